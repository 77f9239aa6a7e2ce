//! DLQ classifier (v0.1)
//!
//! Single policy point for worker-reported failures: fingerprints the log,
//! keys a verdict by (stage, attempt count, failure class), and guarantees
//! the one-retry bound. Anything not provably transient on its first
//! attempt terminates the stage; poison classes are additionally routed to
//! the dead-letter queue.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::message::EntityType;
use crate::stage::Stage;

/// Broad class of a worker failure, matched from log markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    SchemaMismatch,
    InterfaceMismatch,
    MissingFile,
    ToolInvocation,
    Timeout,
    SimulationMismatch,
    Unknown,
}

impl FailureClass {
    /// Canonical machine-readable reason for summaries and node failures.
    pub fn as_reason(self) -> &'static str {
        match self {
            FailureClass::SchemaMismatch => "schema/mismatch",
            FailureClass::InterfaceMismatch => "interface/mismatch",
            FailureClass::MissingFile => "input/missing_file",
            FailureClass::ToolInvocation => "tool/transient",
            FailureClass::Timeout => "timeout/deadline",
            FailureClass::SimulationMismatch => "sim/mismatch",
            FailureClass::Unknown => "unknown",
        }
    }

    /// A poison class can never succeed on retry and belongs in the DLQ.
    pub fn is_poison(self) -> bool {
        matches!(
            self,
            FailureClass::SchemaMismatch | FailureClass::InterfaceMismatch | FailureClass::MissingFile
        )
    }
}

/// Stable identity of one failure mode: class plus a digest of the
/// normalized first error line. Two runs of the same broken tool produce
/// the same signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSignature {
    pub class: FailureClass,
    pub digest: String,
    /// Normalized line the digest was taken from.
    pub line: String,
}

impl FailureSignature {
    /// `class:digest` form, forwarded to debug workers.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.class.as_reason(), self.digest)
    }
}

static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("digit pattern compiles"));
static PATHS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(/[\w.\-]+)+").expect("path pattern compiles"));

/// Marker table for each failure class, checked in order. First match wins.
fn class_markers() -> &'static [(FailureClass, &'static [&'static str])] {
    &[
        (
            FailureClass::SchemaMismatch,
            &["schema/", "schema mismatch", "invalid envelope"],
        ),
        (
            FailureClass::InterfaceMismatch,
            &["interface/", "interface mismatch", "port mismatch"],
        ),
        (
            FailureClass::MissingFile,
            &["missing file", "no such file", "file not found"],
        ),
        (
            FailureClass::ToolInvocation,
            &["tool/transient", "tool invocation", "connection reset", "resource temporarily unavailable"],
        ),
        (FailureClass::Timeout, &["timeout/deadline", "deadline exceeded"]),
        (
            FailureClass::SimulationMismatch,
            &["assertion failed", "sim/mismatch", "comparison failed"],
        ),
    ]
}

/// Fingerprint a worker log: classify by marker and digest the normalized
/// first error-looking line.
pub fn fingerprint(log_output: &str) -> FailureSignature {
    let lowered = log_output.to_lowercase();

    let class = class_markers()
        .iter()
        .find(|(_, markers)| markers.iter().any(|m| lowered.contains(m)))
        .map(|(class, _)| *class)
        .unwrap_or(FailureClass::Unknown);

    let first_line = lowered
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim();
    let normalized = PATHS.replace_all(first_line, "<path>");
    let normalized = DIGITS.replace_all(&normalized, "#").into_owned();

    let mut hasher = DefaultHasher::new();
    normalized.hash(&mut hasher);
    FailureSignature {
        class,
        digest: format!("{:016x}", hasher.finish()),
        line: normalized,
    }
}

/// How the orchestrator must handle a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Re-publish the stage once with a fresh task id.
    RetryOnce,
    /// No further attempts for this stage opening.
    TerminalFail,
}

/// Classifier output for one failure.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub disposition: Disposition,
    /// The triggering message belongs in the dead-letter queue.
    pub reject_to_dlq: bool,
    pub signature: FailureSignature,
}

/// Configurable marker overrides. Empty sets fall back to the built-in
/// table; integrators can extend the transient set without a rebuild.
#[derive(Debug, Clone, Default)]
pub struct ClassifierConfig {
    /// Extra substrings treated as transient tool errors.
    pub extra_transient_markers: Vec<String>,
}

/// Decides retry-once vs. reject-to-DLQ for worker failures.
#[derive(Debug, Clone, Default)]
pub struct FailureClassifier {
    config: ClassifierConfig,
}

impl FailureClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Classify one failure of `stage` on its `attempt`-th publish (1-based,
    /// within the current stage opening).
    ///
    /// Hard property: this never produces `RetryOnce` past attempt 1, so a
    /// stage can never be published more than twice per opening.
    pub fn classify(&self, stage: Stage, attempt: u32, log_output: &str) -> Verdict {
        let mut signature = fingerprint(log_output);

        if signature.class == FailureClass::Unknown {
            let lowered = log_output.to_lowercase();
            if self
                .config
                .extra_transient_markers
                .iter()
                .any(|m| lowered.contains(m.as_str()))
            {
                signature.class = FailureClass::ToolInvocation;
            }
        }

        if signature.class.is_poison() {
            return Verdict {
                disposition: Disposition::TerminalFail,
                reject_to_dlq: true,
                signature,
            };
        }

        if attempt <= 1 {
            return Verdict {
                disposition: Disposition::RetryOnce,
                reject_to_dlq: false,
                signature,
            };
        }

        // Second identical failure: terminal. Repeated deterministic-tool
        // failures go to the DLQ for operator replay; simulation mismatches
        // stay out so a repair cycle can reopen the stage.
        let reject = signature.class == FailureClass::ToolInvocation
            || (signature.class == FailureClass::Unknown
                && stage.entity_type() != EntityType::Reasoning);
        Verdict {
            disposition: Disposition::TerminalFail,
            reject_to_dlq: reject,
            signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> FailureClassifier {
        FailureClassifier::default()
    }

    #[test]
    fn interface_mismatch_is_terminal_and_dead_lettered() {
        let verdict = classifier().classify(
            Stage::Implementing,
            1,
            "interface mismatch: output port 'count' missing",
        );
        assert_eq!(verdict.disposition, Disposition::TerminalFail);
        assert!(verdict.reject_to_dlq);
        assert_eq!(verdict.signature.class, FailureClass::InterfaceMismatch);
    }

    #[test]
    fn schema_mismatch_never_retries() {
        let verdict = classifier().classify(Stage::Linting, 1, "schema/ envelope field missing");
        assert_eq!(verdict.disposition, Disposition::TerminalFail);
        assert!(verdict.reject_to_dlq);
    }

    #[test]
    fn missing_input_file_rejects_to_dlq() {
        let verdict =
            classifier().classify(Stage::Simulating, 1, "no such file: counter4_tb.sv");
        assert_eq!(verdict.disposition, Disposition::TerminalFail);
        assert!(verdict.reject_to_dlq);
        assert_eq!(verdict.signature.class, FailureClass::MissingFile);
    }

    #[test]
    fn transient_tool_error_retries_once() {
        let c = classifier();
        let first = c.classify(Stage::Simulating, 1, "tool/transient: spurious exit 139");
        assert_eq!(first.disposition, Disposition::RetryOnce);
        assert!(!first.reject_to_dlq);

        let second = c.classify(Stage::Simulating, 2, "tool/transient: spurious exit 139");
        assert_eq!(second.disposition, Disposition::TerminalFail);
        assert!(second.reject_to_dlq);
    }

    #[test]
    fn timeout_first_transient_second_terminal() {
        let c = classifier();
        assert_eq!(
            c.classify(Stage::Linting, 1, "timeout/deadline: lint exceeded 60s")
                .disposition,
            Disposition::RetryOnce
        );
        assert_eq!(
            c.classify(Stage::Linting, 2, "timeout/deadline: lint exceeded 60s")
                .disposition,
            Disposition::TerminalFail
        );
    }

    #[test]
    fn never_retries_past_attempt_one() {
        let c = classifier();
        for attempt in 2..6 {
            let verdict = c.classify(Stage::Simulating, attempt, "something odd happened");
            assert_eq!(verdict.disposition, Disposition::TerminalFail);
        }
    }

    #[test]
    fn fingerprint_stable_across_runs() {
        let a = fingerprint("assertion failed at t=120ns: count=7 expected 8");
        let b = fingerprint("assertion failed at t=350ns: count=2 expected 3");
        // digits are collapsed, so the two logs share one failure identity
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.class, FailureClass::SimulationMismatch);
    }

    #[test]
    fn fingerprint_collapses_paths() {
        let a = fingerprint("missing file /work/run1/counter4.sv");
        let b = fingerprint("missing file /work/run2/counter4.sv");
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.class, FailureClass::MissingFile);
    }

    #[test]
    fn signature_carries_class_prefix() {
        let sig = fingerprint("assertion failed: q mismatch");
        assert!(sig.signature().starts_with("sim/mismatch:"));
    }

    #[test]
    fn extra_markers_extend_transient_set() {
        let c = FailureClassifier::new(ClassifierConfig {
            extra_transient_markers: vec!["license server busy".to_string()],
        });
        let verdict = c.classify(Stage::Simulating, 1, "ERROR license server busy, try later");
        assert_eq!(verdict.signature.class, FailureClass::ToolInvocation);
        assert_eq!(verdict.disposition, Disposition::RetryOnce);
    }
}
