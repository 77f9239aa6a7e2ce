//! Task memory store (v0.1)
//!
//! Durable write-through storage for per-node/per-stage envelopes, logs and
//! artifacts, owned by the orchestrator (sole writer). Layout:
//!
//! ```text
//! <root>/<node_id>/<stage>/task.json        first attempt
//! <root>/<node_id>/<stage>/result.json
//! <root>/<node_id>/<stage>/log.txt
//! <root>/<node_id>/<stage>/task.2.json      retry writes siblings
//! <root>/<node_id>/<stage>/artifact.<ext>   copied transient artifacts
//! <root>/specs/                             spec passthrough
//! ```
//!
//! Entries are append-only. Every file write is write-to-temp + rename, so
//! concurrent readers observe either the prior or the new version, never a
//! torn write. In-flight state is deliberately NOT stored here: a restart
//! reloads the log of record and re-publishes any stage without a result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::message::{ResultMessage, TaskMessage, TaskStatus};
use crate::stage::Stage;

/// Storage failure underneath the orchestrator.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("task memory io at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("task memory encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One recorded attempt of a stage.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub task_path: PathBuf,
    pub result_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
}

type StageKey = (Arc<str>, Stage);

/// Append-only per-node/per-stage artifact and log store.
pub struct TaskMemory {
    root: PathBuf,
    artifacts_root: PathBuf,
    /// Publishes recorded per (node, stage), across restarts.
    attempts: HashMap<StageKey, u32>,
    /// Canonical artifact path per (node, stage).
    artifacts: HashMap<StageKey, PathBuf>,
    /// Status of the last recorded result per (node, stage).
    last_status: HashMap<StageKey, TaskStatus>,
}

impl TaskMemory {
    /// Open (or create) a task memory root and reload any prior state.
    pub fn open(root: &Path, artifacts_root: &Path) -> Result<Self, MemoryError> {
        create_dir_all(root)?;
        create_dir_all(&root.join("specs"))?;

        let mut memory = Self {
            root: root.to_path_buf(),
            artifacts_root: artifacts_root.to_path_buf(),
            attempts: HashMap::new(),
            artifacts: HashMap::new(),
            last_status: HashMap::new(),
        };
        memory.reload()?;
        Ok(memory)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one stage of one node.
    pub fn stage_dir(&self, node_id: &str, stage: Stage) -> PathBuf {
        self.root.join(node_id).join(stage.dir_name())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Persist an outbound task envelope. Returns the attempt number this
    /// publish occupies (1-based; retries get sibling files).
    pub fn record_publish(
        &mut self,
        node_id: &Arc<str>,
        stage: Stage,
        task: &TaskMessage,
    ) -> Result<u32, MemoryError> {
        let key = (Arc::clone(node_id), stage);
        let attempt = self.attempts.get(&key).copied().unwrap_or(0) + 1;

        let dir = self.stage_dir(node_id, stage);
        create_dir_all(&dir)?;
        let path = dir.join(attempt_file("task", "json", attempt));
        write_atomic(&path, &serde_json::to_vec_pretty(task)?)?;

        self.attempts.insert(key, attempt);
        debug!(node = %node_id, %stage, attempt, "recorded task publish");
        Ok(attempt)
    }

    /// Persist a result envelope and its log for the latest attempt, and
    /// index the stage artifact.
    ///
    /// An artifact written to a transient path (outside the artifacts root)
    /// is copied into the stage directory; otherwise the canonical path is
    /// recorded as-is.
    pub fn record_result(
        &mut self,
        node_id: &Arc<str>,
        stage: Stage,
        result: &ResultMessage,
    ) -> Result<(), MemoryError> {
        let key = (Arc::clone(node_id), stage);
        let attempt = self.attempts.get(&key).copied().unwrap_or(0).max(1);

        let dir = self.stage_dir(node_id, stage);
        create_dir_all(&dir)?;
        write_atomic(
            &dir.join(attempt_file("result", "json", attempt)),
            &serde_json::to_vec_pretty(result)?,
        )?;
        write_atomic(
            &dir.join(attempt_file("log", "txt", attempt)),
            result.log_output.as_bytes(),
        )?;

        if let Some(raw) = result.artifacts_path.as_deref() {
            let canonical = self.canonicalize_artifact(&dir, Path::new(raw))?;
            self.artifacts.insert(key.clone(), canonical);
        }
        self.last_status.insert(key, result.status);
        debug!(node = %node_id, %stage, attempt, status = ?result.status, "recorded result");
        Ok(())
    }

    /// Drop a marker file into a stage directory (e.g. a postcondition
    /// failure detected by the orchestrator rather than the worker).
    pub fn write_marker(
        &self,
        node_id: &str,
        stage: Stage,
        name: &str,
        body: &str,
    ) -> Result<(), MemoryError> {
        let dir = self.stage_dir(node_id, stage);
        create_dir_all(&dir)?;
        write_atomic(&dir.join(name), body.as_bytes())
    }

    fn canonicalize_artifact(
        &self,
        stage_dir: &Path,
        reported: &Path,
    ) -> Result<PathBuf, MemoryError> {
        if reported.starts_with(&self.artifacts_root) || !reported.exists() {
            return Ok(reported.to_path_buf());
        }
        let ext = reported
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("out");
        let target = stage_dir.join(format!("artifact.{ext}"));
        let data = std::fs::read(reported).map_err(|source| MemoryError::Io {
            path: reported.display().to_string(),
            source,
        })?;
        write_atomic(&target, &data)?;
        Ok(target)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Canonical artifact path recorded for a stage, if any.
    pub fn get_artifact_path(&self, node_id: &str, stage: Stage) -> Option<&Path> {
        self.artifacts
            .iter()
            .find(|((id, s), _)| id.as_ref() == node_id && *s == stage)
            .map(|(_, path)| path.as_path())
    }

    /// Status of the last recorded result for a stage, if any.
    pub fn last_status(&self, node_id: &str, stage: Stage) -> Option<TaskStatus> {
        self.last_status
            .iter()
            .find(|((id, s), _)| id.as_ref() == node_id && *s == stage)
            .map(|(_, status)| *status)
    }

    /// Publishes recorded for a stage across all attempts (and restarts).
    pub fn attempt_count(&self, node_id: &str, stage: Stage) -> u32 {
        self.attempts
            .iter()
            .find(|((id, s), _)| id.as_ref() == node_id && *s == stage)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    /// Log path of the latest attempt that has one.
    pub fn get_log_path(&self, node_id: &str, stage: Stage) -> Option<PathBuf> {
        self.list_attempts(node_id, stage)
            .into_iter()
            .rev()
            .find_map(|a| a.log_path)
    }

    /// All recorded attempts of a stage, ascending.
    pub fn list_attempts(&self, node_id: &str, stage: Stage) -> Vec<AttemptRecord> {
        let dir = self.stage_dir(node_id, stage);
        let count = self.attempt_count(node_id, stage);
        let mut attempts = Vec::with_capacity(count as usize);
        for attempt in 1..=count {
            let task_path = dir.join(attempt_file("task", "json", attempt));
            if !task_path.exists() {
                continue;
            }
            let result_path = dir.join(attempt_file("result", "json", attempt));
            let log_path = dir.join(attempt_file("log", "txt", attempt));
            attempts.push(AttemptRecord {
                attempt,
                task_path,
                result_path: result_path.exists().then_some(result_path),
                log_path: log_path.exists().then_some(log_path),
            });
        }
        attempts
    }

    /// Re-read the last recorded result envelope for a stage from disk.
    pub fn read_last_result(&self, node_id: &str, stage: Stage) -> Option<ResultMessage> {
        let record = self
            .list_attempts(node_id, stage)
            .into_iter()
            .rev()
            .find(|a| a.result_path.is_some())?;
        let raw = std::fs::read(record.result_path?).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Spec passthrough body for a node, if the planner dropped one.
    pub fn spec_summary(&self, node_id: &str) -> Option<String> {
        for ext in ["md", "txt"] {
            let path = self.root.join("specs").join(format!("{node_id}.{ext}"));
            if let Ok(body) = std::fs::read_to_string(&path) {
                return Some(body);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Reload
    // ------------------------------------------------------------------

    /// Rebuild the in-memory index from disk. Stages whose last attempt has
    /// a `task.json` but no `result.json` are simply absent from
    /// `last_status`, so a restarted orchestrator re-publishes them.
    fn reload(&mut self) -> Result<(), MemoryError> {
        for entry in WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_dir())
        {
            let Some(stage) = entry
                .file_name()
                .to_str()
                .and_then(Stage::from_dir_name)
            else {
                continue;
            };
            let Some(node_id) = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
            else {
                continue;
            };
            if node_id == "specs" {
                continue;
            }
            let node_id: Arc<str> = Arc::from(node_id);
            self.reload_stage(&node_id, stage, entry.path());
        }
        Ok(())
    }

    fn reload_stage(&mut self, node_id: &Arc<str>, stage: Stage, dir: &Path) {
        let mut max_attempt = 0u32;
        for attempt in 1.. {
            if dir.join(attempt_file("task", "json", attempt)).exists() {
                max_attempt = attempt;
            } else {
                break;
            }
        }
        if max_attempt == 0 {
            return;
        }
        let key = (Arc::clone(node_id), stage);
        self.attempts.insert(key.clone(), max_attempt);

        // latest attempt with a result defines the stage's recorded outcome
        for attempt in (1..=max_attempt).rev() {
            let result_path = dir.join(attempt_file("result", "json", attempt));
            let Ok(raw) = std::fs::read(&result_path) else {
                continue;
            };
            match serde_json::from_slice::<ResultMessage>(&raw) {
                Ok(result) => {
                    if let Some(artifact) = result.artifacts_path.as_deref() {
                        self.artifacts.insert(key.clone(), PathBuf::from(artifact));
                    }
                    self.last_status.insert(key.clone(), result.status);
                }
                Err(e) => {
                    warn!(node = %node_id, %stage, attempt, error = %e, "unreadable result during reload");
                }
            }
            return;
        }
    }
}

// ============================================================================
// FILE HELPERS
// ============================================================================

fn attempt_file(base: &str, ext: &str, attempt: u32) -> String {
    if attempt <= 1 {
        format!("{base}.{ext}")
    } else {
        format!("{base}.{attempt}.{ext}")
    }
}

fn create_dir_all(path: &Path) -> Result<(), MemoryError> {
    std::fs::create_dir_all(path).map_err(|source| MemoryError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Write-to-temp + rename so readers never observe a torn file.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), MemoryError> {
    let tmp = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => path.with_file_name(format!("{name}.tmp")),
        None => path.with_extension("tmp"),
    };
    let io = |source| MemoryError::Io {
        path: path.display().to_string(),
        source,
    };
    std::fs::write(&tmp, data).map_err(io)?;
    std::fs::rename(&tmp, path).map_err(io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StageContext;
    use crate::message::{TaskMessage, TaskPriority};
    use uuid::Uuid;

    fn task_for(node: &str, stage: Stage) -> TaskMessage {
        let context = StageContext::for_test(node, stage);
        TaskMessage::new(Uuid::new_v4(), TaskPriority::Medium, context)
    }

    fn open_memory(dir: &Path) -> TaskMemory {
        TaskMemory::open(&dir.join("memory"), &dir.join("artifacts")).unwrap()
    }

    #[test]
    fn record_publish_writes_task_json() {
        let tmp = tempfile::tempdir().unwrap();
        let mut memory = open_memory(tmp.path());
        let node: Arc<str> = Arc::from("counter4");

        let attempt = memory
            .record_publish(&node, Stage::Implementing, &task_for("counter4", Stage::Implementing))
            .unwrap();
        assert_eq!(attempt, 1);
        assert!(memory
            .stage_dir("counter4", Stage::Implementing)
            .join("task.json")
            .exists());
    }

    #[test]
    fn retry_writes_sibling_attempt_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut memory = open_memory(tmp.path());
        let node: Arc<str> = Arc::from("counter4");

        let task = task_for("counter4", Stage::Simulating);
        memory.record_publish(&node, Stage::Simulating, &task).unwrap();
        memory
            .record_result(&node, Stage::Simulating, &ResultMessage::failure(&task, "tool/transient"))
            .unwrap();

        let retry = task_for("counter4", Stage::Simulating);
        assert_eq!(memory.record_publish(&node, Stage::Simulating, &retry).unwrap(), 2);
        memory
            .record_result(&node, Stage::Simulating, &ResultMessage::success(&retry, "passed"))
            .unwrap();

        let dir = memory.stage_dir("counter4", Stage::Simulating);
        assert!(dir.join("task.json").exists());
        assert!(dir.join("task.2.json").exists());
        assert!(dir.join("result.json").exists());
        assert!(dir.join("result.2.json").exists());
        assert!(dir.join("log.2.txt").exists());

        let attempts = memory.list_attempts("counter4", Stage::Simulating);
        assert_eq!(attempts.len(), 2);
        assert_eq!(memory.last_status("counter4", Stage::Simulating), Some(TaskStatus::Success));
    }

    #[test]
    fn transient_artifact_copied_into_stage_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut memory = open_memory(tmp.path());
        let node: Arc<str> = Arc::from("counter4");

        // worker wrote somewhere outside the artifacts root
        let transient = tmp.path().join("scratch.jsonl");
        std::fs::write(&transient, "{\"example\":1}\n").unwrap();

        let task = task_for("counter4", Stage::Distilling);
        memory.record_publish(&node, Stage::Distilling, &task).unwrap();
        let mut result = ResultMessage::success(&task, "distilled");
        result.artifacts_path = Some(transient.display().to_string());
        memory.record_result(&node, Stage::Distilling, &result).unwrap();

        let canonical = memory
            .get_artifact_path("counter4", Stage::Distilling)
            .unwrap()
            .to_path_buf();
        assert!(canonical.starts_with(memory.stage_dir("counter4", Stage::Distilling)));
        assert_eq!(std::fs::read_to_string(canonical).unwrap(), "{\"example\":1}\n");
    }

    #[test]
    fn canonical_artifact_recorded_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts_root = tmp.path().join("artifacts");
        std::fs::create_dir_all(artifacts_root.join("generated/rtl")).unwrap();
        let rtl = artifacts_root.join("generated/rtl/counter4.sv");
        std::fs::write(&rtl, "module counter4;endmodule\n").unwrap();

        let mut memory = TaskMemory::open(&tmp.path().join("memory"), &artifacts_root).unwrap();
        let node: Arc<str> = Arc::from("counter4");
        let task = task_for("counter4", Stage::Implementing);
        memory.record_publish(&node, Stage::Implementing, &task).unwrap();
        let mut result = ResultMessage::success(&task, "wrote rtl");
        result.artifacts_path = Some(rtl.display().to_string());
        memory.record_result(&node, Stage::Implementing, &result).unwrap();

        assert_eq!(
            memory.get_artifact_path("counter4", Stage::Implementing).unwrap(),
            rtl.as_path()
        );
    }

    #[test]
    fn reload_recovers_attempts_and_statuses() {
        let tmp = tempfile::tempdir().unwrap();
        let node: Arc<str> = Arc::from("counter4");
        {
            let mut memory = open_memory(tmp.path());
            let impl_task = task_for("counter4", Stage::Implementing);
            memory.record_publish(&node, Stage::Implementing, &impl_task).unwrap();
            memory
                .record_result(&node, Stage::Implementing, &ResultMessage::success(&impl_task, "ok"))
                .unwrap();

            // testbench published, result never arrived (killed mid-stage)
            let tb_task = task_for("counter4", Stage::Testbenching);
            memory.record_publish(&node, Stage::Testbenching, &tb_task).unwrap();
        }

        let memory = open_memory(tmp.path());
        assert_eq!(memory.last_status("counter4", Stage::Implementing), Some(TaskStatus::Success));
        assert_eq!(memory.attempt_count("counter4", Stage::Implementing), 1);
        // stage without a result has no recorded status: it will re-publish
        assert_eq!(memory.last_status("counter4", Stage::Testbenching), None);
        assert_eq!(memory.attempt_count("counter4", Stage::Testbenching), 1);
    }

    #[test]
    fn spec_summary_reads_passthrough() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = open_memory(tmp.path());
        assert!(memory.spec_summary("counter4").is_none());

        std::fs::write(memory.root().join("specs/counter4.md"), "# 4-bit counter\n").unwrap();
        assert_eq!(memory.spec_summary("counter4").unwrap(), "# 4-bit counter\n");
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("result.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        // no stray temp files left behind
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }
}
