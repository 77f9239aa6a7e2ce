//! Stage vocabulary (v0.1)
//!
//! One `Stage` per unit of node work. Each stage maps to exactly one
//! `TaskKind` and therefore one routing entity, and carries a default
//! deadline for in-flight supervision.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::{EntityType, TaskKind};

/// One unit of work for a design node.
///
/// Normal progression is `Implementing → Linting → Testbenching →
/// Simulating → Distilling → Reflecting`; `Debugging` only appears inside
/// a repair cycle after a failed simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Implementing,
    Linting,
    Testbenching,
    Simulating,
    Distilling,
    Reflecting,
    Debugging,
}

impl Stage {
    /// All stages in normal execution order (`Debugging` last, repair-only).
    pub const ALL: [Stage; 7] = [
        Stage::Implementing,
        Stage::Linting,
        Stage::Testbenching,
        Stage::Simulating,
        Stage::Distilling,
        Stage::Reflecting,
        Stage::Debugging,
    ];

    /// The six stages every node passes through on the happy path.
    pub const NORMAL: [Stage; 6] = [
        Stage::Implementing,
        Stage::Linting,
        Stage::Testbenching,
        Stage::Simulating,
        Stage::Distilling,
        Stage::Reflecting,
    ];

    /// The worker role that executes this stage.
    pub fn task_kind(self) -> TaskKind {
        match self {
            Stage::Implementing => TaskKind::Implementation,
            Stage::Linting => TaskKind::Linter,
            Stage::Testbenching => TaskKind::Testbench,
            Stage::Simulating => TaskKind::Simulator,
            Stage::Distilling => TaskKind::Distiller,
            Stage::Reflecting => TaskKind::Reflection,
            Stage::Debugging => TaskKind::Debug,
        }
    }

    /// The routing entity for this stage (derived through the task kind).
    pub fn entity_type(self) -> EntityType {
        self.task_kind().entity_type()
    }

    /// Default in-flight deadline before the orchestrator synthesizes a
    /// timeout failure.
    pub fn default_deadline(self) -> Duration {
        match self {
            Stage::Implementing | Stage::Testbenching | Stage::Debugging => {
                Duration::from_secs(120)
            }
            Stage::Simulating => Duration::from_secs(300),
            Stage::Linting | Stage::Distilling | Stage::Reflecting => Duration::from_secs(60),
        }
    }

    /// Directory name under the task memory root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Implementing => "implementing",
            Stage::Linting => "linting",
            Stage::Testbenching => "testbenching",
            Stage::Simulating => "simulating",
            Stage::Distilling => "distilling",
            Stage::Reflecting => "reflecting",
            Stage::Debugging => "debugging",
        }
    }

    /// Inverse of [`Stage::dir_name`], used when reloading task memory.
    pub fn from_dir_name(name: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.dir_name() == name)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_stage_routes_consistently() {
        for stage in Stage::ALL {
            // kind → entity must agree with the stage's own entity
            assert_eq!(stage.entity_type(), stage.task_kind().entity_type());
        }
    }

    #[test]
    fn deterministic_stages_never_use_reasoning_queue() {
        assert_eq!(Stage::Linting.entity_type(), EntityType::LightDeterministic);
        assert_eq!(Stage::Distilling.entity_type(), EntityType::LightDeterministic);
        assert_eq!(Stage::Simulating.entity_type(), EntityType::HeavyDeterministic);
    }

    #[test]
    fn reasoning_stages_use_agent_queue() {
        for stage in [
            Stage::Implementing,
            Stage::Testbenching,
            Stage::Reflecting,
            Stage::Debugging,
        ] {
            assert_eq!(stage.entity_type(), EntityType::Reasoning);
        }
    }

    #[test]
    fn default_deadlines_match_policy() {
        assert_eq!(Stage::Implementing.default_deadline(), Duration::from_secs(120));
        assert_eq!(Stage::Simulating.default_deadline(), Duration::from_secs(300));
        assert_eq!(Stage::Linting.default_deadline(), Duration::from_secs(60));
        assert_eq!(Stage::Debugging.default_deadline(), Duration::from_secs(120));
    }

    #[test]
    fn dir_name_round_trips() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_dir_name(stage.dir_name()), Some(stage));
        }
        assert_eq!(Stage::from_dir_name("unknown"), None);
    }

    #[test]
    fn serializes_screaming_snake() {
        let json = serde_json::to_string(&Stage::Testbenching).unwrap();
        assert_eq!(json, "\"TESTBENCHING\"");
    }
}
