//! Context builder (v0.1)
//!
//! Deterministically assembles the `context` block of every outbound task
//! from the DAG snapshot, the frozen design context and task memory. Pure
//! with respect to its inputs: the same snapshots yield byte-identical
//! payloads modulo envelope identity.
//!
//! The output is a discriminated union over the stage, so deterministic
//! tool stages can never accidentally carry LLM-only fields.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier;
use crate::dag::DagNode;
use crate::design::{Clocking, CoverageGoals, DesignContext, InterfaceSpec};
use crate::memory::TaskMemory;
use crate::message::TaskKind;
use crate::stage::Stage;

/// Deterministic tool invocation description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl ToolConfig {
    fn lint() -> Self {
        Self {
            name: "verilator".to_string(),
            args: vec!["--lint-only".to_string(), "-Wall".to_string()],
        }
    }

    fn simulate() -> Self {
        Self {
            name: "verilator".to_string(),
            args: vec!["--binary".to_string(), "--timing".to_string()],
        }
    }

    fn distill() -> Self {
        Self {
            name: "distiller".to_string(),
            args: vec![],
        }
    }
}

/// Optional caps forwarded to reasoning workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
}

/// Pointer pair to a completed stage's outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorArtifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

/// Per-stage context payload: one variant per dispatched task kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageContext {
    Implementation {
        node_id: String,
        interface: InterfaceSpec,
        clocking: Clocking,
        rtl_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        spec_summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coverage_goals: Option<CoverageGoals>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<WorkerSettings>,
    },
    Testbench {
        node_id: String,
        interface: InterfaceSpec,
        clocking: Clocking,
        rtl_path: String,
        testbench_path: String,
        test_plan: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coverage_goals: Option<CoverageGoals>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        prior_artifacts: BTreeMap<String, PriorArtifact>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<WorkerSettings>,
    },
    Lint {
        node_id: String,
        rtl_path: String,
        tool: ToolConfig,
    },
    Simulate {
        node_id: String,
        rtl_path: String,
        testbench_path: String,
        tool: ToolConfig,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coverage_goals: Option<CoverageGoals>,
    },
    Distill {
        node_id: String,
        simulation_log: String,
        dataset_path: String,
        tool: ToolConfig,
    },
    Reflect {
        node_id: String,
        dataset_path: String,
        simulation_log: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        prior_artifacts: BTreeMap<String, PriorArtifact>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<WorkerSettings>,
    },
    Debug {
        node_id: String,
        rtl_path: String,
        testbench_path: String,
        failure_signature: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        insights: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        prior_artifacts: BTreeMap<String, PriorArtifact>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<WorkerSettings>,
    },
}

impl StageContext {
    /// The worker role this context addresses.
    pub fn task_kind(&self) -> TaskKind {
        match self {
            StageContext::Implementation { .. } => TaskKind::Implementation,
            StageContext::Testbench { .. } => TaskKind::Testbench,
            StageContext::Lint { .. } => TaskKind::Linter,
            StageContext::Simulate { .. } => TaskKind::Simulator,
            StageContext::Distill { .. } => TaskKind::Distiller,
            StageContext::Reflect { .. } => TaskKind::Reflection,
            StageContext::Debug { .. } => TaskKind::Debug,
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            StageContext::Implementation { node_id, .. }
            | StageContext::Testbench { node_id, .. }
            | StageContext::Lint { node_id, .. }
            | StageContext::Simulate { node_id, .. }
            | StageContext::Distill { node_id, .. }
            | StageContext::Reflect { node_id, .. }
            | StageContext::Debug { node_id, .. } => node_id,
        }
    }

    /// The stage this context belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            StageContext::Implementation { .. } => Stage::Implementing,
            StageContext::Testbench { .. } => Stage::Testbenching,
            StageContext::Lint { .. } => Stage::Linting,
            StageContext::Simulate { .. } => Stage::Simulating,
            StageContext::Distill { .. } => Stage::Distilling,
            StageContext::Reflect { .. } => Stage::Reflecting,
            StageContext::Debug { .. } => Stage::Debugging,
        }
    }
}

/// A stage needs an upstream output that task memory does not hold.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("node '{0}' has no entry in the design context")]
    MissingDesign(String),

    #[error("node '{node}' stage {stage} needs the {missing} from a prior stage")]
    MissingPrior {
        node: String,
        stage: Stage,
        missing: &'static str,
    },
}

/// Builds outbound stage contexts from read-only snapshots.
pub struct ContextBuilder<'a> {
    design: &'a DesignContext,
    memory: &'a TaskMemory,
    artifacts_root: &'a Path,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(design: &'a DesignContext, memory: &'a TaskMemory, artifacts_root: &'a Path) -> Self {
        Self {
            design,
            memory,
            artifacts_root,
        }
    }

    /// Build the context for one stage of one node.
    pub fn build(&self, node: &DagNode, stage: Stage) -> Result<StageContext, ContextError> {
        let node_id = node.id.as_ref();
        let design = self
            .design
            .node(node_id)
            .map_err(|_| ContextError::MissingDesign(node_id.to_string()))?;

        let rtl_path = self.resolve(&design.rtl_file);
        let testbench_path = self.resolve(&design.testbench_file);

        let context = match stage {
            Stage::Implementing => StageContext::Implementation {
                node_id: node_id.to_string(),
                interface: design.interface.clone(),
                clocking: design.clocking.clone(),
                rtl_path,
                spec_summary: self.memory.spec_summary(node_id),
                coverage_goals: design.coverage_goals.clone(),
                settings: None,
            },
            Stage::Testbenching => StageContext::Testbench {
                node_id: node_id.to_string(),
                interface: design.interface.clone(),
                clocking: design.clocking.clone(),
                rtl_path,
                testbench_path,
                test_plan: test_plan(design.coverage_goals.as_ref()),
                coverage_goals: design.coverage_goals.clone(),
                prior_artifacts: self.priors(node_id),
                settings: None,
            },
            Stage::Linting => StageContext::Lint {
                node_id: node_id.to_string(),
                rtl_path,
                tool: ToolConfig::lint(),
            },
            Stage::Simulating => StageContext::Simulate {
                node_id: node_id.to_string(),
                rtl_path,
                testbench_path,
                tool: ToolConfig::simulate(),
                coverage_goals: design.coverage_goals.clone(),
            },
            Stage::Distilling => StageContext::Distill {
                node_id: node_id.to_string(),
                simulation_log: self.simulation_log(node_id, stage)?,
                dataset_path: self.dataset_target(node_id),
                tool: ToolConfig::distill(),
            },
            Stage::Reflecting => StageContext::Reflect {
                node_id: node_id.to_string(),
                dataset_path: self
                    .memory
                    .get_artifact_path(node_id, Stage::Distilling)
                    .map(|p| p.display().to_string())
                    .ok_or(ContextError::MissingPrior {
                        node: node_id.to_string(),
                        stage,
                        missing: "distilled dataset",
                    })?,
                simulation_log: self.simulation_log(node_id, stage)?,
                prior_artifacts: self.priors(node_id),
                settings: None,
            },
            Stage::Debugging => {
                let log_path = self.memory.get_log_path(node_id, Stage::Simulating).ok_or(
                    ContextError::MissingPrior {
                        node: node_id.to_string(),
                        stage,
                        missing: "simulation log",
                    },
                )?;
                let log_body = std::fs::read_to_string(&log_path).unwrap_or_default();
                StageContext::Debug {
                    node_id: node_id.to_string(),
                    rtl_path,
                    testbench_path,
                    failure_signature: classifier::fingerprint(&log_body).signature(),
                    insights: self
                        .memory
                        .read_last_result(node_id, Stage::Reflecting)
                        .and_then(|r| r.reflections),
                    prior_artifacts: self.priors(node_id),
                    settings: None,
                }
            }
        };
        Ok(context)
    }

    fn resolve(&self, relative: &str) -> String {
        self.artifacts_root.join(relative).display().to_string()
    }

    fn dataset_target(&self, node_id: &str) -> String {
        self.artifacts_root
            .join("datasets")
            .join(format!("{node_id}.jsonl"))
            .display()
            .to_string()
    }

    fn simulation_log(&self, node_id: &str, stage: Stage) -> Result<String, ContextError> {
        self.memory
            .get_log_path(node_id, Stage::Simulating)
            .map(|p| p.display().to_string())
            .ok_or(ContextError::MissingPrior {
                node: node_id.to_string(),
                stage,
                missing: "simulation log",
            })
    }

    /// Artifact/log pointers for every stage that has recorded output.
    fn priors(&self, node_id: &str) -> BTreeMap<String, PriorArtifact> {
        let mut priors = BTreeMap::new();
        for stage in Stage::ALL {
            let artifact = self
                .memory
                .get_artifact_path(node_id, stage)
                .map(|p| p.display().to_string());
            let log = self
                .memory
                .get_log_path(node_id, stage)
                .map(|p| p.display().to_string());
            if artifact.is_some() || log.is_some() {
                priors.insert(stage.dir_name().to_string(), PriorArtifact { artifact, log });
            }
        }
        priors
    }
}

/// Scenarios the testbench must cover. Planner goals win; otherwise a
/// minimal deterministic plan.
fn test_plan(goals: Option<&CoverageGoals>) -> Vec<String> {
    if let Some(goals) = goals {
        if !goals.scenarios.is_empty() {
            return goals.scenarios.clone();
        }
    }
    vec![
        "apply reset and verify initial outputs".to_string(),
        "drive every input port at least once".to_string(),
        "check outputs against expected behavior".to_string(),
    ]
}

#[cfg(test)]
impl StageContext {
    /// Minimal context for envelope-level tests.
    pub fn for_test(node_id: &str, stage: Stage) -> Self {
        let node_id = node_id.to_string();
        match stage {
            Stage::Implementing => StageContext::Implementation {
                interface: InterfaceSpec::default(),
                clocking: test_clocking(),
                rtl_path: format!("artifacts/generated/rtl/{node_id}.sv"),
                spec_summary: None,
                coverage_goals: None,
                settings: None,
                node_id,
            },
            Stage::Testbenching => StageContext::Testbench {
                interface: InterfaceSpec::default(),
                clocking: test_clocking(),
                rtl_path: format!("artifacts/generated/rtl/{node_id}.sv"),
                testbench_path: format!("artifacts/generated/rtl/{node_id}_tb.sv"),
                test_plan: vec![],
                coverage_goals: None,
                prior_artifacts: BTreeMap::new(),
                settings: None,
                node_id,
            },
            Stage::Linting => StageContext::Lint {
                rtl_path: format!("artifacts/generated/rtl/{node_id}.sv"),
                tool: ToolConfig::lint(),
                node_id,
            },
            Stage::Simulating => StageContext::Simulate {
                rtl_path: format!("artifacts/generated/rtl/{node_id}.sv"),
                testbench_path: format!("artifacts/generated/rtl/{node_id}_tb.sv"),
                tool: ToolConfig::simulate(),
                coverage_goals: None,
                node_id,
            },
            Stage::Distilling => StageContext::Distill {
                simulation_log: "memory/sim/log.txt".to_string(),
                dataset_path: format!("artifacts/datasets/{node_id}.jsonl"),
                tool: ToolConfig::distill(),
                node_id,
            },
            Stage::Reflecting => StageContext::Reflect {
                dataset_path: format!("artifacts/datasets/{node_id}.jsonl"),
                simulation_log: "memory/sim/log.txt".to_string(),
                prior_artifacts: BTreeMap::new(),
                settings: None,
                node_id,
            },
            Stage::Debugging => StageContext::Debug {
                rtl_path: format!("artifacts/generated/rtl/{node_id}.sv"),
                testbench_path: format!("artifacts/generated/rtl/{node_id}_tb.sv"),
                failure_signature: "sim/mismatch:0000000000000000".to_string(),
                insights: None,
                prior_artifacts: BTreeMap::new(),
                settings: None,
                node_id,
            },
        }
    }
}

#[cfg(test)]
fn test_clocking() -> Clocking {
    use crate::design::ClockSpec;
    Clocking {
        clk: ClockSpec {
            freq_hz: 100_000_000,
            reset: "rst_n".to_string(),
            reset_active_low: true,
        },
    }
}
