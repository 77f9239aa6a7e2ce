//! Planner inputs (v0.1)
//!
//! Read-only deserialization of `design_context.json` and `dag.json`, the
//! two documents the planner freezes before an orchestration run. Treated
//! as immutable for the duration of a run; the per-node file paths are
//! write targets for workers, never for the orchestrator.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port direction of an interface signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
    Inout,
}

impl PortDirection {
    /// SystemVerilog keyword for this direction.
    pub fn keyword(self) -> &'static str {
        match self {
            PortDirection::Input => "input",
            PortDirection::Output => "output",
            PortDirection::Inout => "inout",
        }
    }
}

/// One signal of a module interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSpec {
    pub name: String,
    pub direction: PortDirection,
    /// Width in bits; 1 means a scalar port.
    pub width: u32,
}

/// Full port list of a module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub signals: Vec<SignalSpec>,
}

impl InterfaceSpec {
    /// Input signals only (the set a testbench must drive).
    pub fn inputs(&self) -> impl Iterator<Item = &SignalSpec> {
        self.signals
            .iter()
            .filter(|s| s.direction == PortDirection::Input)
    }
}

/// Clock and reset semantics for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clocking {
    pub clk: ClockSpec,
}

/// A single clock domain description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockSpec {
    pub freq_hz: u64,
    pub reset: String,
    #[serde(default)]
    pub reset_active_low: bool,
}

/// Verification targets the planner attached to a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageGoals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_pct: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toggle_pct: Option<u32>,
    /// Named scenarios the testbench must exercise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scenarios: Vec<String>,
}

/// Per-node design description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDesign {
    pub rtl_file: String,
    pub testbench_file: String,
    pub interface: InterfaceSpec,
    pub clocking: Clocking,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_goals: Option<CoverageGoals>,
    #[serde(default)]
    pub uses_library: bool,
}

impl NodeDesign {
    /// Module name the implementation must declare, derived from the RTL
    /// file target.
    pub fn module_name(&self) -> &str {
        Path::new(&self.rtl_file)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.rtl_file)
    }
}

/// The frozen design plan, loaded once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignContext {
    pub design_context_hash: String,
    #[serde(default)]
    pub standard_library: Option<String>,
    pub nodes: BTreeMap<String, NodeDesign>,
}

/// Failure to load or cross-check the planner documents.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("dag node '{0}' has no entry in the design context")]
    MissingDesign(String),

    #[error("duplicate dag node id '{0}'")]
    DuplicateNode(String),

    #[error("dag node '{node}' depends on unknown node '{dep}'")]
    UnknownDependency { node: String, dep: String },

    #[error("dependency cycle involving node '{0}'")]
    Cycle(String),
}

impl DesignContext {
    /// Load the design context from disk.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| PlanError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Design entry for a node, or the canonical missing-design error.
    pub fn node(&self, node_id: &str) -> Result<&NodeDesign, PlanError> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| PlanError::MissingDesign(node_id.to_string()))
    }
}
