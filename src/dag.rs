//! DAG model (v0.1)
//!
//! Immutable plan graph with per-node mutable execution state. The graph is
//! owned by the orchestrator loop, which is its sole mutator; everything
//! else sees read-only borrows. Uses `Arc<str>` node ids for zero-cost
//! cloning into events and in-flight records.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::design::{DesignContext, PlanError};
use crate::stage::Stage;

/// Per-node lifecycle. Every non-terminal state except `Pending` names the
/// stage currently being worked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Implementing,
    Linting,
    Testbenching,
    Simulating,
    Distilling,
    Reflecting,
    Debugging,
    Done,
    Failed,
}

impl NodeState {
    /// The stage this state is executing, if any.
    pub fn stage(self) -> Option<Stage> {
        match self {
            NodeState::Implementing => Some(Stage::Implementing),
            NodeState::Linting => Some(Stage::Linting),
            NodeState::Testbenching => Some(Stage::Testbenching),
            NodeState::Simulating => Some(Stage::Simulating),
            NodeState::Distilling => Some(Stage::Distilling),
            NodeState::Reflecting => Some(Stage::Reflecting),
            NodeState::Debugging => Some(Stage::Debugging),
            NodeState::Pending | NodeState::Done | NodeState::Failed => None,
        }
    }

    /// State that works a given stage.
    pub fn for_stage(stage: Stage) -> NodeState {
        match stage {
            Stage::Implementing => NodeState::Implementing,
            Stage::Linting => NodeState::Linting,
            Stage::Testbenching => NodeState::Testbenching,
            Stage::Simulating => NodeState::Simulating,
            Stage::Distilling => NodeState::Distilling,
            Stage::Reflecting => NodeState::Reflecting,
            Stage::Debugging => NodeState::Debugging,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Done | NodeState::Failed)
    }
}

/// Marker for a stage currently awaiting a worker result.
///
/// Deliberately not serializable: in-flight state must not survive a
/// restart, so a recovered run re-publishes instead of waiting forever.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub stage: Stage,
    pub task_id: Uuid,
    pub deadline: Instant,
    pub attempt: u32,
}

/// Terminal failure details kept for the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct NodeFailure {
    pub stage: Stage,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_log: Option<String>,
    pub escalated: bool,
}

/// One design node plus its execution state.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub id: Arc<str>,
    pub module_kind: String,
    pub deps: Vec<Arc<str>>,
    pub state: NodeState,
    /// Stage lineage id, allocated at first dispatch.
    pub correlation_id: Uuid,
    /// Cumulative publish count per stage (reporting; scenario assertions).
    pub attempts: HashMap<Stage, u32>,
    /// Publish count within the current opening of the current stage.
    /// Reset on every stage entry; drives the one-retry bound.
    pub opening_attempts: u32,
    pub in_flight: Option<InFlight>,
    /// Recorded artifact paths by stage, mirrored from task memory.
    pub artifacts: BTreeMap<Stage, String>,
    /// Repair mode: after a failed simulation the node replays
    /// distill → reflect → debug → simulate.
    pub repair: bool,
    pub repair_cycles: u32,
    pub failure: Option<NodeFailure>,
}

impl DagNode {
    /// The stage the orchestrator should publish next, if the node is
    /// neither terminal nor already in flight.
    pub fn next_stage(&self) -> Option<Stage> {
        if self.in_flight.is_some() {
            return None;
        }
        match self.state {
            NodeState::Pending => Some(Stage::Implementing),
            other => other.stage(),
        }
    }
}

// ============================================================================
// RAW DOCUMENT
// ============================================================================

/// One node as serialized in `dag.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDagNode {
    pub id: String,
    #[serde(rename = "type")]
    pub module_kind: String,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default = "default_state")]
    pub state: NodeState,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

fn default_state() -> NodeState {
    NodeState::Pending
}

/// The `dag.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDag {
    pub nodes: Vec<RawDagNode>,
}

// ============================================================================
// DAG
// ============================================================================

/// The plan graph. Node order follows the planner document for
/// deterministic scans.
#[derive(Debug)]
pub struct Dag {
    nodes: BTreeMap<Arc<str>, DagNode>,
    order: Vec<Arc<str>>,
}

impl Dag {
    /// Load `dag.json` and cross-check it against the design context.
    pub fn load(path: &Path, design: &DesignContext) -> Result<Self, PlanError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawDag = serde_json::from_str(&raw).map_err(|source| PlanError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_raw(raw, design)
    }

    /// Build and validate the graph: unique ids, known deps, acyclic, and
    /// every node present in the design context.
    pub fn from_raw(raw: RawDag, design: &DesignContext) -> Result<Self, PlanError> {
        let mut nodes: BTreeMap<Arc<str>, DagNode> = BTreeMap::new();
        let mut order: Vec<Arc<str>> = Vec::with_capacity(raw.nodes.len());
        let mut ids: HashSet<Arc<str>> = HashSet::with_capacity(raw.nodes.len());

        // Create Arc<str> once per node, reuse everywhere
        for node in &raw.nodes {
            let id: Arc<str> = Arc::from(node.id.as_str());
            if !ids.insert(Arc::clone(&id)) {
                return Err(PlanError::DuplicateNode(node.id.clone()));
            }
            order.push(id);
        }

        for node in raw.nodes {
            let id: Arc<str> = ids
                .get(node.id.as_str())
                .cloned()
                .unwrap_or_else(|| Arc::from(node.id.as_str()));

            design.node(&node.id)?;

            let mut deps = Vec::with_capacity(node.deps.len());
            for dep in &node.deps {
                let dep_arc = ids.get(dep.as_str()).cloned().ok_or_else(|| {
                    PlanError::UnknownDependency {
                        node: node.id.clone(),
                        dep: dep.clone(),
                    }
                })?;
                deps.push(dep_arc);
            }

            nodes.insert(
                Arc::clone(&id),
                DagNode {
                    id,
                    module_kind: node.module_kind,
                    deps,
                    state: node.state,
                    correlation_id: Uuid::new_v4(),
                    attempts: HashMap::new(),
                    opening_attempts: 0,
                    in_flight: None,
                    artifacts: BTreeMap::new(),
                    repair: false,
                    repair_cycles: 0,
                    failure: None,
                },
            );
        }

        let dag = Self { nodes, order };
        dag.check_acyclic()?;
        Ok(dag)
    }

    /// Kahn's algorithm; any node left unprocessed sits on a cycle.
    fn check_acyclic(&self) -> Result<(), PlanError> {
        let mut indegree: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::with_capacity(self.nodes.len());

        for node in self.nodes.values() {
            indegree.entry(node.id.as_ref()).or_insert(0);
            for dep in &node.deps {
                *indegree.entry(node.id.as_ref()).or_insert(0) += 1;
                successors
                    .entry(dep.as_ref())
                    .or_default()
                    .push(node.id.as_ref());
            }
        }

        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut seen = 0usize;

        while let Some(id) = queue.pop_front() {
            seen += 1;
            for succ in successors.get(id).map(|v| v.as_slice()).unwrap_or(&[]) {
                let d = indegree
                    .get_mut(succ)
                    .expect("successor indegree present by construction");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(succ);
                }
            }
        }

        if seen == self.nodes.len() {
            Ok(())
        } else {
            let stuck = self
                .order
                .iter()
                .find(|id| indegree.get(id.as_ref()).copied().unwrap_or(0) > 0)
                .map(|id| id.to_string())
                .unwrap_or_default();
            Err(PlanError::Cycle(stuck))
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&DagNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut DagNode> {
        self.nodes.get_mut(id)
    }

    /// Nodes in planner order.
    pub fn nodes(&self) -> impl Iterator<Item = &DagNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// A node is eligible when every dependency is `DONE`.
    pub fn deps_done(&self, node: &DagNode) -> bool {
        node.deps
            .iter()
            .all(|dep| matches!(self.nodes.get(dep.as_ref()).map(|n| n.state), Some(NodeState::Done)))
    }

    /// Ids of nodes with a publishable stage this tick, in planner order.
    pub fn ready_nodes(&self) -> Vec<Arc<str>> {
        self.order
            .iter()
            .filter(|id| {
                let Some(node) = self.nodes.get(id.as_ref()) else {
                    return false;
                };
                !node.state.is_terminal()
                    && node.next_stage().is_some()
                    && self.deps_done(node)
            })
            .cloned()
            .collect()
    }

    pub fn all_done(&self) -> bool {
        self.nodes.values().all(|n| n.state == NodeState::Done)
    }

    /// No result can ever arrive and nothing can be published: the run has
    /// stalled (some node is `FAILED` and its dependents wait forever).
    pub fn stalled(&self) -> bool {
        !self.all_done()
            && self.nodes.values().all(|n| n.in_flight.is_none())
            && self.ready_nodes().is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.nodes.values().filter(|n| n.in_flight.is_some()).count()
    }
}
