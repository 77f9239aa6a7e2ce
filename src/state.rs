//! Per-node state machine (v0.1)
//!
//! Pure transition rules: stage ordering, the repair cycle, and the bounded
//! retry/repair limits. The orchestrator loop owns the node and calls in;
//! nothing here performs I/O.

use crate::dag::{DagNode, NodeFailure, NodeState};
use crate::stage::Stage;

/// Publishes allowed per stage opening: the first attempt plus one retry.
pub const MAX_STAGE_ATTEMPTS: u32 = 2;

/// Failed simulation repair cycles before the node is forced to `FAILED`.
pub const MAX_REPAIR_CYCLES: u32 = 2;

/// Where a node goes after a stage succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Stage(Stage),
    Done,
}

/// Successor of a successful stage.
///
/// `repair` is the node's repair flag *before* the success is applied: a
/// repairing node replays `DISTILLING → REFLECTING → DEBUG → SIMULATING`
/// instead of finishing at `REFLECTING`.
pub fn on_success(stage: Stage, repair: bool) -> Advance {
    match stage {
        Stage::Implementing => Advance::Stage(Stage::Linting),
        Stage::Linting => Advance::Stage(Stage::Testbenching),
        Stage::Testbenching => Advance::Stage(Stage::Simulating),
        // A repaired simulation rejoins the normal flow at distilling.
        Stage::Simulating => Advance::Stage(Stage::Distilling),
        Stage::Distilling => Advance::Stage(Stage::Reflecting),
        Stage::Reflecting => {
            if repair {
                Advance::Stage(Stage::Debugging)
            } else {
                Advance::Done
            }
        }
        Stage::Debugging => Advance::Stage(Stage::Simulating),
    }
}

/// Apply a successful stage result to the node and return its new state.
pub fn apply_success(node: &mut DagNode, stage: Stage) -> NodeState {
    let was_repairing = node.repair;
    if stage == Stage::Simulating {
        // Simulation passing closes any open repair cycle.
        node.repair = false;
    }
    node.state = match on_success(stage, was_repairing) {
        Advance::Stage(next) => {
            node.opening_attempts = 0;
            NodeState::for_stage(next)
        }
        Advance::Done => NodeState::Done,
    };
    node.state
}

/// Whether a failed stage still has retry budget in its current opening.
pub fn retry_available(node: &DagNode) -> bool {
    node.opening_attempts < MAX_STAGE_ATTEMPTS
}

/// Whether a terminally failed simulation may open (another) repair cycle.
pub fn repair_available(node: &DagNode, stage: Stage) -> bool {
    stage == Stage::Simulating && node.repair_cycles < MAX_REPAIR_CYCLES
}

/// Enter a repair cycle: the node replays from `DISTILLING` in repair mode
/// with a fresh simulation retry budget.
pub fn enter_repair(node: &mut DagNode) {
    node.repair = true;
    node.repair_cycles += 1;
    node.opening_attempts = 0;
    node.state = NodeState::Distilling;
}

/// Move the node to terminal `FAILED` with its canonical reason.
pub fn fail_node(
    node: &mut DagNode,
    stage: Stage,
    reason: impl Into<String>,
    last_log: Option<String>,
    escalated: bool,
) {
    node.state = NodeState::Failed;
    node.in_flight = None;
    node.failure = Some(NodeFailure {
        stage,
        reason: reason.into(),
        last_log,
        escalated,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use uuid::Uuid;

    fn node() -> DagNode {
        DagNode {
            id: Arc::from("dut"),
            module_kind: "datapath".to_string(),
            deps: vec![],
            state: NodeState::Pending,
            correlation_id: Uuid::new_v4(),
            attempts: HashMap::new(),
            opening_attempts: 0,
            in_flight: None,
            artifacts: Default::default(),
            repair: false,
            repair_cycles: 0,
            failure: None,
        }
    }

    #[test]
    fn happy_path_orders_stages_strictly() {
        let mut n = node();
        let mut visited = vec![];
        let mut stage = Stage::Implementing;
        loop {
            visited.push(stage);
            match apply_success(&mut n, stage) {
                NodeState::Done => break,
                state => stage = state.stage().expect("non-terminal state has a stage"),
            }
        }
        assert_eq!(visited, Stage::NORMAL.to_vec());
        assert_eq!(n.state, NodeState::Done);
    }

    #[test]
    fn repair_cycle_reopens_simulation() {
        let mut n = node();
        n.state = NodeState::Simulating;
        n.opening_attempts = MAX_STAGE_ATTEMPTS;

        assert!(!retry_available(&n));
        assert!(repair_available(&n, Stage::Simulating));
        enter_repair(&mut n);

        assert_eq!(n.state, NodeState::Distilling);
        assert!(n.repair);
        assert_eq!(n.repair_cycles, 1);
        assert_eq!(n.opening_attempts, 0);

        // replay: distill → reflect → debug → simulate
        assert_eq!(apply_success(&mut n, Stage::Distilling), NodeState::Reflecting);
        assert_eq!(apply_success(&mut n, Stage::Reflecting), NodeState::Debugging);
        assert_eq!(apply_success(&mut n, Stage::Debugging), NodeState::Simulating);

        // simulation passing clears repair and rejoins the normal flow
        assert_eq!(apply_success(&mut n, Stage::Simulating), NodeState::Distilling);
        assert!(!n.repair);
        assert_eq!(apply_success(&mut n, Stage::Distilling), NodeState::Reflecting);
        assert_eq!(apply_success(&mut n, Stage::Reflecting), NodeState::Done);
    }

    #[test]
    fn repair_budget_is_two_cycles() {
        let mut n = node();
        n.state = NodeState::Simulating;
        enter_repair(&mut n);
        assert!(repair_available(&n, Stage::Simulating));
        enter_repair(&mut n);
        assert!(!repair_available(&n, Stage::Simulating));
    }

    #[test]
    fn repair_only_opens_for_simulation() {
        let n = node();
        assert!(!repair_available(&n, Stage::Linting));
        assert!(!repair_available(&n, Stage::Reflecting));
    }

    #[test]
    fn retry_budget_is_one_retry() {
        let mut n = node();
        n.opening_attempts = 1;
        assert!(retry_available(&n));
        n.opening_attempts = 2;
        assert!(!retry_available(&n));
    }

    #[test]
    fn fail_node_records_reason_and_clears_flight() {
        let mut n = node();
        n.state = NodeState::Linting;
        fail_node(&mut n, Stage::Linting, "timeout/deadline", None, false);

        assert_eq!(n.state, NodeState::Failed);
        assert!(n.in_flight.is_none());
        let failure = n.failure.expect("failure recorded");
        assert_eq!(failure.stage, Stage::Linting);
        assert_eq!(failure.reason, "timeout/deadline");
        assert!(!failure.escalated);
    }
}
