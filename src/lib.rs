//! # rtlforge Library (v0.1)
//!
//! Orchestration core that turns a frozen hardware design plan into
//! verified RTL artifacts by dispatching staged work to pools of
//! language-model agents and deterministic tool runners over a broker.
//!
//! ## Overview
//!
//! The orchestrator walks a DAG of design nodes. Each node advances
//! through a fixed stage pipeline, one in-flight task at a time:
//!
//! | Stage | Worker | Queue |
//! |-------|--------|-------|
//! | `IMPLEMENTING` | implementation agent | `agent_tasks` |
//! | `LINTING` | lint runner | `process_tasks` |
//! | `TESTBENCHING` | testbench agent | `agent_tasks` |
//! | `SIMULATING` | simulator runner | `simulation_tasks` |
//! | `DISTILLING` | distiller runner | `process_tasks` |
//! | `REFLECTING` | reflection agent | `agent_tasks` |
//! | `DEBUGGING` | debug agent (repair cycles only) | `agent_tasks` |
//!
//! Results come back on a single `results` stream, correlated by task id;
//! unrecoverable messages are dead-lettered. Every stage leaves its task,
//! result, log and artifact in the append-only task memory store.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rtlforge::{
//!     bus::AmqpTaskBus, Config, Dag, DesignContext, Orchestrator, TaskMemory,
//! };
//! use std::sync::Arc;
//!
//! let config = Config::from_env();
//! let design = DesignContext::load(std::path::Path::new("design_context.json"))?;
//! let dag = Dag::load(std::path::Path::new("dag.json"), &design)?;
//! let memory = TaskMemory::open(&config.task_memory_root, &config.artifacts_root)?;
//! let bus = AmqpTaskBus::connect_with_backoff(
//!     &config.broker_url,
//!     config.prefetch,
//!     config.confirm_timeout,
//!     config.reconnect_ceiling,
//! )
//! .await?;
//!
//! let mut orchestrator = Orchestrator::new(Arc::new(bus), dag, design, memory, config);
//! let summary = orchestrator.run().await?;
//! println!("{}", summary.render());
//! # Ok::<(), rtlforge::ForgeError>(())
//! ```
//!
//! ## Modules
//!
//! - [`message`] - Task/result envelopes and boundary validation
//! - [`stage`] / [`state`] - Stage vocabulary and the per-node state machine
//! - [`dag`] - Plan graph with per-node execution state
//! - [`design`] - Read-only planner inputs
//! - [`context`] - Deterministic per-stage context builder
//! - [`memory`] - Append-only task memory store
//! - [`bus`] - Broker adapter (AMQP + in-memory channel)
//! - [`classifier`] - Failure fingerprinting and DLQ routing policy
//! - [`postcheck`] - Stage postcondition verification
//! - [`orchestrator`] - The single-writer control loop
//! - [`journal`] - Run audit trail, write-through to task memory

pub mod bus;
pub mod classifier;
pub mod config;
pub mod context;
pub mod dag;
pub mod design;
pub mod error;
pub mod journal;
pub mod memory;
pub mod message;
pub mod orchestrator;
pub mod postcheck;
pub mod stage;
pub mod state;

// Re-export main types
pub use classifier::{ClassifierConfig, Disposition, FailureClass, FailureClassifier};
pub use config::Config;
pub use context::{ContextBuilder, StageContext};
pub use dag::{Dag, DagNode, NodeState};
pub use design::DesignContext;
pub use error::ForgeError;
pub use journal::{Event, EventKind, RunJournal};
pub use memory::TaskMemory;
pub use message::{
    EntityType, ResultMessage, TaskKind, TaskMessage, TaskPriority, TaskStatus,
};
pub use orchestrator::{Orchestrator, RunSummary, Termination};
pub use stage::Stage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_pipeline_matches_queue_table() {
        // the crate-doc table is load-bearing: each stage routes to the
        // queue its entity class binds to
        use crate::bus::queue_for;
        assert_eq!(queue_for(Stage::Implementing.entity_type()), "agent_tasks");
        assert_eq!(queue_for(Stage::Linting.entity_type()), "process_tasks");
        assert_eq!(queue_for(Stage::Simulating.entity_type()), "simulation_tasks");
        assert_eq!(queue_for(Stage::Debugging.entity_type()), "agent_tasks");
    }

    #[test]
    fn task_message_round_trips_through_wire_form() {
        let context = StageContext::for_test("counter4", Stage::Implementing);
        let task = TaskMessage::new(uuid::Uuid::new_v4(), TaskPriority::Medium, context);
        let bytes = serde_json::to_vec(&task).unwrap();
        let back: TaskMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.task_kind, TaskKind::Implementation);
        assert_eq!(back.entity_type, EntityType::Reasoning);
    }
}
