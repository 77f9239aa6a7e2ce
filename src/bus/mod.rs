//! # Broker Adapter
//!
//! Trait and implementations for the task bus.
//!
//! ## Overview
//!
//! The bus module defines how the orchestrator reaches its workers:
//!
//! - [`TaskBus`] - Core trait: topology, publish, consume, ack/reject
//! - [`AmqpTaskBus`] - Production adapter over an AMQP broker (lapin)
//! - [`ChannelTaskBus`] - In-memory adapter for standalone mode and tests
//! - [`MockWorker`] - Scriptable worker that drives a channel bus
//!
//! ## Topology
//!
//! Declared idempotently at startup:
//!
//! | Object | Kind | Notes |
//! |--------|------|-------|
//! | `tasks_exchange` | direct | routing key = entity type |
//! | `tasks_dlx` | fanout | targets `dead_letter_queue` |
//! | `agent_tasks` | queue | `x-max-priority=3`, dead-letters to `tasks_dlx` |
//! | `process_tasks` | queue | dead-letters to `tasks_dlx` |
//! | `simulation_tasks` | queue | dead-letters to `tasks_dlx` |
//! | `results` | queue | single bounded-prefetch consumer |
//! | `dead_letter_queue` | queue | quarantine for poison messages |
//!
//! ## Worker contract
//!
//! Workers consume exactly one task queue, publish one result envelope
//! per task to `results`, and on unrecoverable failure `nack` the task
//! with `requeue=false` so the broker dead-letters it, preserving the
//! `task_id`/`correlation_id` headers and routing key.

pub mod amqp;
pub mod channel;
pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{EntityType, TaskMessage};

pub use amqp::AmqpTaskBus;
pub use channel::{channel_bus, ChannelBusHandle, ChannelTaskBus};
pub use mock::{MockWorker, WorkerScript};

// ============================================================================
// TOPOLOGY NAMES
// ============================================================================

pub const TASKS_EXCHANGE: &str = "tasks_exchange";
pub const TASKS_DLX: &str = "tasks_dlx";
pub const QUEUE_AGENT_TASKS: &str = "agent_tasks";
pub const QUEUE_PROCESS_TASKS: &str = "process_tasks";
pub const QUEUE_SIMULATION_TASKS: &str = "simulation_tasks";
pub const QUEUE_RESULTS: &str = "results";
pub const QUEUE_DEAD_LETTER: &str = "dead_letter_queue";

/// Priority ceiling of `agent_tasks` (`x-max-priority`).
pub const AGENT_QUEUE_MAX_PRIORITY: u8 = 3;

/// Destination queue for an entity class.
pub fn queue_for(entity: EntityType) -> &'static str {
    match entity {
        EntityType::Reasoning => QUEUE_AGENT_TASKS,
        EntityType::LightDeterministic => QUEUE_PROCESS_TASKS,
        EntityType::HeavyDeterministic => QUEUE_SIMULATION_TASKS,
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Broker-facing failure. Bounded in-process retry on the publish path;
/// reconnection with backoff at the run level.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker connect failed: {0}")]
    Connect(String),

    #[error("topology declaration failed: {0}")]
    Topology(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("publish confirmation timed out")]
    ConfirmTimeout,

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("ack/nack failed: {0}")]
    Acknowledge(String),

    #[error("bus is closed")]
    Closed,
}

// ============================================================================
// TRAIT
// ============================================================================

/// One raw delivery from the results stream. The payload is decoded and
/// validated by the orchestrator, which then acks or rejects by tag.
#[derive(Debug, Clone)]
pub struct ResultDelivery {
    pub tag: u64,
    pub payload: Vec<u8>,
}

/// Transport seam between the orchestrator and the broker.
#[async_trait]
pub trait TaskBus: Send + Sync {
    /// Declare the full topology. Idempotent: running twice yields the
    /// same broker state as running once.
    async fn declare_topology(&self) -> Result<(), TransportError>;

    /// Publish one task envelope, persistent, routed by its entity type,
    /// with the envelope priority as the message priority. Returns after
    /// broker confirmation.
    async fn publish(&self, message: &TaskMessage) -> Result<(), TransportError>;

    /// Receive the next result delivery, waiting at most `wait`.
    /// `Duration::ZERO` polls without blocking (drain mode).
    async fn recv_result(&self, wait: Duration) -> Result<Option<ResultDelivery>, TransportError>;

    /// Acknowledge an applied result.
    async fn ack(&self, tag: u64) -> Result<(), TransportError>;

    /// Reject a result with `requeue=false`, routing it to the DLQ.
    async fn reject(&self, tag: u64) -> Result<(), TransportError>;
}
