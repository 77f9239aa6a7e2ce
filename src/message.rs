//! Message contracts (v0.1)
//!
//! Typed task and result envelopes exchanged with workers over the broker.
//! Both envelopes are validated at the publish and consume boundaries; a
//! message that fails validation never touches the broker (publish side)
//! or the DAG (consume side).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::context::StageContext;

// ============================================================================
// CONTROLLED VOCABULARIES
// ============================================================================

/// Worker class a task is routed to. Doubles as the broker routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    /// Language-model agents (`agent_tasks`, priority-aware).
    Reasoning,
    /// Cheap deterministic tool runners (`process_tasks`).
    LightDeterministic,
    /// Long-running deterministic tool runners (`simulation_tasks`).
    HeavyDeterministic,
}

impl EntityType {
    /// Wire form, used verbatim as the routing key.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Reasoning => "REASONING",
            EntityType::LightDeterministic => "LIGHT_DETERMINISTIC",
            EntityType::HeavyDeterministic => "HEAVY_DETERMINISTIC",
        }
    }
}

/// Ordering hint within a priority-aware queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

impl TaskPriority {
    /// Numeric AMQP priority (queue declares `x-max-priority=3`).
    pub fn as_u8(self) -> u8 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Medium => 2,
            TaskPriority::High => 3,
        }
    }
}

/// The specific worker role a task addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    SpecHelper,
    Planner,
    Implementation,
    Testbench,
    Reflection,
    Debug,
    Linter,
    Simulator,
    Distiller,
}

impl TaskKind {
    /// The only entity class allowed to carry this kind.
    ///
    /// This table is authoritative; [`validate_task`] rejects any envelope
    /// whose `entity_type` disagrees with it.
    pub fn entity_type(self) -> EntityType {
        match self {
            TaskKind::SpecHelper
            | TaskKind::Planner
            | TaskKind::Implementation
            | TaskKind::Testbench
            | TaskKind::Reflection
            | TaskKind::Debug => EntityType::Reasoning,
            TaskKind::Linter | TaskKind::Distiller => EntityType::LightDeterministic,
            TaskKind::Simulator => EntityType::HeavyDeterministic,
        }
    }
}

/// Worker-reported outcome of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failure,
    /// The worker gave up and asked for operator attention. Applied to the
    /// DAG like a failure, but preserved verbatim for reporting.
    Escalated,
}

// ============================================================================
// ENVELOPES
// ============================================================================

/// Outbound task envelope, published once per attempt.
///
/// `task_id` is unique per publish; `correlation_id` is stable across every
/// attempt of one node lineage. Envelopes are created by the context builder
/// and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub priority: TaskPriority,
    pub entity_type: EntityType,
    pub task_kind: TaskKind,
    pub context: StageContext,
}

impl TaskMessage {
    /// Wrap a built stage context in a fresh envelope.
    pub fn new(correlation_id: Uuid, priority: TaskPriority, context: StageContext) -> Self {
        let task_kind = context.task_kind();
        Self {
            task_id: Uuid::new_v4(),
            correlation_id,
            created_at: Utc::now(),
            priority,
            entity_type: task_kind.entity_type(),
            task_kind,
            context,
        }
    }
}

/// Optional usage metrics reported by a worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Descriptor for a distilled training dataset produced by the distiller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_count: Option<u64>,
}

/// Inbound result envelope, consumed exactly once per applied result.
///
/// Unknown fields are tolerated so workers can evolve additively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub task_id: Uuid,
    pub correlation_id: Uuid,
    pub completed_at: DateTime<Utc>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_path: Option<String>,
    pub log_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflections: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TaskMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetDescriptor>,
}

impl ResultMessage {
    /// Build a success result (used by the mock worker and tests).
    pub fn success(task: &TaskMessage, log_output: impl Into<String>) -> Self {
        Self {
            task_id: task.task_id,
            correlation_id: task.correlation_id,
            completed_at: Utc::now(),
            status: TaskStatus::Success,
            artifacts_path: None,
            log_output: log_output.into(),
            reflections: None,
            metrics: None,
            dataset: None,
        }
    }

    /// Build a failure result carrying a worker log.
    pub fn failure(task: &TaskMessage, log_output: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failure,
            ..Self::success(task, log_output)
        }
    }
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Envelope or cross-field invariant violation. Never retried; the message
/// is dead-lettered (consume side) or never published (publish side).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("entity {entity}/kind {kind} mismatch: {kind} must route as {expected}")]
    EntityKindMismatch {
        entity: String,
        kind: String,
        expected: String,
    },

    #[error("SUCCESS result for task {task_id} has empty log_output")]
    EmptySuccessLog { task_id: Uuid },

    #[error("task {task_id}: context stage does not match task_kind {kind}")]
    ContextKindMismatch { task_id: Uuid, kind: String },

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

impl ValidationError {
    /// Canonical machine-readable reason, recorded on failed nodes and in
    /// the run summary.
    pub fn canonical_reason(&self) -> &'static str {
        match self {
            ValidationError::EntityKindMismatch { .. } => "validation/entity_kind_mismatch",
            ValidationError::EmptySuccessLog { .. } => "validation/empty_success_log",
            ValidationError::ContextKindMismatch { .. } => "validation/context_kind_mismatch",
            ValidationError::Malformed(_) => "validation/malformed",
        }
    }
}

/// Validate an outbound task envelope before any broker operation.
pub fn validate_task(message: &TaskMessage) -> Result<(), ValidationError> {
    let expected = message.task_kind.entity_type();
    if message.entity_type != expected {
        return Err(ValidationError::EntityKindMismatch {
            entity: message.entity_type.as_str().to_string(),
            kind: format!("{:?}", message.task_kind),
            expected: expected.as_str().to_string(),
        });
    }
    if message.context.task_kind() != message.task_kind {
        return Err(ValidationError::ContextKindMismatch {
            task_id: message.task_id,
            kind: format!("{:?}", message.task_kind),
        });
    }
    Ok(())
}

/// Validate an inbound result envelope before it may touch the DAG.
pub fn validate_result(message: &ResultMessage) -> Result<(), ValidationError> {
    if message.status == TaskStatus::Success && message.log_output.trim().is_empty() {
        return Err(ValidationError::EmptySuccessLog {
            task_id: message.task_id,
        });
    }
    Ok(())
}

/// Decode and validate a raw result payload from the wire.
pub fn decode_result(payload: &[u8]) -> Result<ResultMessage, ValidationError> {
    let message: ResultMessage =
        serde_json::from_slice(payload).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    validate_result(&message)?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StageContext;

    fn lint_context() -> StageContext {
        StageContext::Lint {
            node_id: "counter4".into(),
            rtl_path: "artifacts/generated/rtl/counter4.sv".into(),
            tool: Default::default(),
        }
    }

    fn sample_task() -> TaskMessage {
        TaskMessage::new(Uuid::new_v4(), TaskPriority::Low, lint_context())
    }

    #[test]
    fn entity_kind_table_is_exhaustive() {
        assert_eq!(TaskKind::Implementation.entity_type(), EntityType::Reasoning);
        assert_eq!(TaskKind::SpecHelper.entity_type(), EntityType::Reasoning);
        assert_eq!(TaskKind::Planner.entity_type(), EntityType::Reasoning);
        assert_eq!(TaskKind::Linter.entity_type(), EntityType::LightDeterministic);
        assert_eq!(TaskKind::Distiller.entity_type(), EntityType::LightDeterministic);
        assert_eq!(TaskKind::Simulator.entity_type(), EntityType::HeavyDeterministic);
    }

    #[test]
    fn new_task_derives_entity_from_context() {
        let task = sample_task();
        assert_eq!(task.task_kind, TaskKind::Linter);
        assert_eq!(task.entity_type, EntityType::LightDeterministic);
        assert!(validate_task(&task).is_ok());
    }

    #[test]
    fn poison_pill_rejected_before_broker() {
        // REASONING carrying a deterministic kind must never be published
        let mut task = sample_task();
        task.entity_type = EntityType::Reasoning;

        let err = validate_task(&task).unwrap_err();
        assert_eq!(err.canonical_reason(), "validation/entity_kind_mismatch");
    }

    #[test]
    fn success_with_empty_log_rejected() {
        let task = sample_task();
        let result = ResultMessage::success(&task, "   ");
        let err = validate_result(&result).unwrap_err();
        assert_eq!(err.canonical_reason(), "validation/empty_success_log");
    }

    #[test]
    fn failure_with_empty_log_allowed() {
        let task = sample_task();
        let result = ResultMessage::failure(&task, "");
        assert!(validate_result(&result).is_ok());
    }

    #[test]
    fn decode_rejects_unknown_status() {
        let raw = serde_json::json!({
            "task_id": Uuid::new_v4(),
            "correlation_id": Uuid::new_v4(),
            "completed_at": Utc::now(),
            "status": "SORT_OF_OK",
            "log_output": "hi",
        });
        let err = decode_result(raw.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.canonical_reason(), "validation/malformed");
    }

    #[test]
    fn decode_tolerates_unknown_fields() {
        let task = sample_task();
        let mut value = serde_json::to_value(ResultMessage::success(&task, "ok")).unwrap();
        value["future_field"] = serde_json::json!({"nested": true});

        let decoded = decode_result(value.to_string().as_bytes()).unwrap();
        assert_eq!(decoded.task_id, task.task_id);
        assert_eq!(decoded.status, TaskStatus::Success);
    }

    #[test]
    fn envelope_round_trips() {
        let task = sample_task();
        let bytes = serde_json::to_vec(&task).unwrap();
        let back: TaskMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.task_id, task.task_id);
        assert_eq!(back.task_kind, TaskKind::Linter);
        assert_eq!(back.context.node_id(), "counter4");
    }

    #[test]
    fn priorities_fit_queue_bound() {
        assert_eq!(TaskPriority::Low.as_u8(), 1);
        assert_eq!(TaskPriority::Medium.as_u8(), 2);
        assert_eq!(TaskPriority::High.as_u8(), 3);
    }
}
