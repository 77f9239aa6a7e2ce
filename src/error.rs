//! # Error Module
//!
//! Unified error surface for the rtlforge CLI.
//!
//! Each layer keeps its own `thiserror` enum close to the code that raises
//! it: validation in `message`, transport in `bus`, storage in `memory`,
//! plan loading in `design`, postconditions in `postcheck`. This module
//! only wraps them for the CLI entry point, so `?` composes across layers
//! without erasing which boundary failed.

use thiserror::Error;

use crate::bus::TransportError;
use crate::context::ContextError;
use crate::design::PlanError;
use crate::memory::MemoryError;
use crate::message::ValidationError;
use crate::postcheck::PostconditionError;

/// Top-level error type for the rtlforge CLI.
#[derive(Error, Debug)]
pub enum ForgeError {
    /// Envelope or cross-field invariant violation. Never retried.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Broker publish/consume failure after bounded retry.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// Task memory storage failure.
    #[error("{0}")]
    Memory(#[from] MemoryError),

    /// Planner document failure (dag.json / design_context.json).
    #[error("{0}")]
    Plan(#[from] PlanError),

    /// Context assembly failure (missing prior artifact).
    #[error("{0}")]
    Context(#[from] ContextError),

    /// Orchestrator-detected postcondition failure.
    #[error("{0}")]
    Postcondition(#[from] PostconditionError),

    /// IO error (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl ForgeError {
    /// Create a generic error with a message.
    pub fn other(msg: impl Into<String>) -> Self {
        ForgeError::Other(msg.into())
    }

    /// Canonical machine-readable reason for summaries and node records.
    pub fn canonical_reason(&self) -> &'static str {
        match self {
            ForgeError::Validation(e) => e.canonical_reason(),
            ForgeError::Transport(_) => "transport/broker",
            ForgeError::Memory(_) => "memory/io",
            ForgeError::Plan(_) => "plan/invalid",
            ForgeError::Context(_) => "context/missing_prior",
            ForgeError::Postcondition(e) => e.canonical_reason(),
            ForgeError::Io(_) => "io",
            ForgeError::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn wraps_validation_with_canonical_reason() {
        let err: ForgeError = ValidationError::EmptySuccessLog {
            task_id: Uuid::new_v4(),
        }
        .into();
        assert_eq!(err.canonical_reason(), "validation/empty_success_log");
    }

    #[test]
    fn wraps_transport() {
        let err: ForgeError = TransportError::ConfirmTimeout.into();
        assert_eq!(err.canonical_reason(), "transport/broker");
        assert!(err.to_string().contains("confirmation"));
    }

    #[test]
    fn wraps_postcondition_as_interface_mismatch() {
        let err: ForgeError = PostconditionError::PortMissing("count".to_string()).into();
        assert_eq!(err.canonical_reason(), "interface/mismatch");
    }

    #[test]
    fn wraps_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ForgeError = io.into();
        assert!(err.to_string().contains("IO error"));
    }
}
