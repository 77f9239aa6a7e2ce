//! In-memory task bus (v0.1)
//!
//! Channel-backed [`TaskBus`] for standalone mode and tests: published
//! tasks land in an inspectable queue, results are injected through a
//! handle, and rejected deliveries accumulate in an in-memory dead-letter
//! sink instead of a broker DLQ.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ResultDelivery, TaskBus, TransportError};
use crate::message::{ResultMessage, TaskMessage};

struct ChannelBusState {
    published: Mutex<Vec<TaskMessage>>,
    pending: Mutex<HashMap<u64, Vec<u8>>>,
    dead_letters: Mutex<Vec<Vec<u8>>>,
    declared: AtomicBool,
    next_tag: AtomicU64,
}

/// In-memory bus half held by the orchestrator.
pub struct ChannelTaskBus {
    state: Arc<ChannelBusState>,
    results_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// Test/driver half: consumes published tasks, injects results, inspects
/// the dead-letter sink.
#[derive(Clone)]
pub struct ChannelBusHandle {
    state: Arc<ChannelBusState>,
    results_tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Create a connected bus/handle pair.
pub fn channel_bus() -> (ChannelTaskBus, ChannelBusHandle) {
    let state = Arc::new(ChannelBusState {
        published: Mutex::new(Vec::new()),
        pending: Mutex::new(HashMap::new()),
        dead_letters: Mutex::new(Vec::new()),
        declared: AtomicBool::new(false),
        next_tag: AtomicU64::new(1),
    });
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    (
        ChannelTaskBus {
            state: Arc::clone(&state),
            results_rx: tokio::sync::Mutex::new(results_rx),
        },
        ChannelBusHandle { state, results_tx },
    )
}

impl ChannelBusHandle {
    /// Drain every task published since the last call.
    pub fn take_published(&self) -> Vec<TaskMessage> {
        std::mem::take(
            &mut *self
                .state
                .published
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Published tasks not yet taken by a worker.
    pub fn published_backlog(&self) -> usize {
        self.state
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Inject a worker result into the results stream.
    pub fn push_result(&self, result: &ResultMessage) {
        let payload = serde_json::to_vec(result).expect("result envelope serializes");
        self.push_raw(payload);
    }

    /// Inject a raw (possibly malformed) payload into the results stream.
    pub fn push_raw(&self, payload: Vec<u8>) {
        // receiver dropped means the run is over; nothing to deliver to
        let _ = self.results_tx.send(payload);
    }

    /// Everything rejected with `requeue=false` so far.
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.state
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TaskBus for ChannelTaskBus {
    async fn declare_topology(&self) -> Result<(), TransportError> {
        // nothing to declare in memory; flag kept so the call stays idempotent
        self.state.declared.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, message: &TaskMessage) -> Result<(), TransportError> {
        debug!(task_id = %message.task_id, kind = ?message.task_kind, "channel publish");
        self.state
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }

    async fn recv_result(&self, wait: Duration) -> Result<Option<ResultDelivery>, TransportError> {
        let mut rx = self.results_rx.lock().await;
        let payload = if wait.is_zero() {
            match rx.try_recv() {
                Ok(payload) => Some(payload),
                Err(mpsc::error::TryRecvError::Empty) => None,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(TransportError::Closed)
                }
            }
        } else {
            match tokio::time::timeout(wait, rx.recv()).await {
                Ok(Some(payload)) => Some(payload),
                Ok(None) => return Err(TransportError::Closed),
                Err(_) => None,
            }
        };

        Ok(payload.map(|payload| {
            let tag = self.state.next_tag.fetch_add(1, Ordering::SeqCst);
            self.state
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(tag, payload.clone());
            ResultDelivery { tag, payload }
        }))
    }

    async fn ack(&self, tag: u64) -> Result<(), TransportError> {
        self.state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tag);
        Ok(())
    }

    async fn reject(&self, tag: u64) -> Result<(), TransportError> {
        let payload = self
            .state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tag);
        if let Some(payload) = payload {
            self.state
                .dead_letters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(payload);
        }
        Ok(())
    }
}
