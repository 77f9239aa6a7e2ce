//! Run journal (v0.1)
//!
//! Audit trail of one orchestration run, passed explicitly into the
//! orchestrator rather than through a process-wide sink. Every record
//! carries the node it concerns on the envelope, so consumers never dig
//! through event payloads to group a node's history.
//!
//! Besides the in-memory snapshot (which the tests assert against), the
//! journal write-throughs each record as one JSON line to
//! `<task_memory_root>/events.jsonl`, next to the stage artifacts it
//! narrates. Sink failures disable the sink and the run continues on the
//! in-memory journal alone.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::dag::NodeState;
use crate::message::TaskStatus;
use crate::stage::Stage;

/// One journal record.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Position in the journal (dense, starts at 0).
    pub seq: u64,
    /// Milliseconds since the journal was opened.
    pub at_ms: u64,
    /// The node this record concerns; `None` for run-level records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<Arc<str>>,
    pub kind: EventKind,
}

/// What happened. Node identity lives on the [`Event`] envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        node_count: usize,
    },
    TopologyDeclared,
    RunCompleted {
        done: usize,
        failed: usize,
        total_duration_ms: u64,
    },
    StateChanged {
        from: NodeState,
        to: NodeState,
    },
    Done,
    Failed {
        stage: Stage,
        reason: String,
    },
    RepairOpened {
        cycle: u32,
    },
    Published {
        stage: Stage,
        task_id: Uuid,
        attempt: u32,
    },
    ResultApplied {
        stage: Stage,
        task_id: Uuid,
        status: TaskStatus,
    },
    Retried {
        stage: Stage,
        attempt: u32,
        reason: String,
    },
    TimedOut {
        stage: Stage,
        task_id: Uuid,
    },
    DeadLettered {
        task_id: Option<Uuid>,
        reason: String,
    },
}

struct Inner {
    events: Vec<Event>,
    sink: Option<File>,
}

/// Append-only journal of one run. Cheap to clone; clones share the same
/// underlying journal, which is how callers keep a handle for inspection
/// after handing the orchestrator its copy.
#[derive(Clone)]
pub struct RunJournal {
    inner: Arc<Mutex<Inner>>,
    opened: Instant,
}

impl RunJournal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                events: Vec::new(),
                sink: None,
            })),
            opened: Instant::now(),
        }
    }

    /// Attach the JSONL write-through sink. Records from here on are also
    /// appended to `path`, one JSON object per line.
    pub fn attach_sink(&self, path: &Path) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.lock().sink = Some(file);
        Ok(())
    }

    /// Append one record, stamping sequence and relative time.
    pub fn record(&self, node: Option<&Arc<str>>, kind: EventKind) {
        let at_ms = self.opened.elapsed().as_millis() as u64;
        let mut inner = self.lock();
        let event = Event {
            seq: inner.events.len() as u64,
            at_ms,
            node: node.map(Arc::clone),
            kind,
        };

        let mut sink_failed = false;
        if let Some(sink) = inner.sink.as_mut() {
            match serde_json::to_string(&event) {
                Ok(line) => sink_failed = writeln!(sink, "{line}").is_err(),
                Err(_) => sink_failed = true,
            }
        }
        if sink_failed {
            inner.sink = None;
            warn!("events journal sink failed, continuing in memory only");
        }

        inner.events.push(event);
    }

    /// Copy of the journal so far.
    pub fn snapshot(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RunJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Arc<str> {
        Arc::from(id)
    }

    #[test]
    fn records_are_sequenced_and_timed() {
        let journal = RunJournal::new();
        journal.record(None, EventKind::RunStarted { node_count: 2 });
        journal.record(
            Some(&node("counter4")),
            EventKind::Published {
                stage: Stage::Implementing,
                task_id: Uuid::new_v4(),
                attempt: 1,
            },
        );
        journal.record(Some(&node("counter4")), EventKind::Done);

        let events = journal.snapshot();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(events.windows(2).all(|w| w[0].at_ms <= w[1].at_ms));
    }

    #[test]
    fn node_scope_lives_on_the_envelope() {
        let journal = RunJournal::new();
        journal.record(None, EventKind::TopologyDeclared);
        journal.record(
            Some(&node("alu")),
            EventKind::Failed {
                stage: Stage::Simulating,
                reason: "sim/mismatch".to_string(),
            },
        );

        let events = journal.snapshot();
        assert_eq!(events[0].node, None);
        assert_eq!(events[1].node.as_deref(), Some("alu"));
        // grouping a node's history needs no knowledge of the payloads
        let alu: Vec<_> = events
            .iter()
            .filter(|e| e.node.as_deref() == Some("alu"))
            .collect();
        assert_eq!(alu.len(), 1);
    }

    #[test]
    fn sink_writes_one_json_line_per_event() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");

        let journal = RunJournal::new();
        journal.attach_sink(&path).unwrap();
        journal.record(None, EventKind::RunStarted { node_count: 1 });
        journal.record(
            Some(&node("counter4")),
            EventKind::Retried {
                stage: Stage::Linting,
                attempt: 2,
                reason: "timeout/deadline".to_string(),
            },
        );

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"]["type"], "run_started");
        assert!(first.get("node").is_none());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["node"], "counter4");
        assert_eq!(second["kind"]["type"], "retried");
        assert_eq!(second["kind"]["stage"], "LINTING");
        assert_eq!(second["kind"]["attempt"], 2);
    }

    #[test]
    fn records_before_attach_stay_in_memory_only() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");

        let journal = RunJournal::new();
        journal.record(None, EventKind::TopologyDeclared);
        journal.attach_sink(&path).unwrap();
        journal.record(None, EventKind::RunStarted { node_count: 1 });

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body.lines().count(), 1);
        assert_eq!(journal.snapshot().len(), 2);
    }

    #[test]
    fn attach_sink_surfaces_io_errors() {
        let tmp = tempfile::tempdir().unwrap();
        // a directory cannot be opened for append
        let err = RunJournal::new().attach_sink(tmp.path());
        assert!(err.is_err());
    }

    #[test]
    fn clones_share_one_journal() {
        let journal = RunJournal::new();
        let inspector = journal.clone();

        journal.record(None, EventKind::RunStarted { node_count: 1 });
        journal.record(Some(&node("counter4")), EventKind::Done);

        assert_eq!(inspector.snapshot().len(), 2);
    }
}
