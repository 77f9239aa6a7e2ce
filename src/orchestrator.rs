//! # Orchestrator Loop (v0.1)
//!
//! Single-writer control plane over the DAG. One tick:
//!
//! 1. Drain ready results without blocking and apply them.
//! 2. Scan for ready nodes (deps `DONE`, nothing in flight), build context,
//!    publish, record in-flight with a deadline.
//! 3. Expire deadlines by synthesizing local timeout failures.
//! 4. Block briefly on the results stream when nothing changed.
//!
//! The loop is the sole mutator of DAG execution state and task memory;
//! broker I/O happens through the [`TaskBus`] seam. Failures of one node
//! never cascade writes into another: dependents simply stay `PENDING`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use colored::Colorize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bus::{ResultDelivery, TaskBus};
use crate::classifier::{Disposition, FailureClassifier, Verdict};
use crate::config::Config;
use crate::context::ContextBuilder;
use crate::dag::{Dag, InFlight, NodeState};
use crate::design::DesignContext;
use crate::error::ForgeError;
use crate::journal::{EventKind, RunJournal};
use crate::memory::TaskMemory;
use crate::message::{self, ResultMessage, TaskMessage, TaskStatus};
use crate::postcheck;
use crate::stage::Stage;
use crate::state;

/// How long an idle tick blocks on the results stream.
const IDLE_WAIT: Duration = Duration::from_millis(25);

/// Pause between publish retries after a transport error.
const PUBLISH_RETRY_PAUSE: Duration = Duration::from_millis(100);

// ============================================================================
// RUN SUMMARY
// ============================================================================

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Every node reached `DONE`.
    Completed,
    /// A node failed and no further progress was possible.
    Stalled,
    /// The external run deadline elapsed first.
    DeadlineExceeded,
}

/// Terminal report for one node.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub id: Arc<str>,
    pub state: NodeState,
    pub failed_stage: Option<Stage>,
    pub reason: Option<String>,
    pub last_log: Option<PathBuf>,
    pub escalated: bool,
}

/// Execution summary emitted at run termination.
#[derive(Debug)]
pub struct RunSummary {
    pub termination: Termination,
    pub nodes: Vec<NodeReport>,
    pub done: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.termination == Termination::Completed
    }

    /// Human-readable colored report for the CLI.
    pub fn render(&self) -> String {
        let headline = match self.termination {
            Termination::Completed => format!(
                "{} {} node(s) done in {} ms",
                "✓".green().bold(),
                self.done,
                self.duration_ms
            ),
            Termination::Stalled => format!(
                "{} run stalled: {} done, {} failed ({} ms)",
                "✗".red().bold(),
                self.done,
                self.failed,
                self.duration_ms
            ),
            Termination::DeadlineExceeded => format!(
                "{} run deadline exceeded: {} done, {} failed ({} ms)",
                "✗".red().bold(),
                self.done,
                self.failed,
                self.duration_ms
            ),
        };

        let mut out = vec![headline];
        for node in &self.nodes {
            let line = match node.state {
                NodeState::Done => format!("  {} {:<20} DONE", "✓".green(), node.id),
                NodeState::Failed => {
                    let stage = node
                        .failed_stage
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "?".to_string());
                    let reason = node.reason.as_deref().unwrap_or("unknown");
                    let status = if node.escalated { "ESCALATED" } else { "FAILED" };
                    let mut line = format!(
                        "  {} {:<20} {} at {} ({})",
                        "✗".red(),
                        node.id,
                        status.red(),
                        stage,
                        reason
                    );
                    if let Some(log) = &node.last_log {
                        line.push_str(&format!(" (last log: {})", log.display()));
                    }
                    line
                }
                other => format!("  {} {:<20} {:?}", "·".yellow(), node.id, other),
            };
            out.push(line);
        }
        out.join("\n")
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Single-instance authority for one run.
pub struct Orchestrator {
    bus: Arc<dyn TaskBus>,
    dag: Dag,
    design: DesignContext,
    memory: TaskMemory,
    classifier: FailureClassifier,
    config: Config,
    journal: RunJournal,
    /// In-flight correlation: task_id → node id. Kept in lockstep with
    /// `DagNode::in_flight`; a task missing here is unknown or superseded.
    flights: HashMap<Uuid, Arc<str>>,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<dyn TaskBus>,
        dag: Dag,
        design: DesignContext,
        memory: TaskMemory,
        config: Config,
    ) -> Self {
        Self {
            bus,
            dag,
            design,
            memory,
            classifier: FailureClassifier::default(),
            config,
            journal: RunJournal::new(),
            flights: HashMap::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn journal(&self) -> &RunJournal {
        &self.journal
    }

    /// Drive the run to termination.
    #[instrument(skip(self), fields(nodes = self.dag.len()))]
    pub async fn run(&mut self) -> Result<RunSummary, ForgeError> {
        // audit trail lives next to the stage artifacts it narrates
        let journal_path = self.memory.root().join("events.jsonl");
        if let Err(e) = self.journal.attach_sink(&journal_path) {
            warn!(error = %e, path = %journal_path.display(), "events journal disabled");
        }

        self.bus.declare_topology().await?;
        self.journal.record(None, EventKind::TopologyDeclared);
        self.recover();
        self.journal.record(
            None,
            EventKind::RunStarted {
                node_count: self.dag.len(),
            },
        );
        let started = Instant::now();

        loop {
            let mut progressed = self.drain_results().await?;
            progressed |= self.dispatch_ready().await?;
            progressed |= self.expire_deadlines().await?;

            if self.dag.all_done() || self.dag.stalled() {
                break;
            }
            if let Some(limit) = self.config.run_deadline {
                if started.elapsed() >= limit {
                    return Ok(self.finish(Termination::DeadlineExceeded, started));
                }
            }
            if !progressed {
                if let Some(delivery) = self.bus.recv_result(IDLE_WAIT).await? {
                    self.apply_delivery(delivery).await?;
                }
            }
        }

        let termination = if self.dag.all_done() {
            Termination::Completed
        } else {
            Termination::Stalled
        };
        Ok(self.finish(termination, started))
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Rebuild node states from task memory after a restart. A stage whose
    /// last recorded result is SUCCESS stays done; the first stage without
    /// one re-publishes. In-flight state never survives a restart.
    fn recover(&mut self) {
        let ids: Vec<Arc<str>> = self.dag.nodes().map(|n| Arc::clone(&n.id)).collect();
        for id in ids {
            let mut state = NodeState::Pending;
            for stage in Stage::NORMAL {
                match self.memory.last_status(&id, stage) {
                    Some(TaskStatus::Success) => {
                        state = match state::on_success(stage, false) {
                            state::Advance::Stage(next) => NodeState::for_stage(next),
                            state::Advance::Done => NodeState::Done,
                        };
                    }
                    _ => break,
                }
            }
            let node = self.node_mut(&id);
            if node.state != state {
                debug!(node = %id, ?state, "recovered node state from task memory");
                node.state = state;
            }
            for stage in Stage::ALL {
                let recorded = self.memory.attempt_count(&id, stage);
                if recorded > 0 {
                    self.node_mut(&id).attempts.insert(stage, recorded);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Tick phases
    // ------------------------------------------------------------------

    async fn drain_results(&mut self) -> Result<bool, ForgeError> {
        let mut progressed = false;
        while let Some(delivery) = self.bus.recv_result(Duration::ZERO).await? {
            self.apply_delivery(delivery).await?;
            progressed = true;
        }
        Ok(progressed)
    }

    async fn dispatch_ready(&mut self) -> Result<bool, ForgeError> {
        let mut progressed = false;
        for node_id in self.dag.ready_nodes() {
            if self.dag.in_flight_count() >= self.config.max_in_flight {
                debug!("in-flight ceiling reached, deferring dispatch");
                break;
            }
            progressed |= self.publish_stage(node_id).await?;
        }
        Ok(progressed)
    }

    async fn expire_deadlines(&mut self) -> Result<bool, ForgeError> {
        let now = Instant::now();
        let expired: Vec<(Arc<str>, InFlight)> = self
            .dag
            .nodes()
            .filter_map(|n| {
                n.in_flight
                    .as_ref()
                    .filter(|f| f.deadline <= now)
                    .map(|f| (Arc::clone(&n.id), f.clone()))
            })
            .collect();
        let any = !expired.is_empty();

        for (node_id, flight) in expired {
            self.flights.remove(&flight.task_id);
            let correlation_id = {
                let node = self.node_mut(&node_id);
                node.in_flight = None;
                node.correlation_id
            };
            self.journal.record(
                Some(&node_id),
                EventKind::TimedOut {
                    stage: flight.stage,
                    task_id: flight.task_id,
                },
            );
            warn!(node = %node_id, stage = %flight.stage, "deadline elapsed, synthesizing failure");

            let synthetic = ResultMessage {
                task_id: flight.task_id,
                correlation_id,
                completed_at: Utc::now(),
                status: TaskStatus::Failure,
                artifacts_path: None,
                log_output: format!(
                    "timeout/deadline: {} exceeded {}s with no result",
                    flight.stage,
                    self.config.stage_timeout(flight.stage).as_secs()
                ),
                reflections: None,
                metrics: None,
                dataset: None,
            };
            self.memory.record_result(&node_id, flight.stage, &synthetic)?;
            let verdict =
                self.classifier
                    .classify(flight.stage, flight.attempt, &synthetic.log_output);
            self.handle_failure(node_id, flight.stage, verdict, false).await?;
        }
        Ok(any)
    }

    // ------------------------------------------------------------------
    // Result application
    // ------------------------------------------------------------------

    async fn apply_delivery(&mut self, delivery: ResultDelivery) -> Result<(), ForgeError> {
        let result = match message::decode_result(&delivery.payload) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "unappliable result, dead-lettering");
                self.journal.record(
                    None,
                    EventKind::DeadLettered {
                        task_id: None,
                        reason: e.canonical_reason().to_string(),
                    },
                );
                return self.bus.reject(delivery.tag).await.map_err(Into::into);
            }
        };

        let Some(node_id) = self.flights.remove(&result.task_id) else {
            // unknown or superseded (late arrival after a timeout)
            warn!(task_id = %result.task_id, "result for unknown task, dead-lettering");
            self.journal.record(
                None,
                EventKind::DeadLettered {
                    task_id: Some(result.task_id),
                    reason: "unknown_task".to_string(),
                },
            );
            return self.bus.reject(delivery.tag).await.map_err(Into::into);
        };

        let Some(flight) = self.node_mut(&node_id).in_flight.take() else {
            warn!(node = %node_id, "flight record missing, dead-lettering");
            return self.bus.reject(delivery.tag).await.map_err(Into::into);
        };
        let stage = flight.stage;

        self.memory.record_result(&node_id, stage, &result)?;
        self.journal.record(
            Some(&node_id),
            EventKind::ResultApplied {
                stage,
                task_id: result.task_id,
                status: result.status,
            },
        );

        match result.status {
            TaskStatus::Success => {
                self.apply_success(node_id, stage, &result)?;
                self.bus.ack(delivery.tag).await?;
            }
            TaskStatus::Failure | TaskStatus::Escalated => {
                let escalated = result.status == TaskStatus::Escalated;
                let verdict =
                    self.classifier
                        .classify(stage, flight.attempt, &result.log_output);
                if verdict.reject_to_dlq {
                    self.journal.record(
                        Some(&node_id),
                        EventKind::DeadLettered {
                            task_id: Some(result.task_id),
                            reason: verdict.signature.class.as_reason().to_string(),
                        },
                    );
                    self.bus.reject(delivery.tag).await?;
                } else {
                    self.bus.ack(delivery.tag).await?;
                }
                self.handle_failure(node_id, stage, verdict, escalated).await?;
            }
        }
        Ok(())
    }

    /// Validate stage postconditions, then advance the node.
    fn apply_success(
        &mut self,
        node_id: Arc<str>,
        stage: Stage,
        result: &ResultMessage,
    ) -> Result<(), ForgeError> {
        let design = self
            .design
            .node(&node_id)
            .map_err(ForgeError::Plan)?
            .clone();

        if let Err(post) = postcheck::verify(stage, &design, result, &self.config.artifacts_root) {
            // terminal: a lying SUCCESS is worse than a failure
            warn!(node = %node_id, %stage, error = %post, "postcondition failed");
            self.memory
                .write_marker(&node_id, stage, "postcondition_failed.txt", &post.to_string())?;
            let last_log = self.last_log_string(&node_id, stage);
            let node = self.node_mut(&node_id);
            state::fail_node(node, stage, post.canonical_reason(), last_log, false);
            self.journal.record(
                Some(&node_id),
                EventKind::Failed {
                    stage,
                    reason: post.canonical_reason().to_string(),
                },
            );
            return Ok(());
        }

        if let Some(artifact) = self.memory.get_artifact_path(&node_id, stage) {
            let artifact = artifact.display().to_string();
            self.node_mut(&node_id).artifacts.insert(stage, artifact);
        }

        let node = self.node_mut(&node_id);
        let from = node.state;
        let to = state::apply_success(node, stage);
        self.journal
            .record(Some(&node_id), EventKind::StateChanged { from, to });
        if to == NodeState::Done {
            info!(node = %node_id, "node complete");
            self.journal.record(Some(&node_id), EventKind::Done);
        }
        Ok(())
    }

    /// Apply a classified failure: retry once, open a repair cycle, or
    /// fail the node terminally.
    async fn handle_failure(
        &mut self,
        node_id: Arc<str>,
        stage: Stage,
        verdict: Verdict,
        escalated: bool,
    ) -> Result<(), ForgeError> {
        let reason = verdict.signature.class.as_reason();

        // an escalated worker already gave up; never retry on its behalf
        let disposition = if escalated {
            Disposition::TerminalFail
        } else {
            verdict.disposition
        };

        let can_retry = state::retry_available(self.node_mut(&node_id));
        match disposition {
            Disposition::RetryOnce if can_retry => {
                let attempt = self.node_mut(&node_id).opening_attempts + 1;
                self.journal.record(
                    Some(&node_id),
                    EventKind::Retried {
                        stage,
                        attempt,
                        reason: reason.to_string(),
                    },
                );
                info!(node = %node_id, %stage, attempt, %reason, "retrying stage");
                self.publish_stage(node_id).await?;
            }
            _ => {
                if !verdict.signature.class.is_poison()
                    && state::repair_available(self.node_mut(&node_id), stage)
                {
                    let node = self.node_mut(&node_id);
                    state::enter_repair(node);
                    let cycle = node.repair_cycles;
                    info!(node = %node_id, cycle, "entering repair cycle");
                    self.journal
                        .record(Some(&node_id), EventKind::RepairOpened { cycle });
                } else {
                    let last_log = self.last_log_string(&node_id, stage);
                    let node = self.node_mut(&node_id);
                    state::fail_node(node, stage, reason, last_log, escalated);
                    warn!(node = %node_id, %stage, %reason, "node failed");
                    self.journal.record(
                        Some(&node_id),
                        EventKind::Failed {
                            stage,
                            reason: reason.to_string(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Build, validate, publish and record one stage for a node. Returns
    /// true when the tick made progress (including terminal failures).
    async fn publish_stage(&mut self, node_id: Arc<str>) -> Result<bool, ForgeError> {
        let (stage, correlation_id, context) = {
            let Some(node) = self.dag.get(&node_id) else {
                return Ok(false);
            };
            let Some(stage) = node.next_stage() else {
                return Ok(false);
            };
            let builder =
                ContextBuilder::new(&self.design, &self.memory, &self.config.artifacts_root);
            match builder.build(node, stage) {
                Ok(context) => (stage, node.correlation_id, context),
                Err(e) => {
                    warn!(node = %node_id, %stage, error = %e, "context build failed");
                    let node = self.node_mut(&node_id);
                    state::fail_node(node, stage, "context/missing_prior", None, false);
                    self.journal.record(
                        Some(&node_id),
                        EventKind::Failed {
                            stage,
                            reason: "context/missing_prior".to_string(),
                        },
                    );
                    return Ok(true);
                }
            }
        };

        let message = TaskMessage::new(correlation_id, self.config.priority_for(stage), context);

        // poison pills die here, before any broker operation
        if let Err(e) = message::validate_task(&message) {
            warn!(node = %node_id, %stage, error = %e, "rejecting task at validation boundary");
            let reason = e.canonical_reason();
            let node = self.node_mut(&node_id);
            state::fail_node(node, stage, reason, None, false);
            self.journal.record(
                Some(&node_id),
                EventKind::Failed {
                    stage,
                    reason: reason.to_string(),
                },
            );
            return Ok(true);
        }

        // bounded in-process retry for transient dispatch failures
        let mut publish_attempts = 0;
        loop {
            match self.bus.publish(&message).await {
                Ok(()) => break,
                Err(e) => {
                    publish_attempts += 1;
                    warn!(node = %node_id, %stage, attempt = publish_attempts, error = %e, "publish failed");
                    if publish_attempts >= self.config.publish_retries {
                        let node = self.node_mut(&node_id);
                        state::fail_node(node, stage, "transport/publish", None, false);
                        self.journal.record(
                            Some(&node_id),
                            EventKind::Failed {
                                stage,
                                reason: "transport/publish".to_string(),
                            },
                        );
                        return Ok(true);
                    }
                    tokio::time::sleep(PUBLISH_RETRY_PAUSE).await;
                }
            }
        }

        self.memory.record_publish(&node_id, stage, &message)?;
        let deadline = Instant::now() + self.config.stage_timeout(stage);
        let node = self.node_mut(&node_id);
        node.opening_attempts += 1;
        *node.attempts.entry(stage).or_insert(0) += 1;
        let from = node.state;
        node.state = NodeState::for_stage(stage);
        let attempt = node.opening_attempts;
        node.in_flight = Some(InFlight {
            stage,
            task_id: message.task_id,
            deadline,
            attempt,
        });
        let to = node.state;
        self.flights.insert(message.task_id, Arc::clone(&node_id));

        debug!(node = %node_id, %stage, task_id = %message.task_id, attempt, "published stage");
        self.journal.record(
            Some(&node_id),
            EventKind::Published {
                stage,
                task_id: message.task_id,
                attempt,
            },
        );
        if from != to {
            self.journal
                .record(Some(&node_id), EventKind::StateChanged { from, to });
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    fn finish(&self, termination: Termination, started: Instant) -> RunSummary {
        let nodes: Vec<NodeReport> = self
            .dag
            .nodes()
            .map(|n| {
                let failed_stage = n.failure.as_ref().map(|f| f.stage);
                NodeReport {
                    id: Arc::clone(&n.id),
                    state: n.state,
                    failed_stage,
                    reason: n.failure.as_ref().map(|f| f.reason.clone()),
                    last_log: failed_stage.and_then(|s| self.memory.get_log_path(&n.id, s)),
                    escalated: n.failure.as_ref().is_some_and(|f| f.escalated),
                }
            })
            .collect();
        let done = nodes.iter().filter(|n| n.state == NodeState::Done).count();
        let failed = nodes.iter().filter(|n| n.state == NodeState::Failed).count();
        let duration_ms = started.elapsed().as_millis() as u64;

        self.journal.record(
            None,
            EventKind::RunCompleted {
                done,
                failed,
                total_duration_ms: duration_ms,
            },
        );
        info!(done, failed, duration_ms, ?termination, "run finished");

        RunSummary {
            termination,
            nodes,
            done,
            failed,
            duration_ms,
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn node_mut(&mut self, id: &Arc<str>) -> &mut crate::dag::DagNode {
        self.dag
            .get_mut(id)
            .expect("node exists for the lifetime of the run")
    }

    fn last_log_string(&self, node_id: &str, stage: Stage) -> Option<String> {
        self.memory
            .get_log_path(node_id, stage)
            .map(|p| p.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::channel_bus;
    use crate::dag::RawDag;

    fn design() -> DesignContext {
        serde_json::from_value(serde_json::json!({
            "design_context_hash": "aa55aa55",
            "nodes": {
                "counter4": {
                    "rtl_file": "generated/rtl/counter4.sv",
                    "testbench_file": "generated/rtl/counter4_tb.sv",
                    "interface": {"signals": [
                        {"name": "clk", "direction": "input", "width": 1},
                        {"name": "count", "direction": "output", "width": 4}
                    ]},
                    "clocking": {"clk": {"freq_hz": 100000000u64, "reset": "rst_n", "reset_active_low": true}}
                }
            }
        }))
        .unwrap()
    }

    fn dag(design: &DesignContext) -> Dag {
        let raw: RawDag = serde_json::from_value(serde_json::json!({
            "nodes": [{"id": "counter4", "type": "sequential", "deps": []}]
        }))
        .unwrap();
        Dag::from_raw(raw, design).unwrap()
    }

    #[tokio::test]
    async fn recover_skips_completed_stages() {
        let tmp = tempfile::tempdir().unwrap();
        let design = design();
        let artifacts_root = tmp.path().join("artifacts");
        let memory_root = tmp.path().join("memory");

        // first life: implementation succeeded, lint published but no result
        {
            let mut memory = TaskMemory::open(&memory_root, &artifacts_root).unwrap();
            let node: Arc<str> = Arc::from("counter4");
            let impl_task = TaskMessage::new(
                Uuid::new_v4(),
                crate::message::TaskPriority::Medium,
                crate::context::StageContext::for_test("counter4", Stage::Implementing),
            );
            memory.record_publish(&node, Stage::Implementing, &impl_task).unwrap();
            memory
                .record_result(
                    &node,
                    Stage::Implementing,
                    &ResultMessage::success(&impl_task, "ok"),
                )
                .unwrap();
            let lint_task = TaskMessage::new(
                Uuid::new_v4(),
                crate::message::TaskPriority::Low,
                crate::context::StageContext::for_test("counter4", Stage::Linting),
            );
            memory.record_publish(&node, Stage::Linting, &lint_task).unwrap();
        }

        // second life
        let memory = TaskMemory::open(&memory_root, &artifacts_root).unwrap();
        let (bus, _handle) = channel_bus();
        let mut config = Config::default();
        config.artifacts_root = artifacts_root;
        let mut orch = Orchestrator::new(Arc::new(bus), dag(&design), design.clone(), memory, config);
        orch.recover();

        let node = orch.dag.get("counter4").unwrap();
        assert_eq!(node.state, NodeState::Linting);
        assert!(node.in_flight.is_none());
        assert_eq!(node.attempts.get(&Stage::Linting), Some(&1));
    }

    #[test]
    fn summary_render_lists_failures() {
        let summary = RunSummary {
            termination: Termination::Stalled,
            nodes: vec![
                NodeReport {
                    id: Arc::from("counter4"),
                    state: NodeState::Done,
                    failed_stage: None,
                    reason: None,
                    last_log: None,
                    escalated: false,
                },
                NodeReport {
                    id: Arc::from("alu"),
                    state: NodeState::Failed,
                    failed_stage: Some(Stage::Simulating),
                    reason: Some("sim/mismatch".to_string()),
                    last_log: Some(PathBuf::from("memory/alu/simulating/log.2.txt")),
                    escalated: false,
                },
            ],
            done: 1,
            failed: 1,
            duration_ms: 420,
        };

        let rendered = summary.render();
        assert!(rendered.contains("counter4"));
        assert!(rendered.contains("sim/mismatch"));
        assert!(rendered.contains("log.2.txt"));
        assert!(!summary.is_success());
    }
}
