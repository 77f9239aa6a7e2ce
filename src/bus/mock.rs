//! Mock worker for testing and dry runs
//!
//! Drives a [`ChannelBusHandle`] the way real workers drive the broker:
//! consumes published tasks, fabricates plausible artifacts, and reports
//! results. Failures are scriptable per stage, so orchestration paths
//! (retry, repair, timeout, poison) can be exercised without a broker or
//! any real tool.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use super::ChannelBusHandle;
use crate::context::StageContext;
use crate::design::InterfaceSpec;
use crate::message::{DatasetDescriptor, ResultMessage, TaskMessage, TaskStatus};
use crate::stage::Stage;

/// How often the worker polls for newly published tasks.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
struct FailPlan {
    remaining: u32,
    log: String,
    escalate: bool,
}

/// Per-stage behavior overrides. Default: every stage succeeds.
#[derive(Debug, Clone, Default)]
pub struct WorkerScript {
    failures: HashMap<Stage, FailPlan>,
    silent: HashSet<Stage>,
    rtl_override: Option<String>,
}

impl WorkerScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `times` attempts of `stage` with the given log, then
    /// succeed.
    pub fn fail_times(mut self, stage: Stage, times: u32, log: impl Into<String>) -> Self {
        self.failures.insert(
            stage,
            FailPlan {
                remaining: times,
                log: log.into(),
                escalate: false,
            },
        );
        self
    }

    /// Report `ESCALATED` instead of `FAILURE` for the scripted failures.
    pub fn escalate(mut self, stage: Stage, times: u32, log: impl Into<String>) -> Self {
        self.failures.insert(
            stage,
            FailPlan {
                remaining: times,
                log: log.into(),
                escalate: true,
            },
        );
        self
    }

    /// Never answer tasks of this stage (deadline tests).
    pub fn silent(mut self, stage: Stage) -> Self {
        self.silent.insert(stage);
        self
    }

    /// Emit this RTL body instead of one generated from the interface.
    pub fn with_rtl(mut self, body: impl Into<String>) -> Self {
        self.rtl_override = Some(body.into());
        self
    }
}

/// Scriptable worker pool stand-in. One instance serves all three queues.
pub struct MockWorker {
    handle: ChannelBusHandle,
    script: WorkerScript,
}

impl MockWorker {
    pub fn new(handle: ChannelBusHandle) -> Self {
        Self {
            handle,
            script: WorkerScript::new(),
        }
    }

    pub fn with_script(handle: ChannelBusHandle, script: WorkerScript) -> Self {
        Self { handle, script }
    }

    /// Serve tasks forever. Run under `tokio::spawn` and abort when the
    /// orchestrator finishes.
    pub async fn run(mut self) {
        loop {
            for task in self.handle.take_published() {
                if let Some(result) = self.respond(&task) {
                    self.handle.push_result(&result);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn respond(&mut self, task: &TaskMessage) -> Option<ResultMessage> {
        let stage = task.context.stage();
        if self.script.silent.contains(&stage) {
            debug!(task_id = %task.task_id, %stage, "mock worker staying silent");
            return None;
        }

        if let Some(plan) = self.script.failures.get_mut(&stage) {
            if plan.remaining > 0 {
                plan.remaining -= 1;
                let mut result = ResultMessage::failure(task, plan.log.clone());
                if plan.escalate {
                    result.status = TaskStatus::Escalated;
                }
                return Some(result);
            }
        }

        Some(self.succeed(task, stage))
    }

    fn succeed(&self, task: &TaskMessage, stage: Stage) -> ResultMessage {
        let mut result = ResultMessage::success(task, format!("{stage} completed"));
        match &task.context {
            StageContext::Implementation {
                interface,
                rtl_path,
                ..
            } => {
                let body = self
                    .script
                    .rtl_override
                    .clone()
                    .unwrap_or_else(|| generate_rtl(module_name(rtl_path), interface));
                write_file(Path::new(rtl_path), &body);
                result.log_output = format!("wrote {rtl_path}");
                result.artifacts_path = Some(rtl_path.clone());
            }
            StageContext::Testbench {
                interface,
                rtl_path,
                testbench_path,
                ..
            } => {
                let body = generate_testbench(module_name(rtl_path), interface);
                write_file(Path::new(testbench_path), &body);
                result.log_output = format!("wrote {testbench_path}");
                result.artifacts_path = Some(testbench_path.clone());
            }
            StageContext::Lint { rtl_path, .. } => {
                result.log_output = format!("lint clean: {rtl_path}, 0 warnings");
            }
            StageContext::Simulate { .. } => {
                result.log_output = "simulation passed: all scenarios ok".to_string();
            }
            StageContext::Distill { dataset_path, .. } => {
                write_file(
                    Path::new(dataset_path),
                    "{\"stimulus\":\"reset\",\"expected\":\"0\"}\n",
                );
                result.log_output = format!("distilled 1 example to {dataset_path}");
                result.artifacts_path = Some(dataset_path.clone());
                result.dataset = Some(DatasetDescriptor {
                    path: dataset_path.clone(),
                    example_count: Some(1),
                });
            }
            StageContext::Reflect { .. } => {
                result.log_output = "reflection complete".to_string();
                result.reflections =
                    Some("waveforms agree with the plan; no uncovered paths".to_string());
            }
            StageContext::Debug { rtl_path, .. } => {
                // keep the implementation's RTL; a real debugger would patch it
                result.log_output = format!("debugged {rtl_path}");
                result.artifacts_path = Some(rtl_path.clone());
            }
        }
        result
    }
}

fn module_name(rtl_path: &str) -> &str {
    Path::new(rtl_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("dut")
}

fn write_file(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(path, body);
}

fn width_decl(width: u32) -> String {
    if width <= 1 {
        String::new()
    } else {
        format!("[{}:0] ", width - 1)
    }
}

fn generate_rtl(module: &str, interface: &InterfaceSpec) -> String {
    let ports = interface
        .signals
        .iter()
        .map(|s| {
            format!(
                "    {} logic {}{}",
                s.direction.keyword(),
                width_decl(s.width),
                s.name
            )
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!("module {module} (\n{ports}\n);\nendmodule\n")
}

fn generate_testbench(module: &str, interface: &InterfaceSpec) -> String {
    let connections = interface
        .signals
        .iter()
        .map(|s| format!(".{0}({0})", s.name))
        .collect::<Vec<_>>()
        .join(", ");
    let drives = interface
        .inputs()
        .map(|s| format!("        {} = '0;", s.name))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "module {module}_tb;\n    {module} dut ({connections});\n    initial begin\n{drives}\n    end\nendmodule\n"
    )
}
