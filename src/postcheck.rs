//! Stage postconditions (v0.1)
//!
//! Orchestrator-side verification of worker output before a stage may
//! advance. A worker saying SUCCESS is not enough: the artifact has to
//! exist and honor the frozen interface. Postcondition failures are
//! terminal for the node (never retried) and leave a marker in task
//! memory.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::design::{InterfaceSpec, NodeDesign, PortDirection};
use crate::message::ResultMessage;
use crate::stage::Stage;

/// A postcondition the stage output failed to meet.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PostconditionError {
    #[error("artifact missing at {0}")]
    MissingArtifact(String),

    #[error("artifact at {0} is empty")]
    EmptyArtifact(String),

    #[error("rtl does not declare module '{0}'")]
    ModuleNotDeclared(String),

    #[error("interface mismatch: port '{0}' not declared")]
    PortMissing(String),

    #[error("interface mismatch: port '{name}' is {found}, expected {expected}")]
    PortDirectionMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("interface mismatch: port '{name}' is {found} bits, expected {expected}")]
    PortWidthMismatch {
        name: String,
        expected: u32,
        found: u32,
    },

    #[error("testbench does not reference module '{0}'")]
    TestbenchMissingDut(String),

    #[error("testbench does not drive input '{0}'")]
    TestbenchInputUndriven(String),

    #[error("no log captured for {0} stage")]
    EmptyLog(Stage),

    #[error("distilled dataset missing or empty")]
    EmptyDataset,

    #[error("reflection insights body is empty")]
    EmptyInsights,
}

impl PostconditionError {
    /// Canonical reason recorded on the failed node.
    pub fn canonical_reason(&self) -> &'static str {
        match self {
            PostconditionError::MissingArtifact(_) | PostconditionError::EmptyArtifact(_) => {
                "artifact/missing"
            }
            PostconditionError::ModuleNotDeclared(_)
            | PostconditionError::PortMissing(_)
            | PostconditionError::PortDirectionMismatch { .. }
            | PostconditionError::PortWidthMismatch { .. } => "interface/mismatch",
            PostconditionError::TestbenchMissingDut(_)
            | PostconditionError::TestbenchInputUndriven(_) => "testbench/incomplete",
            PostconditionError::EmptyLog(_) => "log/missing",
            PostconditionError::EmptyDataset => "dataset/empty",
            PostconditionError::EmptyInsights => "insights/empty",
        }
    }
}

/// Verify the postcondition of one successful stage.
///
/// `artifacts_root` anchors the node's RTL and testbench write targets.
pub fn verify(
    stage: Stage,
    design: &NodeDesign,
    result: &ResultMessage,
    artifacts_root: &Path,
) -> Result<(), PostconditionError> {
    match stage {
        Stage::Implementing | Stage::Debugging => {
            let rtl = read_artifact(&artifacts_root.join(&design.rtl_file))?;
            check_module_interface(&rtl, design.module_name(), &design.interface)
        }
        Stage::Testbenching => {
            let tb = read_artifact(&artifacts_root.join(&design.testbench_file))?;
            check_testbench(&tb, design.module_name(), &design.interface)
        }
        Stage::Linting | Stage::Simulating => {
            if result.log_output.trim().is_empty() {
                Err(PostconditionError::EmptyLog(stage))
            } else {
                Ok(())
            }
        }
        Stage::Distilling => {
            let path = result
                .artifacts_path
                .as_deref()
                .or(result.dataset.as_ref().map(|d| d.path.as_str()))
                .ok_or(PostconditionError::EmptyDataset)?;
            let meta = std::fs::metadata(path).map_err(|_| PostconditionError::EmptyDataset)?;
            if meta.len() == 0 {
                Err(PostconditionError::EmptyDataset)
            } else {
                Ok(())
            }
        }
        Stage::Reflecting => match result.reflections.as_deref() {
            Some(body) if !body.trim().is_empty() => Ok(()),
            _ => Err(PostconditionError::EmptyInsights),
        },
    }
}

fn read_artifact(path: &Path) -> Result<String, PostconditionError> {
    let body = std::fs::read_to_string(path)
        .map_err(|_| PostconditionError::MissingArtifact(path.display().to_string()))?;
    if body.trim().is_empty() {
        return Err(PostconditionError::EmptyArtifact(path.display().to_string()));
    }
    Ok(body)
}

// ============================================================================
// RTL PARSING
// ============================================================================

static MODULE_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*module\s+([A-Za-z_]\w*)").expect("module pattern compiles")
});

static PORT_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)\b(input|output|inout)\s+(?:logic\s+|wire\s+|reg\s+)?(?:\[\s*(\d+)\s*:\s*(\d+)\s*\]\s*)?([A-Za-z_]\w*)")
        .expect("port pattern compiles")
});

#[derive(Debug)]
struct ParsedPort {
    direction: PortDirection,
    width: u32,
}

fn parse_ports(rtl: &str) -> Vec<(String, ParsedPort)> {
    PORT_DECL
        .captures_iter(rtl)
        .map(|cap| {
            let direction = match &cap[1] {
                "input" => PortDirection::Input,
                "output" => PortDirection::Output,
                _ => PortDirection::Inout,
            };
            let width = match (cap.get(2), cap.get(3)) {
                (Some(msb), Some(lsb)) => {
                    let msb: u32 = msb.as_str().parse().unwrap_or(0);
                    let lsb: u32 = lsb.as_str().parse().unwrap_or(0);
                    msb.abs_diff(lsb) + 1
                }
                _ => 1,
            };
            (cap[4].to_string(), ParsedPort { direction, width })
        })
        .collect()
}

/// RTL must declare the expected module and every interface signal with the
/// planned direction and width.
fn check_module_interface(
    rtl: &str,
    module_name: &str,
    interface: &InterfaceSpec,
) -> Result<(), PostconditionError> {
    let declares = MODULE_DECL
        .captures_iter(rtl)
        .any(|cap| &cap[1] == module_name);
    if !declares {
        return Err(PostconditionError::ModuleNotDeclared(module_name.to_string()));
    }

    let ports = parse_ports(rtl);
    for signal in &interface.signals {
        let Some((_, parsed)) = ports.iter().find(|(name, _)| name == &signal.name) else {
            return Err(PostconditionError::PortMissing(signal.name.clone()));
        };
        if parsed.direction != signal.direction {
            return Err(PostconditionError::PortDirectionMismatch {
                name: signal.name.clone(),
                expected: signal.direction.keyword(),
                found: parsed.direction.keyword(),
            });
        }
        if parsed.width != signal.width {
            return Err(PostconditionError::PortWidthMismatch {
                name: signal.name.clone(),
                expected: signal.width,
                found: parsed.width,
            });
        }
    }
    Ok(())
}

/// Testbench must reference the module under test and mention every input
/// port (a port never named cannot be driven).
fn check_testbench(
    tb: &str,
    module_name: &str,
    interface: &InterfaceSpec,
) -> Result<(), PostconditionError> {
    if !tb.contains(module_name) {
        return Err(PostconditionError::TestbenchMissingDut(module_name.to_string()));
    }
    for input in interface.inputs() {
        let driven = Regex::new(&format!(r"\b{}\b", regex::escape(&input.name)))
            .map(|re| re.is_match(tb))
            .unwrap_or(false);
        if !driven {
            return Err(PostconditionError::TestbenchInputUndriven(input.name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StageContext;
    use crate::message::{TaskMessage, TaskPriority};
    use uuid::Uuid;

    fn design() -> NodeDesign {
        serde_json::from_value(serde_json::json!({
            "rtl_file": "generated/rtl/counter4.sv",
            "testbench_file": "generated/rtl/counter4_tb.sv",
            "interface": {"signals": [
                {"name": "clk", "direction": "input", "width": 1},
                {"name": "rst_n", "direction": "input", "width": 1},
                {"name": "count", "direction": "output", "width": 4}
            ]},
            "clocking": {"clk": {"freq_hz": 100000000u64, "reset": "rst_n", "reset_active_low": true}}
        }))
        .unwrap()
    }

    fn result_with_log(log: &str) -> ResultMessage {
        let task = TaskMessage::new(
            Uuid::new_v4(),
            TaskPriority::Medium,
            StageContext::for_test("counter4", Stage::Linting),
        );
        ResultMessage::success(&task, log)
    }

    const GOOD_RTL: &str = "\
module counter4 (
    input  logic clk,
    input  logic rst_n,
    output logic [3:0] count
);
    always_ff @(posedge clk or negedge rst_n) begin
        if (!rst_n) count <= '0;
        else count <= count + 1'b1;
    end
endmodule
";

    fn write_rtl(root: &Path, body: &str) {
        let path = root.join("generated/rtl/counter4.sv");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn accepts_conforming_rtl() {
        let tmp = tempfile::tempdir().unwrap();
        write_rtl(tmp.path(), GOOD_RTL);
        let result = result_with_log("wrote rtl");
        assert!(verify(Stage::Implementing, &design(), &result, tmp.path()).is_ok());
    }

    #[test]
    fn missing_output_port_is_interface_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        write_rtl(
            tmp.path(),
            "module counter4 (input logic clk, input logic rst_n);\nendmodule\n",
        );
        let err = verify(Stage::Implementing, &design(), &result_with_log("ok"), tmp.path())
            .unwrap_err();
        assert_eq!(err, PostconditionError::PortMissing("count".to_string()));
        assert_eq!(err.canonical_reason(), "interface/mismatch");
    }

    #[test]
    fn wrong_width_is_interface_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        write_rtl(
            tmp.path(),
            "module counter4 (input logic clk, input logic rst_n, output logic [7:0] count);\nendmodule\n",
        );
        let err = verify(Stage::Implementing, &design(), &result_with_log("ok"), tmp.path())
            .unwrap_err();
        assert!(matches!(
            err,
            PostconditionError::PortWidthMismatch { expected: 4, found: 8, .. }
        ));
    }

    #[test]
    fn wrong_direction_is_interface_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        write_rtl(
            tmp.path(),
            "module counter4 (input logic clk, input logic rst_n, input logic [3:0] count);\nendmodule\n",
        );
        let err = verify(Stage::Implementing, &design(), &result_with_log("ok"), tmp.path())
            .unwrap_err();
        assert!(matches!(err, PostconditionError::PortDirectionMismatch { .. }));
    }

    #[test]
    fn wrong_module_name_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_rtl(tmp.path(), "module counter8 (input logic clk);\nendmodule\n");
        let err = verify(Stage::Implementing, &design(), &result_with_log("ok"), tmp.path())
            .unwrap_err();
        assert_eq!(err, PostconditionError::ModuleNotDeclared("counter4".to_string()));
    }

    #[test]
    fn missing_artifact_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = verify(Stage::Implementing, &design(), &result_with_log("ok"), tmp.path())
            .unwrap_err();
        assert!(matches!(err, PostconditionError::MissingArtifact(_)));
        assert_eq!(err.canonical_reason(), "artifact/missing");
    }

    #[test]
    fn testbench_must_reference_dut_and_drive_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let tb_path = tmp.path().join("generated/rtl/counter4_tb.sv");
        std::fs::create_dir_all(tb_path.parent().unwrap()).unwrap();

        std::fs::write(&tb_path, "module counter4_tb;\n counter4 dut(.clk(clk), .rst_n(rst_n), .count(count));\n initial begin clk = 0; rst_n = 0; end\nendmodule\n").unwrap();
        assert!(verify(Stage::Testbenching, &design(), &result_with_log("ok"), tmp.path()).is_ok());

        std::fs::write(&tb_path, "module counter4_tb;\n counter4 dut(.clk(clk), .count(count));\n initial clk = 0;\nendmodule\n").unwrap();
        let err = verify(Stage::Testbenching, &design(), &result_with_log("ok"), tmp.path())
            .unwrap_err();
        assert_eq!(err, PostconditionError::TestbenchInputUndriven("rst_n".to_string()));
    }

    #[test]
    fn lint_requires_captured_log() {
        let tmp = tempfile::tempdir().unwrap();
        let ok = result_with_log("lint clean");
        assert!(verify(Stage::Linting, &design(), &ok, tmp.path()).is_ok());

        let mut empty = result_with_log("x");
        empty.log_output = String::new();
        let err = verify(Stage::Linting, &design(), &empty, tmp.path()).unwrap_err();
        assert_eq!(err, PostconditionError::EmptyLog(Stage::Linting));
    }

    #[test]
    fn distill_requires_nonempty_dataset() {
        let tmp = tempfile::tempdir().unwrap();
        let mut result = result_with_log("distilled");
        let dataset = tmp.path().join("counter4.jsonl");

        result.artifacts_path = Some(dataset.display().to_string());
        assert_eq!(
            verify(Stage::Distilling, &design(), &result, tmp.path()).unwrap_err(),
            PostconditionError::EmptyDataset
        );

        std::fs::write(&dataset, "{\"stimulus\": \"reset\"}\n").unwrap();
        assert!(verify(Stage::Distilling, &design(), &result, tmp.path()).is_ok());
    }

    #[test]
    fn reflect_requires_insights_body() {
        let tmp = tempfile::tempdir().unwrap();
        let mut result = result_with_log("reflected");
        assert_eq!(
            verify(Stage::Reflecting, &design(), &result, tmp.path()).unwrap_err(),
            PostconditionError::EmptyInsights
        );

        result.reflections = Some("rollover path is untested near reset".to_string());
        assert!(verify(Stage::Reflecting, &design(), &result, tmp.path()).is_ok());
    }

    #[test]
    fn scalar_ports_parse_with_width_one() {
        let ports = parse_ports(GOOD_RTL);
        let clk = ports.iter().find(|(n, _)| n == "clk").unwrap();
        assert_eq!(clk.1.width, 1);
        assert_eq!(clk.1.direction, PortDirection::Input);
        let count = ports.iter().find(|(n, _)| n == "count").unwrap();
        assert_eq!(count.1.width, 4);
    }
}
