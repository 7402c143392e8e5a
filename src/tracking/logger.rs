use crate::events::{EventSink, RunEvent, RunEventEnvelope};
use crate::tracking::{GraphTracking, NodeTrackingDetail, PhaseTrackingDetail, PortTrackingDetail};
use tracing::info;

const RULE: &str = "---------------------------------------------------------------------------------";

/// Renders tracking tables to the `tracking` log target
#[derive(Debug, Default)]
pub struct TrackingLogger;

impl TrackingLogger {
    pub fn new() -> Self {
        Self
    }

    fn log(lines: Vec<String>) {
        for line in lines {
            info!(target: "tracking", "{}", line);
        }
    }
}

impl EventSink for TrackingLogger {
    fn emit(&self, envelope: &RunEventEnvelope) {
        match &envelope.event {
            RunEvent::TrackingUpdated { phase } => Self::log(render_tracking(phase, false)),
            RunEvent::PhaseFinished { phase } => {
                let mut lines = render_tracking(phase, true);
                lines.push(format!(
                    "Execution of phase [{}] successfully finished - elapsed time(sec): {}",
                    phase.phase,
                    phase.execution_time_ms / 1000
                ));
                Self::log(lines);
            }
            RunEvent::PhaseAborted { phase } => Self::log(vec![format!(
                "Execution of phase [{}] was aborted - elapsed time(sec): {}",
                phase.phase,
                phase.execution_time_ms / 1000
            )]),
            RunEvent::PhaseError { phase, .. } => Self::log(vec![format!(
                "Execution of phase [{}] finished with error - elapsed time(sec): {}",
                phase.phase,
                phase.execution_time_ms / 1000
            )]),
            RunEvent::GraphFinished { tracking }
            | RunEvent::GraphAborted { tracking }
            | RunEvent::GraphError { tracking, .. } => Self::log(render_summary(tracking)),
            RunEvent::GraphStarted { .. } | RunEvent::PhaseStarted { .. } => {}
        }
    }
}

/// `usage` is a fraction of one thread; printed as a percentage
fn cpu_label(usage: f64) -> String {
    let percent = usage * 100.0;
    if percent >= 0.1 {
        format!("{:.1}", percent)
    } else {
        "..".to_string()
    }
}

fn port_row(port: &PortTrackingDetail, cpu: Option<&str>) -> String {
    let label = format!("{}:", port.kind.label());
    let figures = format!(
        "{:<5}{:>9}{:>12}{:>7}{:>8}",
        port.index,
        port.total_records,
        port.total_bytes >> 10,
        port.record_flow,
        port.byte_flow >> 10
    );
    match cpu {
        Some(cpu) => format!("{:<6}{:<4}{:>28}{}", " %cpu:", cpu, label, figures),
        None => format!("{:>38}{}", label, figures),
    }
}

fn node_rows(node: &NodeTrackingDetail, final_tracking: bool) -> Vec<String> {
    let mut rows = vec![format!(
        "{:<23}{:<41}{:>15}",
        node.node_name,
        node.node_id,
        node.result.message()
    )];
    let usage = if final_tracking {
        node.peak_usage_cpu
    } else {
        node.usage_cpu
    };
    let mut cpu = Some(cpu_label(usage));

    for port in node.input_ports.iter().chain(&node.output_ports) {
        rows.push(port_row(port, cpu.take().as_deref()));
    }
    // nodes without ports still report CPU
    if let Some(cpu) = cpu {
        rows.push(format!("{:<6}{:<4}", " %cpu:", cpu));
    }
    rows
}

/// Per-node table of one phase; the final variant shows whole-phase averages and peak CPU
pub fn render_tracking(phase: &PhaseTrackingDetail, final_tracking: bool) -> Vec<String> {
    let mut lines = Vec::new();
    if final_tracking {
        lines.push(format!(
            "----------------------** Final tracking Log for phase [{}] **---------------------",
            phase.phase
        ));
    } else {
        lines.push(format!(
            "---------------------** Start of tracking Log for phase [{}] **-------------------",
            phase.phase
        ));
    }
    lines.push(format!(
        "Time: {}",
        chrono::Local::now().format("%d/%m/%y %H:%M:%S")
    ));
    if final_tracking {
        lines.push(
            "Node                   ID         Port      #Records         #KB aRec/s   aKB/s"
                .to_string(),
        );
    } else {
        lines.push(
            "Node                   ID         Port      #Records         #KB  Rec/s    KB/s"
                .to_string(),
        );
    }
    lines.push(RULE.to_string());
    for node in &phase.nodes {
        lines.extend(node_rows(node, final_tracking));
    }
    lines.push("---------------------------------** End of Log **--------------------------------".to_string());
    lines
}

/// Closing phase-by-phase summary, printed whatever the outcome
pub fn render_summary(tracking: &GraphTracking) -> Vec<String> {
    let mut lines = vec![
        "-----------------------** Summary of Phases execution **---------------------".to_string(),
        "Phase#            Finished Status         RunTime(sec)    MemoryAllocation(KB)".to_string(),
    ];
    for phase in &tracking.phases {
        lines.push(format!(
            "{:<18}{:<24}{:>12}{:>18}",
            phase.phase,
            phase.result.message(),
            phase.execution_time_ms / 1000,
            phase.memory_utilization >> 10
        ));
    }
    lines.push("------------------------------** End of Summary **---------------------------".to_string());
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CountingPort, Graph, Node, NodeContext, Phase, Port, ResultCode};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Copier {
        input: Arc<CountingPort>,
        output: Arc<CountingPort>,
    }

    #[async_trait]
    impl Node for Copier {
        fn id(&self) -> &str {
            "COPY0"
        }

        fn name(&self) -> &str {
            "SimpleCopy"
        }

        fn input_ports(&self) -> Vec<Arc<dyn Port>> {
            vec![self.input.clone()]
        }

        fn output_ports(&self) -> Vec<Arc<dyn Port>> {
            vec![self.output.clone()]
        }

        async fn execute(&self, _ctx: &NodeContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Silent;

    #[async_trait]
    impl Node for Silent {
        fn id(&self) -> &str {
            "SILENT"
        }

        async fn execute(&self, _ctx: &NodeContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn phase() -> Phase {
        Phase::new(1)
            .with_node(Arc::new(Copier {
                input: Arc::new(CountingPort::new(0)),
                output: Arc::new(CountingPort::new(0)),
            }))
            .with_node(Arc::new(Silent))
    }

    #[test]
    fn test_render_tracking_rows() {
        let mut detail = PhaseTrackingDetail::new(&phase());
        detail.nodes[0].result = ResultCode::Running;
        detail.nodes[0].usage_cpu = 0.25;
        detail.nodes[0].input_ports[0].total_records = 2048;
        detail.nodes[0].input_ports[0].total_bytes = 4096;

        let lines = render_tracking(&detail, false);
        assert!(lines[0].contains("Start of tracking Log for phase [1]"));
        assert!(lines[2].contains("Rec/s"));

        let node_line = lines.iter().position(|l| l.starts_with("SimpleCopy")).unwrap();
        assert!(lines[node_line].contains("COPY0"));
        assert!(lines[node_line].ends_with("RUNNING"));
        // CPU printed once, on the first port row
        assert!(lines[node_line + 1].starts_with(" %cpu:25.0"));
        assert!(lines[node_line + 1].contains("In:"));
        assert!(lines[node_line + 1].contains("2048"));
        assert!(!lines[node_line + 2].contains("%cpu"));
        assert!(lines[node_line + 2].contains("Out:"));

        // portless node still gets a cpu row
        let silent = lines.iter().position(|l| l.starts_with("SILENT")).unwrap();
        assert!(lines[silent + 1].starts_with(" %cpu:.."));
    }

    #[test]
    fn test_final_table_uses_peak_cpu() {
        let mut detail = PhaseTrackingDetail::new(&phase());
        detail.nodes[0].usage_cpu = 0.0;
        detail.nodes[0].peak_usage_cpu = 0.75;
        let lines = render_tracking(&detail, true);
        assert!(lines[0].contains("Final tracking Log"));
        assert!(lines[2].contains("aRec/s"));
        assert!(lines.iter().any(|l| l.starts_with(" %cpu:75.0")));
    }

    #[test]
    fn test_cpu_label_is_percent() {
        assert_eq!(cpu_label(1.0), "100.0");
        assert_eq!(cpu_label(0.004), "0.4");
        assert_eq!(cpu_label(0.0005), "..");
    }

    #[test]
    fn test_render_summary() {
        let graph = Graph::new("g", "graph").with_phase(phase());
        let mut tracking = GraphTracking::new(&graph, "run");
        let mut detail = PhaseTrackingDetail::new(&graph.phases()[0]);
        detail.execution_time_ms = 3500;
        detail.memory_utilization = 10 * 1024;
        detail.result = ResultCode::Error;
        tracking.update_phase(&detail);

        let lines = render_summary(&tracking);
        assert_eq!(lines.len(), 4);
        assert!(lines[2].starts_with("1 "));
        assert!(lines[2].contains("ERROR"));
        assert!(lines[2].trim_end().ends_with("10"));
        assert!(lines[2].contains(" 3 "));
    }
}
