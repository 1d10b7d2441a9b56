//! Rendering of run reports and device listings.

use anyhow::{Context, Result};
use clap::ValueEnum;
use offload_core::{DeviceInfo, RunReport};

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text (default).
    #[default]
    Text,
    /// Machine-readable JSON.
    Json,
}

/// A measured run. Text output is the total elapsed microseconds alone.
pub fn render_report(report: &RunReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(report.total().as_micros().to_string()),
        OutputFormat::Json => {
            let value = serde_json::json!({
                "report": report,
                "summary": report.summary(),
            });
            serde_json::to_string_pretty(&value).context("failed to serialize run report")
        }
    }
}

pub fn render_devices(devices: &[DeviceInfo], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(devices).context("failed to serialize device list"),
        OutputFormat::Text => {
            let mut out = String::new();
            for dev in devices {
                let sizes: Vec<String> = dev.max_work_item_sizes.iter().map(usize::to_string).collect();
                out.push_str(&format!(">>> '{}'\n", dev.name));
                out.push_str(&format!("  Vendor: '{}'\n", dev.vendor));
                out.push_str(&format!("  Type: {}\n", dev.device_type));
                out.push_str(&format!("  Compute units: {}\n", dev.max_compute_units));
                out.push_str(&format!("  Max work-group size: {}\n", dev.max_work_group_size));
                out.push_str(&format!("  Max work-item dimensions: {}\n", dev.max_work_item_sizes.len()));
                out.push_str(&format!("  Max work-item sizes: ({})\n", sizes.join(", ")));
                out.push_str(&format!("  OpenCL C version: '{}'\n", dev.opencl_c_version));
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_core::{DeviceType, IterationRecord, RunOutcome};

    fn report() -> RunReport {
        RunReport {
            runtime: "sim".into(),
            dimension: 4,
            max_iterations: 2,
            completed_iterations: 2,
            outcome: RunOutcome::Completed,
            total_us: 1234,
            iterations: vec![
                IterationRecord { index: 1, submit_seq: 0, complete_seq: 1, latency_us: 600 },
                IterationRecord { index: 2, submit_seq: 2, complete_seq: 3, latency_us: 620 },
            ],
        }
    }

    #[test]
    fn text_report_is_total_micros() {
        assert_eq!(render_report(&report(), OutputFormat::Text).unwrap(), "1234");
    }

    #[test]
    fn json_report_includes_summary() {
        let out = render_report(&report(), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["report"]["completed_iterations"], 2);
        assert_eq!(value["summary"]["max_us"], 620);
    }

    #[test]
    fn text_devices_list_work_item_sizes() {
        let dev = DeviceInfo {
            name: "Simulated Device".into(),
            vendor: "offload-bench".into(),
            device_type: DeviceType::Other,
            max_compute_units: 1,
            max_work_group_size: 256,
            max_work_item_sizes: vec![256, 256, 1],
            opencl_c_version: "OpenCL C 1.2".into(),
        };
        let out = render_devices(&[dev], OutputFormat::Text).unwrap();
        assert!(out.starts_with(">>> 'Simulated Device'"));
        assert!(out.contains("Max work-item sizes: (256, 256, 1)"));
        assert!(out.contains("Max work-item dimensions: 3"));
    }
}
