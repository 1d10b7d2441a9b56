//! Measured pipeline run command

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::backend;
use crate::config::{Backend, BenchConfig};
use crate::output::{render_report, OutputFormat};

/// Run the matrix offload pipeline and report its latency
#[derive(Debug, Parser)]
pub struct RunCommand {
    /// Matrix dimension
    #[arg(short, long, value_name = "N")]
    pub size: Option<usize>,

    /// Iterations to measure
    #[arg(short, long, value_name = "N")]
    pub iterations: Option<usize>,

    /// Exact name of the device to use
    #[arg(short, long, value_name = "NAME")]
    pub device: Option<String>,

    /// Device runtime
    #[arg(short, long, value_enum)]
    pub backend: Option<Backend>,

    /// Unreported runs before the measured one
    #[arg(short, long, value_name = "N")]
    pub warmup: Option<usize>,

    /// Artificial per-command latency of the simulated device
    #[arg(long, value_name = "MS")]
    pub latency_ms: Option<u64>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

impl RunCommand {
    /// Overlay flags that were given onto `config`.
    pub fn apply(&self, config: &mut BenchConfig) {
        let run = &mut config.run;
        if let Some(size) = self.size {
            run.size = size;
        }
        if let Some(iterations) = self.iterations {
            run.iterations = iterations;
        }
        if let Some(device) = &self.device {
            run.device = Some(device.clone());
        }
        if let Some(backend) = self.backend {
            run.backend = backend;
        }
        if let Some(warmup) = self.warmup {
            run.warmup = warmup;
        }
        if let Some(latency_ms) = self.latency_ms {
            run.latency_ms = latency_ms;
        }
    }

    pub fn execute(self, config: &BenchConfig) -> Result<()> {
        let mut config = config.clone();
        self.apply(&mut config);
        config.validate().context("invalid run parameters")?;

        let run = &config.run;
        info!(
            backend = %run.backend,
            size = run.size,
            iterations = run.iterations,
            warmup = run.warmup,
            "starting benchmark"
        );
        let report = backend::execute(run)?;
        info!(
            total_us = report.total_us,
            completed = report.completed_iterations,
            "benchmark finished"
        );
        println!("{}", render_report(&report, self.format)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_only_what_is_given() {
        let cmd = RunCommand::parse_from(["run", "--size", "8", "--backend", "sim"]);
        let mut config = BenchConfig::default();
        config.run.iterations = 42;
        cmd.apply(&mut config);
        assert_eq!(config.run.size, 8);
        assert_eq!(config.run.iterations, 42);
        assert_eq!(config.run.backend, Backend::Sim);
    }

    #[test]
    fn zero_size_fails_validation() {
        let cmd = RunCommand::parse_from(["run", "--size", "0"]);
        let err = cmd.execute(&BenchConfig::default()).unwrap_err();
        assert!(format!("{err:#}").contains("size must be greater than zero"));
    }
}
