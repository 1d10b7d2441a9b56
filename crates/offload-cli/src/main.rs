//! offload-bench CLI
//!
//! Measures end-to-end latency of repeatedly offloading a matrix multiply to
//! a device runtime, one iteration at a time, driven by completion callbacks.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{debug, error};

mod backend;
mod commands;
mod config;
mod output;

use commands::{DevicesCommand, KernelSourceCommand, RunCommand};
use config::{BenchConfig, EnvParser, LogFormat};

/// offload-bench - device offload latency benchmark
#[derive(Parser)]
#[command(name = "offload-bench")]
#[command(about = "Device offload latency benchmark")]
#[command(long_about = r#"
Runs a fixed number of serialized matrix-multiply offload iterations on a
device runtime and reports the elapsed time. Each iteration uploads two
matrices, runs the kernel and reads the product back; the next iteration is
submitted from the previous one's completion callback.

Examples:
  # 500 iterations of a 64x64 multiply on the simulated device
  offload-bench run --size 64 --iterations 500

  # Same on a named OpenCL device, with the full report as JSON
  offload-bench run -s 1024 -i 100 --backend opencl -d "GeForce GT 650M" --format json

  # List devices
  offload-bench devices --backend opencl
"#)]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to ./offload-bench.toml if present)
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Log format
    #[arg(long, value_enum, value_name = "FORMAT", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the offload pipeline and report elapsed microseconds
    #[command(alias = "bench")]
    Run(RunCommand),

    /// List compute devices
    #[command(alias = "list-devices")]
    Devices(DevicesCommand),

    /// Print the OpenCL kernel source
    KernelSource(KernelSourceCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_configuration(&cli)?;
    setup_logging(&config);
    debug!(?config, "effective configuration");

    let result = match cli.command {
        Some(Commands::Run(cmd)) => cmd.execute(&config),
        Some(Commands::Devices(cmd)) => cmd.execute(&config),
        Some(Commands::KernelSource(cmd)) => cmd.execute(),
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);

        let mut source = e.source();
        while let Some(err) = source {
            error!("  Caused by: {}", err);
            source = err.source();
        }

        std::process::exit(1);
    }

    Ok(())
}

/// File, then environment, then global flags.
fn load_configuration(cli: &Cli) -> Result<BenchConfig> {
    let cwd = std::env::current_dir().context("failed to determine working directory")?;
    let mut config =
        BenchConfig::discover(cli.config.as_deref(), &cwd).context("failed to load configuration")?;
    EnvParser::new()
        .apply_env(&mut config)
        .context("failed to apply environment overrides")?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    Ok(config)
}

/// Logs go to stderr so stdout carries only results.
fn setup_logging(config: &BenchConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match config.logging.format {
        LogFormat::Json => {
            subscriber
                .json()
                .with_timer(tracing_subscriber::fmt::time::uptime())
                .init();
        }
        LogFormat::Compact => {
            subscriber.compact().init();
        }
        LogFormat::Pretty => {
            subscriber.pretty().init();
        }
    }
}
