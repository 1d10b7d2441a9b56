//! Device listing command

use anyhow::Result;
use clap::Parser;

use crate::backend;
use crate::config::{Backend, BenchConfig};
use crate::output::{render_devices, OutputFormat};

/// List compute devices and their limits
#[derive(Debug, Parser)]
pub struct DevicesCommand {
    /// Backend to enumerate (defaults to the configured backend)
    #[arg(short, long, value_enum)]
    pub backend: Option<Backend>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

impl DevicesCommand {
    pub fn execute(self, config: &BenchConfig) -> Result<()> {
        let backend = self.backend.unwrap_or(config.run.backend);
        let devices = backend::devices(backend)?;
        print!("{}", render_devices(&devices, self.format)?);
        if self.format == OutputFormat::Json {
            println!();
        }
        Ok(())
    }
}
