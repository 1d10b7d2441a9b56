//! Print the OpenCL kernel source the benchmark builds.

use anyhow::Result;
use clap::Parser;
use offload_core::kernels;

/// Print the OpenCL C source of the benchmark kernels
#[derive(Debug, Parser)]
pub struct KernelSourceCommand {
    /// Only list kernel names
    #[arg(long)]
    pub names: bool,
}

impl KernelSourceCommand {
    pub fn execute(self) -> Result<()> {
        if self.names {
            for name in kernels::KERNEL_NAMES {
                println!("{name}");
            }
        } else {
            println!("{}", kernels::KERNEL_SOURCE.trim());
        }
        Ok(())
    }
}
