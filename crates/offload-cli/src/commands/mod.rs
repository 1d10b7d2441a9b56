//! CLI command implementations

pub mod devices;
pub mod kernel_source;
pub mod run;

pub use devices::DevicesCommand;
pub use kernel_source::KernelSourceCommand;
pub use run::RunCommand;
