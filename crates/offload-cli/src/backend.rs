//! Capability construction per backend and the measured run loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use offload_core::kernels::MATRIX_MULT;
use offload_core::sim::{SimConfig, SimFaults, SimRuntime};
use offload_core::{CommandPipeline, DeviceHandles, DeviceInfo, DeviceRuntime, PipelineConfig, RunReport};
use tracing::{debug, info};

use crate::config::{Backend, RunConfig};

/// Run `warmup` unreported pipeline runs, then one measured run.
pub fn run_measured<R: DeviceRuntime>(
    runtime: Arc<R>,
    handles: &DeviceHandles<R>,
    config: PipelineConfig,
    warmup: usize,
) -> Result<RunReport> {
    for round in 1..=warmup {
        debug!(round, warmup, "warmup run");
        run_once(Arc::clone(&runtime), handles, config).with_context(|| format!("warmup run {round} failed"))?;
    }
    run_once(runtime, handles, config).context("measured run failed")
}

fn run_once<R: DeviceRuntime>(
    runtime: Arc<R>,
    handles: &DeviceHandles<R>,
    config: PipelineConfig,
) -> Result<RunReport, offload_core::PipelineError> {
    let pipeline = CommandPipeline::new(runtime, config, handles.try_clone()?)?;
    pipeline.enqueue()?;
    pipeline.wait()
}

fn sim_runtime(run: &RunConfig) -> Result<SimRuntime> {
    let defaults = SimConfig::default();
    if let Some(name) = run.device.as_deref() {
        if name != defaults.device_name {
            bail!("no simulated device named '{name}' (available: '{}')", defaults.device_name);
        }
    }
    let faults = SimFaults { command_latency: Duration::from_millis(run.latency_ms), ..SimFaults::default() };
    Ok(SimRuntime::with_config(SimConfig { faults, ..defaults }))
}

/// Execute a run on the configured backend.
pub fn execute(run: &RunConfig) -> Result<RunReport> {
    let config = PipelineConfig::new(run.size, run.iterations);
    match run.backend {
        Backend::Sim => {
            let rt = Arc::new(sim_runtime(run)?);
            let context = rt.create_context().context("clCreateContext")?;
            let queue = rt.create_queue(&context).context("clCreateCommandQueue")?;
            let kernel = rt.create_kernel(&context, MATRIX_MULT).context("clCreateKernel")?;
            info!(device = %rt.info().name, "using simulated device");
            run_measured(rt, &DeviceHandles { context, queue, kernel }, config, run.warmup)
        }
        Backend::Opencl => execute_opencl(run, config),
    }
}

#[cfg(feature = "opencl")]
fn execute_opencl(run: &RunConfig, config: PipelineConfig) -> Result<RunReport> {
    let (rt, handles, info) = offload_core::opencl::setup(run.device.as_deref())?;
    info!(device = %info.name, "using OpenCL device");
    run_measured(Arc::new(rt), &handles, config, run.warmup)
}

#[cfg(not(feature = "opencl"))]
fn execute_opencl(_run: &RunConfig, _config: PipelineConfig) -> Result<RunReport> {
    bail!(opencl_unavailable())
}

/// Devices available on `backend`.
pub fn devices(backend: Backend) -> Result<Vec<DeviceInfo>> {
    match backend {
        Backend::Sim => Ok(vec![SimRuntime::new().info().clone()]),
        #[cfg(feature = "opencl")]
        Backend::Opencl => Ok(offload_core::opencl::list_devices()?),
        #[cfg(not(feature = "opencl"))]
        Backend::Opencl => bail!(opencl_unavailable()),
    }
}

#[cfg(not(feature = "opencl"))]
fn opencl_unavailable() -> &'static str {
    "this build has no OpenCL support; rebuild with `--features opencl`"
}
