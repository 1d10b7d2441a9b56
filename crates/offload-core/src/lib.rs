//! `offload-core`: asynchronous command resubmission over a device runtime.
//!
//! The crate drives a fixed number of serialized offload iterations (upload,
//! matrix multiply, read back) purely from runtime completion callbacks, while
//! owning every native device object through reference-counted handles.
//!
//! | Module        | Contents                                               |
//! |---------------|--------------------------------------------------------|
//! | [`handle`]    | `RcHandle` / `Owned` wrappers over retain/release      |
//! | [`runtime`]   | The `DeviceRuntime` capability trait                   |
//! | [`pipeline`]  | `CommandPipeline`, the callback-driven state machine   |
//! | [`report`]    | Per-iteration timing records                           |
//! | [`kernels`]   | OpenCL kernel source and CPU reference kernels         |
//! | [`sim`]       | In-process simulated device runtime                    |
//! | `opencl`      | Native OpenCL runtime (feature `opencl`)               |
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use offload_core::kernels::MATRIX_MULT;
//! use offload_core::pipeline::{CommandPipeline, DeviceHandles, PipelineConfig};
//! use offload_core::sim::SimRuntime;
//!
//! let rt = Arc::new(SimRuntime::new());
//! let context = rt.create_context().unwrap();
//! let queue = rt.create_queue(&context).unwrap();
//! let kernel = rt.create_kernel(&context, MATRIX_MULT).unwrap();
//!
//! let pipeline = CommandPipeline::new(
//!     Arc::clone(&rt),
//!     PipelineConfig::new(4, 3),
//!     DeviceHandles { context, queue, kernel },
//! )
//! .unwrap();
//! pipeline.enqueue().unwrap();
//! let report = pipeline.wait().unwrap();
//! assert_eq!(report.completed_iterations, 3);
//! ```

pub mod error;
pub mod handle;
pub mod kernels;
pub mod pipeline;
pub mod report;
pub mod runtime;
pub mod sim;

#[cfg(feature = "opencl")]
pub mod opencl;

pub use error::{DeviceError, PipelineError, StatusCode};
pub use handle::{NativeResource, Owned, RcHandle};
pub use pipeline::{CancelToken, CommandPipeline, DeviceHandles, PipelineConfig, PipelineState};
pub use report::{IterationRecord, LatencySummary, RunOutcome, RunReport};
pub use runtime::{CompletionStatus, DeviceInfo, DeviceRuntime, DeviceType, HostBuffer, MemAccess};
