//! Native OpenCL device runtime.
//!
//! Implements [`DeviceRuntime`] over the raw `cl3` entry points so that every
//! object the pipeline creates is owned through [`Owned`] / [`RcHandle`]
//! rather than the `opencl3` RAII wrappers. Discovery and program build use
//! `opencl3`, and the resulting context, queue and kernel are re-owned as
//! retained handles.

use std::ffi::c_void;
use std::ptr;

use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::device::{
    get_all_devices, Device, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU,
    CL_DEVICE_TYPE_GPU,
};
use opencl3::kernel::Kernel;
use opencl3::memory::{CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{
    cl_command_queue, cl_context, cl_device_type, cl_event, cl_int, cl_kernel, cl_mem, cl_mem_flags, cl_uint,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{DeviceError, StatusCode};
use crate::handle::{NativeResource, Owned, RcHandle};
use crate::kernels;
use crate::pipeline::DeviceHandles;
use crate::runtime::{
    CompletionCallback, CompletionStatus, DeviceInfo, DeviceRuntime, DeviceType, HostBuffer, MemAccess,
};

/// `CL_COMPLETE` execution status.
const CL_COMPLETE: cl_int = 0;
const CL_NON_BLOCKING: cl_uint = 0;

/// A raw OpenCL object pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ClRaw(pub *mut c_void);

// SAFETY: OpenCL object handles may be used from any host thread; the API is
// required to be thread-safe for every call made through this module.
unsafe impl Send for ClRaw {}
unsafe impl Sync for ClRaw {}

fn cl_error(call: &'static str, code: cl_int) -> DeviceError {
    DeviceError::new(call, code, cl3::error_codes::error_text(code))
}

macro_rules! cl_resource {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $retain:path, $release:path, $retain_call:literal, $release_call:literal) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub enum $name {}

        impl NativeResource for $name {
            type Raw = ClRaw;
            const NULL: ClRaw = ClRaw(ptr::null_mut());
            const KIND: &'static str = $kind;

            fn retain(raw: ClRaw) -> Result<(), DeviceError> {
                // SAFETY: `raw` is a live object of this kind held by a handle.
                unsafe { $retain(raw.0 as _) }.map_err(|code| cl_error($retain_call, code))
            }

            fn release(raw: ClRaw) -> Result<(), DeviceError> {
                // SAFETY: every handle releases exactly the reference it owns.
                unsafe { $release(raw.0 as _) }.map_err(|code| cl_error($release_call, code))
            }
        }
    };
}

cl_resource!(
    /// `cl_context`.
    ClContext, "context",
    cl3::context::retain_context, cl3::context::release_context,
    "clRetainContext", "clReleaseContext"
);
cl_resource!(
    /// `cl_command_queue`.
    ClQueue, "command queue",
    cl3::command_queue::retain_command_queue, cl3::command_queue::release_command_queue,
    "clRetainCommandQueue", "clReleaseCommandQueue"
);
cl_resource!(
    /// `cl_kernel`.
    ClKernel, "kernel",
    cl3::kernel::retain_kernel, cl3::kernel::release_kernel,
    "clRetainKernel", "clReleaseKernel"
);
cl_resource!(
    /// `cl_mem`.
    ClMem, "buffer",
    cl3::memory::retain_mem_object, cl3::memory::release_mem_object,
    "clRetainMemObject", "clReleaseMemObject"
);
cl_resource!(
    /// `cl_event`.
    ClEvent, "event",
    cl3::event::retain_event, cl3::event::release_event,
    "clRetainEvent", "clReleaseEvent"
);

/// Failures while locating a device or preparing the benchmark kernel.
#[derive(Debug, Error)]
pub enum OpenClError {
    #[error("no OpenCL platforms found")]
    NoPlatforms,

    #[error("no OpenCL device found{}", .wanted.as_ref().map(|w| format!(" matching {w:?}")).unwrap_or_default())]
    NoDevice { wanted: Option<String> },

    #[error("failed to build kernel program:\n{log}")]
    Build { log: String },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// [`DeviceRuntime`] over a native OpenCL implementation.
#[derive(Debug, Clone, Default)]
pub struct OpenClRuntime {
    _private: (),
}

impl OpenClRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

fn wait_ptr(wait_list: &[ClRaw]) -> (cl_uint, *const cl_event) {
    if wait_list.is_empty() {
        (0, ptr::null())
    } else {
        // `ClRaw` is a transparent newtype over the event pointer.
        (wait_list.len() as cl_uint, wait_list.as_ptr().cast::<cl_event>())
    }
}

/// Keep `host` alive until `event` finishes.
fn hold_until_complete(event: ClRaw, host: HostBuffer) -> Result<(), DeviceError> {
    register_callback(event, Box::new(move |_| drop(host)))
}

extern "C" fn completion_trampoline(_event: cl_event, status: cl_int, user_data: *mut c_void) {
    // SAFETY: `user_data` was produced by `Box::into_raw` in `register_callback`
    // and OpenCL invokes each registered callback exactly once.
    let callback = unsafe { Box::from_raw(user_data.cast::<CompletionCallback>()) };
    let status = if status == CL_COMPLETE {
        CompletionStatus::Complete
    } else {
        CompletionStatus::Error(status)
    };
    callback(status);
}

fn register_callback(event: ClRaw, callback: CompletionCallback) -> Result<(), DeviceError> {
    let user_data = Box::into_raw(Box::new(callback));
    // SAFETY: `event` is live; ownership of `user_data` passes to the trampoline.
    let result = unsafe {
        cl3::event::set_event_callback(
            event.0 as cl_event,
            CL_COMPLETE,
            completion_trampoline,
            user_data.cast::<c_void>(),
        )
    };
    result.map_err(|code| {
        // SAFETY: registration failed, so the trampoline will never run.
        drop(unsafe { Box::from_raw(user_data) });
        cl_error("clSetEventCallback", code)
    })
}

impl DeviceRuntime for OpenClRuntime {
    type Context = ClContext;
    type Queue = ClQueue;
    type Kernel = ClKernel;
    type Mem = ClMem;
    type Event = ClEvent;

    fn name(&self) -> &str {
        "opencl"
    }

    fn error_text(&self, code: StatusCode) -> String {
        cl3::error_codes::error_text(code).to_string()
    }

    fn create_buffer(
        &self,
        context: &RcHandle<ClContext>,
        access: MemAccess,
        bytes: usize,
    ) -> Result<Owned<ClMem>, DeviceError> {
        let flags: cl_mem_flags = match access {
            MemAccess::ReadOnly => CL_MEM_READ_ONLY,
            MemAccess::WriteOnly => CL_MEM_WRITE_ONLY,
            MemAccess::ReadWrite => CL_MEM_READ_WRITE,
        };
        // SAFETY: the context handle is non-null and live; no host pointer.
        let mem = unsafe {
            cl3::memory::create_buffer(context.raw().0 as cl_context, flags, bytes, ptr::null_mut())
        }
        .map_err(|code| cl_error("clCreateBuffer", code))?;
        Ok(Owned::from_created(ClRaw(mem as *mut c_void)))
    }

    fn enqueue_write_buffer(
        &self,
        queue: &RcHandle<ClQueue>,
        buffer: ClRaw,
        src: &HostBuffer,
        wait_list: &[ClRaw],
    ) -> Result<Owned<ClEvent>, DeviceError> {
        let (count, waits) = wait_ptr(wait_list);
        let event = {
            let data = src.lock();
            // SAFETY: `src` is kept alive until the write completes and its
            // storage is never reallocated while shared.
            unsafe {
                cl3::command_queue::enqueue_write_buffer(
                    queue.raw().0 as cl_command_queue,
                    buffer.0 as cl_mem,
                    CL_NON_BLOCKING,
                    0,
                    std::mem::size_of_val(data.as_slice()),
                    data.as_ptr().cast::<c_void>(),
                    count,
                    waits,
                )
            }
            .map_err(|code| cl_error("clEnqueueWriteBuffer", code))?
        };
        let event = Owned::from_created(ClRaw(event as *mut c_void));
        hold_until_complete(event.raw(), src.clone())?;
        Ok(event)
    }

    fn enqueue_marker(&self, queue: &RcHandle<ClQueue>, wait_list: &[ClRaw]) -> Result<Owned<ClEvent>, DeviceError> {
        let (count, waits) = wait_ptr(wait_list);
        // SAFETY: queue and wait-list events are live.
        let event = unsafe {
            cl3::command_queue::enqueue_marker_with_wait_list(queue.raw().0 as cl_command_queue, count, waits)
        }
        .map_err(|code| cl_error("clEnqueueMarkerWithWaitList", code))?;
        Ok(Owned::from_created(ClRaw(event as *mut c_void)))
    }

    fn set_kernel_arg(&self, kernel: &RcHandle<ClKernel>, index: u32, buffer: ClRaw) -> Result<(), DeviceError> {
        let mem = buffer.0 as cl_mem;
        // SAFETY: the argument value is a `cl_mem` read during the call.
        unsafe {
            cl3::kernel::set_kernel_arg(
                kernel.raw().0 as cl_kernel,
                index,
                std::mem::size_of::<cl_mem>(),
                (&mem as *const cl_mem).cast::<c_void>(),
            )
        }
        .map_err(|code| cl_error("clSetKernelArg", code))
    }

    fn enqueue_kernel(
        &self,
        queue: &RcHandle<ClQueue>,
        kernel: &RcHandle<ClKernel>,
        global_dims: &[usize],
        wait_list: &[ClRaw],
    ) -> Result<Owned<ClEvent>, DeviceError> {
        let (count, waits) = wait_ptr(wait_list);
        // SAFETY: `global_dims` outlives the call; local size is left to the
        // implementation.
        let event = unsafe {
            cl3::command_queue::enqueue_nd_range_kernel(
                queue.raw().0 as cl_command_queue,
                kernel.raw().0 as cl_kernel,
                global_dims.len() as cl_uint,
                ptr::null(),
                global_dims.as_ptr(),
                ptr::null(),
                count,
                waits,
            )
        }
        .map_err(|code| cl_error("clEnqueueNDRangeKernel", code))?;
        Ok(Owned::from_created(ClRaw(event as *mut c_void)))
    }

    fn enqueue_read_buffer(
        &self,
        queue: &RcHandle<ClQueue>,
        buffer: ClRaw,
        dst: &HostBuffer,
        wait_list: &[ClRaw],
    ) -> Result<Owned<ClEvent>, DeviceError> {
        let (count, waits) = wait_ptr(wait_list);
        let event = {
            let mut data = dst.lock();
            let bytes = std::mem::size_of_val(data.as_slice());
            // SAFETY: as for writes, `dst` outlives the transfer.
            unsafe {
                cl3::command_queue::enqueue_read_buffer(
                    queue.raw().0 as cl_command_queue,
                    buffer.0 as cl_mem,
                    CL_NON_BLOCKING,
                    0,
                    bytes,
                    data.as_mut_ptr().cast::<c_void>(),
                    count,
                    waits,
                )
            }
            .map_err(|code| cl_error("clEnqueueReadBuffer", code))?
        };
        let event = Owned::from_created(ClRaw(event as *mut c_void));
        hold_until_complete(event.raw(), dst.clone())?;
        Ok(event)
    }

    fn set_completion_callback(&self, event: ClRaw, callback: CompletionCallback) -> Result<(), DeviceError> {
        register_callback(event, callback)
    }

    fn flush(&self, queue: &RcHandle<ClQueue>) -> Result<(), DeviceError> {
        // SAFETY: the queue handle is live.
        unsafe { cl3::command_queue::flush(queue.raw().0 as cl_command_queue) }
            .map_err(|code| cl_error("clFlush", code))
    }
}

fn device_type_of(raw: cl_device_type) -> DeviceType {
    if raw & CL_DEVICE_TYPE_GPU != 0 {
        DeviceType::Gpu
    } else if raw & CL_DEVICE_TYPE_CPU != 0 {
        DeviceType::Cpu
    } else if raw & CL_DEVICE_TYPE_ACCELERATOR != 0 {
        DeviceType::Accelerator
    } else {
        DeviceType::Other
    }
}

fn describe(device: &Device) -> Result<DeviceInfo, DeviceError> {
    let query = |call: &'static str| move |e: opencl3::error_codes::ClError| cl_error(call, e.0);
    Ok(DeviceInfo {
        name: device.name().map_err(query("clGetDeviceInfo(NAME)"))?,
        vendor: device.vendor().map_err(query("clGetDeviceInfo(VENDOR)"))?,
        device_type: device_type_of(device.dev_type().map_err(query("clGetDeviceInfo(TYPE)"))?),
        max_compute_units: device.max_compute_units().map_err(query("clGetDeviceInfo(MAX_COMPUTE_UNITS)"))?,
        max_work_group_size: device
            .max_work_group_size()
            .map_err(query("clGetDeviceInfo(MAX_WORK_GROUP_SIZE)"))?,
        max_work_item_sizes: device
            .max_work_item_sizes()
            .map_err(query("clGetDeviceInfo(MAX_WORK_ITEM_SIZES)"))?,
        opencl_c_version: device
            .opencl_c_version()
            .map_err(query("clGetDeviceInfo(OPENCL_C_VERSION)"))?,
    })
}

/// Every OpenCL device on every platform.
pub fn list_devices() -> Result<Vec<DeviceInfo>, OpenClError> {
    let ids = get_all_devices(CL_DEVICE_TYPE_ALL).map_err(|e| cl_error("clGetDeviceIDs", e.0))?;
    ids.into_iter().map(|id| describe(&Device::new(id)).map_err(Into::into)).collect()
}

/// First device of the preferred type, trying GPU, then CPU, then
/// accelerator. With `wanted`, only a device with exactly that name qualifies.
pub fn find_device(wanted: Option<&str>) -> Result<Device, OpenClError> {
    let platforms = get_platforms().map_err(|e| cl_error("clGetPlatformIDs", e.0))?;
    if platforms.is_empty() {
        return Err(OpenClError::NoPlatforms);
    }
    for device_type in [CL_DEVICE_TYPE_GPU, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_ACCELERATOR] {
        for platform in &platforms {
            // A platform without devices of this type reports an error.
            let ids = platform.get_devices(device_type).unwrap_or_default();
            for id in ids {
                let device = Device::new(id);
                let name = device.name().unwrap_or_default();
                debug!(platform = %platform.name().unwrap_or_default(), device = %name, "found OpenCL device");
                if wanted.map_or(true, |w| name.trim() == w) {
                    info!(device = %name, "selected OpenCL device");
                    return Ok(device);
                }
            }
        }
    }
    Err(OpenClError::NoDevice { wanted: wanted.map(str::to_owned) })
}

/// Context, profiling queue and the `matrix_mult` kernel on `device`.
pub fn prepare(device: &Device) -> Result<DeviceHandles<OpenClRuntime>, OpenClError> {
    let context = Context::from_device(device).map_err(|e| cl_error("clCreateContext", e.0))?;
    let queue = CommandQueue::create_default_with_properties(&context, CL_QUEUE_PROFILING_ENABLE, 0)
        .map_err(|e| cl_error("clCreateCommandQueue", e.0))?;
    let program = Program::create_and_build_from_source(&context, kernels::KERNEL_SOURCE, "").map_err(|log| {
        warn!("kernel program build failed");
        OpenClError::Build { log }
    })?;
    let kernel = Kernel::create(&program, kernels::MATRIX_MULT).map_err(|e| cl_error("clCreateKernel", e.0))?;

    // The opencl3 wrappers release their own references on drop.
    Ok(DeviceHandles {
        context: RcHandle::retained(ClRaw(context.get() as *mut c_void))?,
        queue: RcHandle::retained(ClRaw(queue.get() as *mut c_void))?,
        kernel: RcHandle::retained(ClRaw(kernel.get() as *mut c_void))?,
    })
}

/// Locate a device and prepare the benchmark kernel on it.
pub fn setup(wanted: Option<&str>) -> Result<(OpenClRuntime, DeviceHandles<OpenClRuntime>, DeviceInfo), OpenClError> {
    let device = find_device(wanted)?;
    let info = describe(&device)?;
    let handles = prepare(&device)?;
    Ok((OpenClRuntime::new(), handles, info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handles_are_null() {
        let ctx: RcHandle<ClContext> = RcHandle::null();
        assert!(ctx.is_null());
        assert_eq!(ClEvent::NULL, ClRaw(ptr::null_mut()));
    }

    #[test]
    fn device_type_prefers_gpu_bit() {
        assert_eq!(device_type_of(CL_DEVICE_TYPE_GPU), DeviceType::Gpu);
        assert_eq!(device_type_of(CL_DEVICE_TYPE_CPU), DeviceType::Cpu);
        assert_eq!(device_type_of(CL_DEVICE_TYPE_ACCELERATOR), DeviceType::Accelerator);
        assert_eq!(device_type_of(0), DeviceType::Other);
    }

    #[test]
    fn empty_wait_list_is_null() {
        let (count, waits) = wait_ptr(&[]);
        assert_eq!(count, 0);
        assert!(waits.is_null());
    }

    #[test]
    fn no_device_message_names_filter() {
        let err = OpenClError::NoDevice { wanted: Some("Arc".into()) };
        assert_eq!(err.to_string(), "no OpenCL device found matching \"Arc\"");
        assert_eq!(OpenClError::NoDevice { wanted: None }.to_string(), "no OpenCL device found");
    }
}
