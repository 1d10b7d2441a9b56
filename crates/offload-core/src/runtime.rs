//! The device runtime capability consumed by the command pipeline.
//!
//! [`DeviceRuntime`] is the boundary between the pipeline and whatever
//! executes the work: the in-process simulator in [`crate::sim`] or the native
//! OpenCL runtime behind the `opencl` feature. Every call is non-blocking from
//! the caller's point of view; completion is observed only through
//! [`DeviceRuntime::set_completion_callback`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::error::{DeviceError, StatusCode};
use crate::handle::{NativeResource, Owned, RcHandle};

/// Raw identifier of a resource kind.
pub type RawOf<K> = <K as NativeResource>::Raw;

/// Access mode a device buffer is allocated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl MemAccess {
    /// Whether a kernel may read the buffer.
    pub fn kernel_reads(self) -> bool {
        self != Self::WriteOnly
    }

    /// Whether a kernel may write the buffer.
    pub fn kernel_writes(self) -> bool {
        self != Self::ReadOnly
    }
}

/// Terminal status delivered to a completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The command and everything it depended on completed successfully.
    Complete,
    /// The command terminated abnormally with a runtime status code.
    Error(StatusCode),
}

/// Callback fired once when an event reaches a terminal state.
///
/// Runs on a runtime-chosen thread, which may differ from the thread that
/// registered it.
pub type CompletionCallback = Box<dyn FnOnce(CompletionStatus) + Send + 'static>;

/// Host-side mirror of a device buffer.
///
/// Shared between the submitter and the runtime for the duration of a
/// transfer; the runtime keeps a clone alive until the transfer completes.
#[derive(Clone, Default)]
pub struct HostBuffer {
    data: Arc<Mutex<Vec<f32>>>,
}

impl HostBuffer {
    /// A buffer of `len` zeros.
    pub fn zeroed(len: usize) -> Self {
        Self { data: Arc::new(Mutex::new(vec![0.0; len])) }
    }

    pub fn from_vec(values: Vec<f32>) -> Self {
        Self { data: Arc::new(Mutex::new(values)) }
    }

    /// Lock the contents. A poisoned lock is recovered: the data is plain
    /// floats and has no invariant a panicking writer could break.
    pub fn lock(&self) -> MutexGuard<'_, Vec<f32>> {
        match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<f32> {
        self.lock().clone()
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len()).finish()
    }
}

/// Device classification, in the order devices are preferred during
/// discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceType {
    Gpu,
    Cpu,
    Accelerator,
    Other,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu => write!(f, "GPU"),
            Self::Cpu => write!(f, "CPU"),
            Self::Accelerator => write!(f, "Accelerator"),
            Self::Other => write!(f, "Other"),
        }
    }
}

/// Descriptive information about a compute device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub device_type: DeviceType,
    /// Number of parallel compute units.
    pub max_compute_units: u32,
    /// Largest work-group a kernel may be launched with.
    pub max_work_group_size: usize,
    /// Largest work-group extent per dimension.
    pub max_work_item_sizes: Vec<usize>,
    pub opencl_c_version: String,
}

/// Asynchronous device operations issued by the command pipeline.
///
/// Resource kinds are associated types so that each runtime binds its own
/// retain/release pair through [`NativeResource`]. Enqueue calls return the
/// event marking completion of the enqueued command; wait lists are passed as
/// raw event identifiers borrowed from events the caller still owns.
pub trait DeviceRuntime: Send + Sync + 'static {
    type Context: NativeResource;
    type Queue: NativeResource;
    type Kernel: NativeResource;
    type Mem: NativeResource;
    type Event: NativeResource;

    /// Human-readable runtime name for logs.
    fn name(&self) -> &str;

    /// The runtime's description of a status code.
    fn error_text(&self, code: StatusCode) -> String;

    /// Allocate an uninitialised device buffer of `bytes` bytes.
    fn create_buffer(
        &self,
        context: &RcHandle<Self::Context>,
        access: MemAccess,
        bytes: usize,
    ) -> Result<Owned<Self::Mem>, DeviceError>;

    /// Copy `src` into `buffer` without blocking.
    fn enqueue_write_buffer(
        &self,
        queue: &RcHandle<Self::Queue>,
        buffer: RawOf<Self::Mem>,
        src: &HostBuffer,
        wait_list: &[RawOf<Self::Event>],
    ) -> Result<Owned<Self::Event>, DeviceError>;

    /// A marker completing once every event in `wait_list` has completed.
    fn enqueue_marker(
        &self,
        queue: &RcHandle<Self::Queue>,
        wait_list: &[RawOf<Self::Event>],
    ) -> Result<Owned<Self::Event>, DeviceError>;

    /// Bind `buffer` as kernel argument `index`.
    fn set_kernel_arg(
        &self,
        kernel: &RcHandle<Self::Kernel>,
        index: u32,
        buffer: RawOf<Self::Mem>,
    ) -> Result<(), DeviceError>;

    /// Launch `kernel` over an N-dimensional global range.
    fn enqueue_kernel(
        &self,
        queue: &RcHandle<Self::Queue>,
        kernel: &RcHandle<Self::Kernel>,
        global_dims: &[usize],
        wait_list: &[RawOf<Self::Event>],
    ) -> Result<Owned<Self::Event>, DeviceError>;

    /// Copy `buffer` into `dst` without blocking.
    fn enqueue_read_buffer(
        &self,
        queue: &RcHandle<Self::Queue>,
        buffer: RawOf<Self::Mem>,
        dst: &HostBuffer,
        wait_list: &[RawOf<Self::Event>],
    ) -> Result<Owned<Self::Event>, DeviceError>;

    /// Fire `callback` once `event` reaches a terminal state.
    fn set_completion_callback(
        &self,
        event: RawOf<Self::Event>,
        callback: CompletionCallback,
    ) -> Result<(), DeviceError>;

    /// Submit everything enqueued so far to the device without waiting.
    fn flush(&self, queue: &RcHandle<Self::Queue>) -> Result<(), DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_buffer_byte_len_counts_floats() {
        let buf = HostBuffer::zeroed(16);
        assert_eq!(buf.len(), 16);
        assert_eq!(buf.byte_len(), 64);
        assert!(!buf.is_empty());
    }

    #[test]
    fn host_buffer_clones_share_storage() {
        let a = HostBuffer::from_vec(vec![1.0, 2.0]);
        let b = a.clone();
        b.lock()[0] = 7.0;
        assert_eq!(a.snapshot(), vec![7.0, 2.0]);
    }

    #[test]
    fn device_type_display() {
        assert_eq!(DeviceType::Gpu.to_string(), "GPU");
        assert_eq!(DeviceType::Accelerator.to_string(), "Accelerator");
    }
}
