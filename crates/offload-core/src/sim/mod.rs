//! In-process simulated device runtime.
//!
//! [`SimRuntime`] implements [`DeviceRuntime`] without accelerator hardware:
//! objects live in a process-global table with real reference counts, each
//! queue is served by its own worker thread, and kernels execute the CPU
//! reference implementations from [`crate::kernels`]. Completion callbacks run
//! on queue worker threads, never on the submitting thread (except when
//! registered on an event that has already finished).
//!
//! [`SimFaults`] injects allocation and transfer failures; [`SimStats`]
//! exposes the counters tests use to check resource balance.

mod device;
mod event;
mod queue;
mod registry;
pub mod status;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

pub use device::{SimConfig, SimFaults, SimStats};
pub use registry::{ref_count, SimContext, SimEvent, SimId, SimKernel, SimMem, SimQueue};

use device::{Counters, DeviceState};
use event::EventState;
use queue::{Command, Op, QueueState};
use registry::{lookup, KernelState, MemState, ObjectKind, SimObject};

use crate::error::{DeviceError, StatusCode};
use crate::handle::{NativeResource, Owned, RcHandle};
use crate::kernels;
use crate::runtime::{CompletionCallback, DeviceInfo, DeviceRuntime, HostBuffer, MemAccess};

/// A simulated compute device.
///
/// Cloning shares the device: objects created through any clone count
/// against the same [`SimStats`].
#[derive(Clone)]
pub struct SimRuntime {
    device: Arc<DeviceState>,
}

impl Default for SimRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimRuntime").field("device", &self.device.info.name).finish()
    }
}

fn fail(call: &'static str, code: StatusCode) -> DeviceError {
    DeviceError::new(call, code, status::error_text(code))
}

impl SimRuntime {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        Self { device: Arc::new(DeviceState::new(config)) }
    }

    pub fn with_faults(faults: SimFaults) -> Self {
        Self::with_config(SimConfig { faults, ..SimConfig::default() })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.device.info
    }

    pub fn stats(&self) -> SimStats {
        self.device.stats()
    }

    /// Create a context on this device. The returned handle owns the implicit
    /// first reference.
    pub fn create_context(&self) -> Result<RcHandle<SimContext>, DeviceError> {
        let id = registry::insert(SimObject::Context(Arc::clone(&self.device)));
        debug!(id, device = %self.device.info.name, "context created");
        Ok(RcHandle::adopt(id))
    }

    /// Create an in-order queue on `context`.
    pub fn create_queue(&self, context: &RcHandle<SimContext>) -> Result<RcHandle<SimQueue>, DeviceError> {
        self.check_context(context, "clCreateCommandQueue")?;
        static QUEUE_SEQ: AtomicU64 = AtomicU64::new(1);
        let label = QUEUE_SEQ.fetch_add(1, Ordering::Relaxed).to_string();
        let queue = QueueState::spawn(Arc::clone(&self.device), &label)?;
        let id = registry::insert(SimObject::Queue(queue));
        debug!(id, "command queue created");
        Ok(RcHandle::adopt(id))
    }

    /// Create a kernel by name. Only the kernels in [`kernels::KERNEL_NAMES`]
    /// exist on a simulated device.
    pub fn create_kernel(
        &self,
        context: &RcHandle<SimContext>,
        name: &str,
    ) -> Result<RcHandle<SimKernel>, DeviceError> {
        self.check_context(context, "clCreateKernel")?;
        let Some(&name) = kernels::KERNEL_NAMES.iter().find(|known| **known == name) else {
            return Err(fail("clCreateKernel", status::INVALID_KERNEL_NAME));
        };
        let arg_count = kernels::arg_count(name).unwrap_or(0);
        let kernel = KernelState {
            device: Arc::clone(&self.device),
            name,
            args: Mutex::new(vec![0; arg_count]),
        };
        let id = registry::insert(SimObject::Kernel(Arc::new(kernel)));
        debug!(id, name, "kernel created");
        Ok(RcHandle::adopt(id))
    }

    fn check_context(&self, context: &RcHandle<SimContext>, call: &'static str) -> Result<(), DeviceError> {
        let id = context.get().ok_or_else(|| fail(call, status::INVALID_CONTEXT))?;
        match lookup(id, ObjectKind::Context, call)? {
            SimObject::Context(device) if Arc::ptr_eq(&device, &self.device) => Ok(()),
            _ => Err(fail(call, status::INVALID_CONTEXT)),
        }
    }

    fn queue(&self, queue: &RcHandle<SimQueue>, call: &'static str) -> Result<Arc<QueueState>, DeviceError> {
        let id = queue.get().ok_or_else(|| fail(call, status::INVALID_COMMAND_QUEUE))?;
        match lookup(id, ObjectKind::Queue, call)? {
            SimObject::Queue(state) if Arc::ptr_eq(state.device(), &self.device) => Ok(state),
            _ => Err(fail(call, status::INVALID_COMMAND_QUEUE)),
        }
    }

    fn kernel(&self, kernel: &RcHandle<SimKernel>, call: &'static str) -> Result<Arc<KernelState>, DeviceError> {
        let id = kernel.get().ok_or_else(|| fail(call, status::INVALID_KERNEL))?;
        match lookup(id, ObjectKind::Kernel, call)? {
            SimObject::Kernel(state) if Arc::ptr_eq(&state.device, &self.device) => Ok(state),
            _ => Err(fail(call, status::INVALID_KERNEL)),
        }
    }

    fn mem(&self, id: SimId, call: &'static str) -> Result<Arc<MemState>, DeviceError> {
        match lookup(id, ObjectKind::Mem, call)? {
            SimObject::Mem(state) if Arc::ptr_eq(&state.device, &self.device) => Ok(state),
            _ => Err(fail(call, status::INVALID_MEM_OBJECT)),
        }
    }

    fn events(&self, wait_list: &[SimId], call: &'static str) -> Result<Vec<Arc<EventState>>, DeviceError> {
        wait_list
            .iter()
            .map(|&id| match lookup(id, ObjectKind::Event, call) {
                Ok(SimObject::Event(state)) => Ok(state),
                _ => Err(fail(call, status::INVALID_EVENT_WAIT_LIST)),
            })
            .collect()
    }

    /// Retain `buffers` for the lifetime of a command, then stage it.
    fn stage(
        &self,
        queue: &QueueState,
        op: Op,
        wait_list: Vec<Arc<EventState>>,
        buffers: &[SimId],
        call: &'static str,
    ) -> Result<Owned<SimEvent>, DeviceError> {
        let mut held = Vec::with_capacity(buffers.len());
        for &id in buffers {
            if let Err(e) = SimMem::retain(id) {
                queue::release_held(&held);
                return Err(DeviceError::new(call, e.code, e.description));
            }
            held.push(id);
        }
        let event = Arc::new(EventState::new(Arc::clone(&self.device)));
        self.device.counters.event_created();
        let event_id = registry::insert(SimObject::Event(Arc::clone(&event)));
        queue.stage(Command { op, wait_list, event, held_buffers: held });
        Ok(Owned::from_created(event_id))
    }
}

impl DeviceRuntime for SimRuntime {
    type Context = SimContext;
    type Queue = SimQueue;
    type Kernel = SimKernel;
    type Mem = SimMem;
    type Event = SimEvent;

    fn name(&self) -> &str {
        "sim"
    }

    fn error_text(&self, code: StatusCode) -> String {
        status::error_text(code).to_string()
    }

    fn create_buffer(
        &self,
        context: &RcHandle<SimContext>,
        access: MemAccess,
        bytes: usize,
    ) -> Result<Owned<SimMem>, DeviceError> {
        const CALL: &str = "clCreateBuffer";
        self.check_context(context, CALL)?;
        if bytes == 0 {
            return Err(fail(CALL, status::INVALID_BUFFER_SIZE));
        }
        let ordinal = Counters::bump(&self.device.counters.allocation_attempts);
        if self.device.faults.fail_allocation_at == Some(ordinal) {
            debug!(ordinal, bytes, "injected allocation failure");
            return Err(fail(CALL, status::MEM_OBJECT_ALLOCATION_FAILURE));
        }
        let len = bytes.div_ceil(std::mem::size_of::<f32>());
        let mem = MemState {
            device: Arc::clone(&self.device),
            bytes,
            access,
            data: Mutex::new(vec![0.0; len]),
        };
        self.device.counters.buffer_created();
        let id = registry::insert(SimObject::Mem(Arc::new(mem)));
        Ok(Owned::from_created(id))
    }

    fn enqueue_write_buffer(
        &self,
        queue: &RcHandle<SimQueue>,
        buffer: SimId,
        src: &HostBuffer,
        wait_list: &[SimId],
    ) -> Result<Owned<SimEvent>, DeviceError> {
        const CALL: &str = "clEnqueueWriteBuffer";
        let queue = self.queue(queue, CALL)?;
        let mem = self.mem(buffer, CALL)?;
        if src.byte_len() > mem.bytes {
            return Err(fail(CALL, status::INVALID_VALUE));
        }
        let deps = self.events(wait_list, CALL)?;
        let op = Op::Write { mem, src: src.clone() };
        self.stage(&queue, op, deps, &[buffer], CALL)
    }

    fn enqueue_marker(&self, queue: &RcHandle<SimQueue>, wait_list: &[SimId]) -> Result<Owned<SimEvent>, DeviceError> {
        const CALL: &str = "clEnqueueMarkerWithWaitList";
        let queue = self.queue(queue, CALL)?;
        let deps = self.events(wait_list, CALL)?;
        self.stage(&queue, Op::Marker, deps, &[], CALL)
    }

    fn set_kernel_arg(&self, kernel: &RcHandle<SimKernel>, index: u32, buffer: SimId) -> Result<(), DeviceError> {
        const CALL: &str = "clSetKernelArg";
        let kernel = self.kernel(kernel, CALL)?;
        self.mem(buffer, CALL)?;
        let mut args = kernel.args.lock().map_err(|_| fail(CALL, status::INVALID_KERNEL))?;
        let slot = args
            .get_mut(index as usize)
            .ok_or_else(|| fail(CALL, status::INVALID_ARG_INDEX))?;
        *slot = buffer;
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        queue: &RcHandle<SimQueue>,
        kernel: &RcHandle<SimKernel>,
        global_dims: &[usize],
        wait_list: &[SimId],
    ) -> Result<Owned<SimEvent>, DeviceError> {
        const CALL: &str = "clEnqueueNDRangeKernel";
        let queue = self.queue(queue, CALL)?;
        let kernel = self.kernel(kernel, CALL)?;
        if global_dims.len() != 2 {
            return Err(fail(CALL, status::INVALID_WORK_DIMENSION));
        }
        if global_dims[0] == 0 || global_dims[0] != global_dims[1] {
            return Err(fail(CALL, status::INVALID_GLOBAL_WORK_SIZE));
        }
        let ids = kernel.args.lock().map_err(|_| fail(CALL, status::INVALID_KERNEL))?.clone();
        if ids.iter().any(|&id| id == SimMem::NULL) {
            return Err(fail(CALL, status::INVALID_KERNEL_ARGS));
        }
        let args = ids
            .iter()
            .map(|&id| self.mem(id, CALL).map_err(|_| fail(CALL, status::INVALID_KERNEL_ARGS)))
            .collect::<Result<Vec<_>, _>>()?;
        // Every kernel reads all arguments but the last and writes the last.
        if let Some((output, inputs)) = args.split_last() {
            if !output.access.kernel_writes() || inputs.iter().any(|mem| !mem.access.kernel_reads()) {
                debug!(kernel = kernel.name, "buffer access flags do not match kernel arguments");
                return Err(fail(CALL, status::INVALID_KERNEL_ARGS));
            }
        }
        let deps = self.events(wait_list, CALL)?;
        let op = Op::Kernel { name: kernel.name, args, global: global_dims.to_vec() };
        self.stage(&queue, op, deps, &ids, CALL)
    }

    fn enqueue_read_buffer(
        &self,
        queue: &RcHandle<SimQueue>,
        buffer: SimId,
        dst: &HostBuffer,
        wait_list: &[SimId],
    ) -> Result<Owned<SimEvent>, DeviceError> {
        const CALL: &str = "clEnqueueReadBuffer";
        let queue = self.queue(queue, CALL)?;
        let mem = self.mem(buffer, CALL)?;
        if dst.byte_len() > mem.bytes {
            return Err(fail(CALL, status::INVALID_VALUE));
        }
        let deps = self.events(wait_list, CALL)?;
        let op = Op::Read { mem, dst: dst.clone() };
        self.stage(&queue, op, deps, &[buffer], CALL)
    }

    fn set_completion_callback(&self, event: SimId, callback: CompletionCallback) -> Result<(), DeviceError> {
        const CALL: &str = "clSetEventCallback";
        match lookup(event, ObjectKind::Event, CALL)? {
            SimObject::Event(state) => {
                state.on_complete(callback);
                Ok(())
            }
            _ => Err(fail(CALL, status::INVALID_EVENT)),
        }
    }

    fn flush(&self, queue: &RcHandle<SimQueue>) -> Result<(), DeviceError> {
        self.queue(queue, "clFlush")?.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CompletionStatus;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Setup {
        rt: SimRuntime,
        context: RcHandle<SimContext>,
        queue: RcHandle<SimQueue>,
    }

    fn setup(rt: SimRuntime) -> Setup {
        let context = rt.create_context().unwrap();
        let queue = rt.create_queue(&context).unwrap();
        Setup { rt, context, queue }
    }

    fn completion(rt: &SimRuntime, event: &Owned<SimEvent>) -> mpsc::Receiver<CompletionStatus> {
        let (tx, rx) = mpsc::channel();
        rt.set_completion_callback(event.raw(), Box::new(move |status| {
            let _ = tx.send(status);
        }))
        .unwrap();
        rx
    }

    #[test]
    fn unknown_kernel_name_rejected() {
        let s = setup(SimRuntime::new());
        let err = s.rt.create_kernel(&s.context, "cpy_3d").unwrap_err();
        assert_eq!(err.code, status::INVALID_KERNEL_NAME);
        assert_eq!(err.call, "clCreateKernel");
    }

    #[test]
    fn nothing_runs_before_flush() {
        let s = setup(SimRuntime::new());
        let buf = s.rt.create_buffer(&s.context, MemAccess::ReadWrite, 16).unwrap();
        let host = HostBuffer::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let ev = s.rt.enqueue_write_buffer(&s.queue, buf.raw(), &host, &[]).unwrap();
        let rx = completion(&s.rt, &ev);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        s.rt.flush(&s.queue).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), CompletionStatus::Complete);
    }

    #[test]
    fn write_kernel_read_chain_computes_product() {
        let s = setup(SimRuntime::new());
        let kernel = s.rt.create_kernel(&s.context, kernels::MATRIX_MULT).unwrap();
        let bytes = 4 * std::mem::size_of::<f32>();
        let a = s.rt.create_buffer(&s.context, MemAccess::ReadOnly, bytes).unwrap();
        let b = s.rt.create_buffer(&s.context, MemAccess::ReadOnly, bytes).unwrap();
        let c = s.rt.create_buffer(&s.context, MemAccess::WriteOnly, bytes).unwrap();
        let lhs = HostBuffer::from_vec(vec![0.0, 1.0, 2.0, 3.0]);
        let out = HostBuffer::zeroed(4);

        let wa = s.rt.enqueue_write_buffer(&s.queue, a.raw(), &lhs, &[]).unwrap();
        let wb = s.rt.enqueue_write_buffer(&s.queue, b.raw(), &lhs, &[]).unwrap();
        let join = s.rt.enqueue_marker(&s.queue, &[wa.raw(), wb.raw()]).unwrap();
        s.rt.set_kernel_arg(&kernel, 0, a.raw()).unwrap();
        s.rt.set_kernel_arg(&kernel, 1, b.raw()).unwrap();
        s.rt.set_kernel_arg(&kernel, 2, c.raw()).unwrap();
        let exec = s.rt.enqueue_kernel(&s.queue, &kernel, &[2, 2], &[join.raw()]).unwrap();
        let read = s.rt.enqueue_read_buffer(&s.queue, c.raw(), &out, &[exec.raw()]).unwrap();
        let rx = completion(&s.rt, &read);
        s.rt.flush(&s.queue).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), CompletionStatus::Complete);
        assert_eq!(out.snapshot(), vec![2.0, 3.0, 6.0, 11.0]);
        let stats = s.rt.stats();
        assert_eq!(stats.kernel_launches, 1);
        assert_eq!(stats.writes_executed, 2);
        assert_eq!(stats.reads_executed, 1);
    }

    #[test]
    fn kernel_arg_index_out_of_range() {
        let s = setup(SimRuntime::new());
        let kernel = s.rt.create_kernel(&s.context, kernels::MATRIX_SQR).unwrap();
        let buf = s.rt.create_buffer(&s.context, MemAccess::ReadWrite, 16).unwrap();
        let err = s.rt.set_kernel_arg(&kernel, 2, buf.raw()).unwrap_err();
        assert_eq!(err.code, status::INVALID_ARG_INDEX);
    }

    #[test]
    fn kernel_without_args_rejected() {
        let s = setup(SimRuntime::new());
        let kernel = s.rt.create_kernel(&s.context, kernels::MATRIX_MULT).unwrap();
        let err = s.rt.enqueue_kernel(&s.queue, &kernel, &[2, 2], &[]).unwrap_err();
        assert_eq!(err.code, status::INVALID_KERNEL_ARGS);
    }

    #[test]
    fn kernel_output_in_read_only_buffer_rejected() {
        let s = setup(SimRuntime::new());
        let kernel = s.rt.create_kernel(&s.context, kernels::MATRIX_SQR).unwrap();
        let input = s.rt.create_buffer(&s.context, MemAccess::ReadOnly, 16).unwrap();
        let output = s.rt.create_buffer(&s.context, MemAccess::ReadOnly, 16).unwrap();
        s.rt.set_kernel_arg(&kernel, 0, input.raw()).unwrap();
        s.rt.set_kernel_arg(&kernel, 1, output.raw()).unwrap();
        let err = s.rt.enqueue_kernel(&s.queue, &kernel, &[2, 2], &[]).unwrap_err();
        assert_eq!(err.code, status::INVALID_KERNEL_ARGS);
        assert_eq!(err.call, "clEnqueueNDRangeKernel");
    }

    #[test]
    fn kernel_input_in_write_only_buffer_rejected() {
        let s = setup(SimRuntime::new());
        let kernel = s.rt.create_kernel(&s.context, kernels::MATRIX_SQR).unwrap();
        let input = s.rt.create_buffer(&s.context, MemAccess::WriteOnly, 16).unwrap();
        let output = s.rt.create_buffer(&s.context, MemAccess::WriteOnly, 16).unwrap();
        s.rt.set_kernel_arg(&kernel, 0, input.raw()).unwrap();
        s.rt.set_kernel_arg(&kernel, 1, output.raw()).unwrap();
        let err = s.rt.enqueue_kernel(&s.queue, &kernel, &[2, 2], &[]).unwrap_err();
        assert_eq!(err.code, status::INVALID_KERNEL_ARGS);
        assert_eq!(s.rt.stats().kernel_launches, 0);
    }

    #[test]
    fn injected_allocation_failure_hits_exact_ordinal() {
        let faults = SimFaults { fail_allocation_at: Some(2), ..SimFaults::default() };
        let s = setup(SimRuntime::with_faults(faults));
        let first = s.rt.create_buffer(&s.context, MemAccess::ReadOnly, 4).unwrap();
        let err = s.rt.create_buffer(&s.context, MemAccess::ReadOnly, 4).unwrap_err();
        assert_eq!(err.code, status::MEM_OBJECT_ALLOCATION_FAILURE);
        let third = s.rt.create_buffer(&s.context, MemAccess::ReadOnly, 4).unwrap();
        let stats = s.rt.stats();
        assert_eq!(stats.allocation_attempts, 3);
        assert_eq!(stats.buffers_created, 2);
        drop((first, third));
        assert_eq!(s.rt.stats().live_buffers, 0);
    }

    #[test]
    fn failed_dependency_propagates() {
        let faults = SimFaults { fail_read_at: Some(1), ..SimFaults::default() };
        let s = setup(SimRuntime::with_faults(faults));
        let buf = s.rt.create_buffer(&s.context, MemAccess::ReadWrite, 16).unwrap();
        let out = HostBuffer::zeroed(4);
        let read = s.rt.enqueue_read_buffer(&s.queue, buf.raw(), &out, &[]).unwrap();
        let marker = s.rt.enqueue_marker(&s.queue, &[read.raw()]).unwrap();
        let rx_read = completion(&s.rt, &read);
        let rx_marker = completion(&s.rt, &marker);
        s.rt.flush(&s.queue).unwrap();
        assert_eq!(
            rx_read.recv_timeout(Duration::from_secs(5)).unwrap(),
            CompletionStatus::Error(status::OUT_OF_RESOURCES)
        );
        assert_eq!(
            rx_marker.recv_timeout(Duration::from_secs(5)).unwrap(),
            CompletionStatus::Error(status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST)
        );
    }

    #[test]
    fn commands_keep_released_buffers_alive_until_executed() {
        let s = setup(SimRuntime::new());
        let buf = s.rt.create_buffer(&s.context, MemAccess::ReadWrite, 16).unwrap();
        let host = HostBuffer::from_vec(vec![5.0; 4]);
        let id = buf.raw();
        let ev = s.rt.enqueue_write_buffer(&s.queue, id, &host, &[]).unwrap();
        drop(buf);
        assert_eq!(ref_count(id), Some(1));
        let rx = completion(&s.rt, &ev);
        s.rt.flush(&s.queue).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ref_count(id), None);
        assert_eq!(s.rt.stats().live_buffers, 0);
    }

    #[test]
    fn foreign_context_rejected() {
        let a = SimRuntime::new();
        let b = SimRuntime::new();
        let ctx = a.create_context().unwrap();
        let err = b.create_buffer(&ctx, MemAccess::ReadOnly, 4).unwrap_err();
        assert_eq!(err.code, status::INVALID_CONTEXT);
    }

    #[test]
    fn events_are_released_with_their_owner() {
        let s = setup(SimRuntime::new());
        let ev = s.rt.enqueue_marker(&s.queue, &[]).unwrap();
        assert_eq!(s.rt.stats().live_events, 1);
        drop(ev);
        assert_eq!(s.rt.stats().live_events, 0);
    }
}
