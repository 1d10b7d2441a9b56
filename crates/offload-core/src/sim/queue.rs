//! In-order command queues backed by one worker thread each.
//!
//! Commands are staged when enqueued and handed to the worker on `flush`.
//! The worker executes them strictly in submission order: it waits for every
//! event in a command's wait list, performs the operation, drops the buffer
//! references the command held, and finally completes the command's event,
//! which runs its callbacks on the worker thread.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tracing::{debug, trace, warn};

use super::device::{Counters, DeviceState};
use super::event::EventState;
use super::registry::{MemState, SimId, SimMem};
use super::status;
use crate::error::DeviceError;
use crate::handle::NativeResource;
use crate::kernels;
use crate::runtime::{CompletionStatus, HostBuffer};

pub(crate) enum Op {
    Write { mem: Arc<MemState>, src: HostBuffer },
    Read { mem: Arc<MemState>, dst: HostBuffer },
    Marker,
    Kernel { name: &'static str, args: Vec<Arc<MemState>>, global: Vec<usize> },
}

impl Op {
    fn label(&self) -> &'static str {
        match self {
            Self::Write { .. } => "write",
            Self::Read { .. } => "read",
            Self::Marker => "marker",
            Self::Kernel { .. } => "kernel",
        }
    }
}

pub(crate) struct Command {
    pub(crate) op: Op,
    pub(crate) wait_list: Vec<Arc<EventState>>,
    pub(crate) event: Arc<EventState>,
    /// Buffer identifiers retained at enqueue time, released after execution.
    pub(crate) held_buffers: Vec<SimId>,
}

pub(crate) struct QueueState {
    device: Arc<DeviceState>,
    staged: Mutex<Vec<Command>>,
    sender: Mutex<Option<Sender<Command>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl QueueState {
    /// Create the queue and spawn its worker.
    pub(crate) fn spawn(device: Arc<DeviceState>, label: &str) -> Result<Arc<Self>, DeviceError> {
        let (sender, receiver) = mpsc::channel();
        let worker_device = Arc::clone(&device);
        thread::Builder::new()
            .name(format!("sim-queue-{label}"))
            .spawn(move || run_worker(worker_device, receiver))
            .map_err(|e| {
                warn!(error = %e, "failed to spawn simulated queue worker");
                DeviceError::new(
                    "clCreateCommandQueue",
                    status::OUT_OF_HOST_MEMORY,
                    status::error_text(status::OUT_OF_HOST_MEMORY),
                )
            })?;
        Ok(Arc::new(Self {
            device,
            staged: Mutex::new(Vec::new()),
            sender: Mutex::new(Some(sender)),
        }))
    }

    pub(crate) fn device(&self) -> &Arc<DeviceState> {
        &self.device
    }

    pub(crate) fn stage(&self, command: Command) {
        lock(&self.staged).push(command);
    }

    /// Hand every staged command to the worker.
    pub(crate) fn flush(&self) -> Result<(), DeviceError> {
        let staged = std::mem::take(&mut *lock(&self.staged));
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(DeviceError::new(
                "clFlush",
                status::INVALID_COMMAND_QUEUE,
                status::error_text(status::INVALID_COMMAND_QUEUE),
            ));
        };
        for command in staged {
            if sender.send(command).is_err() {
                return Err(DeviceError::new(
                    "clFlush",
                    status::OUT_OF_RESOURCES,
                    status::error_text(status::OUT_OF_RESOURCES),
                ));
            }
        }
        Ok(())
    }

    /// Called when the last reference goes away. Flushed commands still
    /// drain; commands that were never flushed are dropped with their events
    /// left pending.
    pub(crate) fn shutdown(&self) {
        let dropped = std::mem::take(&mut *lock(&self.staged));
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "queue released with unflushed commands");
        }
        for command in dropped {
            release_held(&command.held_buffers);
        }
        lock(&self.sender).take();
    }
}

fn run_worker(device: Arc<DeviceState>, receiver: Receiver<Command>) {
    for command in receiver {
        execute(&device, command);
    }
    trace!("simulated queue worker exiting");
}

fn execute(device: &DeviceState, command: Command) {
    let Command { op, wait_list, event, held_buffers } = command;
    let label = op.label();

    let dependency_failed = wait_list
        .iter()
        .any(|dep| matches!(dep.wait(), CompletionStatus::Error(_)));

    let status = if dependency_failed {
        CompletionStatus::Error(status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST)
    } else {
        if !device.faults.command_latency.is_zero() {
            thread::sleep(device.faults.command_latency);
        }
        run_op(device, op)
    };
    trace!(op = label, ?status, "command executed");

    release_held(&held_buffers);
    event.complete(status);
}

fn run_op(device: &DeviceState, op: Op) -> CompletionStatus {
    match op {
        Op::Write { mem, src } => {
            Counters::bump(&device.counters.writes_executed);
            let src = src.lock();
            let mut dst = mem.data();
            dst[..src.len()].copy_from_slice(&src);
            CompletionStatus::Complete
        }
        Op::Read { mem, dst } => {
            let ordinal = Counters::bump(&device.counters.reads_executed);
            if device.faults.fail_read_at == Some(ordinal) {
                debug!(ordinal, "injected read failure");
                return CompletionStatus::Error(status::OUT_OF_RESOURCES);
            }
            let src = mem.data();
            let mut dst = dst.lock();
            let len = dst.len();
            dst.copy_from_slice(&src[..len]);
            CompletionStatus::Complete
        }
        Op::Marker => CompletionStatus::Complete,
        Op::Kernel { name, args, global } => {
            Counters::bump(&device.counters.kernel_launches);
            run_kernel(name, &args, &global)
        }
    }
}

fn run_kernel(name: &'static str, args: &[Arc<MemState>], global: &[usize]) -> CompletionStatus {
    let size = global[0];
    let cells = size * size;
    if args.iter().any(|mem| mem.data().len() < cells) {
        return CompletionStatus::Error(status::INVALID_KERNEL_ARGS);
    }
    // Inputs are copied out first so an argument may alias the output.
    match name {
        kernels::MATRIX_MULT => {
            let lhs = args[0].data().clone();
            let rhs = args[1].data().clone();
            let mut out = args[2].data();
            kernels::matrix_mult_ref(&lhs, &rhs, &mut out, size);
        }
        kernels::MATRIX_SQR => {
            let matrix = args[0].data().clone();
            let mut out = args[1].data();
            kernels::matrix_sqr_ref(&matrix, &mut out, size);
        }
        _ => return CompletionStatus::Error(status::INVALID_KERNEL),
    }
    CompletionStatus::Complete
}

pub(crate) fn release_held(ids: &[SimId]) {
    for &id in ids {
        if let Err(e) = SimMem::release(id) {
            warn!(id, error = %e, "failed to drop command buffer reference");
        }
    }
}
