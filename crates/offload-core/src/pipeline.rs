//! Callback-driven command resubmission pipeline.
//!
//! A [`CommandPipeline`] runs a fixed number of iterations of the same
//! offload: upload two `D × D` matrices, multiply them on the device, read the
//! product back. Iterations are strictly serialized: the next iteration is
//! submitted from inside the previous iteration's completion callback, on
//! whatever thread the runtime delivers it on. The caller only ever blocks in
//! [`CommandPipeline::wait`].
//!
//! ```text
//!            enqueue()                  completion (not last)
//!   Idle ───────────────▶ Submitting ─▶ InFlight ──────────────┐
//!                             ▲                                │
//!                             └────────────────────────────────┘
//!                                        completion (last), failure, cancel
//!                           InFlight ───────────────────────────▶ Done
//! ```
//!
//! Each iteration owns its three device buffers and five events through
//! [`Owned`] handles grouped in one `InFlight` value. That value is created by
//! the submission and dropped by the completion callback, so buffers never
//! outlive the iteration that created them and are never released twice.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::error::{DeviceError, PipelineError};
use crate::handle::{Owned, RcHandle};
use crate::report::{micros, IterationRecord, RunOutcome, RunReport};
use crate::runtime::{CompletionStatus, DeviceRuntime, HostBuffer, MemAccess};

/// Kernel argument slots, in binding order.
const ARG_LHS: u32 = 0;
const ARG_RHS: u32 = 1;
const ARG_OUT: u32 = 2;

/// Cooperative cancellation for a running pipeline.
///
/// Checked before every resubmission. Clones share one flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Problem size and iteration budget of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Matrix dimension `D`; every buffer holds `D * D` floats.
    pub dimension: usize,
    /// Number of iterations to run.
    pub iterations: usize,
}

impl PipelineConfig {
    pub fn new(dimension: usize, iterations: usize) -> Self {
        Self { dimension, iterations }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.dimension == 0 {
            return Err(PipelineError::InvalidConfig("dimension must be positive".into()));
        }
        if self.iterations == 0 {
            return Err(PipelineError::InvalidConfig("iteration budget must be positive".into()));
        }
        self.dimension
            .checked_mul(self.dimension)
            .and_then(|cells| cells.checked_mul(std::mem::size_of::<f32>()))
            .ok_or_else(|| PipelineError::InvalidConfig(format!("dimension {} overflows buffer size", self.dimension)))?;
        Ok(())
    }

    pub fn cells(&self) -> usize {
        self.dimension * self.dimension
    }

    pub fn buffer_bytes(&self) -> usize {
        self.cells() * std::mem::size_of::<f32>()
    }
}

/// The shared device capabilities a pipeline runs against.
pub struct DeviceHandles<R: DeviceRuntime> {
    pub context: RcHandle<R::Context>,
    pub queue: RcHandle<R::Queue>,
    pub kernel: RcHandle<R::Kernel>,
}

impl<R: DeviceRuntime> DeviceHandles<R> {
    /// Retain all three capabilities, surfacing the first refused retain.
    pub fn try_clone(&self) -> Result<Self, DeviceError> {
        Ok(Self {
            context: self.context.try_clone()?,
            queue: self.queue.try_clone()?,
            kernel: self.kernel.try_clone()?,
        })
    }
}

impl<R: DeviceRuntime> Clone for DeviceHandles<R> {
    fn clone(&self) -> Self {
        Self { context: self.context.clone(), queue: self.queue.clone(), kernel: self.kernel.clone() }
    }
}

impl<R: DeviceRuntime> fmt::Debug for DeviceHandles<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandles")
            .field("context", &self.context)
            .field("queue", &self.queue)
            .field("kernel", &self.kernel)
            .finish()
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Submitting,
    InFlight,
    Done,
}

/// Device objects owned by the iteration currently in flight.
///
/// Field order is release order: events first, then buffers.
struct InFlight<R: DeviceRuntime> {
    index: usize,
    submit_seq: u64,
    submitted_at: Instant,
    _writes: [Owned<R::Event>; 2],
    _join: Owned<R::Event>,
    _exec: Owned<R::Event>,
    _read: Owned<R::Event>,
    _lhs: Owned<R::Mem>,
    _rhs: Owned<R::Mem>,
    _out: Owned<R::Mem>,
}

struct Control<R: DeviceRuntime> {
    state: PipelineState,
    completed: usize,
    in_flight: Option<InFlight<R>>,
    records: Vec<IterationRecord>,
    outcome: Option<Result<RunOutcome, PipelineError>>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

struct Shared<R: DeviceRuntime> {
    runtime: Arc<R>,
    handles: DeviceHandles<R>,
    config: PipelineConfig,
    lhs: HostBuffer,
    rhs: HostBuffer,
    out: HostBuffer,
    control: Mutex<Control<R>>,
    done: Condvar,
    seq: AtomicU64,
    cancel: Option<CancelToken>,
}

/// Runs `iterations` serialized offload iterations of a `D × D` matrix
/// multiply.
///
/// The kernel must take three buffer arguments: two `D × D` inputs and one
/// `D × D` output, bound in that order.
pub struct CommandPipeline<R: DeviceRuntime> {
    shared: Arc<Shared<R>>,
}

impl<R: DeviceRuntime> CommandPipeline<R> {
    /// Bind a pipeline to its capabilities. No device work happens until
    /// [`enqueue`](Self::enqueue).
    pub fn new(runtime: Arc<R>, config: PipelineConfig, handles: DeviceHandles<R>) -> Result<Self, PipelineError> {
        Self::build(runtime, config, handles, None)
    }

    /// Like [`new`](Self::new), checking `cancel` before every resubmission.
    pub fn with_cancel(
        runtime: Arc<R>,
        config: PipelineConfig,
        handles: DeviceHandles<R>,
        cancel: CancelToken,
    ) -> Result<Self, PipelineError> {
        Self::build(runtime, config, handles, Some(cancel))
    }

    fn build(
        runtime: Arc<R>,
        config: PipelineConfig,
        handles: DeviceHandles<R>,
        cancel: Option<CancelToken>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        for (name, null) in [
            ("context", handles.context.is_null()),
            ("queue", handles.queue.is_null()),
            ("kernel", handles.kernel.is_null()),
        ] {
            if null {
                return Err(PipelineError::InvalidConfig(format!("{name} handle is null")));
            }
        }
        let cells = config.cells();
        let shared = Shared {
            runtime,
            handles,
            config,
            lhs: HostBuffer::zeroed(cells),
            rhs: HostBuffer::zeroed(cells),
            out: HostBuffer::zeroed(cells),
            control: Mutex::new(Control {
                state: PipelineState::Idle,
                completed: 0,
                in_flight: None,
                records: Vec::with_capacity(config.iterations),
                outcome: None,
                started_at: None,
                finished_at: None,
            }),
            done: Condvar::new(),
            seq: AtomicU64::new(0),
            cancel,
        };
        Ok(Self { shared: Arc::new(shared) })
    }

    /// Start the run by submitting iteration 1. Returns without waiting for
    /// any device work.
    ///
    /// Fails if the pipeline was already started or if any step of the first
    /// submission fails; in the latter case the run is over and `wait()`
    /// returns the same error.
    pub fn enqueue(&self) -> Result<(), PipelineError> {
        {
            let mut control = self.shared.lock();
            if control.state != PipelineState::Idle {
                return Err(PipelineError::AlreadyStarted);
            }
            control.state = PipelineState::Submitting;
            control.started_at = Some(Instant::now());
        }
        info!(
            runtime = self.shared.runtime.name(),
            dimension = self.shared.config.dimension,
            iterations = self.shared.config.iterations,
            "pipeline run started"
        );
        match self.shared.submit(1) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Block until the run is done.
    ///
    /// Returns the report of a completed or cancelled run, or the error that
    /// ended it. May be called repeatedly; later calls return the same result
    /// immediately.
    pub fn wait(&self) -> Result<RunReport, PipelineError> {
        let mut control = self.shared.lock();
        if control.state == PipelineState::Idle {
            return Err(PipelineError::NotStarted);
        }
        while control.state != PipelineState::Done {
            control = match self.shared.done.wait(control) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        self.shared.report(&control)
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. Returns `None` if
    /// the run is still going.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<RunReport, PipelineError>> {
        let deadline = Instant::now() + timeout;
        let mut control = self.shared.lock();
        if control.state == PipelineState::Idle {
            return Some(Err(PipelineError::NotStarted));
        }
        while control.state != PipelineState::Done {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            control = match self.shared.done.wait_timeout(control, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        Some(self.shared.report(&control))
    }

    pub fn state(&self) -> PipelineState {
        self.shared.lock().state
    }

    /// Iterations completed so far.
    pub fn iterations(&self) -> usize {
        self.shared.lock().completed
    }

    pub fn config(&self) -> PipelineConfig {
        self.shared.config
    }

    /// The product read back by the most recent completed iteration.
    pub fn result(&self) -> Vec<f32> {
        self.shared.out.snapshot()
    }
}

impl<R: DeviceRuntime> fmt::Debug for CommandPipeline<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPipeline")
            .field("runtime", &self.shared.runtime.name())
            .field("config", &self.shared.config)
            .field("state", &self.state())
            .finish()
    }
}

impl<R: DeviceRuntime> Shared<R> {
    fn lock(&self) -> MutexGuard<'_, Control<R>> {
        match self.control.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Sequential fill of both input mirrors.
    fn fill_inputs(&self) {
        for host in [&self.lhs, &self.rhs] {
            for (i, value) in host.lock().iter_mut().enumerate() {
                *value = i as f32;
            }
        }
    }

    /// Submit iteration `index`. Must be called in the `Submitting` state with
    /// no iteration in flight. Never holds the control lock while calling into
    /// the runtime.
    fn submit(self: &Arc<Self>, index: usize) -> Result<(), PipelineError> {
        let rt = &*self.runtime;
        let DeviceHandles { context, queue, kernel } = &self.handles;
        let dim = self.config.dimension;
        let bytes = self.config.buffer_bytes();
        let submitted_at = Instant::now();

        self.fill_inputs();

        let lhs = rt.create_buffer(context, MemAccess::ReadOnly, bytes)?;
        let rhs = rt.create_buffer(context, MemAccess::ReadOnly, bytes)?;
        let out = rt.create_buffer(context, MemAccess::WriteOnly, bytes)?;

        let write_lhs = rt.enqueue_write_buffer(queue, lhs.raw(), &self.lhs, &[])?;
        let write_rhs = rt.enqueue_write_buffer(queue, rhs.raw(), &self.rhs, &[])?;
        let join = rt.enqueue_marker(queue, &[write_lhs.raw(), write_rhs.raw()])?;

        rt.set_kernel_arg(kernel, ARG_LHS, lhs.raw())?;
        rt.set_kernel_arg(kernel, ARG_RHS, rhs.raw())?;
        rt.set_kernel_arg(kernel, ARG_OUT, out.raw())?;

        let exec = rt.enqueue_kernel(queue, kernel, &[dim, dim], &[join.raw()])?;
        let read = rt.enqueue_read_buffer(queue, out.raw(), &self.out, &[exec.raw()])?;
        let read_event = read.raw();

        let submit_seq = self.seq.fetch_add(1, Ordering::AcqRel);
        {
            let mut control = self.lock();
            control.in_flight = Some(InFlight {
                index,
                submit_seq,
                submitted_at,
                _writes: [write_lhs, write_rhs],
                _join: join,
                _exec: exec,
                _read: read,
                _lhs: lhs,
                _rhs: rhs,
                _out: out,
            });
            control.state = PipelineState::InFlight;
        }
        debug!(iteration = index, submit_seq, "iteration submitted");

        let weak: Weak<Self> = Arc::downgrade(self);
        let registered = rt.set_completion_callback(
            read_event,
            Box::new(move |status| {
                if let Some(shared) = weak.upgrade() {
                    shared.advance(status);
                }
            }),
        );
        if let Err(e) = registered.and_then(|()| rt.flush(queue)) {
            // Resources of the unsubmitted iteration go with the error.
            let mut control = self.lock();
            if control.in_flight.as_ref().is_some_and(|f| f.submit_seq == submit_seq) {
                control.in_flight.take();
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// React to completion of the in-flight iteration: release its resources,
    /// count it, then finish or resubmit. Runs on the runtime's callback
    /// thread.
    fn advance(self: &Arc<Self>, status: CompletionStatus) {
        let complete_seq = self.seq.fetch_add(1, Ordering::AcqRel);
        let next = {
            let mut control = self.lock();
            if control.state != PipelineState::InFlight {
                debug!(state = ?control.state, "ignoring completion outside an in-flight iteration");
                return;
            }
            let Some(flight) = control.in_flight.take() else {
                return;
            };
            let index = flight.index;
            let latency = flight.submitted_at.elapsed();
            let submit_seq = flight.submit_seq;
            drop(flight);
            control.completed += 1;

            if let CompletionStatus::Error(code) = status {
                let source = DeviceError::new("completion", code, self.runtime.error_text(code));
                drop(control);
                self.fail(PipelineError::CompletionFailed { iteration: index, source });
                return;
            }

            control.records.push(IterationRecord {
                index,
                submit_seq,
                complete_seq,
                latency_us: micros(latency),
            });
            debug!(iteration = index, complete_seq, latency_us = micros(latency), "iteration complete");

            if control.completed >= self.config.iterations {
                self.finish(&mut control, Ok(RunOutcome::Completed));
                return;
            }
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                info!(completed = control.completed, "pipeline cancelled");
                self.finish(&mut control, Ok(RunOutcome::Cancelled));
                return;
            }
            control.state = PipelineState::Submitting;
            control.completed + 1
        };

        if let Err(e) = self.submit(next) {
            self.fail(e);
        }
    }

    fn finish(&self, control: &mut Control<R>, outcome: Result<RunOutcome, PipelineError>) {
        control.state = PipelineState::Done;
        control.finished_at = Some(Instant::now());
        control.outcome = Some(outcome);
        info!(completed = control.completed, "pipeline run finished");
        self.done.notify_all();
    }

    /// End the run with `err` and wake the waiter. No further iteration is
    /// submitted.
    fn fail(&self, err: PipelineError) {
        match err.device_error() {
            Some(dev) => error!(call = dev.call, code = dev.code, description = %dev.description, "{err}"),
            None => error!("{err}"),
        }
        let mut control = self.lock();
        control.in_flight.take();
        self.finish(&mut control, Err(err));
    }

    fn report(&self, control: &Control<R>) -> Result<RunReport, PipelineError> {
        let outcome = match &control.outcome {
            Some(Ok(outcome)) => *outcome,
            Some(Err(e)) => return Err(e.clone()),
            None => return Err(PipelineError::NotStarted),
        };
        let total = match (control.started_at, control.finished_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            _ => Duration::ZERO,
        };
        Ok(RunReport {
            runtime: self.runtime.name().to_string(),
            dimension: self.config.dimension,
            max_iterations: self.config.iterations,
            completed_iterations: control.completed,
            outcome,
            total_us: micros(total),
            iterations: control.records.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_zero_dimension() {
        let err = PipelineConfig::new(0, 3).validate().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)), "got {err:?}");
    }

    #[test]
    fn config_rejects_zero_iterations() {
        assert!(PipelineConfig::new(4, 0).validate().is_err());
    }

    #[test]
    fn config_rejects_overflowing_dimension() {
        assert!(PipelineConfig::new(usize::MAX, 1).validate().is_err());
    }

    #[test]
    fn config_buffer_bytes() {
        let cfg = PipelineConfig::new(4, 3);
        assert_eq!(cfg.cells(), 16);
        assert_eq!(cfg.buffer_bytes(), 64);
    }

    #[test]
    fn cancel_token_clones_share_flag() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }
}
