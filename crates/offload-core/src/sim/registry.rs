//! Process-global table of simulated device objects.
//!
//! Identifiers are handed out from a single counter and never reused, so a
//! stale identifier is always detected instead of aliasing a newer object.
//! `0` is the null identifier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tracing::trace;

use super::device::DeviceState;
use super::event::EventState;
use super::queue::QueueState;
use super::status;
use crate::error::DeviceError;
use crate::handle::NativeResource;
use crate::runtime::MemAccess;

/// Identifier of a simulated object.
pub type SimId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectKind {
    Context,
    Queue,
    Kernel,
    Mem,
    Event,
}

impl ObjectKind {
    fn invalid_code(self) -> i32 {
        match self {
            Self::Context => status::INVALID_CONTEXT,
            Self::Queue => status::INVALID_COMMAND_QUEUE,
            Self::Kernel => status::INVALID_KERNEL,
            Self::Mem => status::INVALID_MEM_OBJECT,
            Self::Event => status::INVALID_EVENT,
        }
    }
}

/// Device memory backing a simulated buffer.
#[derive(Debug)]
pub(crate) struct MemState {
    pub(crate) device: Arc<DeviceState>,
    pub(crate) bytes: usize,
    pub(crate) access: MemAccess,
    pub(crate) data: Mutex<Vec<f32>>,
}

impl MemState {
    pub(crate) fn data(&self) -> MutexGuard<'_, Vec<f32>> {
        match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A kernel and its currently bound buffer arguments (`0` = unbound).
#[derive(Debug)]
pub(crate) struct KernelState {
    pub(crate) device: Arc<DeviceState>,
    pub(crate) name: &'static str,
    pub(crate) args: Mutex<Vec<SimId>>,
}

#[derive(Clone)]
pub(crate) enum SimObject {
    Context(Arc<DeviceState>),
    Queue(Arc<QueueState>),
    Kernel(Arc<KernelState>),
    Mem(Arc<MemState>),
    Event(Arc<EventState>),
}

impl SimObject {
    fn kind(&self) -> ObjectKind {
        match self {
            Self::Context(_) => ObjectKind::Context,
            Self::Queue(_) => ObjectKind::Queue,
            Self::Kernel(_) => ObjectKind::Kernel,
            Self::Mem(_) => ObjectKind::Mem,
            Self::Event(_) => ObjectKind::Event,
        }
    }

    /// Side effects of the last reference going away.
    fn destroyed(self) {
        match self {
            Self::Mem(mem) => mem.device.counters.buffer_destroyed(),
            Self::Event(event) => event.device().counters.event_destroyed(),
            Self::Queue(queue) => queue.shutdown(),
            Self::Context(_) | Self::Kernel(_) => {}
        }
    }
}

struct Entry {
    refs: u32,
    object: SimObject,
}

struct Table {
    next_id: SimId,
    entries: HashMap<SimId, Entry>,
}

fn table() -> MutexGuard<'static, Table> {
    static TABLE: OnceLock<Mutex<Table>> = OnceLock::new();
    let table = TABLE.get_or_init(|| Mutex::new(Table { next_id: 1, entries: HashMap::new() }));
    match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Register `object` with one reference and return its identifier.
pub(crate) fn insert(object: SimObject) -> SimId {
    let mut table = table();
    let id = table.next_id;
    table.next_id += 1;
    table.entries.insert(id, Entry { refs: 1, object });
    id
}

/// Look up a live object of the expected kind.
pub(crate) fn lookup(id: SimId, kind: ObjectKind, call: &'static str) -> Result<SimObject, DeviceError> {
    let table = table();
    match table.entries.get(&id) {
        Some(entry) if entry.object.kind() == kind => Ok(entry.object.clone()),
        _ => Err(invalid(kind, call)),
    }
}

fn retain(id: SimId, kind: ObjectKind, call: &'static str) -> Result<(), DeviceError> {
    let mut table = table();
    match table.entries.get_mut(&id) {
        Some(entry) if entry.object.kind() == kind => {
            entry.refs += 1;
            trace!(id, ?kind, refs = entry.refs, "retain");
            Ok(())
        }
        _ => Err(invalid(kind, call)),
    }
}

fn release(id: SimId, kind: ObjectKind, call: &'static str) -> Result<(), DeviceError> {
    let destroyed = {
        let mut table = table();
        let entry = match table.entries.get_mut(&id) {
            Some(entry) if entry.object.kind() == kind => entry,
            _ => return Err(invalid(kind, call)),
        };
        entry.refs -= 1;
        trace!(id, ?kind, refs = entry.refs, "release");
        if entry.refs == 0 {
            table.entries.remove(&id).map(|entry| entry.object)
        } else {
            None
        }
    };
    // Destruction side effects run outside the table lock.
    if let Some(object) = destroyed {
        object.destroyed();
    }
    Ok(())
}

fn invalid(kind: ObjectKind, call: &'static str) -> DeviceError {
    let code = kind.invalid_code();
    DeviceError::new(call, code, status::error_text(code))
}

/// Current reference count of `id`, or `None` once it has been destroyed.
pub fn ref_count(id: SimId) -> Option<u32> {
    table().entries.get(&id).map(|entry| entry.refs)
}

macro_rules! sim_resource {
    ($(#[$meta:meta])* $name:ident, $kind:expr, $label:literal, $retain:literal, $release:literal) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub enum $name {}

        impl NativeResource for $name {
            type Raw = SimId;
            const NULL: SimId = 0;
            const KIND: &'static str = $label;

            fn retain(raw: SimId) -> Result<(), DeviceError> {
                retain(raw, $kind, $retain)
            }

            fn release(raw: SimId) -> Result<(), DeviceError> {
                release(raw, $kind, $release)
            }
        }
    };
}

sim_resource!(
    /// Simulated device context.
    SimContext, ObjectKind::Context, "context", "clRetainContext", "clReleaseContext"
);
sim_resource!(
    /// Simulated in-order command queue.
    SimQueue, ObjectKind::Queue, "command_queue", "clRetainCommandQueue", "clReleaseCommandQueue"
);
sim_resource!(
    /// Simulated compiled kernel.
    SimKernel, ObjectKind::Kernel, "kernel", "clRetainKernel", "clReleaseKernel"
);
sim_resource!(
    /// Simulated device buffer.
    SimMem, ObjectKind::Mem, "mem", "clRetainMemObject", "clReleaseMemObject"
);
sim_resource!(
    /// Simulated completion event.
    SimEvent, ObjectKind::Event, "event", "clRetainEvent", "clReleaseEvent"
);
