//! Per-device configuration, fault injection and instrumentation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::runtime::{DeviceInfo, DeviceType};

/// Faults injected into a simulated device.
///
/// Ordinals are 1-based and count every attempt on the device, across all
/// queues and pipelines sharing it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimFaults {
    /// Fail the Nth buffer allocation with `MEM_OBJECT_ALLOCATION_FAILURE`.
    pub fail_allocation_at: Option<usize>,
    /// Complete the Nth executed read command with `OUT_OF_RESOURCES`.
    pub fail_read_at: Option<usize>,
    /// Sleep this long before executing each command.
    pub command_latency: Duration,
}

/// Configuration of a simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    pub device_name: String,
    pub compute_units: u32,
    pub faults: SimFaults,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            device_name: "Simulated Device".to_string(),
            compute_units: 1,
            faults: SimFaults::default(),
        }
    }
}

/// Snapshot of a simulated device's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Buffers currently holding at least one reference.
    pub live_buffers: usize,
    /// Highest value `live_buffers` has reached.
    pub peak_live_buffers: usize,
    /// Successful buffer allocations.
    pub buffers_created: usize,
    /// Allocation attempts, including injected failures.
    pub allocation_attempts: usize,
    /// Events currently holding at least one reference.
    pub live_events: usize,
    pub kernel_launches: usize,
    pub writes_executed: usize,
    pub reads_executed: usize,
    /// Completion callbacks invoked.
    pub callbacks_fired: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) live_buffers: AtomicUsize,
    pub(crate) peak_live_buffers: AtomicUsize,
    pub(crate) buffers_created: AtomicUsize,
    pub(crate) allocation_attempts: AtomicUsize,
    pub(crate) live_events: AtomicUsize,
    pub(crate) kernel_launches: AtomicUsize,
    pub(crate) writes_executed: AtomicUsize,
    pub(crate) reads_executed: AtomicUsize,
    pub(crate) callbacks_fired: AtomicUsize,
}

impl Counters {
    pub(crate) fn buffer_created(&self) {
        self.buffers_created.fetch_add(1, Ordering::Relaxed);
        let live = self.live_buffers.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_live_buffers.fetch_max(live, Ordering::AcqRel);
    }

    pub(crate) fn buffer_destroyed(&self) {
        self.live_buffers.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn event_created(&self) {
        self.live_events.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn event_destroyed(&self) {
        self.live_events.fetch_sub(1, Ordering::AcqRel);
    }

    /// Count an occurrence and return its 1-based ordinal.
    pub(crate) fn bump(counter: &AtomicUsize) -> usize {
        counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn snapshot(&self) -> SimStats {
        SimStats {
            live_buffers: self.live_buffers.load(Ordering::Acquire),
            peak_live_buffers: self.peak_live_buffers.load(Ordering::Acquire),
            buffers_created: self.buffers_created.load(Ordering::Acquire),
            allocation_attempts: self.allocation_attempts.load(Ordering::Acquire),
            live_events: self.live_events.load(Ordering::Acquire),
            kernel_launches: self.kernel_launches.load(Ordering::Acquire),
            writes_executed: self.writes_executed.load(Ordering::Acquire),
            reads_executed: self.reads_executed.load(Ordering::Acquire),
            callbacks_fired: self.callbacks_fired.load(Ordering::Acquire),
        }
    }
}

/// State shared by every object created on one simulated device.
#[derive(Debug)]
pub(crate) struct DeviceState {
    pub(crate) info: DeviceInfo,
    pub(crate) faults: SimFaults,
    pub(crate) counters: Counters,
}

impl DeviceState {
    pub(crate) fn new(config: SimConfig) -> Self {
        let info = DeviceInfo {
            name: config.device_name,
            vendor: "offload-bench".to_string(),
            device_type: DeviceType::Other,
            max_compute_units: config.compute_units,
            max_work_group_size: 1024,
            max_work_item_sizes: vec![1024, 1024, 1024],
            opencl_c_version: "OpenCL C 1.2 (simulated)".to_string(),
        };
        Self { info, faults: config.faults, counters: Counters::default() }
    }

    pub(crate) fn stats(&self) -> SimStats {
        self.counters.snapshot()
    }
}
