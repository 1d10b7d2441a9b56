//! Completion events for simulated commands.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::runtime::{CompletionCallback, CompletionStatus};

use super::device::{Counters, DeviceState};

struct EventInner {
    status: Option<CompletionStatus>,
    callbacks: Vec<CompletionCallback>,
}

/// Terminal status plus the callbacks waiting for it.
pub(crate) struct EventState {
    device: Arc<DeviceState>,
    inner: Mutex<EventInner>,
    finished: Condvar,
}

impl EventState {
    pub(crate) fn new(device: Arc<DeviceState>) -> Self {
        Self {
            device,
            inner: Mutex::new(EventInner { status: None, callbacks: Vec::new() }),
            finished: Condvar::new(),
        }
    }

    pub(crate) fn device(&self) -> &Arc<DeviceState> {
        &self.device
    }

    fn lock(&self) -> MutexGuard<'_, EventInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn status(&self) -> Option<CompletionStatus> {
        self.lock().status
    }

    /// Record the terminal status, wake waiters, then run callbacks in
    /// registration order on the calling thread.
    pub(crate) fn complete(&self, status: CompletionStatus) {
        let callbacks = {
            let mut inner = self.lock();
            if inner.status.is_some() {
                return;
            }
            inner.status = Some(status);
            std::mem::take(&mut inner.callbacks)
        };
        self.finished.notify_all();
        for callback in callbacks {
            Counters::bump(&self.device.counters.callbacks_fired);
            callback(status);
        }
    }

    /// Register `callback`. Fires immediately on this thread if the event has
    /// already finished.
    pub(crate) fn on_complete(&self, callback: CompletionCallback) {
        let status = {
            let mut inner = self.lock();
            match inner.status {
                Some(status) => status,
                None => {
                    inner.callbacks.push(callback);
                    return;
                }
            }
        };
        Counters::bump(&self.device.counters.callbacks_fired);
        callback(status);
    }

    /// Block until the event finishes.
    pub(crate) fn wait(&self) -> CompletionStatus {
        let mut inner = self.lock();
        loop {
            if let Some(status) = inner.status {
                return status;
            }
            inner = match self.finished.wait(inner) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

impl std::fmt::Debug for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventState").field("status", &self.status()).finish()
    }
}
