//! Error types for device runtime calls and the command pipeline.

use thiserror::Error;

/// Raw status code returned by a device runtime call. `0` means success.
pub type StatusCode = i32;

/// A device runtime call returned a non-success status.
///
/// Carries the name of the failing call and the runtime's own description of
/// the status code so the failure can be reported without further lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{call} failed: {description} ({code})")]
pub struct DeviceError {
    /// Name of the runtime entry point that failed (e.g. `clCreateBuffer`).
    pub call: &'static str,
    /// Raw status code.
    pub code: StatusCode,
    /// Runtime-provided description of `code`.
    pub description: String,
}

impl DeviceError {
    pub fn new(call: &'static str, code: StatusCode, description: impl Into<String>) -> Self {
        Self { call, code, description: description.into() }
    }
}

/// Errors produced by [`crate::pipeline::CommandPipeline`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("pipeline already started")]
    AlreadyStarted,

    #[error("pipeline has not been started; call enqueue() before wait()")]
    NotStarted,

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("iteration {iteration} completed with failure status: {source}")]
    CompletionFailed {
        iteration: usize,
        #[source]
        source: DeviceError,
    },
}

impl PipelineError {
    /// The underlying device failure, if this error came from the runtime.
    pub fn device_error(&self) -> Option<&DeviceError> {
        match self {
            Self::Device(e) | Self::CompletionFailed { source: e, .. } => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_display_names_call_and_code() {
        let err = DeviceError::new("clCreateBuffer", -4, "MEM_OBJECT_ALLOCATION_FAILURE");
        assert_eq!(err.to_string(), "clCreateBuffer failed: MEM_OBJECT_ALLOCATION_FAILURE (-4)");
    }

    #[test]
    fn pipeline_error_exposes_device_error() {
        let dev = DeviceError::new("clEnqueueReadBuffer", -5, "OUT_OF_RESOURCES");
        let err = PipelineError::CompletionFailed { iteration: 2, source: dev.clone() };
        assert_eq!(err.device_error(), Some(&dev));
        assert!(PipelineError::AlreadyStarted.device_error().is_none());
    }
}
