//! Status codes reported by the simulated runtime.
//!
//! Values match the OpenCL status codes of the same name so logs read the same
//! for both backends.

use crate::error::StatusCode;

pub const SUCCESS: StatusCode = 0;
pub const MEM_OBJECT_ALLOCATION_FAILURE: StatusCode = -4;
pub const OUT_OF_RESOURCES: StatusCode = -5;
pub const OUT_OF_HOST_MEMORY: StatusCode = -6;
pub const EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST: StatusCode = -14;
pub const INVALID_VALUE: StatusCode = -30;
pub const INVALID_CONTEXT: StatusCode = -34;
pub const INVALID_COMMAND_QUEUE: StatusCode = -36;
pub const INVALID_MEM_OBJECT: StatusCode = -38;
pub const INVALID_KERNEL_NAME: StatusCode = -46;
pub const INVALID_KERNEL: StatusCode = -48;
pub const INVALID_ARG_INDEX: StatusCode = -49;
pub const INVALID_KERNEL_ARGS: StatusCode = -52;
pub const INVALID_WORK_DIMENSION: StatusCode = -53;
pub const INVALID_EVENT_WAIT_LIST: StatusCode = -57;
pub const INVALID_EVENT: StatusCode = -58;
pub const INVALID_BUFFER_SIZE: StatusCode = -61;
pub const INVALID_GLOBAL_WORK_SIZE: StatusCode = -63;

/// Symbolic name of a status code.
pub fn error_text(code: StatusCode) -> &'static str {
    match code {
        SUCCESS => "SUCCESS",
        MEM_OBJECT_ALLOCATION_FAILURE => "MEM_OBJECT_ALLOCATION_FAILURE",
        OUT_OF_RESOURCES => "OUT_OF_RESOURCES",
        OUT_OF_HOST_MEMORY => "OUT_OF_HOST_MEMORY",
        EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST => "EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST",
        INVALID_VALUE => "INVALID_VALUE",
        INVALID_CONTEXT => "INVALID_CONTEXT",
        INVALID_COMMAND_QUEUE => "INVALID_COMMAND_QUEUE",
        INVALID_MEM_OBJECT => "INVALID_MEM_OBJECT",
        INVALID_KERNEL_NAME => "INVALID_KERNEL_NAME",
        INVALID_KERNEL => "INVALID_KERNEL",
        INVALID_ARG_INDEX => "INVALID_ARG_INDEX",
        INVALID_KERNEL_ARGS => "INVALID_KERNEL_ARGS",
        INVALID_WORK_DIMENSION => "INVALID_WORK_DIMENSION",
        INVALID_EVENT_WAIT_LIST => "INVALID_EVENT_WAIT_LIST",
        INVALID_EVENT => "INVALID_EVENT",
        INVALID_BUFFER_SIZE => "INVALID_BUFFER_SIZE",
        INVALID_GLOBAL_WORK_SIZE => "INVALID_GLOBAL_WORK_SIZE",
        _ => "UNKNOWN_ERROR",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_have_names() {
        assert_eq!(error_text(INVALID_MEM_OBJECT), "INVALID_MEM_OBJECT");
        assert_eq!(error_text(MEM_OBJECT_ALLOCATION_FAILURE), "MEM_OBJECT_ALLOCATION_FAILURE");
    }

    #[test]
    fn unknown_code_is_labelled() {
        assert_eq!(error_text(-9999), "UNKNOWN_ERROR");
    }
}
