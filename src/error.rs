//! Unified error handling for StepForge
//!
//! Two levels of status travel through the runtime:
//!
//! - [`StepForgeError`] is the public error type. It covers caller mistakes
//!   (bad arguments, lifecycle violations) as well as execution outcomes
//!   that surface to the client.
//! - [`ExecStatus`] is the wire-level result code spoken by the plan driver
//!   and the backend contract. Backends report it alongside output shapes
//!   and timing; the two must be observable independently so that contract
//!   violations (e.g. shapes reported with a failure status) can be
//!   detected and promoted to [`ExecStatus::GeneralFailure`].

use std::fmt;

/// Unified error type for StepForge
///
/// This enum consolidates the runtime's error taxonomy into a single type.
/// It supports categorization via the `category()` method.
#[derive(Debug, thiserror::Error)]
pub enum StepForgeError {
    /// Caller supplied invalid arguments; never retried
    #[error("invalid argument: {0}")]
    BadData(String),

    /// Operation not permitted in the current lifecycle state; never retried
    #[error("operation not permitted in current state: {0}")]
    BadState(String),

    /// An output or dynamic-temporary buffer was too small
    #[error("output buffer or dynamic temporary of insufficient size")]
    InsufficientSize,

    /// Deadline exceeded; the condition may clear on a later execution
    #[error("execution missed its deadline (transient)")]
    MissedDeadlineTransient,

    /// Deadline exceeded; the condition is not expected to clear
    #[error("execution missed its deadline (persistent)")]
    MissedDeadlinePersistent,

    /// A backend failed to execute a step
    #[error("backend operation failed: {0}")]
    OpFailed(String),

    /// Unspecified failure inside the runtime or a backend
    #[error("general failure: {0}")]
    GeneralFailure(String),

    /// A backend violated its contract (e.g. an illegal shape vector)
    #[error("backend contract violation: {0}")]
    Unmappable(String),
}

/// Result type alias for runtime operations
pub type ForgeResult<T> = std::result::Result<T, StepForgeError>;

impl StepForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            StepForgeError::BadData(_) => ErrorCategory::Argument,
            StepForgeError::BadState(_) => ErrorCategory::Lifecycle,
            StepForgeError::InsufficientSize => ErrorCategory::Recoverable,
            StepForgeError::MissedDeadlineTransient
            | StepForgeError::MissedDeadlinePersistent => ErrorCategory::Deadline,
            StepForgeError::OpFailed(_) | StepForgeError::GeneralFailure(_) => {
                ErrorCategory::Backend
            }
            StepForgeError::Unmappable(_) => ErrorCategory::Internal,
        }
    }

    /// True for both deadline-miss variants
    ///
    /// Deadline misses bypass CPU fallback: retrying on another backend
    /// cannot beat an already-expired deadline.
    pub fn is_missed_deadline(&self) -> bool {
        matches!(
            self,
            StepForgeError::MissedDeadlineTransient | StepForgeError::MissedDeadlinePersistent
        )
    }

    /// True if the runtime may recover from this error by retrying the
    /// failing step (after growing buffers) or re-running it on the CPU
    /// backend.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Recoverable | ErrorCategory::Backend
        )
    }

    /// The wire-level status this error maps to when it is reported through
    /// an execution completion channel.
    ///
    /// Argument and lifecycle errors have no code of their own on the wire;
    /// they collapse to `GeneralFailure`, as do contract violations.
    pub fn exec_status(&self) -> ExecStatus {
        match self {
            StepForgeError::InsufficientSize => ExecStatus::InsufficientSize,
            StepForgeError::MissedDeadlineTransient => ExecStatus::MissedDeadlineTransient,
            StepForgeError::MissedDeadlinePersistent => ExecStatus::MissedDeadlinePersistent,
            StepForgeError::OpFailed(_) => ExecStatus::OpFailed,
            StepForgeError::BadData(_)
            | StepForgeError::BadState(_)
            | StepForgeError::GeneralFailure(_)
            | StepForgeError::Unmappable(_) => ExecStatus::GeneralFailure,
        }
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid caller-supplied arguments
    Argument,
    /// Operation attempted in the wrong lifecycle state
    Lifecycle,
    /// Temporary condition, recoverable by growing buffers and retrying
    Recoverable,
    /// Deadline miss; terminal for the execution
    Deadline,
    /// Backend failure; recoverable through CPU fallback when allowed
    Backend,
    /// Contract violation or bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Argument => write!(f, "Argument"),
            ErrorCategory::Lifecycle => write!(f, "Lifecycle"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Deadline => write!(f, "Deadline"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

/// Wire-level execution result code
///
/// This is the status reported by backends and the plan driver for a single
/// step or a whole execution. It deliberately travels in tuple position next
/// to output shapes and timing rather than inside a `Result`: the backend
/// output-shape contract is validated by inspecting status and shapes
/// together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Step or execution completed successfully
    Ok,
    /// At least one output buffer or dynamic temporary was too small
    InsufficientSize,
    /// Deadline exceeded, condition may clear later
    MissedDeadlineTransient,
    /// Deadline exceeded, condition is persistent
    MissedDeadlinePersistent,
    /// The backend failed to execute the step
    OpFailed,
    /// Unspecified failure
    GeneralFailure,
}

impl ExecStatus {
    pub fn is_ok(self) -> bool {
        self == ExecStatus::Ok
    }

    pub fn is_missed_deadline(self) -> bool {
        matches!(
            self,
            ExecStatus::MissedDeadlineTransient | ExecStatus::MissedDeadlinePersistent
        )
    }

    /// The completion kind recorded when an execution finishes with this
    /// status.
    pub fn completion(self) -> Completion {
        match self {
            ExecStatus::Ok => Completion::NoError,
            ExecStatus::InsufficientSize => Completion::InsufficientOutput,
            _ => Completion::OtherError,
        }
    }

    /// Convert a final status into the public result the compute APIs
    /// return.
    pub fn into_result(self) -> ForgeResult<()> {
        match self {
            ExecStatus::Ok => Ok(()),
            ExecStatus::InsufficientSize => Err(StepForgeError::InsufficientSize),
            ExecStatus::MissedDeadlineTransient => Err(StepForgeError::MissedDeadlineTransient),
            ExecStatus::MissedDeadlinePersistent => {
                Err(StepForgeError::MissedDeadlinePersistent)
            }
            ExecStatus::OpFailed => Err(StepForgeError::OpFailed("step execution failed".into())),
            ExecStatus::GeneralFailure => {
                Err(StepForgeError::GeneralFailure("execution failed".into()))
            }
        }
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecStatus::Ok => "NO_ERROR",
            ExecStatus::InsufficientSize => "OUTPUT_INSUFFICIENT_SIZE",
            ExecStatus::MissedDeadlineTransient => "MISSED_DEADLINE_TRANSIENT",
            ExecStatus::MissedDeadlinePersistent => "MISSED_DEADLINE_PERSISTENT",
            ExecStatus::OpFailed => "OP_FAILED",
            ExecStatus::GeneralFailure => "GENERAL_FAILURE",
        };
        write!(f, "{}", s)
    }
}

/// How a non-fenced execution completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Finished successfully
    NoError,
    /// Finished, but at least one main output buffer was too small
    InsufficientOutput,
    /// Finished with any other error
    OtherError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            StepForgeError::BadData("x".to_string()).category(),
            ErrorCategory::Argument
        );
        assert_eq!(
            StepForgeError::BadState("x".to_string()).category(),
            ErrorCategory::Lifecycle
        );
        assert_eq!(
            StepForgeError::InsufficientSize.category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            StepForgeError::MissedDeadlineTransient.category(),
            ErrorCategory::Deadline
        );
        assert_eq!(
            StepForgeError::OpFailed("x".to_string()).category(),
            ErrorCategory::Backend
        );
        assert_eq!(
            StepForgeError::Unmappable("x".to_string()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(StepForgeError::InsufficientSize.is_recoverable());
        assert!(StepForgeError::OpFailed("x".to_string()).is_recoverable());
        assert!(!StepForgeError::BadData("x".to_string()).is_recoverable());
        assert!(!StepForgeError::MissedDeadlinePersistent.is_recoverable());
    }

    #[test]
    fn test_missed_deadline_bypasses_fallback() {
        assert!(StepForgeError::MissedDeadlineTransient.is_missed_deadline());
        assert!(StepForgeError::MissedDeadlinePersistent.is_missed_deadline());
        assert!(!StepForgeError::OpFailed("x".to_string()).is_missed_deadline());
        assert!(ExecStatus::MissedDeadlineTransient.is_missed_deadline());
        assert!(!ExecStatus::OpFailed.is_missed_deadline());
    }

    #[test]
    fn test_status_completion_mapping() {
        assert_eq!(ExecStatus::Ok.completion(), Completion::NoError);
        assert_eq!(
            ExecStatus::InsufficientSize.completion(),
            Completion::InsufficientOutput
        );
        assert_eq!(ExecStatus::OpFailed.completion(), Completion::OtherError);
        assert_eq!(
            ExecStatus::MissedDeadlinePersistent.completion(),
            Completion::OtherError
        );
    }

    #[test]
    fn test_status_into_result() {
        assert!(ExecStatus::Ok.into_result().is_ok());
        assert!(matches!(
            ExecStatus::InsufficientSize.into_result(),
            Err(StepForgeError::InsufficientSize)
        ));
        assert!(matches!(
            ExecStatus::MissedDeadlinePersistent.into_result(),
            Err(StepForgeError::MissedDeadlinePersistent)
        ));
    }

    #[test]
    fn test_exec_status_collapse() {
        assert_eq!(
            StepForgeError::BadData("x".to_string()).exec_status(),
            ExecStatus::GeneralFailure
        );
        assert_eq!(
            StepForgeError::Unmappable("x".to_string()).exec_status(),
            ExecStatus::GeneralFailure
        );
        assert_eq!(
            StepForgeError::InsufficientSize.exec_status(),
            ExecStatus::InsufficientSize
        );
    }

    #[test]
    fn test_exec_status_display() {
        assert_eq!(ExecStatus::Ok.to_string(), "NO_ERROR");
        assert_eq!(
            ExecStatus::InsufficientSize.to_string(),
            "OUTPUT_INSUFFICIENT_SIZE"
        );
        assert_eq!(
            StepForgeError::BadData("bad index".to_string()).to_string(),
            "invalid argument: bad index"
        );
    }
}
