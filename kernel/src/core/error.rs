//! Kernel error type
//!
//! Every fallible kernel operation returns `Result<_, SimError>`. Queue
//! operations on a deleted queue are not errors: they report "gone" through
//! `None`/`false` so callers can treat it as a normal outcome.

use thiserror::Error;

/// Errors raised by the simulation kernel
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Illegal name: an object named '{name}' of kind {kind} already exists")]
    IllegalName { name: String, kind: String },

    #[error("Simulation is already running")]
    AlreadyRunning,

    #[error("Operation requires the calling thread to be a TaskThread")]
    NotTaskThread,

    #[error("Task canceled")]
    TaskCanceled,

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Task {task} failed: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: Box<SimError>,
    },
}

impl SimError {
    /// Shorthand for the negative-delay rejection used by every scheduling entry point
    pub(crate) fn negative_delay(delay: i64) -> Self {
        SimError::InvalidArgument(format!("delay must be non-negative, got {}", delay))
    }

    /// True for the error a canceled task observes at its suspension points
    pub fn is_canceled(&self) -> bool {
        matches!(self, SimError::TaskCanceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = SimError::IllegalName {
            name: "q".to_string(),
            kind: "FifoTaskQueue".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Illegal name: an object named 'q' of kind FifoTaskQueue already exists"
        );
        assert_eq!(
            SimError::negative_delay(-3).to_string(),
            "Invalid argument: delay must be non-negative, got -3"
        );
    }

    #[test]
    fn test_task_failed_wraps_source() {
        let err = SimError::TaskFailed {
            task: "task-1".to_string(),
            source: Box::new(SimError::IllegalState("boom".to_string())),
        };
        assert!(err.to_string().contains("boom"));
        assert!(!err.is_canceled());
        assert!(SimError::TaskCanceled.is_canceled());
    }
}
