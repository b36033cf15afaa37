//! Typed failures raised while executing a step or a run.

use std::time::Duration;

use thiserror::Error;

/// Errors from step execution and pipeline runs.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Invalid timeout, limit, step list or command syntax.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Payload above the input cap; nothing was spawned.
    #[error("Input above the configured limit ({actual} > {limit} characters)")]
    InputTooLarge { actual: usize, limit: usize },

    #[error("Command '{command}' timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("Command '{command}' failed (exit code {code}): {stderr}")]
    NonZeroExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Cancellation requested by the user or the feedback loop.
    #[error("Execution aborted")]
    Aborted,

    #[error("Step '{step}' references undefined variable '{variable}' in input_template")]
    MissingVariable { step: String, variable: String },

    /// An `is_code` step produced something other than one fenced code block.
    #[error("Step '{step}' output rejected: {reason}")]
    InsecureCodeBlock { step: String, reason: String },

    #[error("System error: {0}")]
    SystemError(String),
}

impl ExecError {
    /// Process exit code a caller should use for this failure.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfiguration(_) | Self::MissingVariable { .. } => 2,
            Self::InputTooLarge { .. } => 3,
            Self::Timeout { .. } => 4,
            Self::NonZeroExit { .. } => 5,
            Self::InsecureCodeBlock { .. } => 6,
            Self::SystemError(_) => 70,
            Self::Aborted => 130,
        }
    }

    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

impl From<council_core::Error> for ExecError {
    fn from(err: council_core::Error) -> Self {
        match err {
            council_core::Error::Config(msg) | council_core::Error::Limit(msg) => {
                Self::InvalidConfiguration(msg)
            }
            other => Self::SystemError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        Self::SystemError(err.to_string())
    }
}
