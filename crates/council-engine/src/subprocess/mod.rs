//! Step execution: one agent command in, one captured response out.

pub mod cancel;
pub mod capture;
pub mod command;
pub mod provider;
pub mod runner;


use std::future::Future;
use std::time::Duration;

use crate::error::ExecError;

pub use capture::OUTPUT_TRUNCATION_NOTICE;
pub use provider::{DeepSeekProvider, HttpProvider, ProviderRegistry};
pub use runner::{ProcessRunner, Spawner, TokioSpawner};

/// Live progress callback, called once per output line without its newline.
/// A line longer than the runner's read chunk arrives in several calls.
pub type LineCallback<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// One invocation of a step command.
#[derive(Debug, Clone, Copy)]
pub struct ExecRequest<'a> {
    pub command: &'a str,
    pub input: &'a str,
    pub timeout: Duration,
    /// Overrides the runner's process-wide cap when set.
    pub max_input_chars: Option<usize>,
    /// Overrides the runner's process-wide cap when set.
    pub max_output_chars: Option<usize>,
}

impl<'a> ExecRequest<'a> {
    pub const fn new(command: &'a str, input: &'a str, timeout: Duration) -> Self {
        Self {
            command,
            input,
            timeout,
            max_input_chars: None,
            max_output_chars: None,
        }
    }

    #[must_use]
    pub const fn with_caps(mut self, max_input: Option<usize>, max_output: Option<usize>) -> Self {
        self.max_input_chars = max_input;
        self.max_output_chars = max_output;
        self
    }
}

/// What the pipeline needs from a step executor.
pub trait StepExecutor: Send + Sync {
    fn execute(
        &self,
        request: ExecRequest<'_>,
        on_line: LineCallback<'_>,
    ) -> impl Future<Output = Result<String, ExecError>> + Send;

    /// Cancellation has been requested and not yet consumed.
    fn cancel_requested(&self) -> bool;

    /// Forget a pending cancellation request.
    fn clear_cancel(&self) {}
}
