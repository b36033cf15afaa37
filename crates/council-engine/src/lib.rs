//! Council Engine Library
//!
//! Execution core of Council:
//! - Subprocess runner with bounded output, timeouts and cooperative cancellation
//! - In-process HTTP providers for API-only agents
//! - Pipeline state machine with anti-injection data blocks and a feedback loop

pub mod error;
pub mod pipeline;
pub mod subprocess;

pub use error::ExecError;
pub use pipeline::{
    AuditSink, FeedbackProvider, HistorySink, NoFeedback, PipelineEngine, PipelineUi, RunReport,
    RunStatus, SinkError,
};
pub use subprocess::{ExecRequest, ProcessRunner, ProviderRegistry, StepExecutor};
