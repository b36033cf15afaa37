//! Multi-step agent pipeline.

pub mod code_block;
pub mod collaborators;
pub mod engine;
pub mod outcome;
pub mod sentinel;

pub use collaborators::{
    AuditSink, FeedbackProvider, HistorySink, NoFeedback, PipelineUi, SinkError,
};
pub use engine::PipelineEngine;
pub use outcome::{RunOutcome, RunReport, RunStart, RunStatus, StepOutcome, StepStatus};
pub use sentinel::{FEEDBACK_ABORT_SENTINEL, strip_data_blocks, unwrap_data_block, wrap_data_block};
