//! Interfaces the engine drives: presentation, interactive feedback, and
//! best-effort persistence.

use council_core::Step;
use thiserror::Error;

use super::outcome::{RunOutcome, RunStart, StepOutcome};
use super::sentinel::FEEDBACK_ABORT_SENTINEL;

/// Presentation of a run. Called from the engine's task; `on_output_line`
/// may also be called from the runner while a step streams.
pub trait PipelineUi: Send + Sync {
    fn on_output_line(&self, step_key: &str, line: &str);

    /// `attempt` starts at 1 and grows with each feedback revision.
    fn show_step_start(&self, _step: &Step, _attempt: usize) {}

    fn show_panel(&self, title: &str, content: &str, style: &str, is_code: bool);

    fn show_error(&self, message: &str);

    fn show_success(&self, message: &str);
}

/// Pause point after each step.
///
/// `None` or blank text continues, [`FEEDBACK_ABORT_SENTINEL`] aborts the
/// run, anything else re-runs the step with that text as feedback.
pub trait FeedbackProvider: Send + Sync {
    fn request_step_feedback(&self, agent_name: &str, role_desc: &str, output: &str)
    -> Option<String>;
}

/// Used when the run is not interactive.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFeedback;

impl FeedbackProvider for NoFeedback {
    fn request_step_feedback(&self, _: &str, _: &str, _: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Feedback {
    Continue,
    Revise(String),
    Abort,
}

impl Feedback {
    pub(crate) fn classify(reply: Option<String>) -> Self {
        match reply {
            None => Self::Continue,
            Some(text) if text.trim().is_empty() => Self::Continue,
            Some(text) if text.trim() == FEEDBACK_ABORT_SENTINEL => Self::Abort,
            Some(text) => Self::Revise(text),
        }
    }
}

/// A history or audit write failed.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        Self(err.to_string())
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// Run history persistence.
pub trait HistorySink: Send + Sync {
    fn start_run(&self, run: &RunStart) -> Result<(), SinkError>;
    fn record_step(&self, step: &StepOutcome) -> Result<(), SinkError>;
    fn finish_run(&self, run: &RunOutcome) -> Result<(), SinkError>;
}

/// Structured audit trail. `data` is a JSON object.
pub trait AuditSink: Send + Sync {
    fn log_event(&self, event: &str, data: &serde_json::Value) -> Result<(), SinkError>;
}
