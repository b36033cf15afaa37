//! Per-step and per-run results handed to history and audit sinks.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::error::ExecError;

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
    Aborted,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }

    pub(crate) fn from_result<T>(result: &Result<T, ExecError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(ExecError::Aborted) => Self::Aborted,
            Err(_) => Self::Error,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Error,
    Aborted,
    /// Disabled step; the previous output was carried forward.
    Skipped,
}

impl From<RunStatus> for StepStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Success => Self::Success,
            RunStatus::Error => Self::Error,
            RunStatus::Aborted => Self::Aborted,
        }
    }
}

/// Announced to sinks before the first step runs.
#[derive(Debug, Clone, Serialize)]
pub struct RunStart {
    pub run_id: String,
    pub flow_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_path: Option<String>,
    pub step_keys: Vec<String>,
    pub prompt_chars: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub run_id: String,
    pub step_key: String,
    pub agent_name: String,
    pub role_desc: String,
    pub command: String,
    pub status: StepStatus,
    pub duration_ms: u128,
    /// Executions of the step, including feedback revisions.
    pub attempts: usize,
    pub input_chars: usize,
    pub output_chars: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub duration_ms: u128,
    pub executed_steps: usize,
    pub successful_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What [`PipelineEngine::run`](super::PipelineEngine::run) returns.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub duration: Duration,
    pub executed_steps: usize,
    pub successful_steps: usize,
    /// Output of every completed (or carried-forward) step by key.
    pub outputs: HashMap<String, String>,
    /// Output of the last step that produced one.
    pub final_output: Option<String>,
    /// The failure that ended the run, if it did not succeed.
    pub error: Option<ExecError>,
}

impl RunReport {
    /// 0 on success, otherwise the failure's exit code.
    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(0, ExecError::exit_code)
    }
}
