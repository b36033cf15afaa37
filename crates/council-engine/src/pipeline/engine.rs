//! The pipeline state machine.
//!
//! Steps run strictly one after another. Each step sees the user prompt, the
//! transcript so far, the previous output and every earlier step's output,
//! all wrapped as data blocks; only its own instruction is passed verbatim.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use council_core::template::{self, TemplateError};
use council_core::{ContextStore, Limits, Step};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::code_block::extract_code_block;
use super::collaborators::{
    AuditSink, Feedback, FeedbackProvider, HistorySink, NoFeedback, PipelineUi, SinkError,
};
use super::outcome::{RunOutcome, RunReport, RunStart, RunStatus, StepOutcome, StepStatus};
use super::sentinel::{build_follow_up_input, wrap_data_block};
use crate::error::ExecError;
use crate::subprocess::{ExecRequest, StepExecutor};

const HUMAN_ACTOR: &str = "Human";

/// Runs a validated list of steps against a [`StepExecutor`].
pub struct PipelineEngine<E> {
    steps: Vec<Step>,
    executor: Arc<E>,
    ui: Arc<dyn PipelineUi>,
    feedback: Arc<dyn FeedbackProvider>,
    history: Option<Arc<dyn HistorySink>>,
    audit: Option<Arc<dyn AuditSink>>,
    limits: Limits,
    flow_source: String,
    flow_path: Option<PathBuf>,
}

/// Mutable state of one run.
#[derive(Debug, Default)]
struct RunState {
    outputs: HashMap<String, String>,
    last_output: String,
    final_output: Option<String>,
    executed: usize,
    successful: usize,
}

#[derive(Debug, Default)]
struct StepMetrics {
    attempts: usize,
    input_chars: usize,
    output_chars: usize,
}

/// A history or audit sink that switches itself off after its first failure.
struct SinkSlot<T: ?Sized> {
    name: &'static str,
    sink: Option<Arc<T>>,
}

impl<T: ?Sized> SinkSlot<T> {
    const fn new(name: &'static str, sink: Option<Arc<T>>) -> Self {
        Self { name, sink }
    }

    fn call(&mut self, op: impl FnOnce(&T) -> Result<(), SinkError>) {
        let Some(sink) = self.sink.as_deref() else {
            return;
        };
        if let Err(e) = op(sink) {
            warn!(
                sink = self.name,
                error = %e,
                "Sink write failed; disabled for the rest of this run"
            );
            self.sink = None;
        }
    }
}

fn audit_data(value: &impl Serialize) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

impl<E: StepExecutor> PipelineEngine<E> {
    /// Structural checks (non-empty, unique and non-reserved keys, positive
    /// limits) happen here; template references are resolved when each step
    /// renders its input.
    pub fn new(
        steps: Vec<Step>,
        executor: Arc<E>,
        ui: Arc<dyn PipelineUi>,
        limits: Limits,
    ) -> Result<Self, ExecError> {
        council_core::flow::validate_step_structure(&steps)?;
        if limits.max_context_chars == 0 {
            return Err(ExecError::InvalidConfiguration(
                "max_context_chars must be greater than zero".into(),
            ));
        }
        Ok(Self {
            steps,
            executor,
            ui,
            feedback: Arc::new(NoFeedback),
            history: None,
            audit: None,
            limits,
            flow_source: "default".to_string(),
            flow_path: None,
        })
    }

    #[must_use]
    pub fn with_feedback(mut self, feedback: Arc<dyn FeedbackProvider>) -> Self {
        self.feedback = feedback;
        self
    }

    #[must_use]
    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Where the flow came from, for history and audit records.
    #[must_use]
    pub fn with_flow_source(mut self, source: impl Into<String>, path: Option<PathBuf>) -> Self {
        self.flow_source = source.into();
        self.flow_path = path;
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub const fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    /// Execute every step for `user_prompt`.
    ///
    /// Never fails: the terminal status and the error that ended the run (if
    /// any) are part of the report. The failure has already been shown to
    /// the UI and reported to the sinks exactly once.
    pub async fn run(&self, user_prompt: &str) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut history = SinkSlot::new("history", self.history.clone());
        let mut audit = SinkSlot::new("audit", self.audit.clone());

        let start = RunStart {
            run_id: run_id.clone(),
            flow_source: self.flow_source.clone(),
            flow_path: self.flow_path.as_ref().map(|p| p.display().to_string()),
            step_keys: self.steps.iter().map(|s| s.key.clone()).collect(),
            prompt_chars: user_prompt.chars().count(),
        };
        info!(
            run_id = %run_id,
            steps = self.steps.len(),
            flow_source = %self.flow_source,
            "Starting council run"
        );
        history.call(|h| h.start_run(&start));
        audit.call(|a| a.log_event("run_started", &audit_data(&start)));

        self.ui.show_panel("Request (User)", user_prompt, "cyan", false);

        let mut state = RunState {
            last_output: user_prompt.to_string(),
            ..RunState::default()
        };
        let result = match ContextStore::new(self.limits.max_context_chars) {
            Ok(mut context) => {
                context.add_turn(HUMAN_ACTOR, "user", user_prompt, "Initial request");
                self.run_steps(
                    &run_id,
                    user_prompt,
                    &mut context,
                    &mut state,
                    &mut history,
                    &mut audit,
                )
                .await
            }
            Err(e) => Err(e.into()),
        };

        if matches!(result, Err(ExecError::Aborted)) {
            // The request that stopped this run must not stop the next one.
            self.executor.clear_cancel();
        }
        let status = RunStatus::from_result(&result);
        let duration = started.elapsed();
        match &result {
            Ok(()) => {
                info!(run_id = %run_id, elapsed_ms = duration.as_millis(), "Council run finished");
                self.ui.show_success("Council flow finished successfully.");
            }
            Err(ExecError::Aborted) => {
                info!(run_id = %run_id, executed = state.executed, "Council run aborted");
                self.ui.show_panel(
                    "Run aborted",
                    "The run was stopped on request. Remaining steps were not executed.",
                    "yellow",
                    false,
                );
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Council run failed");
                self.ui.show_error(&format!(
                    "{e}. The flow was interrupted and remaining steps were skipped."
                ));
            }
        }

        let outcome = RunOutcome {
            run_id: run_id.clone(),
            status,
            duration_ms: duration.as_millis(),
            executed_steps: state.executed,
            successful_steps: state.successful,
            error: result.as_ref().err().map(ToString::to_string),
        };
        history.call(|h| h.finish_run(&outcome));
        audit.call(|a| a.log_event("run_finished", &audit_data(&outcome)));

        RunReport {
            run_id,
            status,
            duration,
            executed_steps: state.executed,
            successful_steps: state.successful,
            outputs: state.outputs,
            final_output: state.final_output,
            error: result.err(),
        }
    }

    async fn run_steps(
        &self,
        run_id: &str,
        user_prompt: &str,
        context: &mut ContextStore,
        state: &mut RunState,
        history: &mut SinkSlot<dyn HistorySink>,
        audit: &mut SinkSlot<dyn AuditSink>,
    ) -> Result<(), ExecError> {
        let total = self.steps.len();
        for (index, step) in self.steps.iter().enumerate() {
            if self.executor.cancel_requested() {
                info!(run_id, step = %step.key, "Cancellation requested before step");
                return Err(ExecError::Aborted);
            }

            if !step.enabled {
                debug!(run_id, step = %step.key, "Step disabled; carrying previous output forward");
                state
                    .outputs
                    .insert(step.key.clone(), state.last_output.clone());
                let outcome = Self::step_outcome(
                    run_id,
                    step,
                    StepStatus::Skipped,
                    Duration::ZERO,
                    &StepMetrics::default(),
                    None,
                );
                history.call(|h| h.record_step(&outcome));
                continue;
            }

            info!(
                run_id,
                step = %step.key,
                position = index + 1,
                total,
                agent = %step.agent_name,
                "Running step"
            );
            audit.call(|a| {
                a.log_event(
                    "step_started",
                    &json!({
                        "run_id": run_id,
                        "step": step.key,
                        "agent": step.agent_name,
                        "command": step.command,
                    }),
                )
            });

            let started = Instant::now();
            let mut metrics = StepMetrics::default();
            let result = self
                .run_step(step, user_prompt, context, state, &mut metrics)
                .await;

            // Counters and reporting run for every outcome.
            state.executed += 1;
            let status = RunStatus::from_result(&result);
            if status == RunStatus::Success {
                state.successful += 1;
            }
            let outcome = Self::step_outcome(
                run_id,
                step,
                status.into(),
                started.elapsed(),
                &metrics,
                result.as_ref().err().map(ToString::to_string),
            );
            history.call(|h| h.record_step(&outcome));
            audit.call(|a| a.log_event("step_finished", &audit_data(&outcome)));

            let output = result?;
            state.outputs.insert(step.key.clone(), output.clone());
            state.last_output.clone_from(&output);
            state.final_output = Some(output);
        }
        Ok(())
    }

    /// One step including its feedback revisions.
    async fn run_step(
        &self,
        step: &Step,
        user_prompt: &str,
        context: &mut ContextStore,
        state: &RunState,
        metrics: &mut StepMetrics,
    ) -> Result<String, ExecError> {
        let variables = self.template_variables(step, user_prompt, context, state)?;
        let mut input = template::render(&step.input_template, &variables).map_err(|e| match e {
            TemplateError::MissingVariable { name } => ExecError::MissingVariable {
                step: step.key.clone(),
                variable: name,
            },
            malformed @ TemplateError::Malformed { .. } => ExecError::InvalidConfiguration(
                format!("step '{}' has an invalid input_template: {malformed}", step.key),
            ),
        })?;

        loop {
            metrics.attempts += 1;
            metrics.input_chars = input.chars().count();
            self.ui.show_step_start(step, metrics.attempts);

            let raw = self.execute(step, &input).await?;
            let output = if step.is_code {
                extract_code_block(&raw).map_err(|reason| {
                    warn!(step = %step.key, reason = %reason, "Rejected code step output");
                    ExecError::InsecureCodeBlock {
                        step: step.key.clone(),
                        reason,
                    }
                })?
            } else {
                raw
            };
            metrics.output_chars = output.chars().count();

            context.add_turn(&step.agent_name, "assistant", &output, &step.role_desc);
            self.ui.show_panel(
                &format!("{} - {}", step.agent_name, step.role_desc),
                &output,
                &step.style,
                step.is_code,
            );

            let reply = self
                .feedback
                .request_step_feedback(&step.agent_name, &step.role_desc, &output);
            match Feedback::classify(reply) {
                Feedback::Continue => return Ok(output),
                Feedback::Abort => {
                    info!(step = %step.key, "Run aborted from the feedback prompt");
                    return Err(ExecError::Aborted);
                }
                Feedback::Revise(text) => {
                    if self.executor.cancel_requested() {
                        return Err(ExecError::Aborted);
                    }
                    info!(
                        step = %step.key,
                        attempt = metrics.attempts,
                        "Re-running step with feedback"
                    );
                    context.add_turn(
                        HUMAN_ACTOR,
                        "user",
                        text.trim(),
                        format!("Feedback on {}", step.key),
                    );
                    input = build_follow_up_input(&step.key, &step.instruction, &output, &text);
                }
            }
        }
    }

    async fn execute(&self, step: &Step, input: &str) -> Result<String, ExecError> {
        let ui = &self.ui;
        let key = step.key.as_str();
        let on_line = move |line: &str| ui.on_output_line(key, line);
        let request = ExecRequest::new(
            &step.command,
            input,
            Duration::from_secs(step.timeout_secs),
        )
        .with_caps(step.max_input_chars, step.max_output_chars);
        self.executor.execute(request, &on_line).await
    }

    /// Reserved keys plus every completed step, all wrapped as data blocks
    /// except the instruction.
    fn template_variables(
        &self,
        step: &Step,
        user_prompt: &str,
        context: &ContextStore,
        state: &RunState,
    ) -> Result<HashMap<String, String>, ExecError> {
        let context_cap = step
            .max_context_chars
            .unwrap_or(self.limits.max_context_chars);
        let full_context = context.get_full_context(Some(context_cap))?;

        let mut variables = HashMap::with_capacity(state.outputs.len() + 4);
        variables.insert(
            "user_prompt".to_string(),
            wrap_data_block("user_prompt", user_prompt),
        );
        variables.insert(
            "full_context".to_string(),
            wrap_data_block("full_context", &full_context),
        );
        variables.insert(
            "last_output".to_string(),
            wrap_data_block("last_output", &state.last_output),
        );
        variables.insert("instruction".to_string(), step.instruction.clone());
        for (key, output) in &state.outputs {
            variables.insert(key.clone(), wrap_data_block(key, output));
        }
        Ok(variables)
    }

    fn step_outcome(
        run_id: &str,
        step: &Step,
        status: StepStatus,
        duration: Duration,
        metrics: &StepMetrics,
        error: Option<String>,
    ) -> StepOutcome {
        StepOutcome {
            run_id: run_id.to_string(),
            step_key: step.key.clone(),
            agent_name: step.agent_name.clone(),
            role_desc: step.role_desc.clone(),
            command: step.command.clone(),
            status,
            duration_ms: duration.as_millis(),
            attempts: metrics.attempts,
            input_chars: metrics.input_chars,
            output_chars: metrics.output_chars,
            error,
        }
    }
}
