//! Collaborator doubles shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::Mutex;

use council_core::Step;
use council_engine::pipeline::{RunOutcome, RunStart, StepOutcome};
use council_engine::{FeedbackProvider, HistorySink, PipelineUi, SinkError};

/// Records everything shown to the user.
#[derive(Default)]
pub struct RecordingUi {
    pub lines: Mutex<Vec<(String, String)>>,
    pub step_starts: Mutex<Vec<(String, usize)>>,
    pub panels: Mutex<Vec<(String, String)>>,
    pub errors: Mutex<Vec<String>>,
    pub successes: Mutex<Vec<String>>,
    /// Called on every output line, after recording it.
    pub on_line_hook: Mutex<Option<Box<dyn Fn(&str) + Send>>>,
    /// Called with the step key whenever a step (re)starts.
    pub on_step_start_hook: Mutex<Option<Box<dyn Fn(&str) + Send>>>,
}

impl PipelineUi for RecordingUi {
    fn on_output_line(&self, step_key: &str, line: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((step_key.to_string(), line.to_string()));
        if let Some(hook) = self.on_line_hook.lock().unwrap().as_ref() {
            hook(line);
        }
    }

    fn show_step_start(&self, step: &Step, attempt: usize) {
        self.step_starts
            .lock()
            .unwrap()
            .push((step.key.clone(), attempt));
        if let Some(hook) = self.on_step_start_hook.lock().unwrap().as_ref() {
            hook(&step.key);
        }
    }

    fn show_panel(&self, title: &str, content: &str, _style: &str, _is_code: bool) {
        self.panels
            .lock()
            .unwrap()
            .push((title.to_string(), content.to_string()));
    }

    fn show_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn show_success(&self, message: &str) {
        self.successes.lock().unwrap().push(message.to_string());
    }
}

/// Replies with queued answers, then continues.
#[derive(Default)]
pub struct ScriptedFeedback {
    pub replies: Mutex<VecDeque<Option<String>>>,
    pub asked: Mutex<Vec<String>>,
}

impl ScriptedFeedback {
    pub fn new(replies: impl IntoIterator<Item = Option<&'static str>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| r.map(String::from)).collect()),
            asked: Mutex::new(Vec::new()),
        }
    }
}

impl FeedbackProvider for ScriptedFeedback {
    fn request_step_feedback(
        &self,
        agent_name: &str,
        _role: &str,
        _output: &str,
    ) -> Option<String> {
        self.asked.lock().unwrap().push(agent_name.to_string());
        self.replies.lock().unwrap().pop_front().flatten()
    }
}

#[derive(Debug, Clone)]
pub enum HistoryEvent {
    Start(RunStart),
    Step(StepOutcome),
    Finish(RunOutcome),
}

#[derive(Default)]
pub struct RecordingHistory {
    pub events: Mutex<Vec<HistoryEvent>>,
}

impl HistorySink for RecordingHistory {
    fn start_run(&self, run: &RunStart) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(HistoryEvent::Start(run.clone()));
        Ok(())
    }

    fn record_step(&self, step: &StepOutcome) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(HistoryEvent::Step(step.clone()));
        Ok(())
    }

    fn finish_run(&self, run: &RunOutcome) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(HistoryEvent::Finish(run.clone()));
        Ok(())
    }
}

pub fn step(key: &str, command: &str, template: &str) -> Step {
    Step::new(key, key.to_uppercase(), "Tester", command, format!("Instruction for {key}"))
        .with_template(template)
        .with_timeout(10)
}
