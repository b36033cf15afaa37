//! Terminal collaborator: streams agent output, prints panels, and asks for
//! feedback between steps.

use council_core::Step;
use council_engine::pipeline::FEEDBACK_ABORT_SENTINEL;
use council_engine::{FeedbackProvider, PipelineUi};
use tracing::warn;

/// Typed at the feedback prompt to stop the run.
pub const ABORT_COMMAND: &str = "/abort";

const RULE_WIDTH: usize = 72;

#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleUi;

impl ConsoleUi {
    pub const fn new() -> Self {
        Self
    }
}

#[allow(clippy::print_stdout)]
impl PipelineUi for ConsoleUi {
    fn on_output_line(&self, _step_key: &str, line: &str) {
        println!("  {line}");
    }

    fn show_step_start(&self, step: &Step, attempt: usize) {
        if attempt > 1 {
            println!("\n>> {} ({}) - revision {}", step.agent_name, step.role_desc, attempt - 1);
        } else {
            println!("\n>> {} ({})", step.agent_name, step.role_desc);
        }
    }

    fn show_panel(&self, title: &str, content: &str, style: &str, is_code: bool) {
        println!("\n{}", panel_header(title, style));
        if is_code {
            println!("```");
            println!("{content}");
            println!("```");
        } else {
            println!("{content}");
        }
        println!("{}", "-".repeat(RULE_WIDTH));
    }

    #[allow(clippy::print_stderr)]
    fn show_error(&self, message: &str) {
        eprintln!("\nError: {message}");
    }

    fn show_success(&self, message: &str) {
        println!("\n{message}");
    }
}

impl FeedbackProvider for ConsoleUi {
    fn request_step_feedback(
        &self,
        agent_name: &str,
        role_desc: &str,
        _output: &str,
    ) -> Option<String> {
        let prompt = format!(
            "Feedback for {agent_name} ({role_desc}) [Enter to continue, {ABORT_COMMAND} to stop]"
        );
        // The engine calls this from inside the runtime; the prompt blocks on stdin.
        let reply = tokio::task::block_in_place(|| {
            dialoguer::Input::<String>::new()
                .with_prompt(prompt)
                .allow_empty(true)
                .interact_text()
        });
        match reply {
            Ok(text) => interpret_reply(&text),
            Err(e) => {
                warn!(error = %e, agent = agent_name, "Feedback prompt failed, continuing");
                None
            }
        }
    }
}

/// Map what the user typed to the engine's feedback contract.
fn interpret_reply(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.eq_ignore_ascii_case(ABORT_COMMAND) {
        Some(FEEDBACK_ABORT_SENTINEL.to_string())
    } else {
        Some(text.to_string())
    }
}

fn panel_header(title: &str, style: &str) -> String {
    let label = format!("== {title} [{style}] ");
    let fill = RULE_WIDTH.saturating_sub(label.chars().count());
    format!("{label}{}", "=".repeat(fill))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn blank_reply_continues() {
        assert_eq!(interpret_reply(""), None);
        assert_eq!(interpret_reply("   "), None);
    }

    #[test]
    fn abort_command_maps_to_sentinel() {
        assert_eq!(
            interpret_reply(" /ABORT "),
            Some(FEEDBACK_ABORT_SENTINEL.to_string())
        );
    }

    #[test]
    fn other_text_is_passed_through() {
        assert_eq!(
            interpret_reply("add error handling"),
            Some("add error handling".to_string())
        );
    }

    #[test]
    fn panel_header_fills_to_rule_width() {
        let header = panel_header("Plan", "blue");
        assert!(header.starts_with("== Plan [blue] ="));
        assert_eq!(header.chars().count(), RULE_WIDTH);
    }
}
