//! Turning a tokenized step command into a child invocation.

use council_core::command::{INPUT_PLACEHOLDER, binary_basename};

pub const ARGV_INPUT_START: &str = "===INPUT_START===";
pub const ARGV_INPUT_END: &str = "===INPUT_END===";
const ARGV_INPUT_NOTICE: &str = "FULL PROMPT SENT VIA ARGV.";

/// Final argv plus what (if anything) goes to the child's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCommand {
    pub argv: Vec<String>,
    /// `None` means stdin is closed without writing anything.
    pub stdin: Option<String>,
}

/// Place `payload` either into argv or onto stdin.
///
/// Every `{input}` token is replaced with the wrapped payload. A `gemini`
/// command that ends in `-p`/`--prompt` gets the wrapped payload appended as
/// the flag's value. Anything else receives the payload on stdin.
pub fn prepare_argv(mut argv: Vec<String>, payload: &str) -> PreparedCommand {
    if argv.iter().any(|t| t == INPUT_PLACEHOLDER) {
        let wrapped = wrap_argv_payload(payload);
        for token in &mut argv {
            if token == INPUT_PLACEHOLDER {
                token.clone_from(&wrapped);
            }
        }
        return PreparedCommand { argv, stdin: None };
    }

    if needs_prompt_value(&argv) {
        argv.push(wrap_argv_payload(payload));
        return PreparedCommand { argv, stdin: None };
    }

    PreparedCommand {
        argv,
        stdin: Some(payload.to_string()),
    }
}

/// Blank payloads become the empty string.
pub fn wrap_argv_payload(payload: &str) -> String {
    if payload.trim().is_empty() {
        return String::new();
    }
    format!("{ARGV_INPUT_START}\n{ARGV_INPUT_NOTICE}\n{payload}\n{ARGV_INPUT_END}")
}

fn needs_prompt_value(argv: &[String]) -> bool {
    let (Some(first), Some(last)) = (argv.first(), argv.last()) else {
        return false;
    };
    argv.len() > 1
        && binary_basename(first) == "gemini"
        && matches!(last.as_str(), "-p" | "--prompt")
}
