//! Process-wide character limits.
//!
//! Defaults can be overridden through environment variables:
//! - `COUNCIL_MAX_INPUT_CHARS`
//! - `COUNCIL_MAX_OUTPUT_CHARS`
//! - `COUNCIL_MAX_CONTEXT_CHARS`
//!
//! A missing or empty variable keeps the default; anything that is not a
//! positive integer is rejected with an error naming the variable.

use crate::error::{Error, Result};

pub const MAX_INPUT_CHARS_ENV_VAR: &str = "COUNCIL_MAX_INPUT_CHARS";
pub const MAX_OUTPUT_CHARS_ENV_VAR: &str = "COUNCIL_MAX_OUTPUT_CHARS";
pub const MAX_CONTEXT_CHARS_ENV_VAR: &str = "COUNCIL_MAX_CONTEXT_CHARS";

pub const DEFAULT_MAX_INPUT_CHARS: usize = 200_000;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 200_000;
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 120_000;

/// Character caps applied when a step does not carry its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_input_chars: usize,
    pub max_output_chars: usize,
    pub max_context_chars: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
        }
    }
}

impl Limits {
    /// Build limits with explicit values, rejecting zero caps.
    pub fn new(
        max_input_chars: usize,
        max_output_chars: usize,
        max_context_chars: usize,
    ) -> Result<Self> {
        for (name, value) in [
            ("max_input_chars", max_input_chars),
            ("max_output_chars", max_output_chars),
            ("max_context_chars", max_context_chars),
        ] {
            if value == 0 {
                return Err(Error::Limit(format!("{name} must be greater than zero")));
            }
        }
        Ok(Self {
            max_input_chars,
            max_output_chars,
            max_context_chars,
        })
    }

    /// Resolve limits from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve limits through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str, default: usize| {
            parse_positive_int(name, lookup(name).as_deref(), default)
        };
        Ok(Self {
            max_input_chars: read(MAX_INPUT_CHARS_ENV_VAR, DEFAULT_MAX_INPUT_CHARS)?,
            max_output_chars: read(MAX_OUTPUT_CHARS_ENV_VAR, DEFAULT_MAX_OUTPUT_CHARS)?,
            max_context_chars: read(MAX_CONTEXT_CHARS_ENV_VAR, DEFAULT_MAX_CONTEXT_CHARS)?,
        })
    }
}

/// Read a positive integer from the environment variable `name`.
pub fn read_positive_int_env(name: &str, default: usize) -> Result<usize> {
    parse_positive_int(name, std::env::var(name).ok().as_deref(), default)
}

/// Parse a raw variable value: absent/blank => `default`, otherwise it must
/// be an integer greater than zero.
pub fn parse_positive_int(name: &str, raw: Option<&str>, default: usize) -> Result<usize> {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Ok(default);
    }
    match raw.parse::<usize>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(Error::Limit(format!(
            "environment variable '{name}' is invalid: expected a positive integer, got '{raw}'"
        ))),
    }
}
