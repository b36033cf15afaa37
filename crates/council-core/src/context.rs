//! Conversation transcript shared between pipeline steps.
//!
//! Turns are append-only. The rendered view is bounded: when it exceeds the
//! character budget the oldest text is dropped and a visible marker is
//! prefixed, never silently cut.

use crate::error::{Error, Result};

/// Marker prefixed to any context view cut to fit its budget.
pub const CONTEXT_TRUNCATION_NOTICE: &str = "[... earlier context truncated ...]\n";

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub actor: String,
    pub role: String,
    pub content: String,
    pub action: String,
}

/// Append-only transcript of a run.
#[derive(Debug, Clone)]
pub struct ContextStore {
    turns: Vec<Turn>,
    max_context_chars: usize,
}

impl ContextStore {
    pub fn new(max_context_chars: usize) -> Result<Self> {
        if max_context_chars == 0 {
            return Err(Error::Limit(
                "max_context_chars must be greater than zero".into(),
            ));
        }
        Ok(Self {
            turns: Vec::new(),
            max_context_chars,
        })
    }

    pub fn add_turn(
        &mut self,
        actor: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
        action: impl Into<String>,
    ) {
        self.turns.push(Turn {
            actor: actor.into(),
            role: role.into(),
            content: content.into(),
            action: action.into(),
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Render every turn oldest to newest as
    /// `--- actor (ROLE) [action] ---\ncontent`, joined with newlines.
    ///
    /// `max_chars` overrides the store's default budget for this call.
    pub fn get_full_context(&self, max_chars: Option<usize>) -> Result<String> {
        let budget = max_chars.unwrap_or(self.max_context_chars);
        if budget == 0 {
            return Err(Error::Limit("max_chars must be greater than zero".into()));
        }

        let rendered = self
            .turns
            .iter()
            .map(render_turn)
            .collect::<Vec<_>>()
            .join("\n");

        Ok(truncate_tail(&rendered, budget, CONTEXT_TRUNCATION_NOTICE))
    }
}

fn render_turn(turn: &Turn) -> String {
    let role = turn.role.to_uppercase();
    let action = turn.action.trim();
    let header = if action.is_empty() {
        format!("--- {} ({role}) ---", turn.actor)
    } else {
        format!("--- {} ({role}) [{action}] ---", turn.actor)
    };
    format!("{header}\n{}", turn.content.trim())
}

/// Keep the trailing characters of `text` so the result fits in `max_chars`.
///
/// When cutting is needed the result starts with `marker` and the marker counts
/// toward the budget. If the budget is smaller than the marker, a prefix of the
/// marker is returned. The result never exceeds `max_chars` characters and
/// applying the function twice yields the same string.
pub fn truncate_tail(text: &str, max_chars: usize, marker: &str) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    let marker_chars = marker.chars().count();
    if max_chars <= marker_chars {
        return marker.chars().take(max_chars).collect();
    }

    let keep = max_chars - marker_chars;
    let tail_start = text
        .char_indices()
        .nth(total - keep)
        .map_or(text.len(), |(idx, _)| idx);
    format!("{marker}{}", &text[tail_start..])
}
