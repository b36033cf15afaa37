//! Strict extraction of the code produced by an `is_code` step.

const FENCE: &str = "```";

/// Return the inner content of `output` when it is exactly one fenced code
/// block (optionally tagged with a language). Anything else is rejected with
/// a reason; nothing is stripped on a best-effort basis.
pub fn extract_code_block(output: &str) -> Result<String, String> {
    let trimmed = output.trim();
    let lines: Vec<&str> = trimmed.lines().collect();

    let Some(opening) = lines.first() else {
        return Err("output is empty, expected a single fenced code block".into());
    };
    let Some(tag) = opening.trim_end().strip_prefix(FENCE) else {
        return Err("output does not start with a code fence".into());
    };
    if !is_language_tag(tag) {
        return Err(format!("invalid code fence info string: {tag:?}"));
    }
    if lines.len() < 2 || lines.last().map(|l| l.trim_end()) != Some(FENCE) {
        return Err("code block is missing its closing fence".into());
    }

    let inner = &lines[1..lines.len() - 1];
    if inner.iter().any(|l| l.trim_start().starts_with(FENCE)) {
        return Err("output contains more than one code block".into());
    }
    if inner.iter().all(|l| l.trim().is_empty()) {
        return Err("code block is empty".into());
    }
    Ok(inner.join("\n"))
}

fn is_language_tag(tag: &str) -> bool {
    tag.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '.' | '#'))
}
