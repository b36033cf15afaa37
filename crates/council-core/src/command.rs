//! Command-line tokenization.
//!
//! Step commands are split the way a POSIX shell splits words, but they are
//! never handed to a shell: the resulting argv is executed directly.

use crate::error::{Error, Result};

/// Literal argv token replaced by the step payload.
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Split `command` into argv words.
///
/// Supports single quotes (literal), double quotes (with `\"`, `\\`, `\$` and
/// `` \` `` escapes) and backslash escapes outside quotes.
pub fn tokenize_command(command: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated(command, "single quote")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(esc @ ('"' | '\\' | '$' | '`')) => current.push(esc),
                            Some('\n') => {}
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err(unterminated(command, "double quote")),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated(command, "double quote")),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some('\n') => {}
                    Some(ch) => current.push(ch),
                    None => return Err(unterminated(command, "escape")),
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// First argv word of `command`, if it tokenizes.
pub fn binary_name(command: &str) -> Option<String> {
    tokenize_command(command).ok()?.into_iter().next()
}

/// File-name component of a binary token (`/usr/bin/gemini` -> `gemini`).
pub fn binary_basename(binary: &str) -> &str {
    binary.rsplit(['/', '\\']).next().unwrap_or(binary)
}

fn unterminated(command: &str, what: &str) -> Error {
    Error::Config(format!("command has an unterminated {what}: {command}"))
}
