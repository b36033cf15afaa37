//! `{name}` placeholder substitution against a flat string map.
//!
//! Only bare identifiers are accepted inside braces: no attribute access,
//! indexing or format specs. `{{` and `}}` produce literal braces.

use std::collections::HashMap;

use thiserror::Error;

/// Template rendering failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// A placeholder references a name absent from the variable map.
    #[error("undefined template variable '{name}'")]
    MissingVariable { name: String },

    /// The template text itself is not well formed.
    #[error("malformed template at byte {position}: {reason}")]
    Malformed { position: usize, reason: String },
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Brace(char),
    Variable(&'a str),
}

/// Render `template`, replacing every `{name}` with `variables[name]`.
pub fn render(
    template: &str,
    variables: &HashMap<String, String>,
) -> Result<String, TemplateError> {
    let segments = parse(template)?;
    let mut out = String::with_capacity(template.len());
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Brace(c) => out.push(c),
            Segment::Variable(name) => {
                let value = variables
                    .get(name)
                    .ok_or_else(|| TemplateError::MissingVariable {
                        name: name.to_string(),
                    })?;
                out.push_str(value);
            }
        }
    }
    Ok(out)
}

/// Names referenced by `template`, in order of first appearance.
pub fn referenced_variables(template: &str) -> Result<Vec<String>, TemplateError> {
    let mut names: Vec<String> = Vec::new();
    for segment in parse(template)? {
        if let Segment::Variable(name) = segment {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let bytes = template.as_bytes();
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' | b'}' if bytes.get(i + 1) == Some(&bytes[i]) => {
                if literal_start < i {
                    segments.push(Segment::Literal(&template[literal_start..i]));
                }
                segments.push(Segment::Brace(char::from(bytes[i])));
                i += 2;
                literal_start = i;
            }
            b'{' => {
                if literal_start < i {
                    segments.push(Segment::Literal(&template[literal_start..i]));
                }
                let close = template[i + 1..]
                    .find('}')
                    .map(|offset| i + 1 + offset)
                    .ok_or_else(|| TemplateError::Malformed {
                        position: i,
                        reason: "unclosed '{'".into(),
                    })?;
                let name = template[i + 1..close].trim();
                if !is_identifier(name) {
                    return Err(TemplateError::Malformed {
                        position: i,
                        reason: format!("unsupported placeholder '{{{name}}}'"),
                    });
                }
                segments.push(Segment::Variable(name));
                i = close + 1;
                literal_start = i;
            }
            b'}' => {
                return Err(TemplateError::Malformed {
                    position: i,
                    reason: "single '}' is not allowed".into(),
                });
            }
            _ => i += 1,
        }
    }

    if literal_start < bytes.len() {
        segments.push(Segment::Literal(&template[literal_start..]));
    }
    Ok(segments)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
