//! Flow step definitions and validation.
//!
//! A flow is an ordered list of [`Step`]s. Steps are built once when the flow
//! is loaded and never mutated during a run.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::command::{self, tokenize_command};
use crate::error::{Error, Result};
use crate::template;

/// Template variable names that step keys may not shadow.
pub const RESERVED_TEMPLATE_KEYS: [&str; 4] =
    ["user_prompt", "full_context", "last_output", "instruction"];

/// Binaries a flow file may invoke.
pub const ALLOWED_COMMAND_BINARIES: [&str; 5] = ["claude", "gemini", "codex", "ollama", "deepseek"];

/// Binaries served by an in-process HTTP provider instead of a subprocess.
pub const API_ONLY_COMMAND_BINARIES: [&str; 1] = ["deepseek"];

pub const DEFAULT_INPUT_TEMPLATE: &str = "{instruction}\n\n{full_context}";
pub const DEFAULT_STYLE: &str = "blue";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

static SHELL_VARIABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$[A-Za-z_][A-Za-z0-9_]*").expect("static regex is valid"));
static HOME_TILDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)~(/|$)").expect("static regex is valid"));

/// One pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Unique key; later templates reference this step's output as `{key}`.
    pub key: String,
    pub agent_name: String,
    pub role_desc: String,
    pub command: String,
    pub instruction: String,
    pub input_template: String,
    pub style: String,
    /// Output must be exactly one fenced code block.
    pub is_code: bool,
    pub enabled: bool,
    pub timeout_secs: u64,
    pub max_input_chars: Option<usize>,
    pub max_output_chars: Option<usize>,
    pub max_context_chars: Option<usize>,
}

impl Step {
    /// Build a step with default template, style, timeout and no per-step caps.
    pub fn new(
        key: impl Into<String>,
        agent_name: impl Into<String>,
        role_desc: impl Into<String>,
        command: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            agent_name: agent_name.into(),
            role_desc: role_desc.into(),
            command: command.into(),
            instruction: instruction.into(),
            input_template: DEFAULT_INPUT_TEMPLATE.to_string(),
            style: DEFAULT_STYLE.to_string(),
            is_code: false,
            enabled: true,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_input_chars: None,
            max_output_chars: None,
            max_context_chars: None,
        }
    }

    #[must_use]
    pub fn with_template(mut self, input_template: impl Into<String>) -> Self {
        self.input_template = input_template.into();
        self
    }

    #[must_use]
    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = style.into();
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    #[must_use]
    pub const fn code(mut self) -> Self {
        self.is_code = true;
        self
    }

    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_TEMPLATE_KEYS.contains(&key)
}

pub fn is_api_only_binary(binary: &str) -> bool {
    API_ONLY_COMMAND_BINARIES.contains(&binary)
}

/// Full validation of a step list: [`validate_step_structure`] plus every
/// template reference pointing at a reserved key or an earlier step.
pub fn validate_steps(steps: &[Step]) -> Result<()> {
    validate_step_structure(steps)?;
    validate_template_references(steps)
}

/// Non-empty, unique keys disjoint from the reserved names, positive limits.
pub fn validate_step_structure(steps: &[Step]) -> Result<()> {
    if steps.is_empty() {
        return Err(Error::Config("the flow must contain at least 1 step".into()));
    }

    let mut seen = HashSet::new();
    let mut duplicates: Vec<&str> = Vec::new();
    for step in steps {
        if !seen.insert(step.key.as_str()) && !duplicates.contains(&step.key.as_str()) {
            duplicates.push(step.key.as_str());
        }
    }
    if !duplicates.is_empty() {
        duplicates.sort_unstable();
        return Err(Error::Config(format!(
            "duplicate step keys: {}",
            duplicates.join(", ")
        )));
    }

    let mut reserved: Vec<&str> = steps
        .iter()
        .map(|s| s.key.as_str())
        .filter(|k| is_reserved_key(k))
        .collect();
    if !reserved.is_empty() {
        reserved.sort_unstable();
        return Err(Error::Config(format!(
            "step keys cannot use reserved names ({})",
            reserved.join(", ")
        )));
    }

    for step in steps {
        if step.timeout_secs == 0 {
            return Err(Error::Config(format!(
                "step '{}' timeout must be greater than zero",
                step.key
            )));
        }
        for (name, value) in [
            ("max_input_chars", step.max_input_chars),
            ("max_output_chars", step.max_output_chars),
            ("max_context_chars", step.max_context_chars),
        ] {
            if value == Some(0) {
                return Err(Error::Config(format!(
                    "step '{}' {name} must be greater than zero",
                    step.key
                )));
            }
        }
    }
    Ok(())
}

/// Check that each template only references reserved keys or earlier steps.
pub fn validate_template_references(steps: &[Step]) -> Result<()> {
    let mut available: HashSet<&str> = RESERVED_TEMPLATE_KEYS.into_iter().collect();
    for step in steps {
        let referenced = template::referenced_variables(&step.input_template).map_err(|e| {
            Error::Config(format!("step '{}' has an invalid input_template: {e}", step.key))
        })?;
        if let Some(missing) = referenced.iter().find(|v| !available.contains(v.as_str())) {
            return Err(Error::Config(format!(
                "step '{}' references undefined variable '{missing}' in input_template",
                step.key
            )));
        }
        available.insert(step.key.as_str());
    }
    Ok(())
}

/// Reject shell syntax, explicit paths and binaries outside the allow-list.
///
/// `position` is the 1-based step number used in error messages.
pub fn validate_command(command: &str, position: usize) -> Result<()> {
    let operators = disallowed_operators(command);
    if !operators.is_empty() {
        return Err(Error::Config(format!(
            "field 'command' in step #{position} contains disallowed shell operators ({})",
            operators.join(", ")
        )));
    }

    let tokens = tokenize_command(command).map_err(|e| {
        Error::Config(format!(
            "field 'command' in step #{position} has invalid syntax: {e}"
        ))
    })?;
    let Some(binary) = tokens.first() else {
        return Err(Error::Config(format!(
            "field 'command' in step #{position} cannot be empty"
        )));
    };

    if binary.contains('/') || binary.contains('\\') {
        return Err(Error::Config(format!(
            "field 'command' in step #{position} must use a bare binary name \
             without a path: '{binary}'"
        )));
    }

    if !ALLOWED_COMMAND_BINARIES.contains(&binary.as_str()) {
        return Err(Error::Config(format!(
            "field 'command' in step #{position} uses a binary that is not allowed: \
             '{binary}'. Allowed: {}",
            ALLOWED_COMMAND_BINARIES.join(", ")
        )));
    }
    Ok(())
}

fn disallowed_operators(command: &str) -> Vec<&'static str> {
    let mut found = Vec::new();
    let checks: [(&str, bool); 10] = [
        ("\\n", command.contains('\n')),
        ("\\r", command.contains('\r')),
        ("&&", command.contains("&&")),
        (";", command.contains(';')),
        ("|", command.contains('|')),
        ("`", command.contains('`')),
        ("${", command.contains("${")),
        ("$VAR", SHELL_VARIABLE_RE.is_match(command)),
        ("$(", command.contains("$(")),
        ("~", HOME_TILDE_RE.is_match(command)),
    ];
    for (label, hit) in checks {
        if hit {
            found.push(label);
        }
    }
    if command.contains(">>") {
        found.push(">>");
    }
    if command.replace(">>", "").contains('>') {
        found.push(">");
    }
    found
}

/// The flow used when no flow file is configured.
pub fn default_flow_steps() -> Vec<Step> {
    let plan = "You are a senior, pragmatic software architect. Analyse the request below \
        and produce a structured implementation plan with:\n\n\
        1. OVERVIEW - what will be built and why.\n\
        2. ARCHITECTURE - components, dependencies and integrations.\n\
        3. IMPLEMENTATION STEPS - ordered tasks naming the files to create or change.\n\
        4. RISKS AND MITIGATIONS.\n\
        5. SUCCESS CRITERIA - how to validate the result.\n\n\
        Be specific about file names, functions and data structures.";
    let critique = "You are a rigorous, sceptical technical auditor. Find what the architect \
        missed. Focus on architecture flaws, security (injection, data exposure, permissions, \
        supply chain), uncovered edge cases and race conditions, unnecessary complexity and \
        dependency risk. Rate each finding [CRITICAL], [HIGH], [MEDIUM] or [LOW] and propose \
        a concrete fix. Do not praise what is fine.";
    let consolidate = "You are the final deciding architect. You received an initial plan and \
        an audit of it. Accept the valid findings and adjust the plan, reject the others with a \
        short justification, and produce the FINAL CONSOLIDATED PLAN with the same five \
        sections as the original. The implementer will follow it to the letter.";
    let implement = "You are a senior software engineer. Implement EXACTLY what the consolidated \
        plan specifies. Return ONLY source code inside a single fenced code block, with error \
        handling and input validation where applicable. Include tests if the plan asks for them.";
    let review = "You are a code reviewer specialised in security and robustness. Compare the \
        implementation with the consolidated plan and assess conformance, vulnerabilities, \
        logic bugs and test coverage. Rate each finding [CRITICAL], [HIGH], [MEDIUM] or [LOW].";

    vec![
        Step::new("plan", "Claude", "Planning", "claude -p", plan)
            .with_template("{instruction}\n\nCONTEXT:\n{full_context}")
            .with_style("dark_goldenrod"),
        Step::new("critique", "Gemini", "Critique", "gemini -p {input}", critique)
            .with_template("{instruction}\n\nPROPOSED PLAN:\n{plan}")
            .with_style("dodger_blue1"),
        Step::new("final_plan", "Claude", "Consolidation", "claude -p", consolidate)
            .with_template("{instruction}\n\nINITIAL PLAN:\n{plan}\n\nAUDIT FINDINGS:\n{critique}")
            .with_style("dark_goldenrod"),
        Step::new(
            "code",
            "Codex",
            "Implementation",
            "codex exec --skip-git-repo-check",
            implement,
        )
        .with_template("{instruction}\n\nFINAL PLAN:\n{final_plan}")
        .with_style("bright_black")
        .code(),
        Step::new("review", "Gemini", "Final Review", "gemini -p {input}", review)
            .with_template(
                "{instruction}\n\nCONSOLIDATED PLAN:\n{final_plan}\n\nCODE:\n{code}",
            )
            .with_style("dodger_blue1"),
    ]
}

/// Distinct binaries used by the enabled steps, in flow order.
pub fn required_binaries(steps: &[Step]) -> Vec<String> {
    let mut binaries: Vec<String> = Vec::new();
    for step in steps.iter().filter(|s| s.enabled) {
        if let Some(binary) = command::binary_name(&step.command) {
            if !binaries.contains(&binary) {
                binaries.push(binary);
            }
        }
    }
    binaries
}
