//! Flow configuration resolution and loading.
//!
//! Resolution order for the flow file:
//! 1. Explicit path (CLI argument)
//! 2. `COUNCIL_FLOW_CONFIG` environment variable
//! 3. `./flow.json` in the working directory
//! 4. `<council home>/flow.json`
//! 5. Built-in default flow

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::flow::{
    self, DEFAULT_INPUT_TEMPLATE, DEFAULT_STYLE, DEFAULT_TIMEOUT_SECS, Step, validate_command,
};

pub const FLOW_CONFIG_ENV_VAR: &str = "COUNCIL_FLOW_CONFIG";
pub const COUNCIL_HOME_ENV_VAR: &str = "COUNCIL_HOME";
pub const FLOW_FILE_NAME: &str = "flow.json";

/// Where the active flow came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSource {
    Cli,
    Env,
    Cwd,
    User,
    Default,
}

impl FlowSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Env => "env",
            Self::Cwd => "cwd",
            Self::User => "user",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for FlowSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of flow file resolution. `path` is `None` for the built-in flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFlowConfig {
    pub path: Option<PathBuf>,
    pub source: FlowSource,
}

/// Council's per-user directory: `COUNCIL_HOME`, else the platform config
/// directory joined with `council`.
pub fn council_home() -> Option<PathBuf> {
    match std::env::var(COUNCIL_HOME_ENV_VAR) {
        Ok(dir) if !dir.trim().is_empty() => Some(PathBuf::from(dir.trim())),
        _ => dirs::config_dir().map(|d| d.join("council")),
    }
}

/// Path of the per-user flow file.
pub fn user_flow_config_path() -> Option<PathBuf> {
    council_home().map(|home| home.join(FLOW_FILE_NAME))
}

/// Resolve which flow file to use from the process environment.
pub fn resolve_flow_config(cli_path: Option<&str>) -> Result<ResolvedFlowConfig> {
    let cwd = std::env::current_dir()?;
    resolve_flow_config_with(
        cli_path,
        std::env::var(FLOW_CONFIG_ENV_VAR).ok().as_deref(),
        &cwd,
        user_flow_config_path().as_deref(),
    )
}

/// Resolution with every input explicit.
pub fn resolve_flow_config_with(
    cli_path: Option<&str>,
    env_path: Option<&str>,
    cwd: &Path,
    user_path: Option<&Path>,
) -> Result<ResolvedFlowConfig> {
    if let Some(raw) = cli_path.map(str::trim).filter(|p| !p.is_empty()) {
        return Ok(ResolvedFlowConfig {
            path: Some(validate_config_path(raw, "--flow-config")?),
            source: FlowSource::Cli,
        });
    }

    if let Some(raw) = env_path.map(str::trim).filter(|p| !p.is_empty()) {
        return Ok(ResolvedFlowConfig {
            path: Some(validate_config_path(raw, FLOW_CONFIG_ENV_VAR)?),
            source: FlowSource::Env,
        });
    }

    let cwd_path = cwd.join(FLOW_FILE_NAME);
    if cwd_path.is_file() {
        return Ok(ResolvedFlowConfig {
            path: Some(cwd_path),
            source: FlowSource::Cwd,
        });
    }

    if let Some(user) = user_path.filter(|p| p.is_file()) {
        return Ok(ResolvedFlowConfig {
            path: Some(user.to_path_buf()),
            source: FlowSource::User,
        });
    }

    Ok(ResolvedFlowConfig {
        path: None,
        source: FlowSource::Default,
    })
}

fn validate_config_path(raw: &str, source: &str) -> Result<PathBuf> {
    let path = PathBuf::from(raw);
    if !path.exists() {
        return Err(Error::Config(format!(
            "configuration file not found ({source}): {}",
            path.display()
        )));
    }
    if !path.is_file() {
        return Err(Error::Config(format!(
            "path given by {source} is not a file: {}",
            path.display()
        )));
    }
    Ok(path)
}

/// Load and validate the steps of a resolved flow.
pub fn load_flow_steps(resolved: &ResolvedFlowConfig) -> Result<Vec<Step>> {
    let Some(path) = &resolved.path else {
        debug!(source = %resolved.source, "Using built-in flow");
        return Ok(flow::default_flow_steps());
    };
    debug!(source = %resolved.source, path = %path.display(), "Loading flow file");

    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "failed to read flow configuration {}: {e}",
            path.display()
        ))
    })?;
    let steps = parse_flow(&content).map_err(|e| match e {
        Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
        other => other,
    })?;
    debug!(path = %path.display(), steps = steps.len(), "Flow file validated");
    Ok(steps)
}

/// Parse flow JSON: either a list of steps or `{ "steps": [...] }`.
pub fn parse_flow(content: &str) -> Result<Vec<Step>> {
    let payload: Value = serde_json::from_str(content)
        .map_err(|e| Error::Config(format!("invalid JSON: {e}")))?;

    let raw_steps = match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("steps") {
            Some(Value::Array(items)) => items,
            _ => return Err(invalid_format()),
        },
        _ => return Err(invalid_format()),
    };

    let steps = raw_steps
        .into_iter()
        .enumerate()
        .map(|(index, raw)| parse_step(raw, index + 1))
        .collect::<Result<Vec<_>>>()?;

    flow::validate_steps(&steps)?;
    Ok(steps)
}

fn invalid_format() -> Error {
    Error::Config("invalid format: use a list of steps or a JSON object with a 'steps' key".into())
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(alias = "id")]
    key: Option<String>,
    #[serde(alias = "agent")]
    agent_name: Option<String>,
    #[serde(alias = "role")]
    role_desc: Option<String>,
    command: Option<String>,
    instruction: Option<String>,
    input_template: Option<String>,
    style: Option<String>,
    #[serde(default)]
    is_code: bool,
    #[serde(default = "default_enabled")]
    enabled: bool,
    timeout: Option<u64>,
    max_input_chars: Option<u64>,
    max_output_chars: Option<u64>,
    max_context_chars: Option<u64>,
}

const fn default_enabled() -> bool {
    true
}

fn parse_step(raw: Value, position: usize) -> Result<Step> {
    if !raw.is_object() {
        return Err(Error::Config(format!(
            "step #{position} is invalid: expected a JSON object"
        )));
    }
    let raw: RawStep = serde_json::from_value(raw)
        .map_err(|e| Error::Config(format!("step #{position} is invalid: {e}")))?;

    let required = |value: Option<String>, field: &str| -> Result<String> {
        let value = value.ok_or_else(|| {
            Error::Config(format!("missing required field '{field}' in step #{position}"))
        })?;
        let cleaned = value.trim();
        if cleaned.is_empty() {
            return Err(Error::Config(format!(
                "field '{field}' in step #{position} cannot be empty"
            )));
        }
        Ok(cleaned.to_string())
    };
    let optional = |value: Option<String>| {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let positive = |value: Option<u64>, field: &str| -> Result<Option<u64>> {
        match value {
            Some(0) => Err(Error::Config(format!(
                "field '{field}' in step #{position} must be greater than zero"
            ))),
            other => Ok(other),
        }
    };

    let command = required(raw.command, "command")?;
    validate_command(&command, position)?;

    let chars = |value: Option<u64>, field: &str| -> Result<Option<usize>> {
        Ok(positive(value, field)?.map(|n| usize::try_from(n).unwrap_or(usize::MAX)))
    };

    Ok(Step {
        key: optional(raw.key).unwrap_or_else(|| format!("step_{position}")),
        agent_name: required(raw.agent_name, "agent_name")?,
        role_desc: required(raw.role_desc, "role_desc")?,
        command,
        instruction: required(raw.instruction, "instruction")?,
        input_template: optional(raw.input_template)
            .unwrap_or_else(|| DEFAULT_INPUT_TEMPLATE.to_string()),
        style: optional(raw.style).unwrap_or_else(|| DEFAULT_STYLE.to_string()),
        is_code: raw.is_code,
        enabled: raw.enabled,
        timeout_secs: positive(raw.timeout, "timeout")?.unwrap_or(DEFAULT_TIMEOUT_SECS),
        max_input_chars: chars(raw.max_input_chars, "max_input_chars")?,
        max_output_chars: chars(raw.max_output_chars, "max_output_chars")?,
        max_context_chars: chars(raw.max_context_chars, "max_context_chars")?,
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn minimal_step(extra: &str) -> String {
        format!(concat!(
            r#"{{"agent": "Claude", "role": "Planning", "command": "claude -p", "#,
            r#""instruction": "Plan"{extra}}}"#
        ), extra = extra)
    }

    #[test]
    fn parses_list_and_object_forms() {
        let list = format!("[{}]", minimal_step(""));
        let object = format!(r#"{{"steps": [{}]}}"#, minimal_step(""));
        for content in [list, object] {
            let steps = parse_flow(&content).unwrap();
            assert_eq!(steps.len(), 1);
            assert_eq!(steps[0].key, "step_1");
            assert_eq!(steps[0].agent_name, "Claude");
            assert_eq!(steps[0].input_template, DEFAULT_INPUT_TEMPLATE);
            assert_eq!(steps[0].timeout_secs, DEFAULT_TIMEOUT_SECS);
            assert!(steps[0].enabled);
            assert!(!steps[0].is_code);
        }
    }

    #[test]
    fn parses_optional_fields() {
        let content = format!(
            "[{}]",
            minimal_step(
                r#", "id": "plan", "timeout": 45, "is_code": true, "enabled": false,
                   "max_input_chars": 10, "max_output_chars": 20, "max_context_chars": 30,
                   "input_template": "{user_prompt}", "style": "green""#
            )
        );
        let step = &parse_flow(&content).unwrap()[0];
        assert_eq!(step.key, "plan");
        assert_eq!(step.timeout_secs, 45);
        assert!(step.is_code);
        assert!(!step.enabled);
        assert_eq!(step.max_input_chars, Some(10));
        assert_eq!(step.max_output_chars, Some(20));
        assert_eq!(step.max_context_chars, Some(30));
        assert_eq!(step.input_template, "{user_prompt}");
        assert_eq!(step.style, "green");
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(parse_flow("not json").is_err());
        assert!(parse_flow(r#"{"flow": []}"#).is_err());
        assert!(parse_flow("[]").is_err());
        assert!(parse_flow("[1]").is_err());
    }

    #[test]
    fn rejects_missing_and_empty_fields() {
        let err = parse_flow(r#"[{"agent": "A", "role": "R", "instruction": "I"}]"#).unwrap_err();
        assert!(err.to_string().contains("'command'"));
        let err = parse_flow(
            r#"[{"agent": "  ", "role": "R", "command": "claude", "instruction": "I"}]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot be empty"));
    }

    #[test]
    fn rejects_non_positive_numbers_and_wrong_types() {
        for extra in [
            r#", "timeout": 0"#,
            r#", "timeout": -5"#,
            r#", "max_output_chars": 0"#,
            r#", "enabled": "yes""#,
            r#", "timeout": true"#,
        ] {
            let content = format!("[{}]", minimal_step(extra));
            assert!(parse_flow(&content).is_err(), "{extra}");
        }
    }

    #[test]
    fn rejects_disallowed_commands() {
        let content =
            r#"[{"agent": "A", "role": "R", "command": "claude -p; rm x", "instruction": "I"}]"#;
        let err = parse_flow(content).unwrap_err();
        assert!(err.to_string().contains("step #1"));
    }

    #[test]
    fn rejects_unresolvable_template_reference() {
        let content = format!("[{}]", minimal_step(r#", "input_template": "{later}""#));
        let err = parse_flow(&content).unwrap_err();
        assert!(err.to_string().contains("'later'"));
    }

    #[test]
    fn resolution_prefers_cli_then_env_then_cwd_then_user() {
        let dir = tempfile::TempDir::new().unwrap();
        let cli = dir.path().join("cli.json");
        let env = dir.path().join("env.json");
        let user = dir.path().join("user.json");
        for p in [&cli, &env, &user] {
            std::fs::write(p, "[]").unwrap();
        }
        let cwd = dir.path().join("cwd");
        std::fs::create_dir(&cwd).unwrap();

        let r = resolve_flow_config_with(
            cli.to_str(),
            env.to_str(),
            &cwd,
            Some(user.as_path()),
        )
        .unwrap();
        assert_eq!(r.source, FlowSource::Cli);

        let r = resolve_flow_config_with(None, env.to_str(), &cwd, Some(user.as_path())).unwrap();
        assert_eq!(r.source, FlowSource::Env);

        let r = resolve_flow_config_with(None, None, &cwd, Some(user.as_path())).unwrap();
        assert_eq!(r.source, FlowSource::User);

        std::fs::write(cwd.join(FLOW_FILE_NAME), "[]").unwrap();
        let r = resolve_flow_config_with(None, Some("  "), &cwd, Some(user.as_path())).unwrap();
        assert_eq!(r.source, FlowSource::Cwd);

        let empty = dir.path().join("empty");
        std::fs::create_dir(&empty).unwrap();
        let r = resolve_flow_config_with(None, None, &empty, None).unwrap();
        assert_eq!(r.source, FlowSource::Default);
        assert!(r.path.is_none());
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = resolve_flow_config_with(Some("/nonexistent/flow.json"), None, dir.path(), None)
            .unwrap_err();
        assert!(err.to_string().contains("--flow-config"));
        let err =
            resolve_flow_config_with(dir.path().to_str(), None, dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("not a file"));
    }

    #[test]
    fn default_source_loads_builtin_flow() {
        let steps = load_flow_steps(&ResolvedFlowConfig {
            path: None,
            source: FlowSource::Default,
        })
        .unwrap();
        assert_eq!(steps.len(), 5);
    }

    #[test]
    fn load_reports_file_path_on_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("flow.json");
        std::fs::write(&path, "[]").unwrap();
        let err = load_flow_steps(&ResolvedFlowConfig {
            path: Some(path.clone()),
            source: FlowSource::Cli,
        })
        .unwrap_err();
        assert!(err.to_string().contains(&path.display().to_string()));
    }
}
