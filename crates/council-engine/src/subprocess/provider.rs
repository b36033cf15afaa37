//! In-process HTTP providers for API-only agents.
//!
//! A step whose binary is registered here never spawns a child: the runner
//! hands the payload to the provider and treats the response body like
//! captured stdout.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use council_core::prerequisites::DEEPSEEK_API_BASE_URL;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ExecError;

pub const DEEPSEEK_API_KEY_ENV_VAR: &str = "DEEPSEEK_API_KEY";
pub const DEEPSEEK_BASE_URL_ENV_VAR: &str = "DEEPSEEK_BASE_URL";
pub const DEFAULT_DEEPSEEK_MODEL: &str = "deepseek-chat";

const ERROR_BODY_EXCERPT_CHARS: usize = 500;
/// Largest response body read from a provider. The body is JSON and must be
/// parsed whole before the output cap can apply, so it gets a hard ceiling.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

pub type ProviderFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ExecError>> + Send + 'a>>;

/// One request/response exchange standing in for a subprocess.
pub trait HttpProvider: Send + Sync {
    /// `argv` is the tokenized step command, `payload` the rendered input.
    fn complete<'a>(&'a self, argv: &'a [String], payload: &'a str) -> ProviderFuture<'a>;
}

/// Providers keyed by the binary name they serve.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn HttpProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut binaries: Vec<_> = self.providers.keys().collect();
        binaries.sort();
        f.debug_struct("ProviderRegistry")
            .field("binaries", &binaries)
            .finish()
    }
}

impl ProviderRegistry {
    /// Registry with no providers: every command spawns a child.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry serving `deepseek` from the environment's credentials.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("deepseek", Arc::new(DeepSeekProvider::from_env()));
        registry
    }

    pub fn register(&mut self, binary: impl Into<String>, provider: Arc<dyn HttpProvider>) {
        self.providers.insert(binary.into(), provider);
    }

    pub fn get(&self, binary: &str) -> Option<Arc<dyn HttpProvider>> {
        self.providers.get(binary).cloned()
    }
}

/// OpenAI-compatible chat completions client for DeepSeek.
#[derive(Debug, Clone)]
pub struct DeepSeekProvider {
    base_url: String,
    api_key: Option<String>,
    max_response_bytes: usize,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatContent,
}

#[derive(Deserialize)]
struct ChatContent {
    #[serde(default)]
    content: Option<String>,
}

impl DeepSeekProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }

    #[must_use]
    pub const fn with_max_response_bytes(mut self, max_bytes: usize) -> Self {
        self.max_response_bytes = max_bytes;
        self
    }

    /// Reads `DEEPSEEK_API_KEY` and `DEEPSEEK_BASE_URL`.
    pub fn from_env() -> Self {
        let base_url = std::env::var(DEEPSEEK_BASE_URL_ENV_VAR)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEEPSEEK_API_BASE_URL.to_string());
        let api_key = std::env::var(DEEPSEEK_API_KEY_ENV_VAR).ok();
        Self::new(base_url, api_key)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn chat(&self, argv: &[String], payload: &str) -> Result<String, ExecError> {
        let api_key = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ExecError::InvalidConfiguration(format!(
                    "{DEEPSEEK_API_KEY_ENV_VAR} is not set; it is required for deepseek steps"
                ))
            })?;
        let model = model_from_argv(argv).unwrap_or(DEFAULT_DEEPSEEK_MODEL);

        // reqwest is built with rustls-no-provider; Err only means a provider
        // is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ExecError::SystemError(format!("HTTP client setup failed: {e}")))?;

        let body = ChatRequest {
            model,
            messages: [ChatMessage {
                role: "user",
                content: payload,
            }],
            stream: false,
        };
        debug!(url = %self.endpoint(), model, "Sending DeepSeek chat request");

        let resp = http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExecError::SystemError(format!("DeepSeek request failed: {e}")))?;
        let status = resp.status();
        let body = read_body_capped(resp, self.max_response_bytes).await;

        if !status.is_success() {
            warn!(status = status.as_u16(), "DeepSeek request rejected");
            let excerpt = body
                .map(|bytes| {
                    String::from_utf8_lossy(&bytes)
                        .chars()
                        .take(ERROR_BODY_EXCERPT_CHARS)
                        .collect::<String>()
                })
                .unwrap_or_default();
            return Err(ExecError::NonZeroExit {
                command: argv.join(" "),
                code: i32::from(status.as_u16()),
                stderr: excerpt,
            });
        }

        let parsed: ChatResponse = serde_json::from_slice(&body?)
            .map_err(|e| ExecError::SystemError(format!("Unexpected DeepSeek response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExecError::SystemError("DeepSeek response has no content".into()))
    }
}

impl HttpProvider for DeepSeekProvider {
    fn complete<'a>(&'a self, argv: &'a [String], payload: &'a str) -> ProviderFuture<'a> {
        Box::pin(self.chat(argv, payload))
    }
}

/// Read the whole body, failing as soon as it grows past `max_bytes`.
async fn read_body_capped(
    mut resp: reqwest::Response,
    max_bytes: usize,
) -> Result<Vec<u8>, ExecError> {
    let too_large = || {
        ExecError::SystemError(format!(
            "DeepSeek response exceeds the {max_bytes}-byte limit"
        ))
    };
    if resp
        .content_length()
        .is_some_and(|len| len > u64::try_from(max_bytes).unwrap_or(u64::MAX))
    {
        return Err(too_large());
    }

    let mut body = Vec::new();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| ExecError::SystemError(format!("DeepSeek response unreadable: {e}")))?
    {
        if body.len() + chunk.len() > max_bytes {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// `--model <m>` or `--model=<m>`.
fn model_from_argv(argv: &[String]) -> Option<&str> {
    let mut args = argv.iter().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--model" {
            return args.next().map(String::as_str).filter(|m| !m.is_empty());
        }
        if let Some(model) = arg.strip_prefix("--model=") {
            return Some(model).filter(|m| !m.is_empty());
        }
    }
    None
}
