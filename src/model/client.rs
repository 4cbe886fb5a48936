//! Model client for OpenAI-style endpoints with calling-convention fallback.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::extract::{
    decide, parse_chat_reply, parse_completion_reply, parse_responses_reply, RawReply,
};
use super::messages::{chat_body, completions_body, responses_body, Sampling, StepContext};
use crate::actions::Action;
use crate::config::get_system_prompt;

/// Default number of retry attempts for failed requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retry attempts in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 2;

/// Model client errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Failed to parse response: {0}")]
    ParseError(String),
    #[error("Max retries exceeded after {0} attempts: {1}")]
    MaxRetriesExceeded(u32, String),
    #[error("All calling conventions failed: {0}")]
    AllModesFailed(String),
}

/// Calling convention of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    Chat,
    Responses,
    Completions,
}

impl CallMode {
    /// Order in which conventions are tried after the hinted one.
    pub const FALLBACK_ORDER: [CallMode; 3] =
        [CallMode::Chat, CallMode::Responses, CallMode::Completions];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallMode::Chat => "chat",
            CallMode::Responses => "responses",
            CallMode::Completions => "completions",
        }
    }

    /// Parse a mode name as used in settings and `MODEL_MODE`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "chat" | "chat_completions" => Some(CallMode::Chat),
            "responses" => Some(CallMode::Responses),
            "completions" | "completion" => Some(CallMode::Completions),
            _ => None,
        }
    }

    fn path(&self) -> &'static str {
        match self {
            CallMode::Chat => "chat/completions",
            CallMode::Responses => "responses",
            CallMode::Completions => "completions",
        }
    }

    /// The hinted mode first, then the rest in fallback order.
    pub fn attempt_order(hint: CallMode) -> Vec<CallMode> {
        std::iter::once(hint)
            .chain(Self::FALLBACK_ORDER.into_iter().filter(|m| *m != hint))
            .collect()
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one model profile.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub extra_body: Map<String, Value>,
    /// Maximum number of retry attempts per calling convention.
    pub max_retries: u32,
    /// Delay between retry attempts in seconds.
    pub retry_delay_secs: u64,
    /// Convention tried first until another one succeeds.
    pub preferred_mode: CallMode,
    /// Advertise one function tool per action.
    pub use_tools: bool,
    pub request_timeout_secs: u64,
    /// Prompt language, `en` or `cn`.
    pub lang: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            max_tokens: 1024,
            temperature: 0.0,
            top_p: 0.85,
            extra_body: Map::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            preferred_mode: CallMode::Chat,
            use_tools: false,
            request_timeout_secs: 120,
            lang: "en".to_string(),
        }
    }
}

impl ModelConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    /// Set the maximum number of retry attempts for failed requests.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between retry attempts in seconds.
    pub fn with_retry_delay(mut self, delay_secs: u64) -> Self {
        self.retry_delay_secs = delay_secs;
        self
    }

    pub fn with_preferred_mode(mut self, mode: CallMode) -> Self {
        self.preferred_mode = mode;
        self
    }

    pub fn with_tools(mut self, use_tools: bool) -> Self {
        self.use_tools = use_tools;
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    pub fn with_extra_body(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_body.insert(key.into(), value);
        self
    }
}

/// One decision obtained from the model.
#[derive(Debug, Clone)]
pub struct ModelDecision {
    pub thought: String,
    pub action: Action,
    /// Raw reply text, kept for logs.
    pub raw: String,
    /// Convention that produced it, `None` for synthesized decisions.
    pub mode: Option<CallMode>,
}

/// Source of per-step decisions.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn next_decision(&self, ctx: &StepContext<'_>) -> Result<ModelDecision, ModelError>;
}

/// Client for OpenAI-compatible endpoints.
///
/// Remembers which calling convention last worked and tries it first on the
/// next call.
pub struct ModelClient {
    config: ModelConfig,
    client: Client,
    mode_hint: Mutex<CallMode>,
}

impl ModelClient {
    /// Create a new ModelClient with the given configuration.
    pub fn new(config: ModelConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        let mode_hint = Mutex::new(config.preferred_mode);
        Self {
            config,
            client,
            mode_hint,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// The convention that will be tried first.
    pub fn mode_hint(&self) -> CallMode {
        match self.mode_hint.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_mode_hint(&self, mode: CallMode) {
        let mut guard = match self.mode_hint.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != mode {
            info!("Model endpoint mode hint changed: {} -> {}", *guard, mode);
            *guard = mode;
        }
    }

    fn build_body(&self, mode: CallMode, ctx: &StepContext<'_>) -> Value {
        let system = get_system_prompt(
            &self.config.lang,
            ctx.screen.0,
            ctx.screen.1,
            self.config.use_tools && mode != CallMode::Completions,
        );
        let sampling = Sampling {
            model: &self.config.model_name,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            extra_body: &self.config.extra_body,
        };
        match mode {
            CallMode::Chat => chat_body(&system, ctx, &sampling, self.config.use_tools),
            CallMode::Responses => responses_body(&system, ctx, &sampling, self.config.use_tools),
            CallMode::Completions => completions_body(&system, ctx, &sampling),
        }
    }

    /// Send one convention's request with the retry policy applied.
    async fn request(&self, mode: CallMode, body: &Value) -> Result<RawReply, ModelError> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), mode.path());

        let mut last_error: Option<ModelError> = None;
        let max_attempts = self.config.max_retries + 1;

        for attempt in 1..=max_attempts {
            match self.send_request(mode, &url, body).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    let is_retryable = Self::is_retryable_error(&e);

                    if attempt < max_attempts && is_retryable {
                        warn!(
                            "{} request failed (attempt {}/{}): {}; retrying in {}s",
                            mode, attempt, max_attempts, e, self.config.retry_delay_secs
                        );
                        sleep(Duration::from_secs(self.config.retry_delay_secs)).await;
                        last_error = Some(e);
                    } else if !is_retryable {
                        return Err(e);
                    } else {
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(ModelError::MaxRetriesExceeded(
            max_attempts,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }

    /// Transport errors, 5xx, 429, timeouts and rate limits are retryable.
    fn is_retryable_error(error: &ModelError) -> bool {
        match error {
            ModelError::RequestFailed(_) => true,
            ModelError::Http { status, body } => {
                let lower = body.to_lowercase();
                *status >= 500
                    || *status == 429
                    || lower.contains("timeout")
                    || lower.contains("rate limit")
            }
            ModelError::ParseError(_)
            | ModelError::MaxRetriesExceeded(_, _)
            | ModelError::AllModesFailed(_) => false,
        }
    }

    async fn send_request(
        &self,
        mode: CallMode,
        url: &str,
        body: &Value,
    ) -> Result<RawReply, ModelError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response.json().await?;
        let reply = match mode {
            CallMode::Chat => parse_chat_reply(&payload),
            CallMode::Responses => parse_responses_reply(&payload),
            CallMode::Completions => parse_completion_reply(&payload),
        };
        reply.ok_or_else(|| ModelError::ParseError(format!("unexpected {} response shape", mode)))
    }
}

#[async_trait]
impl DecisionProvider for ModelClient {
    async fn next_decision(&self, ctx: &StepContext<'_>) -> Result<ModelDecision, ModelError> {
        let hint = self.mode_hint();
        let mut failures = Vec::new();

        for mode in CallMode::attempt_order(hint) {
            let body = self.build_body(mode, ctx);
            match self.request(mode, &body).await {
                Ok(reply) => {
                    self.set_mode_hint(mode);
                    let (thought, action) = decide(&reply);
                    debug!("Model ({}) chose {}: {}", mode, action.tag(), thought);
                    return Ok(ModelDecision {
                        thought,
                        action,
                        raw: reply.text,
                        mode: Some(mode),
                    });
                }
                Err(e) => {
                    warn!("Model endpoint mode {} failed: {}", mode, e);
                    failures.push(format!("{}: {}", mode, e));
                }
            }
        }

        Err(ModelError::AllModesFailed(failures.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionKind;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn spawn_mock(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn test_config(base_url: String) -> ModelConfig {
        ModelConfig::default()
            .with_base_url(base_url)
            .with_max_retries(0)
            .with_retry_delay(0)
    }

    #[test]
    fn test_attempt_order() {
        assert_eq!(
            CallMode::attempt_order(CallMode::Responses),
            vec![CallMode::Responses, CallMode::Chat, CallMode::Completions]
        );
        assert_eq!(CallMode::attempt_order(CallMode::Chat), CallMode::FALLBACK_ORDER.to_vec());
        assert_eq!(CallMode::from_name("RESPONSES"), Some(CallMode::Responses));
        assert_eq!(CallMode::from_name("grpc"), None);
    }

    #[test]
    fn test_retryable_classification() {
        let busy = ModelError::Http { status: 503, body: String::new() };
        let limited = ModelError::Http { status: 400, body: "Rate limit exceeded".into() };
        let missing = ModelError::Http { status: 404, body: "not found".into() };
        assert!(ModelClient::is_retryable_error(&busy));
        assert!(ModelClient::is_retryable_error(&limited));
        assert!(!ModelClient::is_retryable_error(&missing));
        assert!(!ModelClient::is_retryable_error(&ModelError::ParseError("x".into())));
    }

    #[tokio::test]
    async fn test_fallback_updates_hint() {
        let chat_hits = Arc::new(AtomicUsize::new(0));
        let hits = chat_hits.clone();
        let router = Router::new()
            .route(
                "/chat/completions",
                post(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    async { (StatusCode::NOT_FOUND, "no chat here") }
                }),
            )
            .route(
                "/responses",
                post(|| async {
                    Json(json!({"output": [{
                        "type": "function_call",
                        "name": "tap",
                        "arguments": "{\"x\":10,\"y\":20,\"thought\":\"press it\"}"
                    }]}))
                }),
            );
        let base = spawn_mock(router).await;
        let client = ModelClient::new(test_config(base));
        assert_eq!(client.mode_hint(), CallMode::Chat);

        let ctx = StepContext::text_only("tap something", 1, 5, &[]);
        let decision = client.next_decision(&ctx).await.unwrap();
        assert_eq!(decision.mode, Some(CallMode::Responses));
        assert_eq!(decision.thought, "press it");
        assert_eq!(decision.action.kind, ActionKind::Tap { x: 10, y: 20 });
        assert_eq!(client.mode_hint(), CallMode::Responses);
        assert_eq!(chat_hits.load(Ordering::SeqCst), 1);

        // The hinted mode is tried first on the next call.
        client.next_decision(&ctx).await.unwrap();
        assert_eq!(chat_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_modes_failed_names_every_mode() {
        let base = spawn_mock(Router::new()).await;
        let client = ModelClient::new(test_config(base));
        let ctx = StepContext::text_only("anything", 1, 5, &[]);

        let err = client.next_decision(&ctx).await.unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, ModelError::AllModesFailed(_)));
        assert!(message.contains("chat: HTTP 404"));
        assert!(message.contains("responses: HTTP 404"));
        assert!(message.contains("completions: HTTP 404"));
        assert_eq!(client.mode_hint(), CallMode::Chat);
    }

    #[tokio::test]
    async fn test_retries_server_errors_within_mode() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/chat/completions",
            post(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "busy"})))
                    } else {
                        (
                            StatusCode::OK,
                            Json(json!({"choices": [{"message": {
                                "content": "```json\n{\"thought\":\"done\",\"type\":\"finish\",\"message\":\"ok\"}\n```"
                            }}]})),
                        )
                    }
                }
            }),
        );
        let base = spawn_mock(router).await;
        let client = ModelClient::new(test_config(base).with_max_retries(2));
        let ctx = StepContext::text_only("finish", 1, 5, &[]);

        let decision = client.next_decision(&ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(decision.mode, Some(CallMode::Chat));
        assert_eq!(decision.action.kind, ActionKind::Finish { message: "ok".into() });
    }
}
