//! HTTP client for the model provider's messages endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::core::retry::RetryConfig;
use crate::core::types::ModelResponse;
use crate::llm::error::LlmError;
use crate::llm::sse::{ResponseAssembler, SseDecoder};
use crate::llm::{ModelClient, ModelRequest, StreamEvent};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const CLIENT_VERSION_HEADER: &str = "x-setup-agent-version";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_BODY_LIMIT: usize = 500;

/// How requests are authenticated. Only header logic differs between modes.
#[derive(Clone)]
pub enum Auth {
    /// API key sent in the provider's custom header.
    Direct { api_key: String },
    /// Bearer token for a proxy, plus client-version metadata.
    Proxied {
        token: String,
        client_version: String,
    },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct { .. } => f.write_str("Auth::Direct"),
            Self::Proxied { client_version, .. } => {
                write!(f, "Auth::Proxied({client_version})")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub stream: bool,
    pub auth: Auth,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    endpoint: String,
    settings: ClientSettings,
}

impl LlmClient {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("build http client")?;
        let endpoint = format!("{}/v1/messages", settings.base_url.trim_end_matches('/'));
        Ok(Self {
            http,
            endpoint,
            settings,
        })
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    fn request_body(&self, request: &ModelRequest) -> Value {
        json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "system": request.system,
            "messages": request.messages,
            "tools": request.tools,
            "stream": self.settings.stream,
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, reqwest::Error> {
        let mut builder = self.http.post(&self.endpoint).json(body);
        builder = match &self.settings.auth {
            Auth::Direct { api_key } => builder
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            Auth::Proxied {
                token,
                client_version,
            } => builder
                .bearer_auth(token)
                .header(CLIENT_VERSION_HEADER, client_version),
        };
        builder.send().await
    }

    /// Connect with retries. Only the connection and initial status are
    /// retried; once a success status arrives the body is never re-requested.
    async fn connect(
        &self,
        body: &Value,
        on_event: &mut (dyn FnMut(&StreamEvent) + Send),
    ) -> Result<reqwest::Response, LlmError> {
        let retry = &self.settings.retry;
        let attempts = retry.max_attempts();
        let mut last: Option<LlmError> = None;
        for attempt in 0..attempts {
            if let Some(reason) = &last {
                let delay = retry.backoff(attempt - 1);
                warn!(attempt = attempt + 1, ?delay, error = %reason, "retrying model request");
                on_event(&StreamEvent::Retrying {
                    attempt: attempt + 1,
                    delay,
                    reason: reason.to_string(),
                });
                tokio::time::sleep(delay).await;
            }

            let err = match self.post(body).await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    LlmError::Api {
                        status,
                        message: error_message(&text),
                    }
                }
                Err(err) => LlmError::Transport(err.to_string()),
            };
            debug!(attempt = attempt + 1, error = %err, "model request failed");
            if !err.is_retryable() {
                return Err(err);
            }
            last = Some(err);
        }
        Err(LlmError::RetryExhausted {
            attempts,
            last: Box::new(last.unwrap_or_else(|| LlmError::Transport("no attempts made".into()))),
        })
    }

    async fn read_whole(response: reqwest::Response) -> Result<ModelResponse, LlmError> {
        let bytes = response
            .bytes()
            .await
            .map_err(|err| LlmError::Stream(format!("read response body: {err}")))?;
        let mut parsed: ModelResponse = serde_json::from_slice(&bytes)
            .map_err(|err| LlmError::Decode(format!("response json: {err}")))?;
        for block in &mut parsed.content {
            if let crate::core::types::ContentBlock::ToolUse { input, .. } = block
                && input.is_null()
            {
                *input = Value::Object(serde_json::Map::new());
            }
        }
        Ok(parsed)
    }

    async fn read_stream(
        response: reqwest::Response,
        on_event: &mut (dyn FnMut(&StreamEvent) + Send),
    ) -> Result<ModelResponse, LlmError> {
        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut assembler = ResponseAssembler::default();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| LlmError::Stream(format!("read stream: {err}")))?;
            for payload in decoder.push(&chunk) {
                for event in assembler.apply(&payload)? {
                    on_event(&event);
                }
            }
        }
        if let Some(payload) = decoder.finish() {
            for event in assembler.apply(&payload)? {
                on_event(&event);
            }
        }
        assembler.finish()
    }
}

#[async_trait]
impl ModelClient for LlmClient {
    #[instrument(skip_all, fields(model = %self.settings.model, messages = request.messages.len()))]
    async fn send(
        &self,
        request: &ModelRequest,
        on_event: &mut (dyn for<'e> FnMut(&'e StreamEvent) + Send),
    ) -> Result<ModelResponse, LlmError> {
        let body = self.request_body(request);
        let response = self.connect(&body, on_event).await?;
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/json"));
        if !self.settings.stream || is_json {
            return Self::read_whole(response).await;
        }
        Self::read_stream(response, on_event).await
    }
}

/// Pull a readable message out of a provider error body.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body)
        && let Some(error) = value.get("error")
    {
        let kind = error.get("type").and_then(Value::as_str).unwrap_or("error");
        let message = error.get("message").and_then(Value::as_str).unwrap_or("");
        return format!("{kind}: {message}");
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    trimmed.chars().take(ERROR_BODY_LIMIT).collect()
}
