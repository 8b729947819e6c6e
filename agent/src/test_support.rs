//! Test doubles and fixtures shared by unit and integration tests.
//!
//! Enabled for this crate's own tests and, through the `test-support` feature,
//! for the integration tests under `tests/`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::core::types::{ContentBlock, ModelResponse, StopReason, Usage};
use crate::events::{AgentEvent, EventSink};
use crate::llm::{LlmError, ModelClient, ModelRequest, StreamEvent};
use crate::tools::operator::{ConfirmDecision, ConfirmRequest, Operator};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A model turn that only speaks.
pub fn text_turn(text: &str) -> ModelResponse {
    ModelResponse {
        id: "msg_text".to_string(),
        content: vec![ContentBlock::text(text)],
        stop_reason: Some(StopReason::EndTurn),
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

/// A model turn requesting tools, given as `(id, name, input)`.
pub fn tool_turn(calls: &[(&str, &str, Value)]) -> ModelResponse {
    ModelResponse {
        id: "msg_tools".to_string(),
        content: calls
            .iter()
            .map(|(id, name, input)| ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: input.clone(),
            })
            .collect(),
        stop_reason: Some(StopReason::ToolUse),
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

/// A model turn calling `transition` with the given results.
pub fn transition_turn(id: &str, results: Value, notes: &str) -> ModelResponse {
    tool_turn(&[(id, "transition", json!({"results": results, "notes": notes}))])
}

/// Model client replaying queued turns in order.
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Result<ModelResponse, LlmError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<ModelResponse>) -> Self {
        Self::with_results(turns.into_iter().map(Ok).collect())
    }

    pub fn with_results(turns: Vec<Result<ModelResponse, LlmError>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.requests).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.turns).len()
    }

    /// Panics if any scripted turn was never consumed.
    pub fn assert_drained(&self) {
        let remaining = self.remaining();
        assert_eq!(remaining, 0, "scripted model has {remaining} unused turns");
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn send(
        &self,
        request: &ModelRequest,
        on_event: &mut (dyn for<'e> FnMut(&'e StreamEvent) + Send),
    ) -> Result<ModelResponse, LlmError> {
        lock(&self.requests).push(request.clone());
        let next = lock(&self.turns).pop_front();
        let response = next.unwrap_or_else(|| Err(LlmError::Stream("scripted model exhausted".into())))?;
        let text = response.text();
        if !text.is_empty() {
            on_event(&StreamEvent::TextDelta(text));
        }
        on_event(&StreamEvent::MessageComplete {
            stop_reason: response.stop_reason.clone(),
            usage: response.usage,
        });
        Ok(response)
    }
}

/// Operator answering from queues and recording what it was asked.
#[derive(Default)]
pub struct RecordingOperator {
    decisions: Mutex<VecDeque<ConfirmDecision>>,
    answers: Mutex<VecDeque<String>>,
    confirmations: Mutex<Vec<ConfirmRequest>>,
    questions: Mutex<Vec<String>>,
}

impl RecordingOperator {
    /// Allows every confirmation and has no answers queued.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decisions(self, decisions: impl IntoIterator<Item = ConfirmDecision>) -> Self {
        lock(&self.decisions).extend(decisions);
        self
    }

    pub fn with_answers<S: Into<String>>(self, answers: impl IntoIterator<Item = S>) -> Self {
        lock(&self.answers).extend(answers.into_iter().map(Into::into));
        self
    }

    pub fn confirmations(&self) -> Vec<ConfirmRequest> {
        lock(&self.confirmations).clone()
    }

    pub fn questions(&self) -> Vec<String> {
        lock(&self.questions).clone()
    }
}

#[async_trait]
impl Operator for RecordingOperator {
    async fn confirm(&self, request: &ConfirmRequest) -> Result<ConfirmDecision> {
        lock(&self.confirmations).push(request.clone());
        Ok(lock(&self.decisions)
            .pop_front()
            .unwrap_or(ConfirmDecision::Allow))
    }

    async fn ask(&self, question: &str) -> Result<String> {
        lock(&self.questions).push(question.to_string());
        lock(&self.answers)
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted answer for: {question}"))
    }
}

/// Event sink that keeps every event.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<AgentEvent>>>,
}

impl EventLog {
    pub fn sink(&self) -> EventSink {
        let events = Arc::clone(&self.events);
        Arc::new(move |event: &AgentEvent| lock(&events).push(event.clone()))
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        lock(&self.events).clone()
    }
}

/// One canned HTTP response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl MockResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain".to_string(),
            body: String::new(),
        }
    }

    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: body.to_string(),
        }
    }

    /// A `text/event-stream` body, closed after the last byte.
    pub fn sse(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/event-stream".to_string(),
            body: body.into(),
        }
    }
}

/// A request as seen by the mock server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Raw TCP HTTP/1.1 server replaying scripted responses, one per connection.
/// Once the script runs out it keeps answering 500.
pub struct MockHttpServer {
    addr: std::net::SocketAddr,
    count: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: tokio::task::JoinHandle<()>,
}

impl MockHttpServer {
    pub async fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock listener");
        let addr = listener.local_addr().expect("mock listener addr");
        let count = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(VecDeque::from(responses)));

        let task_count = Arc::clone(&count);
        let task_requests = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let Some(request) = read_request(&mut socket).await else {
                    continue;
                };
                task_count.fetch_add(1, Ordering::SeqCst);
                lock(&task_requests).push(request);
                let response = lock(&script)
                    .pop_front()
                    .unwrap_or_else(|| MockResponse::status(500));
                let _ = socket.write_all(&encode_response(&response)).await;
                let _ = socket.shutdown().await;
            }
        });

        Self {
            addr,
            count,
            requests,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn request_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    let length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body_end = buf.len().min(header_end + length);
    Some(RecordedRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&buf[header_end..body_end]).to_string(),
    })
}

fn encode_response(response: &MockResponse) -> Vec<u8> {
    let reason = match response.status {
        200 => "OK",
        302 => "Found",
        400 => "Bad Request",
        401 => "Unauthorized",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Status",
    };
    let framing = if response.content_type == "text/event-stream" {
        String::new()
    } else {
        format!("Content-Length: {}\r\n", response.body.len())
    };
    format!(
        "HTTP/1.1 {} {reason}\r\nContent-Type: {}\r\n{framing}Connection: close\r\n\r\n{}",
        response.status, response.content_type, response.body
    )
    .into_bytes()
}

/// Render provider stream events as an SSE body.
pub fn sse_body(events: &[Value]) -> String {
    events
        .iter()
        .map(|event| {
            let kind = event["type"].as_str().unwrap_or("message");
            format!("event: {kind}\ndata: {event}\n\n")
        })
        .collect()
}

/// Stream events for a complete text-only turn.
pub fn sse_text_turn(text: &str) -> Vec<Value> {
    vec![
        json!({"type": "message_start", "message": {"id": "msg_sse", "usage": {"input_tokens": 7, "output_tokens": 1}}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 3}}),
        json!({"type": "message_stop"}),
    ]
}

/// Temporary project directory with helpers for seeding files.
pub struct TestProject {
    dir: tempfile::TempDir,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, relative: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    pub fn read(&self, relative: &str) -> Result<String> {
        Ok(std::fs::read_to_string(self.dir.path().join(relative))?)
    }
}
