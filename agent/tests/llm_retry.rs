//! Model client retry behaviour against a scripted HTTP server.
//!
//! Only the connection and initial status are retried. A stream that breaks
//! after a success status is surfaced once and never re-requested.

use serde_json::{Value, json};
use setup_agent::core::retry::RetryConfig;
use setup_agent::core::types::{ContentBlock, Message, StopReason};
use setup_agent::llm::{Auth, ClientSettings, LlmClient, LlmError, ModelClient, ModelRequest, StreamEvent};
use setup_agent::test_support::{MockHttpServer, MockResponse, sse_body, sse_text_turn};

fn client(server: &MockHttpServer, auth: Auth, stream: bool) -> LlmClient {
    LlmClient::new(ClientSettings {
        base_url: server.base_url(),
        model: "test-model".to_string(),
        max_tokens: 256,
        stream,
        auth,
        retry: RetryConfig::for_tests(),
    })
    .expect("client")
}

fn direct() -> Auth {
    Auth::Direct {
        api_key: "sk-test".to_string(),
    }
}

fn request() -> ModelRequest {
    ModelRequest {
        system: "You are a setup agent.".to_string(),
        messages: vec![Message::user_text("Begin.")],
        tools: Vec::new(),
    }
}

async fn send(client: &LlmClient) -> (Result<setup_agent::core::types::ModelResponse, LlmError>, Vec<StreamEvent>) {
    let mut events = Vec::new();
    let result = client
        .send(&request(), &mut |event: &StreamEvent| events.push(event.clone()))
        .await;
    (result, events)
}

fn overloaded() -> MockResponse {
    MockResponse::json(
        529,
        json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
    )
}

#[tokio::test]
async fn retryable_statuses_are_retried_until_success() {
    for status in [429u16, 500, 502, 503, 504, 529] {
        let server = MockHttpServer::start(vec![
            MockResponse::status(status),
            MockResponse::sse(sse_body(&sse_text_turn("ready"))),
        ])
        .await;
        let (result, events) = send(&client(&server, direct(), true)).await;

        let response = result.unwrap_or_else(|err| panic!("status {status}: {err}"));
        assert_eq!(response.text(), "ready");
        assert_eq!(server.request_count(), 2, "status {status}");
        assert_eq!(retry_attempts(&events), [2], "status {status}");
    }
}

fn retry_attempts(events: &[StreamEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Retrying { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn success_on_the_last_allowed_attempt() {
    let server = MockHttpServer::start(vec![
        overloaded(),
        overloaded(),
        overloaded(),
        MockResponse::sse(sse_body(&sse_text_turn("finally"))),
    ])
    .await;
    let (result, events) = send(&client(&server, direct(), true)).await;

    assert_eq!(result.expect("response").text(), "finally");
    assert_eq!(server.request_count(), 4);
    assert_eq!(retry_attempts(&events), [2, 3, 4]);
}

#[tokio::test]
async fn unreachable_provider_exhausts_retries() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let client = LlmClient::new(ClientSettings {
        base_url: format!("http://127.0.0.1:{port}"),
        model: "test-model".to_string(),
        max_tokens: 256,
        stream: true,
        auth: direct(),
        retry: RetryConfig::for_tests(),
    })
    .expect("client");
    let (result, events) = send(&client).await;

    let err = result.expect_err("nothing listening");
    let LlmError::RetryExhausted { attempts, last } = &err else {
        panic!("expected exhaustion, got {err:?}");
    };
    assert_eq!(*attempts, RetryConfig::for_tests().max_attempts());
    assert!(matches!(last.as_ref(), LlmError::Transport(_)));
    assert_eq!(retry_attempts(&events), [2, 3, 4]);
    assert!(err.user_message().contains("Check your network connection"));
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    for status in [400u16, 401, 403, 404] {
        let server = MockHttpServer::start(vec![MockResponse::json(
            status,
            json!({"type": "error", "error": {"type": "invalid_request_error", "message": "nope"}}),
        )])
        .await;
        let (result, _) = send(&client(&server, direct(), true)).await;

        match result {
            Err(LlmError::Api { status: got, message }) => {
                assert_eq!(got, status);
                assert_eq!(message, "invalid_request_error: nope");
            }
            other => panic!("status {status}: expected api error, got {other:?}"),
        }
        assert_eq!(server.request_count(), 1, "status {status}");
    }
}

#[tokio::test]
async fn retries_stop_after_max_attempts() {
    let server = MockHttpServer::start((0..6).map(|_| overloaded()).collect()).await;
    let (result, events) = send(&client(&server, direct(), true)).await;

    let err = result.expect_err("exhausted");
    let LlmError::RetryExhausted { attempts, last } = &err else {
        panic!("expected exhaustion, got {err:?}");
    };
    assert_eq!(*attempts, RetryConfig::for_tests().max_attempts());
    assert!(matches!(last.as_ref(), LlmError::Api { status: 529, .. }));
    assert_eq!(server.request_count(), 4);
    assert!(err.user_message().contains("temporarily unavailable"));
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, StreamEvent::Retrying { .. }))
            .count(),
        3
    );
}

#[tokio::test]
async fn truncated_stream_is_not_retried() {
    let mut events = sse_text_turn("partial");
    events.truncate(3);
    let server = MockHttpServer::start(vec![
        MockResponse::sse(sse_body(&events)),
        MockResponse::sse(sse_body(&sse_text_turn("second"))),
    ])
    .await;
    let (result, _) = send(&client(&server, direct(), true)).await;

    assert!(matches!(result, Err(LlmError::Stream(message)) if message.contains("message_stop")));
    assert_eq!(server.request_count(), 1);
}

#[tokio::test]
async fn streamed_tool_use_is_assembled() {
    let events = vec![
        json!({"type": "message_start", "message": {"id": "msg_1", "usage": {"input_tokens": 12, "output_tokens": 1}}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "tu_1", "name": "read_file", "input": {}}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"path\": \"pack"}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "age.json\"}"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "tu_2", "name": "list_files", "input": {}}}),
        json!({"type": "content_block_stop", "index": 1}),
        json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 20}}),
        json!({"type": "message_stop"}),
    ];
    let server = MockHttpServer::start(vec![MockResponse::sse(sse_body(&events))]).await;
    let (result, _) = send(&client(&server, direct(), true)).await;

    let response = result.expect("response");
    assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    let calls = response.tool_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].input, json!({"path": "package.json"}));
    // Empty partial input normalises to an object.
    assert_eq!(calls[1].input, json!({}));
    assert!(matches!(&response.content[0], ContentBlock::ToolUse { id, .. } if id == "tu_1"));
}

#[tokio::test]
async fn json_responses_are_decoded_whole() {
    let body = json!({
        "id": "msg_json",
        "content": [{"type": "text", "text": "plain"}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 3, "output_tokens": 2}
    });
    let server = MockHttpServer::start(vec![MockResponse::json(200, body)]).await;
    let (result, _) = send(&client(&server, direct(), false)).await;

    let response = result.expect("response");
    assert_eq!(response.text(), "plain");
    assert_eq!(response.usage.total(), 5);
    let sent: Value = serde_json::from_str(&server.requests()[0].body).expect("request json");
    assert_eq!(sent["stream"], false);
    assert_eq!(sent["model"], "test-model");
}

#[tokio::test]
async fn auth_modes_send_their_headers() {
    let server = MockHttpServer::start(vec![
        MockResponse::sse(sse_body(&sse_text_turn("a"))),
        MockResponse::sse(sse_body(&sse_text_turn("b"))),
    ])
    .await;

    send(&client(&server, direct(), true)).await.0.expect("direct");
    let proxied = Auth::Proxied {
        token: "proxy-token".to_string(),
        client_version: "0.1.0".to_string(),
    };
    send(&client(&server, proxied, true)).await.0.expect("proxied");

    let requests = server.requests();
    assert_eq!(requests[0].path, "/v1/messages");
    assert_eq!(requests[0].header("x-api-key"), Some("sk-test"));
    assert!(requests[0].header("anthropic-version").is_some());
    assert!(requests[0].header("authorization").is_none());

    assert_eq!(requests[1].header("authorization"), Some("Bearer proxy-token"));
    assert_eq!(requests[1].header("x-setup-agent-version"), Some("0.1.0"));
    assert!(requests[1].header("x-api-key").is_none());
}
