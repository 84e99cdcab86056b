mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use chat_relay::config::ResponseSource;
use chat_relay::delta::{FunctionCallRecord, StreamRecord};
use chat_relay::router::AuthConfig;
use serde_json::json;
use std::time::Duration;

use common::*;

const WAIT: Duration = Duration::from_secs(3);

fn snapshot(body: &str, done: bool) -> StreamRecord {
    StreamRecord {
        body: body.to_string(),
        done,
        ..StreamRecord::default()
    }
}

#[tokio::test]
async fn json_completion_returns_page_text() {
    let test = TestApp::new(ScriptedAutomation::with_replies(vec![Reply::Text(
        "Hello from the page".to_string(),
    )]));

    let (status, body) = post_chat(&test.app, chat_body(false, "hello")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], "chat.completion");
    assert!(body["id"].as_str().expect("id").starts_with("chatcmpl-"));
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello from the page");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(body["choices"][0]["message"].get("tool_calls").is_none());
    assert!(body["usage"]["completion_tokens"].as_u64().expect("usage") > 0);
    assert_eq!(
        body["usage"]["total_tokens"].as_u64(),
        Some(
            body["usage"]["prompt_tokens"].as_u64().unwrap_or_default()
                + body["usage"]["completion_tokens"].as_u64().unwrap_or_default()
        )
    );

    let automation = test.automation.clone();
    wait_until(WAIT, || automation.count(|call| matches!(call, Call::Clear)) == 1).await;
    let calls = automation.calls();
    assert!(matches!(&calls[0], Call::Submit(text) if text.contains("hello")));
    assert!(calls.contains(&Call::GetResponse));
    assert_eq!(calls.last(), Some(&Call::Clear));
}

#[tokio::test]
async fn aux_stream_snapshots_become_sse_deltas() {
    let mut config = test_config();
    config.response_source = ResponseSource::AuxStream;
    let test = TestApp::with_config(ScriptedAutomation::new(), config, AuthConfig::disabled());

    for record in [json!({"body": "Hi"}), json!({"body": "Hi there", "done": true})] {
        let (status, _) =
            send_json(&test.app, Method::POST, "/internal/stream", Some(record)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let (status, headers, body) = send(&test.app, chat_request(&chat_body(true, "hello"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream")));

    let data = sse_data(&body);
    assert_eq!(data.len(), 4, "unexpected events: {data:?}");
    assert_eq!(data[3], "[DONE]");

    let chunks = sse_chunks(&body);
    assert_eq!(chunks[0]["object"], "chat.completion.chunk");
    assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "Hi");
    assert!(chunks[0]["choices"][0]["finish_reason"].is_null());
    assert_eq!(chunks[1]["choices"][0]["delta"]["content"], " there");
    assert_eq!(chunks[1]["choices"][0]["finish_reason"], "stop");
    assert!(chunks[2]["usage"]["total_tokens"].as_u64().expect("usage") > 0);
    assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
    let ids: Vec<_> = chunks.iter().map(|chunk| chunk["id"].clone()).collect();
    assert!(ids.iter().all(|id| id == &ids[0]));

    assert_eq!(test.automation.count(|call| matches!(call, Call::GetResponse)), 0);
}

#[tokio::test]
async fn page_text_is_replayed_as_pseudo_stream() {
    let text = "first line of the answer\nsecond line";
    let test = TestApp::new(ScriptedAutomation::with_replies(vec![Reply::Text(
        text.to_string(),
    )]));

    let (status, _, body) = send(&test.app, chat_request(&chat_body(true, "hello"))).await;
    assert_eq!(status, StatusCode::OK);
    let chunks = sse_chunks(&body);
    assert!(chunks.len() > 3, "expected several deltas, got {}", chunks.len());
    assert_eq!(streamed_content(&chunks), text);
    assert_eq!(sse_data(&body).last().map(String::as_str), Some("[DONE]"));

    wait_until(WAIT, || {
        test.automation.count(|call| matches!(call, Call::Clear)) == 1
    })
    .await;
}

#[tokio::test]
async fn page_stream_records_are_diffed() {
    let test = TestApp::new(ScriptedAutomation::with_replies(vec![Reply::Records(vec![
        snapshot("The", false),
        snapshot("The answer", false),
        // A shrinking snapshot contributes nothing.
        snapshot("The", false),
        snapshot("The answer is 42", true),
    ])]));

    let (status, _, body) = send(&test.app, chat_request(&chat_body(true, "question"))).await;
    assert_eq!(status, StatusCode::OK);
    let chunks = sse_chunks(&body);
    assert_eq!(streamed_content(&chunks), "The answer is 42");
    let finishes: Vec<_> = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["finish_reason"].as_str())
        .collect();
    assert_eq!(finishes, vec!["stop", "stop"]);
}

#[tokio::test]
async fn function_calls_become_tool_calls() {
    let record = StreamRecord {
        body: String::new(),
        done: true,
        function_calls: vec![FunctionCallRecord {
            name: "get_weather".to_string(),
            params: json!({"city": "Paris"}),
        }],
        ..StreamRecord::default()
    };
    let test = TestApp::new(ScriptedAutomation::with_replies(vec![Reply::Records(vec![
        record,
    ])]));

    let (status, body) = post_chat(&test.app, chat_body(false, "weather?")).await;
    assert_eq!(status, StatusCode::OK);
    let message = &body["choices"][0]["message"];
    assert!(message["content"].is_null());
    assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
    let call = &message["tool_calls"][0];
    assert_eq!(call["type"], "function");
    assert!(call["id"].as_str().expect("id").starts_with("call_"));
    assert_eq!(call["function"]["name"], "get_weather");
    let arguments: serde_json::Value =
        serde_json::from_str(call["function"]["arguments"].as_str().expect("arguments"))
            .expect("arguments json");
    assert_eq!(arguments, json!({"city": "Paris"}));
}

#[tokio::test]
async fn streamed_function_calls_finish_with_tool_calls() {
    let test = TestApp::new(ScriptedAutomation::with_replies(vec![Reply::Records(vec![
        snapshot("Checking", false),
        StreamRecord {
            body: "Checking now".to_string(),
            done: true,
            function_calls: vec![FunctionCallRecord {
                name: "lookup".to_string(),
                params: serde_json::Value::Null,
            }],
            ..StreamRecord::default()
        },
    ])]));

    let (_, _, body) = send(&test.app, chat_request(&chat_body(true, "go"))).await;
    let chunks = sse_chunks(&body);
    assert_eq!(streamed_content(&chunks), "Checking now");
    let tool_chunk = chunks
        .iter()
        .find(|chunk| chunk["choices"][0]["delta"]["tool_calls"].is_array())
        .expect("tool call chunk");
    assert_eq!(tool_chunk["choices"][0]["finish_reason"], "tool_calls");
    assert_eq!(
        tool_chunk["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
        "{}"
    );
    let usage = chunks.last().expect("usage chunk");
    assert_eq!(usage["choices"][0]["finish_reason"], "tool_calls");
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_queueing() {
    let test = TestApp::new(ScriptedAutomation::new());

    let (status, body) = post_chat(&test.app, json!({"messages": []})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_type(&body), Some("invalid_request"));

    let (status, _) = post_chat(
        &test.app,
        json!({"messages": [{"role": "system", "content": "be brief"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(test.automation.calls().is_empty());
    assert_eq!(test.relay.queue().len(), 0);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let test = TestApp::new(ScriptedAutomation::new());
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .expect("request");

    let (status, _, body) = send(&test.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_str(&body).expect("error body");
    assert_eq!(error_type(&body), Some("invalid_request"));
    assert!(test.automation.calls().is_empty());
}

#[tokio::test]
async fn upstream_failure_saves_snapshot() {
    let test = TestApp::new(ScriptedAutomation::with_replies(vec![Reply::Fail(
        "selector vanished".to_string(),
    )]));

    let (status, body) = post_chat(&test.app, chat_body(false, "hello")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(error_type(&body), Some("upstream_failure"));
    assert!(body["error"]["message"]
        .as_str()
        .expect("message")
        .contains("selector vanished"));

    let automation = test.automation.clone();
    wait_until(WAIT, || automation.count(|call| matches!(call, Call::Clear)) == 1).await;
    let calls = automation.calls();
    let snapshot = calls
        .iter()
        .find_map(|call| match call {
            Call::Snapshot(tag) => Some(tag.clone()),
            _ => None,
        })
        .expect("snapshot saved");
    assert!(snapshot.starts_with("nonstream_wait_"));
    // The prompt went out, so the page is still reset.
    assert_eq!(calls.last(), Some(&Call::Clear));
}

#[tokio::test]
async fn page_not_ready_is_unavailable() {
    let automation = ScriptedAutomation::new();
    automation.set_ready(false);
    let test = TestApp::new(automation);

    let (status, headers, body) = send(&test.app, chat_request(&chat_body(false, "hello"))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        headers.get(header::RETRY_AFTER).and_then(|value| value.to_str().ok()),
        Some("30")
    );
    let body: serde_json::Value = serde_json::from_str(&body).expect("error body");
    assert_eq!(error_type(&body), Some("service_unavailable"));
    assert!(!test.automation.calls().iter().any(|call| matches!(call, Call::Submit(_))));
}
