mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use chat_relay::liveness::connection_pair;
use chat_relay::openai::ChatCompletionRequest;
use chat_relay::router::AuthConfig;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use common::*;

const WAIT: Duration = Duration::from_secs(3);

fn spawn_chat(test: &TestApp, body: Value) -> JoinHandle<(StatusCode, Value)> {
    let app = test.app.clone();
    tokio::spawn(async move { post_chat(&app, body).await })
}

fn submitted(automation: &ScriptedAutomation) -> Vec<String> {
    automation
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Submit(text) => Some(text),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn disconnect_while_waiting_resets_page() {
    let test = TestApp::new(ScriptedAutomation::with_replies(vec![Reply::UntilDisconnect]));

    let pending = spawn_chat(&test, chat_body(false, "slow"));
    let automation = test.automation.clone();
    wait_until(WAIT, || automation.count(|call| matches!(call, Call::GetResponse)) == 1).await;
    pending.abort();

    wait_until(WAIT, || automation.count(|call| matches!(call, Call::Clear)) == 1).await;
    assert_eq!(automation.count(|call| matches!(call, Call::Snapshot(_))), 0);

    let (status, body) = post_chat(&test.app, chat_body(false, "next")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["choices"][0]["message"]["content"], "ok");
}

#[tokio::test]
async fn dropped_stream_releases_page() {
    let test = TestApp::new(ScriptedAutomation::with_replies(vec![Reply::Hang]));
    let automation = test.automation.clone();
    let relay = test.relay.clone();

    let response = test
        .app
        .clone()
        .oneshot(chat_request(&chat_body(true, "endless")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    wait_until(WAIT, || automation.count(|call| matches!(call, Call::GetResponse)) == 1).await;
    assert!(relay.is_processing());

    drop(response);
    wait_until(WAIT, || automation.count(|call| matches!(call, Call::Clear)) == 1).await;
    wait_until(WAIT, || !relay.is_processing()).await;

    let (status, body) = post_chat(&test.app, chat_body(false, "next")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["choices"][0]["message"]["content"], "ok");
}

#[tokio::test]
async fn queued_request_with_departed_client_is_never_submitted() {
    let release = Arc::new(Notify::new());
    let test = TestApp::new(ScriptedAutomation::with_replies(vec![Reply::Hold(
        release.clone(),
        "first".to_string(),
    )]));

    let first = spawn_chat(&test, chat_body(false, "first"));
    let automation = test.automation.clone();
    wait_until(WAIT, || automation.count(|call| matches!(call, Call::GetResponse)) == 1).await;

    let second = spawn_chat(&test, chat_body(false, "second"));
    let relay = test.relay.clone();
    wait_until(WAIT, || relay.queue().len() == 1).await;
    second.abort();

    release.notify_one();
    let (status, _) = first.await.expect("first request");
    assert_eq!(status, StatusCode::OK);

    wait_until(WAIT, || relay.queue().is_empty()).await;
    let (status, _) = post_chat(&test.app, chat_body(false, "third")).await;
    assert_eq!(status, StatusCode::OK);
    let prompts = submitted(&automation);
    assert_eq!(prompts.len(), 2);
    assert!(prompts.iter().all(|prompt| !prompt.contains("second")));
}

#[tokio::test]
async fn requests_are_served_one_at_a_time_in_order() {
    let release = Arc::new(Notify::new());
    let test = TestApp::new(ScriptedAutomation::with_replies(vec![Reply::Hold(
        release.clone(),
        "alpha".to_string(),
    )]));
    let automation = test.automation.clone();
    let relay = test.relay.clone();

    let first = spawn_chat(&test, chat_body(false, "alpha"));
    wait_until(WAIT, || automation.count(|call| matches!(call, Call::GetResponse)) == 1).await;
    let second = spawn_chat(&test, chat_body(true, "bravo"));
    wait_until(WAIT, || relay.queue().len() == 1).await;
    let third = spawn_chat(&test, chat_body(false, "charlie"));
    wait_until(WAIT, || relay.queue().len() == 2).await;
    assert!(relay.is_processing());

    release.notify_one();
    for handle in [first, second, third] {
        let (status, _) = handle.await.expect("request");
        assert_eq!(status, StatusCode::OK);
    }

    let prompts = submitted(&automation);
    assert_eq!(prompts.len(), 3);
    for (prompt, expected) in prompts.iter().zip(["alpha", "bravo", "charlie"]) {
        assert!(prompt.contains(expected), "{prompt} should contain {expected}");
    }
    wait_until(WAIT, || automation.count(|call| matches!(call, Call::Clear)) == 3).await;
    assert_eq!(automation.max_in_flight(), 1);
}

#[tokio::test]
async fn consecutive_streaming_requests_are_spaced() {
    let mut config = test_config();
    config.min_stream_interval = Duration::from_millis(200);
    let test = TestApp::with_config(ScriptedAutomation::new(), config, AuthConfig::disabled());

    for _ in 0..2 {
        let (status, _, _) = send(&test.app, chat_request(&chat_body(true, "tick"))).await;
        assert_eq!(status, StatusCode::OK);
    }
    let automation = test.automation.clone();
    wait_until(WAIT, || automation.count(|call| matches!(call, Call::Clear)) == 2).await;

    let calls = automation.timed_calls();
    let first_clear = calls
        .iter()
        .find(|(call, _)| matches!(call, Call::Clear))
        .map(|(_, at)| *at)
        .expect("first clear");
    let second_submit = calls
        .iter()
        .filter(|(call, _)| matches!(call, Call::Submit(_)))
        .nth(1)
        .map(|(_, at)| *at)
        .expect("second submit");
    assert!(second_submit.duration_since(first_clear) >= Duration::from_millis(190));
}

#[tokio::test]
async fn shutdown_interrupts_pacing_delay() {
    let mut config = test_config();
    config.min_stream_interval = Duration::from_secs(30);
    let test = TestApp::with_config(ScriptedAutomation::new(), config, AuthConfig::disabled());
    let automation = test.automation.clone();
    let relay = test.relay.clone();

    let (status, _, _) = send(&test.app, chat_request(&chat_body(true, "first"))).await;
    assert_eq!(status, StatusCode::OK);
    wait_until(WAIT, || automation.count(|call| matches!(call, Call::Clear)) == 1).await;

    let paced = spawn_chat(&test, chat_body(true, "second"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(relay.queue().is_empty());
    tokio::time::timeout(WAIT, relay.shutdown())
        .await
        .expect("shutdown does not wait out the pacing delay");

    let (status, body) = paced.await.expect("paced request");
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_type(&body), Some("service_unavailable"));
    assert_eq!(submitted(&automation).len(), 1);
}

#[tokio::test]
async fn processing_timeout_returns_504_and_worker_recovers() {
    let mut config = test_config();
    config.response_timeout = Duration::from_millis(100);
    config.completion_slack = Duration::from_millis(100);
    let test = TestApp::with_config(
        ScriptedAutomation::with_replies(vec![Reply::Hang]),
        config,
        AuthConfig::disabled(),
    );

    let (status, body) = post_chat(&test.app, chat_body(false, "hang")).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(error_type(&body), Some("timeout"));

    let (status, body) = post_chat(&test.app, chat_body(false, "again")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["choices"][0]["message"]["content"], "ok");
    let automation = test.automation.clone();
    wait_until(WAIT, || automation.count(|call| matches!(call, Call::Clear)) == 2).await;
}

#[tokio::test]
async fn panic_during_processing_returns_500_and_worker_recovers() {
    let test = TestApp::new(ScriptedAutomation::with_replies(vec![Reply::Panic]));

    let (status, body) = post_chat(&test.app, chat_body(false, "boom")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_type(&body), Some("internal_error"));
    assert!(test.relay.worker_running());

    let (status, _) = post_chat(&test.app, chat_body(false, "after")).await;
    assert_eq!(status, StatusCode::OK);
    let relay = test.relay.clone();
    wait_until(WAIT, || !relay.is_processing()).await;
}

#[tokio::test]
async fn cancelling_a_queued_request() {
    let release = Arc::new(Notify::new());
    let test = TestApp::new(ScriptedAutomation::with_replies(vec![Reply::Hold(
        release.clone(),
        "done".to_string(),
    )]));
    let automation = test.automation.clone();
    let relay = test.relay.clone();

    let first = spawn_chat(&test, chat_body(false, "first"));
    wait_until(WAIT, || automation.count(|call| matches!(call, Call::GetResponse)) == 1).await;
    let second = spawn_chat(&test, chat_body(true, "second"));
    wait_until(WAIT, || relay.queue().len() == 1).await;

    let (status, queue) = send_json(&test.app, Method::GET, "/queue/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(queue["queue_length"], 1);
    assert_eq!(queue["is_processing_locked"], true);
    assert_eq!(queue["items"][0]["is_streaming"], true);
    assert_eq!(queue["items"][0]["cancelled"], false);
    let request_id = queue["items"][0]["req_id"]
        .as_str()
        .expect("request id")
        .to_string();

    let (status, body) =
        send_json(&test.app, Method::POST, &format!("/cancel/{request_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = second.await.expect("second request");
    assert_eq!(status.as_u16(), 499);
    assert_eq!(error_type(&body), Some("cancelled"));

    let (_, queue) = send_json(&test.app, Method::GET, "/queue/status", None).await;
    assert_eq!(queue["items"][0]["cancelled"], true);

    let (status, body) = send_json(&test.app, Method::POST, "/cancel/nope123", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_type(&body), Some("request_not_found"));

    release.notify_one();
    let (status, _) = first.await.expect("first request");
    assert_eq!(status, StatusCode::OK);
    wait_until(WAIT, || relay.queue().is_empty()).await;
    assert_eq!(submitted(&automation).len(), 1);
}

#[tokio::test]
async fn shutdown_rejects_in_flight_and_queued_requests() {
    let test = TestApp::new(ScriptedAutomation::with_replies(vec![Reply::Hang]));
    let automation = test.automation.clone();
    let relay = test.relay.clone();

    let in_flight = spawn_chat(&test, chat_body(false, "stuck"));
    wait_until(WAIT, || automation.count(|call| matches!(call, Call::GetResponse)) == 1).await;
    let queued = spawn_chat(&test, chat_body(false, "waiting"));
    wait_until(WAIT, || relay.queue().len() == 1).await;

    relay.shutdown().await;

    for handle in [in_flight, queued] {
        let (status, body) = handle.await.expect("request");
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_type(&body), Some("service_unavailable"));
    }
    assert!(!relay.worker_running());
    assert_eq!(automation.count(|call| matches!(call, Call::Clear)), 1);

    let (status, _) = post_chat(&test.app, chat_body(false, "late")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn enqueue_after_shutdown_is_refused() {
    let test = TestApp::new(ScriptedAutomation::new());
    test.relay.shutdown().await;
    assert!(test.relay.queue().is_closed());

    let request: ChatCompletionRequest =
        serde_json::from_value(chat_body(false, "late")).expect("request");
    let (connection, _guard) = connection_pair();
    match test.relay.enqueue("late".to_string(), request, connection) {
        Ok(_) => panic!("request admitted after shutdown"),
        Err(err) => assert_eq!(err.status_code(), 503),
    }
    assert!(test.relay.queue().is_empty());
}
