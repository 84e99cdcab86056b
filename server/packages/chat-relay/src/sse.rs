//! Server-sent-event encoding and the streaming response producer.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::response::sse::Event;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::automation::RecordStream;
use crate::completion::{CompletionCause, CompletionSignal};
use crate::delta::DeltaEmitter;
use crate::liveness::ConnectionGuard;
use crate::monitor::DisconnectState;
use crate::openai::ChatMessage;
use crate::usage::{calculate_usage, TokenEstimator};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

pub const DONE_MARKER: &str = "[DONE]";
const EVENT_BUFFER: usize = 64;

pub fn unix_timestamp() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

pub fn completion_id(prefix: &str, request_id: &str, created: i64) -> String {
    format!("{prefix}{request_id}-{created}")
}

pub fn json_event<T: Serialize>(payload: &T) -> Option<Event> {
    match serde_json::to_string(payload) {
        Ok(data) => Some(Event::default().data(data)),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode sse payload");
            None
        }
    }
}

pub fn done_event() -> Event {
    Event::default().data(DONE_MARKER)
}

/// Ties the client connection guard to the response body: the connection is
/// considered alive exactly as long as hyper keeps polling the body.
pub fn hold_connection(stream: EventStream, guard: ConnectionGuard) -> EventStream {
    Box::pin(stream.map(move |event| {
        let _ = &guard;
        event
    }))
}

/// Everything the producer needs besides the record source.
pub struct StreamSetup {
    pub request_id: String,
    pub completion_id: String,
    pub model: String,
    pub created: i64,
    pub messages: Vec<ChatMessage>,
    pub estimator: Arc<dyn TokenEstimator>,
}

/// Spawns the task that turns `records` into SSE events. The task sets
/// `completion` when it exits, however it exits.
pub fn spawn_stream_producer(
    setup: StreamSetup,
    records: RecordStream,
    completion: CompletionSignal,
    disconnect: DisconnectState,
) -> (EventStream, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
    let handle = tokio::spawn(produce(setup, records, completion, disconnect, sender));
    let stream = ReceiverStream::new(receiver).map(Ok::<_, Infallible>);
    (Box::pin(stream), handle)
}

async fn produce(
    setup: StreamSetup,
    mut records: RecordStream,
    completion: CompletionSignal,
    disconnect: DisconnectState,
    sender: mpsc::Sender<Event>,
) {
    let _latch = completion.guard(CompletionCause::Producer);
    let request_id = setup.request_id.as_str();
    let mut emitter = DeltaEmitter::new(
        request_id,
        setup.completion_id.clone(),
        setup.model.clone(),
        setup.created,
    );
    let mut chunks_sent = 0usize;

    'records: loop {
        let next = tokio::select! {
            biased;
            _ = disconnect.disconnected() => {
                tracing::info!(request_id = %request_id, "client disconnected; stopping stream");
                break;
            }
            _ = sender.closed() => {
                tracing::info!(request_id = %request_id, "response body dropped; stopping stream");
                break;
            }
            next = records.next() => next,
        };
        let Some(next) = next else {
            break;
        };
        match next {
            Ok(record) => {
                if record.timed_out {
                    tracing::warn!(request_id = %request_id, "response source timed out; closing stream");
                }
                for chunk in emitter.observe(&record) {
                    if !send(&sender, json_event(&chunk)).await {
                        break 'records;
                    }
                    chunks_sent += 1;
                }
                if record.done {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(request_id = %request_id, error = %err, "response source failed");
                let chunk = emitter.error_chunk(&err.to_string());
                send(&sender, json_event(&chunk)).await;
                break;
            }
        }
    }

    let (body, reasoning) = emitter.emitted();
    let usage = calculate_usage(setup.estimator.as_ref(), &setup.messages, body, reasoning);
    if send(&sender, json_event(&emitter.usage_chunk(usage))).await {
        send(&sender, Some(done_event())).await;
    }
    tracing::debug!(
        request_id = %request_id,
        chunks = chunks_sent,
        completion_tokens = usage.completion_tokens,
        "stream finished"
    );
}

async fn send(sender: &mpsc::Sender<Event>, event: Option<Event>) -> bool {
    match event {
        Some(event) => sender.send(event).await.is_ok(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::StreamRecord;
    use crate::usage::HeuristicEstimator;
    use std::time::Duration;

    fn setup() -> StreamSetup {
        StreamSetup {
            request_id: "req".to_string(),
            completion_id: "chatcmpl-req-1".to_string(),
            model: "m".to_string(),
            created: 1,
            messages: vec![ChatMessage::text("user", "hello")],
            estimator: Arc::new(HeuristicEstimator),
        }
    }

    #[tokio::test]
    async fn producer_sets_completion_after_flushing() {
        let records: RecordStream = Box::pin(futures::stream::iter(vec![
            Ok(StreamRecord {
                body: "Hi".to_string(),
                ..StreamRecord::default()
            }),
            Ok(StreamRecord {
                body: "Hi there".to_string(),
                done: true,
                ..StreamRecord::default()
            }),
        ]));
        let completion = CompletionSignal::new();
        let (stream, handle) = spawn_stream_producer(
            setup(),
            records,
            completion.clone(),
            DisconnectState::new("req"),
        );
        let events: Vec<_> = stream.collect().await;
        handle.await.expect("producer");
        // two deltas, usage, [DONE]
        assert_eq!(events.len(), 4);
        assert_eq!(completion.cause(), Some(CompletionCause::Producer));
    }

    #[tokio::test]
    async fn producer_stops_on_disconnect() {
        let records: RecordStream = Box::pin(futures::stream::pending());
        let completion = CompletionSignal::new();
        let disconnect = DisconnectState::new("req");
        let (_stream, handle) =
            spawn_stream_producer(setup(), records, completion.clone(), disconnect.clone());
        disconnect.mark();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("producer exits")
            .expect("join");
        assert!(completion.is_set());
    }

    #[tokio::test]
    async fn dropped_body_stops_producer() {
        let records: RecordStream = Box::pin(futures::stream::pending());
        let completion = CompletionSignal::new();
        let (stream, handle) = spawn_stream_producer(
            setup(),
            records,
            completion.clone(),
            DisconnectState::new("req"),
        );
        drop(stream);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("producer exits")
            .expect("join");
        assert!(completion.is_set());
    }
}
