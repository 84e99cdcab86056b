//! Response sources feeding the delta emitter.
//!
//! `aux-stream` mode reads records pushed into a [`StreamQueue`] by an
//! external interceptor. `page` mode uses whatever the automation layer
//! returned, replaying plain text as a paced pseudo-stream.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::automation::{RecordStream, ResponseBody};
use crate::delta::{pseudo_stream_records, StreamRecord};

type Receiver = mpsc::UnboundedReceiver<Option<Value>>;

/// In-process buffer for records produced outside the relay. A `None`
/// entry is the end-of-response marker.
#[derive(Debug)]
pub struct StreamQueue {
    sender: mpsc::UnboundedSender<Option<Value>>,
    receiver: Arc<Mutex<Receiver>>,
    idle_timeout: Duration,
}

enum ReadState {
    Waiting(Arc<Mutex<Receiver>>),
    Reading(OwnedMutexGuard<Receiver>),
    Finished,
}

impl StreamQueue {
    pub fn new(idle_timeout: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            idle_timeout,
        }
    }

    /// Queues one raw record. `null` ends the current response.
    pub fn push(&self, value: Value) {
        let entry = if value.is_null() { None } else { Some(value) };
        // The queue owns a receiver, so the channel never closes.
        let _ = self.sender.send(entry);
    }

    /// Discards leftovers from a previous response.
    pub async fn drain(&self) -> usize {
        let mut receiver = self.receiver.lock().await;
        let mut drained = 0;
        while receiver.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            tracing::debug!(drained, "discarded residual stream records");
        }
        drained
    }

    /// Reads records for one response until a `done` record, the end marker,
    /// or an idle gap longer than the idle timeout. Holds the receiver for the
    /// lifetime of the returned stream.
    pub fn records(&self, request_id: &str) -> RecordStream {
        let request_id = request_id.to_string();
        let idle_timeout = self.idle_timeout;
        let initial = ReadState::Waiting(self.receiver.clone());
        let stream = futures::stream::unfold(initial, move |state| {
            let request_id = request_id.clone();
            async move {
                let mut receiver = match state {
                    ReadState::Waiting(receiver) => receiver.lock_owned().await,
                    ReadState::Reading(receiver) => receiver,
                    ReadState::Finished => return None,
                };
                loop {
                    let next = match tokio::time::timeout(idle_timeout, receiver.recv()).await {
                        Ok(next) => next,
                        Err(_) => {
                            tracing::warn!(
                                request_id = %request_id,
                                idle_ms = idle_timeout.as_millis() as u64,
                                "response stream went idle"
                            );
                            return Some((Ok(StreamRecord::source_timeout()), ReadState::Finished));
                        }
                    };
                    let Some(Some(value)) = next else {
                        tracing::debug!(request_id = %request_id, "response stream end marker");
                        return None;
                    };
                    match StreamRecord::parse(value) {
                        Ok(record) => {
                            let state = if record.done {
                                ReadState::Finished
                            } else {
                                ReadState::Reading(receiver)
                            };
                            return Some((Ok(record), state));
                        }
                        Err(err) => {
                            tracing::warn!(request_id = %request_id, error = %err, "skipping malformed stream record");
                        }
                    }
                }
            }
        });
        Box::pin(stream)
    }
}

/// Replays `records` with `delay` before each one.
pub fn paced_records(records: Vec<StreamRecord>, delay: Duration) -> RecordStream {
    Box::pin(futures::stream::iter(records).then(move |record| async move {
        tokio::time::sleep(delay).await;
        Ok(record)
    }))
}

pub fn response_records(body: ResponseBody, delay: Duration) -> RecordStream {
    match body {
        ResponseBody::Text(text) => paced_records(pseudo_stream_records(&text), delay),
        ResponseBody::Stream(stream) => stream,
    }
}
