//! Text-event-stream framing and the per-connection [`EventStream`].
//!
//! Every frame is `event: <name>\ndata: <payload>\n\n`. A connection always
//! opens with an `event: connected` frame carrying a free-text greeting, then
//! one frame per payload published on its topic.

use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use scanbridge_types::BridgeError;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::{EventBus, Subscription};

/// Default number of frames buffered per SSE connection.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// The opening frame of every stream.
    pub fn connected(greeting: impl Into<String>) -> Self {
        Self::new("connected", greeting)
    }

    pub fn json(event: impl Into<String>, payload: &Value) -> Self {
        Self::new(event, payload.to_string())
    }

    /// Wire encoding. Multi-line data is split across several `data:` lines.
    pub fn encode(&self) -> String {
        let mut out = format!("event: {}\n", self.event);
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Encoded SSE frames for one topic, fed by an [`EventBus`] listener.
///
/// The listener lives exactly as long as the stream: dropping the stream
/// unsubscribes it. A consumer that falls behind far enough to fill the
/// buffer is cut off: the listener unsubscribes itself and the stream ends
/// once the frames queued before the overflow are drained.
pub struct EventStream {
    topic: String,
    receiver: mpsc::Receiver<String>,
    subscription: Arc<Subscription>,
}

impl EventStream {
    /// Queue the `connected` greeting, then start listening on `topic`.
    pub fn open(bus: &EventBus, topic: impl AsRef<str>, greeting: &str, buffer: usize) -> Self {
        let topic = topic.as_ref().to_string();
        let (tx, receiver) = mpsc::channel(buffer.max(1));
        // Capacity is at least one, so the greeting always fits.
        let _ = tx.try_send(SseFrame::connected(greeting).encode());

        // Weak, so the stream stays the only owner of its subscription.
        let own_subscription: Arc<OnceLock<Weak<Subscription>>> = Arc::new(OnceLock::new());
        let listener_subscription = Arc::clone(&own_subscription);
        let sender = Mutex::new(Some(tx));
        let event = topic.clone();

        let subscription = Arc::new(bus.subscribe(&topic, move |payload: &Value| {
            let mut sender = sender.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(tx) = sender.as_ref() else {
                return Err(BridgeError::Listener {
                    topic: event.clone(),
                    details: "event stream closed".to_string(),
                });
            };
            let Err(e) = tx.try_send(SseFrame::json(event.as_str(), payload).encode()) else {
                return Ok(());
            };

            let details = e.to_string();
            // Dropping the sender ends the stream after the queued frames.
            sender.take();
            drop(sender);
            if let Some(subscription) = listener_subscription.get().and_then(Weak::upgrade) {
                subscription.unsubscribe();
            }
            warn!(topic = %event, error = %details, "event stream consumer fell behind, closing");
            Err(BridgeError::Listener {
                topic: event.clone(),
                details,
            })
        }));
        let _ = own_subscription.set(Arc::downgrade(&subscription));
        debug!(topic = %topic, "event stream opened");

        Self {
            topic,
            receiver,
            subscription,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next encoded frame, or `None` once the listener has been removed and
    /// the queue is drained.
    pub async fn next_frame(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Stop listening. Frames already queued can still be drained.
    pub fn close(&mut self) {
        if self.subscription.unsubscribe() {
            debug!(topic = %self.topic, "event stream closed");
        }
    }
}

impl Stream for EventStream {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use scanbridge_types::{DomainEvent, DrumStatusChanged};
    use serde_json::json;
    use std::error::Error;

    #[test]
    fn frame_encoding() {
        assert_eq!(
            SseFrame::connected("Connected to drums SSE").encode(),
            "event: connected\ndata: Connected to drums SSE\n\n"
        );
        assert_eq!(
            SseFrame::json("orderUpdate", &json!({"orderId": 1})).encode(),
            "event: orderUpdate\ndata: {\"orderId\":1}\n\n"
        );
        assert_eq!(
            SseFrame::new("note", "a\nb").encode(),
            "event: note\ndata: a\ndata: b\n\n"
        );
    }

    #[tokio::test]
    async fn drum_status_reaches_only_drum_listeners() -> Result<(), Box<dyn Error>> {
        let bus = EventBus::new();
        let mut drums = EventStream::open(&bus, "drumStatus", "Connected to drums SSE", 8);
        let mut orders = EventStream::open(&bus, "orderUpdate", "Connected to orders SSE", 8);

        let event = DomainEvent::DrumStatus(DrumStatusChanged {
            drum_id: 7,
            new_status: "processed".to_string(),
        });
        bus.publish_event(&event)?;

        assert_eq!(
            drums.next().await.as_deref(),
            Some("event: connected\ndata: Connected to drums SSE\n\n")
        );
        assert_eq!(
            drums.next().await.as_deref(),
            Some("event: drumStatus\ndata: {\"drumId\":7,\"newStatus\":\"processed\"}\n\n")
        );
        assert!(drums.receiver.try_recv().is_err());

        assert_eq!(
            orders.next_frame().await.as_deref(),
            Some("event: connected\ndata: Connected to orders SSE\n\n")
        );
        assert!(orders.receiver.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn dropping_stream_releases_listener() {
        let bus = EventBus::new();
        let stream = EventStream::open(&bus, "orderUpdate", "hi", 8);
        assert_eq!(bus.listener_count("orderUpdate"), 1);
        drop(stream);
        assert_eq!(bus.listener_count("orderUpdate"), 0);
        assert_eq!(bus.publish("orderUpdate", &json!({})), 0);
    }

    #[tokio::test]
    async fn close_ends_stream_after_queued_frames() {
        let bus = EventBus::new();
        let mut stream = EventStream::open(&bus, "drumStatus", "hi", 8);
        bus.publish("drumStatus", &json!(1));
        stream.close();
        assert_eq!(bus.listener_count("drumStatus"), 0);

        assert!(stream.next_frame().await.is_some());
        assert!(stream.next_frame().await.is_some());
        assert_eq!(stream.next_frame().await, None);
    }

    #[tokio::test]
    async fn overflow_unsubscribes_and_ends_stream() {
        let bus = EventBus::new();
        // Room for the greeting and one event.
        let mut stream = EventStream::open(&bus, "drumStatus", "hi", 2);

        assert_eq!(bus.publish("drumStatus", &json!(1)), 1);
        assert_eq!(bus.publish("drumStatus", &json!(2)), 0);
        assert_eq!(bus.listener_count("drumStatus"), 0);

        assert_eq!(
            stream.next_frame().await.as_deref(),
            Some("event: connected\ndata: hi\n\n")
        );
        assert_eq!(
            stream.next_frame().await.as_deref(),
            Some("event: drumStatus\ndata: 1\n\n")
        );
        // Nothing after the missed frame, even once there is room again.
        assert_eq!(bus.publish("drumStatus", &json!(3)), 0);
        assert_eq!(stream.next_frame().await, None);
    }

    #[test]
    fn overflow_leaves_other_streams_subscribed() {
        let bus = EventBus::new();
        let _slow = EventStream::open(&bus, "orderUpdate", "hi", 1);
        let _fast = EventStream::open(&bus, "orderUpdate", "hi", 8);

        assert_eq!(bus.publish("orderUpdate", &json!(1)), 1);
        assert_eq!(bus.listener_count("orderUpdate"), 1);
    }
}
