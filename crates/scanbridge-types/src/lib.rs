use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod scan_code;

pub use scan_code::ScanCode;

/// Opaque identity assigned to every downstream subscriber.
pub type SubscriberId = Uuid;

/// Connectivity status announced to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Connected,
    Error,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Connected => "connected",
            LinkStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the single upstream device link.
///
/// Only the link supervisor transitions this value; everyone else observes
/// it through the supervisor's published notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Closed,
    Opening,
    Open,
    Draining,
    ReconnectPending,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkState::Closed => "closed",
            LinkState::Opening => "opening",
            LinkState::Open => "open",
            LinkState::Draining => "draining",
            LinkState::ReconnectPending => "reconnect_pending",
        };
        f.write_str(s)
    }
}

/// Discriminates the two kinds of broadcast traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Status,
    Data,
}

/// Normalised unit handed from a publisher to the broadcast hub.
///
/// The same envelope shape is used whether the payload came from the scanner
/// or from a domain event, so the hub never needs to know its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// A status envelope carrying `status`.
    pub fn status(status: LinkStatus) -> Self {
        Self {
            kind: MessageKind::Status,
            payload: status.as_str().to_string(),
            timestamp: Utc::now(),
        }
    }

    /// A data envelope carrying one scan payload verbatim.
    pub fn data(payload: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Data,
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }

    /// Render the envelope as the text frame subscribers receive.
    ///
    /// Status envelopes become `{"type":"status","status":"<status>"}`; data
    /// envelopes are sent as the raw payload, not JSON.
    pub fn to_wire_text(&self) -> Result<String, BridgeError> {
        match self.kind {
            MessageKind::Data => Ok(self.payload.clone()),
            MessageKind::Status => {
                let frame = StatusFrame {
                    frame_type: "status".to_string(),
                    status: self.payload.clone(),
                };
                serde_json::to_string(&frame).map_err(|e| BridgeError::Serialization(e.to_string()))
            }
        }
    }
}

/// JSON shape of a status frame on the scan feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub status: String,
}

/// A text frame as seen by a scan-feed consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Status(LinkStatus),
    Data(String),
}

impl InboundFrame {
    /// Classify a received text frame.
    ///
    /// The frame is first parsed as JSON; only a well-formed status object is
    /// treated as a status frame, anything else (including bare JSON scalars
    /// such as an all-digit barcode) is a data frame.
    pub fn classify(text: &str) -> Self {
        if let Ok(frame) = serde_json::from_str::<StatusFrame>(text)
            && frame.frame_type == "status"
        {
            match frame.status.as_str() {
                "connected" => return InboundFrame::Status(LinkStatus::Connected),
                "error" => return InboundFrame::Status(LinkStatus::Error),
                _ => {}
            }
        }
        InboundFrame::Data(text.to_string())
    }
}

/// Receiver of everything a link supervisor produces.
///
/// Called synchronously from the supervisor task, so implementations must
/// return quickly and never block on a downstream consumer.
pub trait LinkSink: Send + Sync {
    /// The link became usable (`Connected`) or was lost (`Error`).
    fn on_status(&self, status: LinkStatus);

    /// One framed, trimmed record. May be empty.
    fn on_record(&self, record: String);
}

/// Drum status change, streamed on the `drumStatus` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrumStatusChanged {
    pub drum_id: i64,
    pub new_status: String,
}

/// Order receipt progress, streamed on the `orderUpdate` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdated {
    pub order_id: i64,
    pub drum_id: i64,
    pub new_quantity_received: i64,
}

/// Domain events that flow through the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainEvent {
    DrumStatus(DrumStatusChanged),
    OrderUpdate(OrderUpdated),
}

impl DomainEvent {
    pub const DRUM_STATUS_TOPIC: &'static str = "drumStatus";
    pub const ORDER_UPDATE_TOPIC: &'static str = "orderUpdate";

    /// The topic (and SSE event name) this event is routed on.
    pub fn topic(&self) -> &'static str {
        match self {
            DomainEvent::DrumStatus(_) => Self::DRUM_STATUS_TOPIC,
            DomainEvent::OrderUpdate(_) => Self::ORDER_UPDATE_TOPIC,
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, BridgeError> {
        serde_json::to_value(self).map_err(|e| BridgeError::Serialization(e.to_string()))
    }
}

/// Error type shared by every scanbridge crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeError {
    #[error("cannot open link {device}: {details}")]
    LinkOpen { device: String, details: String },

    #[error("link I/O error: {0}")]
    LinkIo(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("parse error: {0}")]
    Parsing(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("bind error: {0}")]
    Bind(String),

    #[error("listener on {topic} failed: {details}")]
    Listener { topic: String, details: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_envelope_renders_json_frame() -> Result<(), BridgeError> {
        let text = Envelope::status(LinkStatus::Connected).to_wire_text()?;
        assert_eq!(text, r#"{"type":"status","status":"connected"}"#);

        let text = Envelope::status(LinkStatus::Error).to_wire_text()?;
        assert_eq!(text, r#"{"type":"status","status":"error"}"#);
        Ok(())
    }

    #[test]
    fn data_envelope_renders_raw_payload() -> Result<(), BridgeError> {
        let text = Envelope::data("52-H1024").to_wire_text()?;
        assert_eq!(text, "52-H1024");
        Ok(())
    }

    #[test]
    fn classify_distinguishes_status_from_data() {
        assert_eq!(
            InboundFrame::classify(r#"{"type":"status","status":"connected"}"#),
            InboundFrame::Status(LinkStatus::Connected)
        );
        assert_eq!(
            InboundFrame::classify(r#"{"type":"status","status":"error"}"#),
            InboundFrame::Status(LinkStatus::Error)
        );
        assert_eq!(InboundFrame::classify("A1"), InboundFrame::Data("A1".to_string()));
        // Parses as JSON but is not a status object.
        assert_eq!(InboundFrame::classify("12345"), InboundFrame::Data("12345".to_string()));
        assert_eq!(
            InboundFrame::classify(r#"{"type":"other","status":"connected"}"#),
            InboundFrame::Data(r#"{"type":"other","status":"connected"}"#.to_string())
        );
    }

    #[test]
    fn domain_events_use_camel_case_payloads() -> Result<(), BridgeError> {
        let drum = DomainEvent::DrumStatus(DrumStatusChanged {
            drum_id: 7,
            new_status: "processed".to_string(),
        });
        assert_eq!(drum.topic(), "drumStatus");
        assert_eq!(
            drum.to_json()?,
            serde_json::json!({"drumId": 7, "newStatus": "processed"})
        );

        let order = DomainEvent::OrderUpdate(OrderUpdated {
            order_id: 52,
            drum_id: 1024,
            new_quantity_received: 3,
        });
        assert_eq!(order.topic(), "orderUpdate");
        assert_eq!(
            order.to_json()?,
            serde_json::json!({"orderId": 52, "drumId": 1024, "newQuantityReceived": 3})
        );
        Ok(())
    }

    #[test]
    fn link_state_display_is_snake_case() {
        assert_eq!(LinkState::ReconnectPending.to_string(), "reconnect_pending");
        assert_eq!(LinkState::Open.to_string(), "open");
    }

    #[test]
    fn bridge_error_display() {
        let err = BridgeError::LinkOpen {
            device: "/dev/ttyUSB0".to_string(),
            details: "no such file".to_string(),
        };
        assert!(err.to_string().contains("/dev/ttyUSB0"));

        let err = BridgeError::Listener {
            topic: "drumStatus".to_string(),
            details: "closed".to_string(),
        };
        assert!(err.to_string().contains("drumStatus"));
    }
}
