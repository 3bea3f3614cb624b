//! The little HTTP the gateway speaks besides WebSocket.
//!
//! Only the request line is looked at. Responses are written by hand and
//! close the connection, except for event streams which stay open.

use scanbridge_types::{BridgeError, DomainEvent};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Upper bound on an accepted request head.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

pub const DRUMS_SSE_PATH: &str = "/api/drums/sse";
pub const ORDERS_SSE_PATH: &str = "/api/orders/sse";
pub const HEALTH_PATH: &str = "/healthz";

/// Status line and headers opening an event stream.
pub const EVENT_STREAM_HEAD: &str = "HTTP/1.1 200 OK\r\n\
     Content-Type: text/event-stream\r\n\
     Cache-Control: no-cache\r\n\
     Connection: keep-alive\r\n\
     \r\n";

/// Length of the request head including its terminating blank line, or
/// `None` while the head is still incomplete.
pub fn head_len(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|at| at + 4)
}

/// `true` when the raw head asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(head: &str) -> bool {
    head.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Server-sent event stream for one bus topic.
    EventStream {
        topic: &'static str,
        greeting: &'static str,
    },
    Health,
    BadRequest,
    MethodNotAllowed,
    NotFound,
}

impl Route {
    /// Route on the request line of `head`. The query string is ignored.
    pub fn resolve(head: &str) -> Self {
        let mut parts = head.lines().next().unwrap_or_default().split_whitespace();
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Route::BadRequest;
        };
        if !version.starts_with("HTTP/") {
            return Route::BadRequest;
        }

        let route = match target.split('?').next().unwrap_or(target) {
            DRUMS_SSE_PATH => Route::EventStream {
                topic: DomainEvent::DRUM_STATUS_TOPIC,
                greeting: "Connected to drums SSE",
            },
            ORDERS_SSE_PATH => Route::EventStream {
                topic: DomainEvent::ORDER_UPDATE_TOPIC,
                greeting: "Connected to orders SSE",
            },
            HEALTH_PATH => Route::Health,
            _ => return Route::NotFound,
        };
        if method != "GET" {
            return Route::MethodNotAllowed;
        }
        route
    }
}

/// Write a complete response with a body and `Connection: close`.
pub async fn write_response<W>(
    writer: &mut W,
    status: &str,
    content_type: &str,
    body: &str,
) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );
    writer
        .write_all(response.as_bytes())
        .await
        .map_err(|e| BridgeError::LinkIo(format!("HTTP write error: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| BridgeError::LinkIo(format!("HTTP flush error: {e}")))
}
