//! [`GatewayServer`] – the single TCP listener clients connect to.
//!
//! Listens on `0.0.0.0:9000` by default (see [`GatewayServer::with_port`]).
//!
//! * WebSocket upgrades → live scan feed: the connection is registered in the
//!   [`SubscriberRegistry`], receives every broadcast envelope and answers
//!   liveness pings.
//! * `GET /api/drums/sse`, `GET /api/orders/sse` → text-event-stream fed by
//!   the [`EventBus`].
//! * `GET /healthz` → link state and subscriber count as JSON.
//! * Anything else → `404`, or `405` for a known path with another method.
//!
//! The SSE routes only carry what is published on the server's [`EventBus`]
//! (see [`GatewayServer::bus`]). The link itself never publishes domain
//! events, so a process with no domain producer serves just the greeting.

use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::sink::Sink;
use futures_util::{SinkExt, StreamExt};
use scanbridge_middleware::{
    DEFAULT_STREAM_BUFFER, EventBus, EventStream, Outbound, SubscriberRegistry,
};
use scanbridge_types::{BridgeError, LinkState};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::http::{self, Route};

/// Default TCP port for the gateway.
pub const DEFAULT_PORT: u16 = 9000;

/// How long a client may take to deliver its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between peeks while a request head is still arriving.
const HEAD_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long one frame may take to reach a client's socket.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared by every connection task.
struct Shared {
    registry: Arc<SubscriberRegistry>,
    bus: EventBus,
    link_state: watch::Receiver<LinkState>,
    stream_buffer: usize,
    cancel: CancellationToken,
}

/// HTTP + WebSocket front door of the bridge.
pub struct GatewayServer {
    registry: Arc<SubscriberRegistry>,
    bus: EventBus,
    link_state: watch::Receiver<LinkState>,
    stream_buffer: usize,
    cancel: CancellationToken,
    bind_address: IpAddr,
    port: u16,
}

impl GatewayServer {
    /// Create a server on `0.0.0.0:`[`DEFAULT_PORT`].
    ///
    /// `link_state` is the supervisor's state channel; the gateway only
    /// reads it.
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        bus: EventBus,
        link_state: watch::Receiver<LinkState>,
    ) -> Self {
        Self {
            registry,
            bus,
            link_state,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            cancel: CancellationToken::new(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Stop accepting and close every open connection when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Frames buffered per SSE connection. A client that lets the buffer
    /// fill up is disconnected.
    pub fn with_stream_buffer(mut self, frames: usize) -> Self {
        self.stream_buffer = frames.max(1);
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The bus feeding the SSE routes. Domain producers publish on a clone.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Bind`] if the address is unavailable.
    pub async fn bind(&self) -> Result<TcpListener, BridgeError> {
        let addr = self.addr();
        TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Bind(format!("bind error on {addr}: {e}")))
    }

    /// Bind and serve until cancelled.
    pub async fn run(self) -> Result<(), BridgeError> {
        let listener = self.bind().await.inspect_err(|e| error!(error = %e, "gateway bind failed"))?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until cancelled.
    pub async fn serve(self, listener: TcpListener) -> Result<(), BridgeError> {
        let local = listener
            .local_addr()
            .map_err(|e| BridgeError::Bind(format!("listener address unavailable: {e}")))?;
        info!(addr = %local, "gateway listening");

        let shared = Arc::new(Shared {
            registry: self.registry,
            bus: self.bus,
            link_state: self.link_state,
            stream_buffer: self.stream_buffer,
            cancel: self.cancel,
        });

        loop {
            let accepted = tokio::select! {
                () = shared.cancel.cancelled() => {
                    info!("gateway shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, shared).await {
                            debug!(peer = %peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection dispatch
// ---------------------------------------------------------------------------

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), BridgeError> {
    let head = peek_head(&stream, peer).await?;
    let preview = String::from_utf8_lossy(&head);

    if http::is_websocket_upgrade(&preview) {
        return handle_ws(stream, peer, shared).await;
    }

    let route = Route::resolve(&preview);
    // The head was only peeked; take it off the socket before answering.
    let mut consumed = vec![0u8; head.len()];
    stream
        .read_exact(&mut consumed)
        .await
        .map_err(|e| BridgeError::LinkIo(format!("request read error from {peer}: {e}")))?;
    debug!(peer = %peer, route = ?route, "http request");

    match route {
        Route::EventStream { topic, greeting } => {
            serve_event_stream(stream, peer, topic, greeting, shared).await
        }
        Route::Health => {
            let body = json!({
                "link": shared.link_state.borrow().to_string(),
                "subscribers": shared.registry.len(),
            })
            .to_string();
            http::write_response(&mut stream, "200 OK", "application/json", &body).await
        }
        Route::BadRequest => {
            http::write_response(&mut stream, "400 Bad Request", "text/plain", "bad request").await
        }
        Route::MethodNotAllowed => {
            http::write_response(
                &mut stream,
                "405 Method Not Allowed",
                "text/plain",
                "method not allowed",
            )
            .await
        }
        Route::NotFound => {
            http::write_response(&mut stream, "404 Not Found", "text/plain", "not found").await
        }
    }
}

/// Peek until the whole request head is buffered and return it. `peek`
/// leaves the bytes in place for tungstenite's handshake.
async fn peek_head(stream: &TcpStream, peer: SocketAddr) -> Result<Vec<u8>, BridgeError> {
    let mut buf = vec![0u8; http::MAX_HEAD_LEN];
    let peeking = async {
        loop {
            let n = stream
                .peek(&mut buf)
                .await
                .map_err(|e| BridgeError::LinkIo(format!("peek error from {peer}: {e}")))?;
            if n == 0 {
                return Err(BridgeError::LinkIo(format!(
                    "{peer} closed before sending a request"
                )));
            }
            if let Some(len) = http::head_len(&buf[..n]) {
                return Ok(len);
            }
            if n == buf.len() {
                return Err(BridgeError::Parsing(format!(
                    "request head from {peer} exceeds {} bytes",
                    http::MAX_HEAD_LEN
                )));
            }
            // `peek` returns at once while any bytes are queued, so give the
            // rest of a split head time to arrive.
            tokio::time::sleep(HEAD_POLL_INTERVAL).await;
        }
    };
    let len = tokio::time::timeout(HEAD_TIMEOUT, peeking)
        .await
        .map_err(|_| BridgeError::LinkIo(format!("request head from {peer} timed out")))??;
    buf.truncate(len);
    Ok(buf)
}

// ---------------------------------------------------------------------------
// WebSocket: live scan feed
// ---------------------------------------------------------------------------

async fn handle_ws(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), BridgeError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| BridgeError::LinkIo(format!("WS handshake from {peer}: {e}")))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Registered only once the handshake is done, so the queued `connected`
    // status is the first frame on the wire.
    let (handle, mut outbound) = shared.registry.connect();
    info!(peer = %peer, subscriber_id = %handle.id(), "scan feed client connected");

    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => {
                let _ = send_frame(&mut ws_tx, Message::Close(None), SEND_TIMEOUT).await;
                break;
            }
            // Downstream: registry → client
            frame = outbound.recv() => {
                let message = match frame {
                    Some(Outbound::Text(text)) => Message::Text(text.into()),
                    Some(Outbound::Ping) => Message::Ping(Vec::new().into()),
                    // Removed from the registry (evicted or send failure).
                    None => {
                        let _ = send_frame(&mut ws_tx, Message::Close(None), SEND_TIMEOUT).await;
                        break;
                    }
                };
                if let Err(e) = send_frame(&mut ws_tx, message, SEND_TIMEOUT).await {
                    debug!(peer = %peer, error = %e, "websocket send failed");
                    break;
                }
            }
            // Upstream: client → liveness bookkeeping
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        handle.mark_alive();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(peer = %peer, error = %e, "websocket read error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!(peer = %peer, subscriber_id = %handle.id(), "scan feed client disconnected");
    drop(handle);
    Ok(())
}

/// Send one frame, giving up after `limit` so a peer that stopped reading
/// cannot pin the session.
async fn send_frame<S>(sink: &mut S, message: Message, limit: Duration) -> Result<(), BridgeError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout(limit, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(BridgeError::LinkIo(format!("websocket send error: {e}"))),
        Err(_) => Err(BridgeError::LinkIo(format!(
            "websocket send timed out after {limit:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Server-sent events: EventBus topic stream
// ---------------------------------------------------------------------------

async fn serve_event_stream(
    stream: TcpStream,
    peer: SocketAddr,
    topic: &'static str,
    greeting: &'static str,
    shared: Arc<Shared>,
) -> Result<(), BridgeError> {
    let (mut reader, mut writer) = stream.into_split();
    let mut events = EventStream::open(&shared.bus, topic, greeting, shared.stream_buffer);
    info!(peer = %peer, topic, "event stream client connected");

    let result = match write_bounded(&mut writer, http::EVENT_STREAM_HEAD).await {
        Ok(()) => stream_frames(&mut reader, &mut writer, &mut events, &shared.cancel).await,
        Err(e) => Err(e),
    };

    events.close();
    info!(peer = %peer, topic, "event stream client disconnected");
    result
}

async fn stream_frames(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    events: &mut EventStream,
    cancel: &CancellationToken,
) -> Result<(), BridgeError> {
    let mut scratch = [0u8; 256];
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            frame = events.next_frame() => {
                // `None` once the client fell behind and was unsubscribed.
                let Some(frame) = frame else { return Ok(()) };
                write_bounded(writer, &frame).await?;
            }
            // The client never sends after the request head; EOF or an error
            // here means it went away.
            read = reader.read(&mut scratch) => {
                match read {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(_) => {}
                }
            }
        }
    }
}

/// Write and flush `text`, giving up after [`SEND_TIMEOUT`].
async fn write_bounded(writer: &mut OwnedWriteHalf, text: &str) -> Result<(), BridgeError> {
    let write = async {
        writer.write_all(text.as_bytes()).await?;
        writer.flush().await
    };
    match tokio::time::timeout(SEND_TIMEOUT, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(BridgeError::LinkIo(format!("SSE write error: {e}"))),
        Err(_) => Err(BridgeError::LinkIo(format!(
            "SSE write timed out after {SEND_TIMEOUT:?}"
        ))),
    }
}
