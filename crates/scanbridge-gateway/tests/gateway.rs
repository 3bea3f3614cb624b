//! End-to-end checks against a gateway bound to an ephemeral port.

use std::error::Error;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use scanbridge_gateway::GatewayServer;
use scanbridge_middleware::{BroadcastHub, EventBus, HealthConfig, HealthMonitor, SubscriberRegistry};
use scanbridge_types::{DomainEvent, DrumStatusChanged, Envelope, LinkState, OrderUpdated};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type TestResult = Result<(), Box<dyn Error>>;

const CONNECTED: &str = r#"{"type":"status","status":"connected"}"#;
const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    addr: SocketAddr,
    registry: Arc<SubscriberRegistry>,
    bus: EventBus,
    _state_tx: watch::Sender<LinkState>,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start() -> Result<Harness, Box<dyn Error>> {
    let registry = Arc::new(SubscriberRegistry::default());
    let bus = EventBus::new();
    let (state_tx, state_rx) = watch::channel(LinkState::Open);
    let cancel = CancellationToken::new();

    let server = GatewayServer::new(Arc::clone(&registry), bus.clone(), state_rx)
        .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_port(0)
        .with_cancellation(cancel.clone());
    let listener = server.bind().await?;
    let addr = listener.local_addr()?;
    tokio::spawn(server.serve(listener));

    Ok(Harness {
        addr,
        registry,
        bus,
        _state_tx: state_tx,
        cancel,
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> TestResult {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    Ok(())
}

/// Read from `stream` until the accumulated text contains `needle`.
async fn read_until(stream: &mut TcpStream, seen: &mut String, needle: &str) -> TestResult {
    tokio::time::timeout(WAIT, async {
        let mut buf = [0u8; 1024];
        while !seen.contains(needle) {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(format!("connection closed before {needle:?}").into());
            }
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        Ok::<(), Box<dyn Error>>(())
    })
    .await?
}

async fn next_text<S>(ws: &mut S) -> Result<String, Box<dyn Error>>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await?
            .ok_or("websocket closed")??;
        if let Message::Text(text) = msg {
            return Ok(text.as_str().to_owned());
        }
    }
}

#[tokio::test]
async fn websocket_client_gets_connected_status_then_scans() -> TestResult {
    let h = start().await?;
    let hub = BroadcastHub::new(Arc::clone(&h.registry));

    let (mut ws, _) = connect_async(format!("ws://{}/", h.addr)).await?;
    assert_eq!(next_text(&mut ws).await?, CONNECTED);
    assert_eq!(h.registry.len(), 1);

    assert_eq!(hub.publish(&Envelope::data("1234-H7")), 1);
    assert_eq!(next_text(&mut ws).await?, "1234-H7");

    ws.close(None).await?;
    drop(ws);
    wait_until(|| h.registry.is_empty()).await
}

#[tokio::test]
async fn websocket_handshake_split_across_segments_is_upgraded() -> TestResult {
    let h = start().await?;
    let mut client = TcpStream::connect(h.addr).await?;
    client.set_nodelay(true)?;

    client.write_all(b"GET /scans HTTP/1.1\r\nHost: localhost\r\n").await?;
    client.flush().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    client
        .write_all(
            b"Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await?;

    let mut seen = String::new();
    read_until(&mut client, &mut seen, "\r\n\r\n").await?;
    assert!(seen.starts_with("HTTP/1.1 101"), "unexpected response: {seen}");
    let registry = Arc::clone(&h.registry);
    wait_until(move || registry.len() == 1).await
}

#[tokio::test]
async fn websocket_pong_clears_pending_probe() -> TestResult {
    let h = start().await?;
    let monitor = HealthMonitor::new(Arc::clone(&h.registry), HealthConfig::default());

    let (mut ws, _) = connect_async(format!("ws://{}/", h.addr)).await?;
    assert_eq!(next_text(&mut ws).await?, CONNECTED);
    let id = h.registry.snapshot()[0].id;

    assert_eq!(monitor.tick().probed, 1);
    let ping = tokio::time::timeout(WAIT, ws.next()).await?.ok_or("websocket closed")??;
    assert!(matches!(ping, Message::Ping(_)));

    // Polling the stream again flushes the automatic pong.
    let _ = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    let registry = Arc::clone(&h.registry);
    wait_until(move || registry.info(id).is_some_and(|info| !info.awaiting_pong)).await?;

    assert_eq!(monitor.tick().evicted, 0);
    assert!(h.registry.contains(id));
    Ok(())
}

#[tokio::test]
async fn drum_sse_stream_delivers_greeting_then_events() -> TestResult {
    let h = start().await?;
    let mut client = TcpStream::connect(h.addr).await?;
    client
        .write_all(b"GET /api/drums/sse HTTP/1.1\r\nHost: localhost\r\nAccept: text/event-stream\r\n\r\n")
        .await?;

    let mut seen = String::new();
    read_until(&mut client, &mut seen, "data: Connected to drums SSE\n\n").await?;
    assert!(seen.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(seen.contains("Content-Type: text/event-stream\r\n"));
    assert!(seen.contains("Cache-Control: no-cache\r\n"));
    assert!(seen.contains("event: connected\ndata: Connected to drums SSE\n\n"));
    assert_eq!(h.bus.listener_count("drumStatus"), 1);

    // Not routed to this stream.
    h.bus.publish_event(&DomainEvent::OrderUpdate(OrderUpdated {
        order_id: 1,
        drum_id: 7,
        new_quantity_received: 3,
    }))?;
    h.bus.publish_event(&DomainEvent::DrumStatus(DrumStatusChanged {
        drum_id: 7,
        new_status: "processed".to_string(),
    }))?;

    let frame = "event: drumStatus\ndata: {\"drumId\":7,\"newStatus\":\"processed\"}\n\n";
    read_until(&mut client, &mut seen, frame).await?;
    assert!(!seen.contains("orderUpdate"));

    drop(client);
    let bus = h.bus.clone();
    wait_until(move || bus.listener_count("drumStatus") == 0).await
}

#[tokio::test]
async fn health_endpoint_reports_link_state_and_subscribers() -> TestResult {
    let h = start().await?;
    let mut client = TcpStream::connect(h.addr).await?;
    client
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await?;

    let mut response = String::new();
    tokio::time::timeout(WAIT, client.read_to_string(&mut response)).await??;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with(r#"{"link":"open","subscribers":0}"#));
    Ok(())
}

#[tokio::test]
async fn unknown_path_is_not_found() -> TestResult {
    let h = start().await?;
    let mut client = TcpStream::connect(h.addr).await?;
    client
        .write_all(b"GET /api/unknown HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await?;

    let mut response = String::new();
    tokio::time::timeout(WAIT, client.read_to_string(&mut response)).await??;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    Ok(())
}
