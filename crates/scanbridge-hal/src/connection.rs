//! Device connections.
//!
//! [`LinkConnection`] is the seam between the supervisor's state machine and
//! the actual transport. [`FramedConnection`] is the production
//! implementation: it opens either a native serial port (via
//! `tokio-serial`) or, for `tcp://host:port` devices, a TCP socket to a
//! serial-over-IP server, and frames the byte stream with [`RecordCodec`].

use async_trait::async_trait;
use futures_util::StreamExt;
use scanbridge_types::BridgeError;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::FramedRead;
use tracing::debug;

use crate::codec::{Frame, RecordCodec};
use crate::config::LinkConfig;

/// One physical (or virtual) connection to the scanning device.
///
/// Implementations are driven by a single task, so `&mut self` access is
/// never concurrent.
#[async_trait]
pub trait LinkConnection: Send {
    /// Human-readable device identifier for logs.
    fn device(&self) -> &str;

    /// Open the device. Any previously open handle is released first.
    async fn open(&mut self) -> Result<(), BridgeError>;

    /// Wait for the next framed record.
    ///
    /// Returns `None` when the device closed the stream (cable pulled, remote
    /// hang-up) and `Some(Err(_))` on an I/O error. Both mean the link is
    /// gone.
    async fn next_frame(&mut self) -> Option<Result<Frame, BridgeError>>;

    /// Release the device handle. Idempotent.
    async fn close(&mut self);
}

/// Where a [`FramedConnection`] connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Serial(String),
    Tcp(String),
}

impl LinkTarget {
    /// `tcp://host:port` selects TCP; anything else is a serial device path.
    pub fn parse(device: &str) -> Self {
        match device.strip_prefix("tcp://") {
            Some(addr) => LinkTarget::Tcp(addr.to_string()),
            None => LinkTarget::Serial(device.to_string()),
        }
    }
}

type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Serial or TCP byte stream framed into scan records.
pub struct FramedConnection {
    device: String,
    target: LinkTarget,
    baud_rate: u32,
    codec: RecordCodec,
    reader: Option<FramedRead<ByteStream, RecordCodec>>,
}

impl FramedConnection {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            device: config.device.clone(),
            target: LinkTarget::parse(&config.device),
            baud_rate: config.baud_rate,
            codec: RecordCodec::new(config.delimiter, config.max_record_len),
            reader: None,
        }
    }

    pub fn target(&self) -> &LinkTarget {
        &self.target
    }
}

/// Borrows only the plain fields so the returned future stays `Send` while
/// the connection itself holds a non-`Sync` reader.
async fn connect(device: &str, target: &LinkTarget, baud_rate: u32) -> Result<ByteStream, BridgeError> {
    let open_error = |details: String| BridgeError::LinkOpen {
        device: device.to_string(),
        details,
    };
    match target {
        LinkTarget::Serial(path) => {
            let port = tokio_serial::new(path, baud_rate)
                .open_native_async()
                .map_err(|e| open_error(e.to_string()))?;
            Ok(Box::new(port))
        }
        LinkTarget::Tcp(addr) => {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| open_error(e.to_string()))?;
            Ok(Box::new(stream))
        }
    }
}

#[async_trait]
impl LinkConnection for FramedConnection {
    fn device(&self) -> &str {
        &self.device
    }

    async fn open(&mut self) -> Result<(), BridgeError> {
        self.reader = None;
        let stream = connect(&self.device, &self.target, self.baud_rate).await?;
        self.reader = Some(FramedRead::new(stream, self.codec.clone()));
        debug!(device = %self.device, "device handle opened");
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, BridgeError>> {
        let reader = self.reader.as_mut()?;
        reader
            .next()
            .await
            .map(|item| item.map_err(|e| BridgeError::LinkIo(e.to_string())))
    }

    async fn close(&mut self) {
        if self.reader.take().is_some() {
            debug!(device = %self.device, "device handle released");
        }
    }
}
