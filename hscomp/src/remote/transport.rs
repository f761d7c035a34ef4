//! Connection-oriented transports for remote messages

use super::codec;
use super::message::RemoteMessage;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Transport trait for abstracting a peer connection
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a message
    async fn send(&self, message: RemoteMessage) -> Result<()>;

    /// Receive the next message. Fails once the peer has gone.
    async fn recv(&self) -> Result<RemoteMessage>;

    /// Close the transport
    async fn close(&self) -> Result<()>;

    /// Human readable peer description
    fn peer(&self) -> String;
}

/// Opens transports towards a server
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn Transport>>;
}

/// Framed TCP connection
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer: String,
    max_frame_len: usize,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, max_frame_len: usize) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %err, "Failed to disable Nagle");
        }
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer,
            max_frame_len,
        }
    }

    pub async fn connect(endpoint: &str, max_frame_len: usize) -> Result<Self> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|err| Error::connection(format!("Failed to connect to {endpoint}"), err))?;
        Ok(Self::new(stream, max_frame_len))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, message: RemoteMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        codec::write_message(&mut *writer, &message, self.max_frame_len).await
    }

    async fn recv(&self) -> Result<RemoteMessage> {
        let mut reader = self.reader.lock().await;
        codec::read_message(&mut *reader, self.max_frame_len)
            .await?
            .ok_or_else(|| Error::connection_msg(format!("{} closed the connection", self.peer)))
    }

    async fn close(&self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Connects to a fixed TCP endpoint
pub struct TcpConnector {
    endpoint: String,
    max_frame_len: usize,
}

impl TcpConnector {
    pub fn new(endpoint: impl Into<String>, max_frame_len: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            max_frame_len,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let transport = TcpTransport::connect(&self.endpoint, self.max_frame_len).await?;
        Ok(Arc::new(transport))
    }
}

/// Mock transport for testing
#[cfg(test)]
pub struct MockTransport {
    tx: tokio::sync::mpsc::UnboundedSender<RemoteMessage>,
    rx: Mutex<tokio::sync::mpsc::UnboundedReceiver<RemoteMessage>>,
    name: String,
}

#[cfg(test)]
impl MockTransport {
    /// Two connected ends.
    pub fn pair(name: &str) -> (Self, Self) {
        let (tx1, rx1) = tokio::sync::mpsc::unbounded_channel();
        let (tx2, rx2) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                tx: tx1,
                rx: Mutex::new(rx2),
                name: format!("{name}/near"),
            },
            Self {
                tx: tx2,
                rx: Mutex::new(rx1),
                name: format!("{name}/far"),
            },
        )
    }

    /// Next message without waiting.
    pub fn try_recv(&self) -> Option<RemoteMessage> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: RemoteMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::connection_msg("mock transport send failed"))
    }

    async fn recv(&self) -> Result<RemoteMessage> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or(Error::connection_msg("mock transport recv failed"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

/// Connector handing the far end of every new connection to the test.
#[cfg(test)]
pub struct MockConnector {
    far_ends: tokio::sync::mpsc::UnboundedSender<MockTransport>,
    refuse: std::sync::atomic::AtomicBool,
    attempts: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockConnector {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<MockTransport>) {
        let (far_ends, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                far_ends,
                refuse: std::sync::atomic::AtomicBool::new(false),
                attempts: std::sync::atomic::AtomicUsize::new(0),
            },
            rx,
        )
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        use std::sync::atomic::Ordering;
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::connection_msg("mock connection refused"));
        }
        let (near, far) = MockTransport::pair("mock");
        self.far_ends
            .send(far)
            .map_err(|_| Error::connection_msg("mock server gone"))?;
        Ok(Arc::new(near))
    }
}
