//! Connections to the camera's event channel.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;

/// Byte stream of delimited event records.
pub type EventStream = Box<dyn AsyncRead + Send + Unpin>;

/// Opens a fresh event stream on each call.
#[async_trait]
pub trait EventConnector: Send + Sync {
    async fn connect(&self) -> io::Result<EventStream>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// Plain TCP connection to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
        }
    }
}

#[async_trait]
impl EventConnector for TcpConnector {
    async fn connect(&self) -> io::Result<EventStream> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
