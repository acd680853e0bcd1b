//! UDP shipper sending entries straight to a logstash endpoint.

use tokio::net::UdpSocket;

use crate::entry::{ContentType, LogEntry};

/// Errors produced by [`Logstash`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`std::io::Error`].
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    /// An entry failed to serialize.
    #[error("failed to serialize entry: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Ships each non-ignored entry as one JSON datagram.
#[derive(Debug)]
pub struct Logstash {
    socket: UdpSocket,
}

impl Logstash {
    /// Bind an ephemeral socket and connect it to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket can not be bound or connected.
    pub async fn connect(target: &str) -> Result<Self, Error> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(target).await?;
        Ok(Self { socket })
    }

    /// Send one entry. Ignored entries are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the send fails.
    pub async fn process(&self, entry: LogEntry) -> Result<(), Error> {
        if entry.content_type == ContentType::Ignore {
            return Ok(());
        }
        let payload = serde_json::to_vec(&entry)?;
        self.socket.send(&payload).await?;
        Ok(())
    }
}
