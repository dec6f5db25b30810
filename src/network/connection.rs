//! Connection handling
//!
//! Manages one link to a neighboring screen, including:
//! - Message encoding/decoding
//! - The invite handshake
//! - Splitting the link into independently owned directions

use bytes::BytesMut;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::protocol::{CodecError, Decoder, Encoder, Frame, Message};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("Connection timeout")]
    Timeout,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// Sending direction of a link
pub struct ConnectionWriter<W> {
    writer: W,
    encoder: Encoder,
    write_buf: BytesMut,
    stats: ConnectionStats,
}

impl<W: AsyncWrite + Unpin> ConnectionWriter<W> {
    fn new(writer: W) -> Self {
        Self {
            writer,
            encoder: Encoder::new(),
            write_buf: BytesMut::with_capacity(256),
            stats: ConnectionStats::default(),
        }
    }

    /// Send a message
    pub async fn send(&mut self, message: &Message) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.encoder.encode(message, &mut self.write_buf)?;

        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;
        Ok(())
    }

    /// Send a message, giving up after `timeout`
    pub async fn send_timeout(&mut self, message: &Message, timeout: Duration) -> ConnectionResult<()> {
        match tokio::time::timeout(timeout, self.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Shut down the sending direction
    pub async fn shutdown(&mut self) -> ConnectionResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }
}

/// Receiving direction of a link
pub struct ConnectionReader<R> {
    reader: R,
    decoder: Decoder,
    read_buf: BytesMut,
    stats: ConnectionStats,
}

impl<R: AsyncRead + Unpin> ConnectionReader<R> {
    fn new(reader: R, read_buf: BytesMut) -> Self {
        Self {
            reader,
            decoder: Decoder::new(),
            read_buf,
            stats: ConnectionStats::default(),
        }
    }

    /// Receive a message. `Ok(None)` is a clean close between frames.
    ///
    /// Cancel safe: bytes already read stay buffered.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                self.stats.messages_received += 1;
                return Ok(Some(frame));
            }

            let n = self.reader.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ConnectionError::Closed);
            }
            self.stats.bytes_received += n as u64;
        }
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }
}

/// A framed link to a remote screen
pub struct Connection<S> {
    /// Remote peer address, for logging
    remote: String,
    reader: ConnectionReader<ReadHalf<S>>,
    writer: ConnectionWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    /// Wrap an established stream
    pub fn new(stream: S, remote: impl Into<String>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            remote: remote.into(),
            reader: ConnectionReader::new(read_half, BytesMut::with_capacity(4096)),
            writer: ConnectionWriter::new(write_half),
        }
    }

    /// Get the remote address
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Send a message
    pub async fn send(&mut self, message: &Message) -> ConnectionResult<()> {
        self.writer.send(message).await
    }

    /// Receive a message (`Ok(None)` on a clean close)
    pub async fn recv(&mut self) -> ConnectionResult<Option<Frame>> {
        self.reader.recv().await
    }

    /// Try to receive a message with a timeout
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ConnectionResult<Option<Frame>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Close the connection gracefully
    pub async fn close(&mut self, reason: &str) -> ConnectionResult<()> {
        self.writer
            .send(&Message::Disconnect {
                reason: reason.to_string(),
            })
            .await?;
        self.writer.shutdown().await
    }

    /// Split into the receiving and sending directions
    pub fn into_split(self) -> (ConnectionReader<ReadHalf<S>>, ConnectionWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("remote", &self.remote).finish()
    }
}

/// Current time in microseconds since the Unix epoch, for heartbeats
pub(crate) fn timestamp_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
