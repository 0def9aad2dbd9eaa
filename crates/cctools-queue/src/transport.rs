//! Framed, timeout-bounded byte streams between the master and one worker.
//!
//! Every operation takes an absolute `stoptime` (a wall-clock deadline, not a
//! relative duration) and enforces it via `tokio::time::timeout_at` over the
//! underlying non-blocking socket I/O. On deadline expiry the transport is
//! considered dead: callers must discard it rather than retry.

use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Longest ASCII protocol line, newline included (§6).
pub const MAX_LINE_BYTES: usize = 4096;

/// Errors raised by transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection attempt did not complete before `stoptime`.
    #[error("connect timed out")]
    ConnectTimeout,
    /// An operation did not complete before its `stoptime`.
    #[error("operation timed out")]
    Timeout,
    /// The peer is unreachable or refused the connection.
    #[error("unreachable: {0}")]
    Unreachable(#[source] std::io::Error),
    /// The peer closed the connection, or a read/write syscall failed.
    #[error("transport failed: {0}")]
    Failed(#[source] std::io::Error),
    /// A received line exceeded `MAX_LINE_BYTES`.
    #[error("line too long")]
    LineTooLong,
}

/// A reliable request/response channel to one worker.
pub struct Transport {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    closed: bool,
}

fn tokio_deadline(stoptime: Instant) -> tokio::time::Instant {
    tokio::time::Instant::now() + stoptime.saturating_duration_since(Instant::now())
}

impl Transport {
    /// Open a TCP connection to `host:port`, failing if it does not complete
    /// before `stoptime`.
    pub async fn open(host: &str, port: u16, stoptime: Instant) -> Result<Self, TransportError> {
        let deadline = tokio_deadline(stoptime);
        let connect = TcpStream::connect((host, port));
        let stream = tokio::time::timeout_at(deadline, connect)
            .await
            .map_err(|_| TransportError::ConnectTimeout)?
            .map_err(TransportError::Unreachable)?;
        stream.set_nodelay(true).map_err(TransportError::Failed)?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected stream (e.g. one accepted by a listener).
    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            closed: false,
        }
    }

    /// Send one ASCII line, appending the trailing newline.
    pub async fn send_line(&mut self, text: &str, stoptime: Instant) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Failed(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "transport closed",
            )));
        }
        let deadline = tokio_deadline(stoptime);
        let fut = async {
            self.writer.write_all(text.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await
        };
        tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                self.closed = true;
                TransportError::Failed(e)
            })
    }

    /// Receive one newline-delimited ASCII line, excluding the newline.
    ///
    /// The read itself is capped at `MAX_LINE_BYTES`, via a `Take` wrapper
    /// over the buffered reader, so a peer that withholds the newline
    /// cannot force unbounded buffer growth before the size is checked.
    pub async fn recv_line(&mut self, stoptime: Instant) -> Result<String, TransportError> {
        if self.closed {
            return Err(TransportError::Failed(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "transport closed",
            )));
        }
        let deadline = tokio_deadline(stoptime);
        let mut buf: Vec<u8> = Vec::new();
        let mut limited = tokio::io::AsyncReadExt::take(&mut self.reader, MAX_LINE_BYTES as u64);
        let read = tokio::io::AsyncBufReadExt::read_until(&mut limited, b'\n', &mut buf);
        let n = tokio::time::timeout_at(deadline, read)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                self.closed = true;
                TransportError::Failed(e)
            })?;
        if n == 0 {
            self.closed = true;
            return Err(TransportError::Failed(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            )));
        }
        if !buf.ends_with(b"\n") {
            self.closed = true;
            if buf.len() >= MAX_LINE_BYTES {
                return Err(TransportError::LineTooLong);
            }
            return Err(TransportError::Failed(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed connection mid-line",
            )));
        }
        while buf.ends_with(b"\n") || buf.ends_with(b"\r") {
            buf.pop();
        }
        String::from_utf8(buf).map_err(|e| {
            self.closed = true;
            TransportError::Failed(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    /// Send a raw payload of exactly `buf.len()` bytes.
    pub async fn send_bytes(&mut self, buf: &[u8], stoptime: Instant) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Failed(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "transport closed",
            )));
        }
        let deadline = tokio_deadline(stoptime);
        let fut = async {
            self.writer.write_all(buf).await?;
            self.writer.flush().await
        };
        tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                self.closed = true;
                TransportError::Failed(e)
            })
    }

    /// Receive exactly `len` raw bytes.
    pub async fn recv_bytes(&mut self, len: usize, stoptime: Instant) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Failed(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "transport closed",
            )));
        }
        let deadline = tokio_deadline(stoptime);
        let mut out = vec![0u8; len];
        let fut = self.reader.read_exact(&mut out);
        tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                self.closed = true;
                TransportError::Failed(e)
            })?;
        Ok(out)
    }

    /// Idempotent close: safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.writer.shutdown().await;
    }

    /// Whether a prior operation already observed this transport as dead.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn line_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut t = Transport::from_stream(stream);
            let line = t
                .recv_line(Instant::now() + std::time::Duration::from_secs(5))
                .await
                .unwrap();
            t.send_line(&line, Instant::now() + std::time::Duration::from_secs(5))
                .await
                .unwrap();
        });

        let mut client = Transport::open(
            "127.0.0.1",
            addr.port(),
            Instant::now() + std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();
        client
            .send_line("ready host 1 2 3", Instant::now() + std::time::Duration::from_secs(5))
            .await
            .unwrap();
        let echoed = client
            .recv_line(Instant::now() + std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(echoed, "ready host 1 2 3");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn recv_times_out_on_expired_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _keepalive = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            drop(stream);
        });

        let mut client = Transport::open(
            "127.0.0.1",
            addr.port(),
            Instant::now() + std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();
        let result = client.recv_line(Instant::now()).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn recv_line_rejects_oversized_line_without_buffering_it_whole() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _sender = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // No newline: a well-behaved peer would never do this, this is
            // exactly what the size cap exists to bound.
            let payload = vec![b'a'; MAX_LINE_BYTES * 4];
            let _ = tokio::io::AsyncWriteExt::write_all(&mut stream, &payload).await;
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let mut client = Transport::open(
            "127.0.0.1",
            addr.port(),
            Instant::now() + std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();
        let result = client
            .recv_line(Instant::now() + std::time::Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(TransportError::LineTooLong)));
        assert!(client.is_closed());
    }
}
