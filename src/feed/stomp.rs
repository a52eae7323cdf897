//! Client side of the local stompy proxy (spec §4.B "Streaming
//! consumer", §6 "STOMP proxy protocol"): one message per read from a
//! fixed local TCP port, with a one-byte ack written back after the
//! caller has committed its transaction. The proxy itself — the thing
//! that actually speaks STOMP to the vendor broker — is an external
//! process; this is only the framed hand-off between it and us.
//!
//! Wire shape: a 4-byte big-endian length prefix followed by the UTF-8
//! message body, ack is the single byte `0x01`. Timeouts are enforced
//! client-side with `tokio::time::timeout`.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const ACK_BYTE: u8 = 0x01;
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum StompError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("read timed out")]
    Timeout,
    #[error("message body was not valid UTF-8")]
    Utf8,
}

/// One connection to a stompy proxy port. `read_frame` blocks (up to
/// `read_timeout`) for the next message; `ack` must be called only
/// after the caller's store transaction has committed, per the
/// commit-before-ack discipline of spec §5.
pub struct StompConsumer {
    stream: TcpStream,
    read_timeout: Duration,
}

impl StompConsumer {
    pub async fn connect(addr: &str, read_timeout: Duration) -> Result<Self, StompError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { stream, read_timeout })
    }

    /// Read one frame body, or `Ok(None)` on a client-side read timeout
    /// (spec's "3-code timeout" — the caller should simply loop).
    pub async fn read_frame(&mut self) -> Result<Option<String>, StompError> {
        match tokio::time::timeout(self.read_timeout, self.read_frame_inner()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn read_frame_inner(&mut self) -> Result<String, StompError> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        String::from_utf8(body).map_err(|_| StompError::Utf8)
    }

    /// Acknowledge the last delivered frame. Must only be called after
    /// the caller's transaction has committed.
    pub async fn ack(&mut self) -> Result<(), StompError> {
        self.stream.write_all(&[ACK_BYTE]).await?;
        Ok(())
    }
}

/// Exponential back-off for reconnect attempts, capped at ~5 minutes
/// (spec §4.B).
pub struct ReconnectBackoff {
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let secs = 2u64.saturating_pow(self.attempt).min(MAX_RECONNECT_BACKOFF.as_secs());
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs(secs)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reads_one_length_prefixed_frame_and_acks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let body = b"{\"msg_type\":\"0001\"}";
            socket.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            let mut ack = [0u8; 1];
            socket.read_exact(&mut ack).await.unwrap();
            ack
        });

        let mut consumer = StompConsumer::connect(&addr.to_string(), Duration::from_secs(1)).await.unwrap();
        let frame = consumer.read_frame().await.unwrap().unwrap();
        assert_eq!(frame, "{\"msg_type\":\"0001\"}");
        consumer.ack().await.unwrap();

        let ack = server.await.unwrap();
        assert_eq!(ack[0], ACK_BYTE);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = ReconnectBackoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), MAX_RECONNECT_BACKOFF);
    }
}
