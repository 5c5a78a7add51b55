//! The client half of the bundle-queue transport: a `QueueConn` dials the
//! server, authenticates, and commits to one queue name and direction
//! (`Put`/`Get`) for its entire lifetime.
//!
//! Grounded on `server::queue`'s wire contract (a 32-byte auth frame, then
//! one `Handshake` frame, then per-message length-prefixed JSON frames) —
//! this module is the dialing half of that same handshake, so its framing
//! and timeout idiom mirror it directly. No single teacher source covers
//! this (see `SPEC_FULL.md` §4.2); it reuses the teacher's `tokio`
//! socket/timeout style.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use shared::wire::{read_raw_frame, write_raw_frame, FrameError};

/// Must match `server::queue::AUTH_KEY_LEN`.
pub const AUTH_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Scheduled,
    Completed,
    Heartbeat,
    Confirmed,
}

impl QueueName {
    fn as_str(&self) -> &'static str {
        match self {
            QueueName::Scheduled => "scheduled",
            QueueName::Completed => "completed",
            QueueName::Heartbeat => "heartbeat",
            QueueName::Confirmed => "confirmed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Direction {
    Put,
    Get,
}

#[derive(Debug, Serialize, Deserialize)]
struct Handshake {
    queue: String,
    direction: Direction,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,
    #[error("timed out")]
    Timeout,
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server address and shared secret every `QueueConn` dials with.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub host: String,
    pub port: u16,
    pub auth: String,
}

impl QueueConfig {
    pub fn new(host: impl Into<String>, port: u16, auth: impl Into<String>) -> Self {
        QueueConfig { host: host.into(), port, auth: auth.into() }
    }

    async fn dial(&self, name: QueueName, direction: Direction) -> Result<TcpStream, QueueError> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = TcpStream::connect(&addr).await?;

        let mut secret = [0u8; AUTH_KEY_LEN];
        let bytes = self.auth.as_bytes();
        let n = bytes.len().min(AUTH_KEY_LEN);
        secret[..n].copy_from_slice(&bytes[..n]);
        stream.write_all(&secret).await?;

        let handshake = Handshake { queue: name.as_str().to_string(), direction };
        let bytes = serde_json::to_vec(&handshake).expect("Handshake serialization is infallible");
        write_raw_frame(&mut stream, Some(&bytes)).await?;
        Ok(stream)
    }
}

/// One live connection dedicated to a single queue name and direction for
/// its entire lifetime; the opposite of `server::queue::Lane` (one per
/// client, rather than one broker shared by every client).
pub struct QueueConn {
    stream: TcpStream,
}

impl QueueConn {
    pub async fn connect_get(config: &QueueConfig, name: QueueName) -> Result<Self, QueueError> {
        Ok(QueueConn { stream: config.dial(name, Direction::Get).await? })
    }

    pub async fn connect_put(config: &QueueConfig, name: QueueName) -> Result<Self, QueueError> {
        Ok(QueueConn { stream: config.dial(name, Direction::Put).await? })
    }

    /// Read one frame, waiting up to `wait`. `Ok(None)` is the sentinel the
    /// server sends when draining this consumer.
    pub async fn get(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, QueueError> {
        match timeout(wait, read_raw_frame(&mut self.stream)).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(QueueError::Timeout),
        }
    }

    /// Write one frame, waiting up to `wait`. `None` sends the sentinel.
    pub async fn put(&mut self, data: Option<&[u8]>, wait: Duration) -> Result<(), QueueError> {
        match timeout(wait, write_raw_frame(&mut self.stream, data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(QueueError::Timeout),
        }
    }
}

/// Convenience for opening named connections against one server address;
/// cheap to clone, held by whichever FSM needs to (re)dial.
#[derive(Clone)]
pub struct QueueClient {
    config: std::sync::Arc<QueueConfig>,
}

impl QueueClient {
    pub fn new(config: QueueConfig) -> Self {
        QueueClient { config: std::sync::Arc::new(config) }
    }

    pub async fn connect_get(&self, name: QueueName) -> Result<QueueConn, QueueError> {
        QueueConn::connect_get(&self.config, name).await
    }

    pub async fn connect_put(&self, name: QueueName) -> Result<QueueConn, QueueError> {
        QueueConn::connect_put(&self.config, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_get_performs_handshake_and_reads_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stub = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut secret = [0u8; AUTH_KEY_LEN];
            stream.read_exact(&mut secret).await.unwrap();
            assert_eq!(&secret[..3], b"key");

            let hs = read_raw_frame(&mut stream).await.unwrap().unwrap();
            let hs: Handshake = serde_json::from_slice(&hs).unwrap();
            assert_eq!(hs.queue, "scheduled");
            assert_eq!(hs.direction, Direction::Get);

            write_raw_frame(&mut stream, Some(b"task-bundle")).await.unwrap();
            write_raw_frame(&mut stream, None).await.unwrap();
        });

        let config = QueueConfig::new("127.0.0.1", addr.port(), "key");
        let mut conn = QueueConn::connect_get(&config, QueueName::Scheduled).await.unwrap();
        let got = conn.get(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, Some(b"task-bundle".to_vec()));
        let sentinel = conn.get(Duration::from_secs(1)).await.unwrap();
        assert!(sentinel.is_none());

        stub.await.unwrap();
    }

    #[tokio::test]
    async fn connect_put_performs_handshake_and_writes_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stub = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut secret = [0u8; AUTH_KEY_LEN];
            stream.read_exact(&mut secret).await.unwrap();

            let hs = read_raw_frame(&mut stream).await.unwrap().unwrap();
            let hs: Handshake = serde_json::from_slice(&hs).unwrap();
            assert_eq!(hs.queue, "completed");
            assert_eq!(hs.direction, Direction::Put);

            let frame = read_raw_frame(&mut stream).await.unwrap();
            assert_eq!(frame, Some(b"done-task".to_vec()));
        });

        let config = QueueConfig::new("127.0.0.1", addr.port(), "key");
        let mut conn = QueueConn::connect_put(&config, QueueName::Completed).await.unwrap();
        conn.put(Some(b"done-task"), Duration::from_secs(1)).await.unwrap();

        stub.await.unwrap();
    }

    #[tokio::test]
    async fn get_times_out_when_nothing_arrives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stub = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut secret = [0u8; AUTH_KEY_LEN];
            stream.read_exact(&mut secret).await.unwrap();
            let _ = read_raw_frame(&mut stream).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let config = QueueConfig::new("127.0.0.1", addr.port(), "key");
        let mut conn = QueueConn::connect_get(&config, QueueName::Heartbeat).await.unwrap();
        let got = conn.get(Duration::from_millis(50)).await;
        assert!(matches!(got, Err(QueueError::Timeout)));

        stub.await.unwrap();
    }
}
