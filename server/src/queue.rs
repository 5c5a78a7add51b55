//! The server half of the bundle-queue transport: a `tokio::net::TcpListener`
//! broker multiplexing the four named queues (`scheduled`, `completed`,
//! `heartbeat`, `confirmed`) across however many client connections are
//! attached to each at a time.
//!
//! Grounded on `SPEC_FULL.md` §4.2: this module has no single teacher
//! source (the teacher's `axum`/`tower` stack is HTTP/REST-shaped) but
//! reuses the teacher's `tokio::select!`/bounded-channel/graceful-shutdown
//! idiom from `server/src/main.rs`. Authentication uses constant-time
//! comparison (`subtle`) on a 32-byte hex shared secret, exactly as
//! specified in `spec.md` §4.2/§6 "Authentication"/"Framing".

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use shared::fsm::HaltFlag;
use shared::wire::{read_raw_frame, write_raw_frame, FrameError};

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

    fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(QueueName::Scheduled),
            "completed" => Some(QueueName::Completed),
            "heartbeat" => Some(QueueName::Heartbeat),
            "confirmed" => Some(QueueName::Confirmed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
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

struct Lane {
    tx: mpsc::Sender<Option<Vec<u8>>>,
    rx: Arc<Mutex<mpsc::Receiver<Option<Vec<u8>>>>>,
}

impl Lane {
    fn new(bound: usize) -> Self {
        let (tx, rx) = mpsc::channel(bound);
        Lane { tx, rx: Arc::new(Mutex::new(rx)) }
    }
}

/// The server-held broker for all four named queues. Cloning is cheap;
/// every background task (scheduler, receiver, confirm, heartmonitor, and
/// every per-connection handler) holds a clone.
#[derive(Clone)]
pub struct QueueServer {
    scheduled: Arc<Lane>,
    completed: Arc<Lane>,
    heartbeat: Arc<Lane>,
    confirmed: Arc<Lane>,
    auth: Arc<String>,
}

impl QueueServer {
    /// `scheduled`/`completed` are bounded per `spec.md` §4.2's "Bound"
    /// column; `heartbeat`/`confirmed` are effectively unbounded (a large
    /// bound, since no consumer-side backpressure is specified for them).
    pub fn new(auth: impl Into<String>, bundlesize_bound: usize) -> Self {
        QueueServer {
            scheduled: Arc::new(Lane::new(bundlesize_bound.max(1) * 4)),
            completed: Arc::new(Lane::new(bundlesize_bound.max(1) * 4)),
            heartbeat: Arc::new(Lane::new(4096)),
            confirmed: Arc::new(Lane::new(4096)),
            auth: Arc::new(auth.into()),
        }
    }

    fn lane(&self, name: QueueName) -> &Arc<Lane> {
        match name {
            QueueName::Scheduled => &self.scheduled,
            QueueName::Completed => &self.completed,
            QueueName::Heartbeat => &self.heartbeat,
            QueueName::Confirmed => &self.confirmed,
        }
    }

    /// Put one packed message onto a queue (producer side). `None` is the
    /// drain-and-halt sentinel.
    pub async fn put(
        &self,
        name: QueueName,
        data: Option<Vec<u8>>,
        wait: Duration,
    ) -> Result<(), QueueError> {
        let lane = self.lane(name);
        match timeout(wait, lane.tx.send(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(QueueError::Closed),
            Err(_) => Err(QueueError::Timeout),
        }
    }

    /// Get one packed message from a queue (consumer side), waiting up to
    /// `wait` for one to arrive. `Ok(None)` is the drain-and-halt sentinel;
    /// a `Timeout` means nothing arrived in `wait` and the caller should
    /// retry, not finalize.
    pub async fn get(&self, name: QueueName, wait: Duration) -> Result<Option<Vec<u8>>, QueueError> {
        let lane = self.lane(name);
        let mut rx = lane.rx.lock().await;
        match timeout(wait, rx.recv()).await {
            Ok(Some(item)) => Ok(item),
            Ok(None) => Err(QueueError::Closed),
            Err(_) => Err(QueueError::Timeout),
        }
    }

    fn check_auth(&self, candidate: &[u8]) -> bool {
        let expected = self.auth.as_bytes();
        candidate.len() == expected.len() && bool::from(candidate.ct_eq(expected))
    }
}

/// Accept connections on `addr` until `halt` trips, dispatching each to a
/// lane according to its handshake.
pub async fn serve(
    server: QueueServer,
    addr: std::net::SocketAddr,
    halt: Arc<HaltFlag>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "bundle-queue broker listening");
    loop {
        if halt.is_tripped() {
            break;
        }
        let accepted = timeout(Duration::from_millis(500), listener.accept()).await;
        let (stream, peer) = match accepted {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(error = %e, "accept failed");
                continue;
            }
            Err(_) => continue,
        };
        let server = server.clone();
        let halt = halt.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(server, stream, halt).await {
                debug!(%peer, error = %e, "connection closed");
            }
        });
    }
    Ok(())
}

async fn handle_connection(
    server: QueueServer,
    mut stream: TcpStream,
    halt: Arc<HaltFlag>,
) -> Result<(), QueueError> {
    use tokio::io::AsyncReadExt;

    let mut secret = vec![0u8; AUTH_KEY_LEN];
    stream.read_exact(&mut secret).await?;
    if !server.check_auth(&secret) {
        return Ok(()); // silent close, no error frame, per spec
    }

    let Some(handshake_bytes) = read_raw_frame(&mut stream).await? else {
        return Ok(());
    };
    let Ok(handshake) = serde_json::from_slice::<Handshake>(&handshake_bytes) else {
        return Ok(());
    };
    let Some(name) = QueueName::parse(&handshake.queue) else {
        return Ok(());
    };

    match handshake.direction {
        Direction::Get => serve_consumer(server, name, stream, halt).await,
        Direction::Put => serve_producer(server, name, stream, halt).await,
    }
}

async fn serve_consumer(
    server: QueueServer,
    name: QueueName,
    mut stream: TcpStream,
    halt: Arc<HaltFlag>,
) -> Result<(), QueueError> {
    loop {
        if halt.is_tripped() {
            write_raw_frame(&mut stream, None).await?;
            return Ok(());
        }
        match server.get(name, Duration::from_secs(2)).await {
            Ok(Some(data)) => write_raw_frame(&mut stream, Some(&data)).await?,
            Ok(None) => {
                write_raw_frame(&mut stream, None).await?;
                return Ok(());
            }
            Err(QueueError::Timeout) => continue,
            Err(QueueError::Closed) => return Ok(()),
            Err(other) => return Err(other),
        }
    }
}

async fn serve_producer(
    server: QueueServer,
    name: QueueName,
    mut stream: TcpStream,
    halt: Arc<HaltFlag>,
) -> Result<(), QueueError> {
    loop {
        if halt.is_tripped() {
            return Ok(());
        }
        match timeout(Duration::from_secs(2), read_raw_frame(&mut stream)).await {
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(data))) => {
                server.put(name, Some(data), Duration::from_secs(5)).await?;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let server = QueueServer::new("0123456789abcdef0123456789abcdef", 4);
        server
            .put(QueueName::Scheduled, Some(b"hello".to_vec()), Duration::from_secs(1))
            .await
            .unwrap();
        let got = server.get(QueueName::Scheduled, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn get_times_out_on_empty_queue() {
        let server = QueueServer::new("key", 4);
        let got = server.get(QueueName::Completed, Duration::from_millis(50)).await;
        assert!(matches!(got, Err(QueueError::Timeout)));
    }

    #[tokio::test]
    async fn sentinel_put_is_distinct_from_timeout() {
        let server = QueueServer::new("key", 4);
        server.put(QueueName::Completed, None, Duration::from_secs(1)).await.unwrap();
        let got = server.get(QueueName::Completed, Duration::from_millis(50)).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn auth_check_is_exact_length_and_value() {
        let server = QueueServer::new("deadbeefdeadbeefdeadbeefdeadbeef", 1);
        assert!(server.check_auth(b"deadbeefdeadbeefdeadbeefdeadbeef"));
        assert!(!server.check_auth(b"wrongkey"));
    }

    #[tokio::test]
    async fn full_handshake_over_real_socket() {
        let server = QueueServer::new("secretsecretsecretsecretsecretse", 4);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let halt = Arc::new(HaltFlag::new());

        let server_clone = server.clone();
        let halt_clone = halt.clone();
        let accept_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = handle_connection(server_clone, stream, halt_clone).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        use tokio::io::AsyncWriteExt;
        client.write_all(b"secretsecretsecretsecretsecretse").await.unwrap();
        let hs = serde_json::to_vec(&Handshake { queue: "scheduled".into(), direction: Direction::Put })
            .unwrap();
        write_raw_frame(&mut client, Some(&hs)).await.unwrap();
        write_raw_frame(&mut client, Some(b"task-bundle")).await.unwrap();
        write_raw_frame(&mut client, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let got = server.get(QueueName::Scheduled, Duration::from_millis(500)).await.unwrap();
        assert_eq!(got, Some(b"task-bundle".to_vec()));

        halt.trip();
        let _ = accept_task.await;
    }
}
