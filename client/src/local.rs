//! Bounded in-process task channels wiring the scheduler, executors, and
//! collector together within one client process.
//!
//! Mirrors `server::queue`'s `Lane` pattern: a cloneable sender and a single
//! receiver shared behind an `Arc<Mutex<_>>` so several executors can pull
//! from one inbound channel (the Python original uses a `multiprocessing`
//! `Queue` here; a single client process has no need for that, so a plain
//! `tokio::sync::mpsc` channel stands in for it).

use std::sync::Arc;
use std::time::Duration;

use shared::Task;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{error::Elapsed, timeout};

/// A task, or the sentinel telling a consumer to drain and halt.
pub type Item = Option<Task>;

pub struct LocalQueue {
    tx: mpsc::Sender<Item>,
    rx: Arc<Mutex<mpsc::Receiver<Item>>>,
}

impl LocalQueue {
    pub fn new(bound: usize) -> Self {
        let (tx, rx) = mpsc::channel(bound.max(1));
        LocalQueue { tx, rx: Arc::new(Mutex::new(rx)) }
    }

    pub fn sender(&self) -> LocalSender {
        LocalSender(self.tx.clone())
    }

    pub fn receiver(&self) -> LocalReceiver {
        LocalReceiver(self.rx.clone())
    }
}

#[derive(Debug)]
pub enum SendError {
    Timeout,
    Closed,
}

#[derive(Clone)]
pub struct LocalSender(mpsc::Sender<Item>);

impl LocalSender {
    pub async fn send(&self, item: Item, wait: Duration) -> Result<(), SendError> {
        match timeout(wait, self.0.send(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => Err(SendError::Timeout),
        }
    }
}

#[derive(Clone)]
pub struct LocalReceiver(Arc<Mutex<mpsc::Receiver<Item>>>);

impl LocalReceiver {
    /// `Ok(None)` covers both the sentinel and a channel with no senders
    /// left; either way the consumer should treat it as drain-and-halt.
    pub async fn recv(&self, wait: Duration) -> Result<Item, Elapsed> {
        let mut rx = self.0.lock().await;
        timeout(wait, rx.recv()).await.map(|opt| opt.flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("echo hi", Default::default(), "sub-1", "host-a")
    }

    #[tokio::test]
    async fn send_then_recv_round_trips() {
        let q = LocalQueue::new(4);
        let tx = q.sender();
        let rx = q.receiver();
        tx.send(Some(task()), Duration::from_millis(100)).await.unwrap();
        let got = rx.recv(Duration::from_millis(100)).await.unwrap();
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn sentinel_is_distinct_from_timeout() {
        let q = LocalQueue::new(4);
        let tx = q.sender();
        let rx = q.receiver();
        tx.send(None, Duration::from_millis(100)).await.unwrap();
        let got = rx.recv(Duration::from_millis(100)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn recv_times_out_on_empty_channel() {
        let q = LocalQueue::new(4);
        let rx = q.receiver();
        let got = rx.recv(Duration::from_millis(20)).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn multiple_senders_can_share_one_queue() {
        let q = LocalQueue::new(4);
        let a = q.sender();
        let b = q.sender();
        let rx = q.receiver();
        a.send(Some(task()), Duration::from_millis(100)).await.unwrap();
        b.send(Some(task()), Duration::from_millis(100)).await.unwrap();
        assert!(rx.recv(Duration::from_millis(100)).await.unwrap().is_some());
        assert!(rx.recv(Duration::from_millis(100)).await.unwrap().is_some());
    }
}
