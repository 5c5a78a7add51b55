//! `ClientCollector`: gathers finished tasks from the executors' shared
//! outbound channel, bundles them up to `bundlesize` or `bundlewait`, and
//! posts the bundle back to the server's `completed` queue.
//!
//! Grounded on `original_source/client.py`'s `ClientCollector`/`CollectorState`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use shared::fsm::{HaltFlag, MachineState, StateMachine};
use shared::Task;
use tracing::{debug, trace, warn};

use crate::local::LocalReceiver;
use crate::queue::{QueueConn, QueueError};

const GET_TIMEOUT: Duration = Duration::from_secs(1);
const PUT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Start,
    GetLocal,
    CheckBundle,
    PackBundle,
    PutRemote,
    Final,
    Halt,
}

impl MachineState for CollectorState {
    fn halt_state() -> Self {
        CollectorState::Halt
    }
}

pub struct ClientCollector {
    state: CollectorState,
    completed: QueueConn,
    local: LocalReceiver,
    tasks: Vec<Task>,
    bundle: Vec<Vec<u8>>,
    bundlesize: usize,
    bundlewait: chrono::Duration,
    previous_send: chrono::DateTime<Local>,
    halt: Arc<HaltFlag>,
}

impl ClientCollector {
    pub fn new(
        completed: QueueConn,
        local: LocalReceiver,
        bundlesize: usize,
        bundlewait_secs: u64,
        halt: Arc<HaltFlag>,
    ) -> Self {
        ClientCollector {
            state: CollectorState::Start,
            completed,
            local,
            tasks: Vec::new(),
            bundle: Vec::new(),
            bundlesize: bundlesize.max(1),
            bundlewait: chrono::Duration::seconds(bundlewait_secs as i64),
            previous_send: Local::now(),
            halt,
        }
    }

    fn start(&mut self) -> CollectorState {
        debug!("started (collector)");
        self.previous_send = Local::now();
        CollectorState::GetLocal
    }

    async fn get_local(&mut self) -> CollectorState {
        match self.local.recv(GET_TIMEOUT).await {
            Ok(Some(task)) => {
                self.tasks.push(task);
                CollectorState::CheckBundle
            }
            Ok(None) => CollectorState::Final,
            // Falls through to the bundle-flush check even when nothing new
            // arrived — not a self-loop back to `GetLocal` — so a partial
            // bundle still ages out on `bundlewait` while the channel is idle.
            Err(_) => CollectorState::CheckBundle,
        }
    }

    fn check_bundle(&mut self) -> CollectorState {
        let since_last = Local::now() - self.previous_send;
        if self.tasks.len() >= self.bundlesize {
            trace!(count = self.tasks.len(), "bundle size reached");
            CollectorState::PackBundle
        } else if !self.tasks.is_empty() && since_last >= self.bundlewait {
            trace!(?since_last, "bundle wait exceeded");
            CollectorState::PackBundle
        } else {
            CollectorState::GetLocal
        }
    }

    fn pack_bundle(&mut self) -> CollectorState {
        self.bundle = self.tasks.iter().map(Task::pack).collect();
        CollectorState::PutRemote
    }

    async fn put_remote(&mut self) -> CollectorState {
        if self.bundle.is_empty() {
            trace!("bundle empty");
            return CollectorState::GetLocal;
        }
        for data in &self.bundle {
            match self.completed.put(Some(data), PUT_TIMEOUT).await {
                Ok(()) => {}
                Err(QueueError::Timeout) => return CollectorState::PutRemote,
                Err(e) => {
                    warn!(error = %e, "failed to return completed bundle");
                    break;
                }
            }
        }
        trace!(count = self.bundle.len(), "bundle returned");
        self.tasks.clear();
        self.bundle.clear();
        self.previous_send = Local::now();
        CollectorState::GetLocal
    }

    /// Flushes whatever accumulated since the last full bundle before
    /// halting, so a sentinel arriving mid-bundle never drops tasks.
    async fn finalize(&mut self) -> CollectorState {
        if !self.tasks.is_empty() {
            self.pack_bundle();
            let _ = self.put_remote().await;
        }
        debug!("done (collector)");
        CollectorState::Halt
    }
}

#[async_trait]
impl StateMachine for ClientCollector {
    type State = CollectorState;

    fn state(&self) -> CollectorState {
        self.state
    }

    fn set_state(&mut self, state: CollectorState) {
        self.state = state;
    }

    async fn action(&mut self) -> CollectorState {
        if self.halt.is_tripped() && self.state != CollectorState::PutRemote {
            return CollectorState::Final;
        }
        match self.state {
            CollectorState::Start => self.start(),
            CollectorState::GetLocal => self.get_local().await,
            CollectorState::CheckBundle => self.check_bundle(),
            CollectorState::PackBundle => self.pack_bundle(),
            CollectorState::PutRemote => self.put_remote().await,
            CollectorState::Final => self.finalize().await,
            CollectorState::Halt => CollectorState::Halt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalQueue;
    use crate::queue::{QueueClient, QueueConfig, QueueName};
    use tokio::net::TcpListener;

    async fn dummy_conn() -> QueueConn {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let client = QueueClient::new(QueueConfig::new("127.0.0.1", addr.port(), "key"));
        client.connect_put(QueueName::Completed).await.unwrap()
    }

    fn task() -> Task {
        Task::new("echo hi", Default::default(), "sub-1", "host-a")
    }

    #[tokio::test]
    async fn check_bundle_packs_once_size_reached() {
        let local = LocalQueue::new(4);
        let mut collector =
            ClientCollector::new(dummy_conn().await, local.receiver(), 2, 5, Arc::new(HaltFlag::new()));
        collector.tasks = vec![task(), task()];
        collector.state = CollectorState::CheckBundle;
        let next = collector.action().await;
        assert_eq!(next, CollectorState::PackBundle);
    }

    #[tokio::test]
    async fn check_bundle_waits_when_under_size_and_fresh() {
        let local = LocalQueue::new(4);
        let mut collector =
            ClientCollector::new(dummy_conn().await, local.receiver(), 4, 60, Arc::new(HaltFlag::new()));
        collector.tasks = vec![task()];
        collector.previous_send = Local::now();
        collector.state = CollectorState::CheckBundle;
        let next = collector.action().await;
        assert_eq!(next, CollectorState::GetLocal);
    }

    #[tokio::test]
    async fn check_bundle_flushes_partial_bundle_after_wait_elapses() {
        let local = LocalQueue::new(4);
        let mut collector =
            ClientCollector::new(dummy_conn().await, local.receiver(), 4, 1, Arc::new(HaltFlag::new()));
        collector.tasks = vec![task()];
        collector.previous_send = Local::now() - chrono::Duration::seconds(5);
        collector.state = CollectorState::CheckBundle;
        let next = collector.action().await;
        assert_eq!(next, CollectorState::PackBundle);
    }

    #[tokio::test]
    async fn sentinel_moves_straight_to_final() {
        let local = LocalQueue::new(4);
        let tx = local.sender();
        tx.send(None, Duration::from_millis(100)).await.unwrap();
        let mut collector =
            ClientCollector::new(dummy_conn().await, local.receiver(), 4, 5, Arc::new(HaltFlag::new()));
        collector.state = CollectorState::GetLocal;
        let next = collector.action().await;
        assert_eq!(next, CollectorState::Final);
    }

    #[tokio::test]
    async fn finalize_flushes_remaining_tasks_before_halting() {
        let local = LocalQueue::new(4);
        let mut collector =
            ClientCollector::new(dummy_conn().await, local.receiver(), 4, 5, Arc::new(HaltFlag::new()));
        collector.tasks = vec![task()];
        collector.state = CollectorState::Final;
        let next = collector.action().await;
        assert_eq!(next, CollectorState::Halt);
        assert!(collector.tasks.is_empty());
    }
}
