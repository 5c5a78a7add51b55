//! `ClientScheduler`: pulls task frames from the server's `scheduled` queue,
//! unpacks them, optionally confirms receipt, and hands each task to the
//! local executor channel.
//!
//! Grounded on `original_source/client.py`'s `ClientScheduler`/`SchedulerState`.
//! The remote `scheduled` queue carries one packed task per wire frame
//! rather than a Python-style list-in-one-message bundle (see
//! `server::scheduler`'s identical choice), so each "bundle" unpacked here
//! holds exactly one task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use shared::fsm::{HaltFlag, MachineState, StateMachine};
use shared::{ClientInfo, Task};
use tracing::{debug, warn};

use crate::local::LocalSender;
use crate::queue::{QueueConn, QueueError};

const GET_TIMEOUT: Duration = Duration::from_secs(2);
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);
const PUT_LOCAL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Start,
    GetRemote,
    Unpack,
    PutConfirm,
    PopTask,
    PutLocal,
    Final,
    Halt,
}

impl MachineState for SchedulerState {
    fn halt_state() -> Self {
        SchedulerState::Halt
    }
}

pub struct ClientScheduler {
    state: SchedulerState,
    scheduled: QueueConn,
    confirmed: Option<QueueConn>,
    local: LocalSender,
    timeout: Option<chrono::Duration>,
    previous_received: chrono::DateTime<Local>,
    bundle: Option<Vec<u8>>,
    client_info: Option<Vec<u8>>,
    tasks: Vec<Task>,
    client_id: String,
    client_host: String,
    halt: Arc<HaltFlag>,
}

impl ClientScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduled: QueueConn,
        confirmed: Option<QueueConn>,
        local: LocalSender,
        timeout_secs: Option<u64>,
        client_id: impl Into<String>,
        client_host: impl Into<String>,
        halt: Arc<HaltFlag>,
    ) -> Self {
        ClientScheduler {
            state: SchedulerState::Start,
            scheduled,
            confirmed,
            local,
            timeout: timeout_secs.map(|s| chrono::Duration::seconds(s as i64)),
            previous_received: Local::now(),
            bundle: None,
            client_info: None,
            tasks: Vec::new(),
            client_id: client_id.into(),
            client_host: client_host.into(),
            halt,
        }
    }

    fn start(&mut self) -> SchedulerState {
        debug!("started (scheduler)");
        self.previous_received = Local::now();
        SchedulerState::GetRemote
    }

    /// The client is expected to observe a "stop soon" request only here,
    /// matching the server handing out a bundle at its own pace — any task
    /// already in flight below this state runs to completion.
    async fn get_remote(&mut self) -> SchedulerState {
        if self.halt.is_tripped() {
            debug!("halt requested");
            return SchedulerState::Final;
        }
        match self.scheduled.get(GET_TIMEOUT).await {
            Ok(Some(data)) => {
                self.bundle = Some(data);
                self.previous_received = Local::now();
                SchedulerState::Unpack
            }
            Ok(None) => {
                debug!("disconnect received");
                SchedulerState::Final
            }
            Err(QueueError::Timeout) => {
                let waited = Local::now() - self.previous_received;
                match self.timeout {
                    Some(limit) if waited >= limit => {
                        debug!(?waited, "client idle timeout reached");
                        SchedulerState::Final
                    }
                    _ => SchedulerState::GetRemote,
                }
            }
            Err(e) => {
                warn!(error = %e, "scheduled queue error");
                SchedulerState::GetRemote
            }
        }
    }

    fn unpack_bundle(&mut self) -> SchedulerState {
        let Some(data) = self.bundle.take() else {
            return SchedulerState::GetRemote;
        };
        match Task::unpack(&data) {
            Ok(task) => self.tasks = vec![task],
            Err(e) => {
                warn!(error = %e, "failed to unpack scheduled task");
                self.tasks.clear();
                return SchedulerState::GetRemote;
            }
        }
        if self.confirmed.is_none() {
            SchedulerState::PopTask
        } else {
            let info = ClientInfo::from_tasks(&self.client_id, &self.client_host, &self.tasks);
            self.client_info = Some(info.pack());
            SchedulerState::PutConfirm
        }
    }

    async fn put_confirm(&mut self) -> SchedulerState {
        let Some(conn) = self.confirmed.as_mut() else {
            return SchedulerState::PopTask;
        };
        let Some(data) = self.client_info.as_deref() else {
            return SchedulerState::PopTask;
        };
        match conn.put(Some(data), CONFIRM_TIMEOUT).await {
            Ok(()) => {
                debug!(count = self.tasks.len(), "confirmed tasks");
                self.client_info = None;
                SchedulerState::PopTask
            }
            Err(QueueError::Timeout) => SchedulerState::PutConfirm,
            Err(e) => {
                warn!(error = %e, "failed to confirm tasks");
                self.client_info = None;
                SchedulerState::PopTask
            }
        }
    }

    fn pop_task(&mut self) -> SchedulerState {
        if self.tasks.is_empty() {
            SchedulerState::GetRemote
        } else {
            SchedulerState::PutLocal
        }
    }

    async fn put_local(&mut self) -> SchedulerState {
        if self.tasks.is_empty() {
            return SchedulerState::PopTask;
        }
        let task = self.tasks[0].clone();
        match self.local.send(Some(task), PUT_LOCAL_TIMEOUT).await {
            Ok(()) => {
                self.tasks.remove(0);
                SchedulerState::PopTask
            }
            Err(_) => SchedulerState::PutLocal,
        }
    }

    fn finalize(&mut self) -> SchedulerState {
        debug!("done (scheduler)");
        SchedulerState::Halt
    }
}

#[async_trait]
impl StateMachine for ClientScheduler {
    type State = SchedulerState;

    fn state(&self) -> SchedulerState {
        self.state
    }

    fn set_state(&mut self, state: SchedulerState) {
        self.state = state;
    }

    async fn action(&mut self) -> SchedulerState {
        match self.state {
            SchedulerState::Start => self.start(),
            SchedulerState::GetRemote => self.get_remote().await,
            SchedulerState::Unpack => self.unpack_bundle(),
            SchedulerState::PutConfirm => self.put_confirm().await,
            SchedulerState::PopTask => self.pop_task(),
            SchedulerState::PutLocal => self.put_local().await,
            SchedulerState::Final => self.finalize(),
            SchedulerState::Halt => SchedulerState::Halt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalQueue;
    use crate::queue::{QueueClient, QueueConfig, QueueName};
    use tokio::net::TcpListener;

    /// A `QueueConn` can only be constructed by dialing a real socket; tests
    /// below that don't exercise `get_remote` build one against a throwaway
    /// listener that is accepted once and then idle.
    async fn dummy_conn() -> QueueConn {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let client = QueueClient::new(QueueConfig::new("127.0.0.1", addr.port(), "key"));
        client.connect_get(QueueName::Scheduled).await.unwrap()
    }

    async fn test_scheduler(confirmed: Option<QueueConn>, local: LocalSender) -> ClientScheduler {
        ClientScheduler::new(
            dummy_conn().await,
            confirmed,
            local,
            None,
            "client-1",
            "host-a",
            Arc::new(HaltFlag::new()),
        )
    }

    #[tokio::test]
    async fn unpack_bundle_with_no_confirm_goes_straight_to_pop_task() {
        let local = LocalQueue::new(4);
        let mut scheduler = test_scheduler(None, local.sender()).await;
        let task = Task::new("echo hi", Default::default(), "sub-1", "host-a");
        scheduler.bundle = Some(task.pack());
        let next = scheduler.action().await;
        assert_eq!(next, SchedulerState::PopTask);
        assert_eq!(scheduler.tasks.len(), 1);
    }

    #[tokio::test]
    async fn unpack_bundle_with_confirm_enabled_builds_client_info() {
        let local = LocalQueue::new(4);
        let confirmed = Some(dummy_conn().await);
        let mut scheduler = test_scheduler(confirmed, local.sender()).await;
        let task = Task::new("echo hi", Default::default(), "sub-1", "host-a");
        scheduler.bundle = Some(task.pack());
        let next = scheduler.action().await;
        assert_eq!(next, SchedulerState::PutConfirm);
        assert!(scheduler.client_info.is_some());
    }

    #[tokio::test]
    async fn pop_task_with_no_remaining_tasks_goes_to_get_remote() {
        let local = LocalQueue::new(4);
        let mut scheduler = test_scheduler(None, local.sender()).await;
        scheduler.tasks.clear();
        scheduler.state = SchedulerState::PopTask;
        let next = scheduler.action().await;
        assert_eq!(next, SchedulerState::GetRemote);
    }

    #[tokio::test]
    async fn pop_task_with_remaining_task_goes_to_put_local() {
        let local = LocalQueue::new(4);
        let mut scheduler = test_scheduler(None, local.sender()).await;
        scheduler.tasks = vec![Task::new("echo hi", Default::default(), "sub-1", "host-a")];
        scheduler.state = SchedulerState::PopTask;
        let next = scheduler.action().await;
        assert_eq!(next, SchedulerState::PutLocal);
    }

    #[tokio::test]
    async fn put_local_delivers_task_and_pops_it() {
        let local = LocalQueue::new(4);
        let rx = local.receiver();
        let mut scheduler = test_scheduler(None, local.sender()).await;
        scheduler.tasks = vec![Task::new("echo hi", Default::default(), "sub-1", "host-a")];
        scheduler.state = SchedulerState::PutLocal;
        let next = scheduler.action().await;
        assert_eq!(next, SchedulerState::PopTask);
        assert!(scheduler.tasks.is_empty());
        let got = rx.recv(Duration::from_millis(100)).await.unwrap();
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn halt_flag_short_circuits_get_remote() {
        let local = LocalQueue::new(4);
        let mut scheduler = test_scheduler(None, local.sender()).await;
        scheduler.halt.trip();
        scheduler.state = SchedulerState::GetRemote;
        let next = scheduler.action().await;
        assert_eq!(next, SchedulerState::Final);
    }
}
