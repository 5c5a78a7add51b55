//! `Confirm`: drains the `confirmed` queue and stamps task ownership
//! (`client_id`/`client_host`) once a client acknowledges receipt of a
//! scheduled bundle.
//!
//! Grounded on `original_source/server.py`'s `Confirm`/`ConfirmState`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shared::fsm::{HaltFlag, MachineState, StateMachine};
use shared::ClientInfo;
use tracing::{debug, warn};

use crate::queue::{QueueError, QueueName, QueueServer};
use crate::store::Store;

const GET_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmState {
    Start,
    Unload,
    Unpack,
    Update,
    Final,
    Halt,
}

impl MachineState for ConfirmState {
    fn halt_state() -> Self {
        ConfirmState::Halt
    }
}

pub struct Confirm {
    state: ConfirmState,
    queue: QueueServer,
    store: Arc<Store>,
    client_data: Option<Vec<u8>>,
    client_info: Option<ClientInfo>,
    halt: Arc<HaltFlag>,
}

impl Confirm {
    pub fn new(queue: QueueServer, store: Arc<Store>, halt: Arc<HaltFlag>) -> Self {
        Confirm {
            state: ConfirmState::Start,
            queue,
            store,
            client_data: None,
            client_info: None,
            halt,
        }
    }

    async fn unload_info(&mut self) -> ConfirmState {
        match self.queue.get(QueueName::Confirmed, GET_TIMEOUT).await {
            Ok(Some(data)) => {
                self.client_data = Some(data);
                ConfirmState::Unpack
            }
            Ok(None) => ConfirmState::Final,
            Err(QueueError::Timeout) => ConfirmState::Unload,
            Err(e) => {
                warn!(error = %e, "confirmed queue error");
                ConfirmState::Unload
            }
        }
    }

    fn unpack_info(&mut self) -> ConfirmState {
        match self.client_data.take() {
            Some(data) => match ClientInfo::unpack(&data) {
                Ok(info) => {
                    debug!(count = info.task_ids.len(), client = %info.client_id, "confirmed tasks");
                    self.client_info = Some(info);
                }
                Err(e) => warn!(error = %e, "failed to unpack client info"),
            },
            None => {}
        }
        ConfirmState::Update
    }

    fn update_info(&mut self) -> ConfirmState {
        if let Some(info) = self.client_info.take() {
            if let Err(e) = self.store.update_assignment(&info.transpose()) {
                warn!(error = %e, "failed to persist task assignment");
            }
        }
        ConfirmState::Unload
    }

    fn finalize(&mut self) -> ConfirmState {
        debug!("done (confirm)");
        ConfirmState::Halt
    }
}

#[async_trait]
impl StateMachine for Confirm {
    type State = ConfirmState;

    fn state(&self) -> ConfirmState {
        self.state
    }

    fn set_state(&mut self, state: ConfirmState) {
        self.state = state;
    }

    async fn action(&mut self) -> ConfirmState {
        if self.halt.is_tripped() {
            return ConfirmState::Final;
        }
        match self.state {
            ConfirmState::Start => {
                debug!("started (confirm)");
                ConfirmState::Unload
            }
            ConfirmState::Unload => self.unload_info().await,
            ConfirmState::Unpack => self.unpack_info(),
            ConfirmState::Update => self.update_info(),
            ConfirmState::Final => self.finalize(),
            ConfirmState::Halt => ConfirmState::Halt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confirmation_bundle_round_trips_through_machine() {
        let queue = QueueServer::new("key", 4);
        let halt = Arc::new(HaltFlag::new());
        let info = ClientInfo::new("client-1", "host-a", vec!["t1".into(), "t2".into()]);
        queue.put(QueueName::Confirmed, Some(info.pack()), GET_TIMEOUT).await.unwrap();

        let mut confirm = Confirm::new(queue, Arc::new(Store::in_memory()), halt);
        confirm.state = ConfirmState::Unload;
        assert_eq!(confirm.action().await, ConfirmState::Unpack);
        assert_eq!(confirm.action().await, ConfirmState::Update);
        assert_eq!(confirm.action().await, ConfirmState::Unload);
    }

    #[tokio::test]
    async fn sentinel_moves_to_final() {
        let queue = QueueServer::new("key", 4);
        let halt = Arc::new(HaltFlag::new());
        queue.put(QueueName::Confirmed, None, GET_TIMEOUT).await.unwrap();
        let mut confirm = Confirm::new(queue, Arc::new(Store::in_memory()), halt);
        confirm.state = ConfirmState::Unload;
        assert_eq!(confirm.action().await, ConfirmState::Final);
    }
}
