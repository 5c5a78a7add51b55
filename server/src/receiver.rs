//! `Receiver`: drains the `completed` queue and writes finished-task run
//! details back to the store, optionally redirecting failed task argument
//! lines to a file.
//!
//! Grounded on `original_source/server.py`'s `Receiver`/`ReceiverState`.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shared::fsm::{HaltFlag, MachineState, StateMachine};
use shared::Task;
use tracing::{debug, warn};

use crate::queue::{QueueError, QueueName, QueueServer};
use crate::store::Store;

const GET_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Start,
    Unload,
    Unpack,
    Update,
    Final,
    Halt,
}

impl MachineState for ReceiverState {
    fn halt_state() -> Self {
        ReceiverState::Halt
    }
}

pub struct Receiver {
    state: ReceiverState,
    queue: QueueServer,
    store: Arc<Store>,
    bundle: Option<Vec<u8>>,
    tasks: Vec<Task>,
    failures: Option<Box<dyn Write + Send>>,
    halt: Arc<HaltFlag>,
}

impl Receiver {
    pub fn new(
        queue: QueueServer,
        store: Arc<Store>,
        failures: Option<Box<dyn Write + Send>>,
        halt: Arc<HaltFlag>,
    ) -> Self {
        Receiver {
            state: ReceiverState::Start,
            queue,
            store,
            bundle: None,
            tasks: Vec::new(),
            failures,
            halt,
        }
    }

    async fn unload_bundle(&mut self) -> ReceiverState {
        match self.queue.get(QueueName::Completed, GET_TIMEOUT).await {
            Ok(Some(data)) => {
                self.bundle = Some(data);
                ReceiverState::Unpack
            }
            Ok(None) => ReceiverState::Final,
            Err(QueueError::Timeout) => ReceiverState::Unload,
            Err(e) => {
                warn!(error = %e, "completed queue error");
                ReceiverState::Unload
            }
        }
    }

    fn unpack_bundle(&mut self) -> ReceiverState {
        // A single completed-bundle frame packs every task's JSON back to
        // back isn't how `wire` frames work (one frame = one task here);
        // each bundle element arrives as its own queue message.
        if let Some(data) = self.bundle.take() {
            match Task::unpack(&data) {
                Ok(task) => self.tasks = vec![task],
                Err(e) => {
                    warn!(error = %e, "failed to unpack completed task");
                    self.tasks.clear();
                }
            }
        }
        ReceiverState::Update
    }

    fn update_tasks(&mut self) -> ReceiverState {
        if let Err(e) = self.store.update_completed(&self.tasks) {
            warn!(error = %e, "failed to persist completed tasks");
        }
        for task in &self.tasks {
            debug!(id = %task.id, "completed task");
            if task.exit_status != Some(0) {
                warn!(id = %task.id, status = ?task.exit_status, "non-zero exit status");
                if let Some(out) = &mut self.failures {
                    let _ = writeln!(out, "{}", task.args);
                }
            }
        }
        ReceiverState::Unload
    }

    fn finalize(&mut self) -> ReceiverState {
        debug!("done (receiver)");
        ReceiverState::Halt
    }
}

#[async_trait]
impl StateMachine for Receiver {
    type State = ReceiverState;

    fn state(&self) -> ReceiverState {
        self.state
    }

    fn set_state(&mut self, state: ReceiverState) {
        self.state = state;
    }

    async fn action(&mut self) -> ReceiverState {
        if self.halt.is_tripped() {
            return ReceiverState::Final;
        }
        match self.state {
            ReceiverState::Start => {
                debug!("started (receiver)");
                ReceiverState::Unload
            }
            ReceiverState::Unload => self.unload_bundle().await,
            ReceiverState::Unpack => self.unpack_bundle(),
            ReceiverState::Update => self.update_tasks(),
            ReceiverState::Final => self.finalize(),
            ReceiverState::Halt => ReceiverState::Halt,
        }
    }
}
