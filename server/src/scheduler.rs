//! `Scheduler`: pulls the next bundle of tasks from the store and posts it
//! onto the `scheduled` queue for clients to pick up.
//!
//! Grounded on `original_source/server.py`'s `Scheduler`/`SchedulerState`.

use std::time::Duration;

use async_trait::async_trait;
use shared::fsm::{HaltFlag, MachineState, StateMachine};
use shared::Task;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::queue::{QueueName, QueueServer};
use crate::store::Store;

const QUERY_PAUSE: Duration = Duration::from_secs(2);
const POST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Start,
    Load,
    Pack,
    Post,
    Final,
    Halt,
}

impl MachineState for SchedulerState {
    fn halt_state() -> Self {
        SchedulerState::Halt
    }
}

pub struct Scheduler {
    state: SchedulerState,
    queue: QueueServer,
    store: Arc<Store>,
    tasks: Vec<Task>,
    bundle: Vec<Vec<u8>>,
    bundlesize: usize,
    max_retries: i32,
    eager: bool,
    forever: bool,
    restart: bool,
    startup_phase: bool,
    halt: Arc<HaltFlag>,
    server_id: String,
    server_host: String,
}

impl Scheduler {
    pub fn new(
        queue: QueueServer,
        store: Arc<Store>,
        bundlesize: usize,
        max_retries: i32,
        eager: bool,
        forever: bool,
        restart: bool,
        halt: Arc<HaltFlag>,
        server_id: impl Into<String>,
        server_host: impl Into<String>,
    ) -> Self {
        Scheduler {
            state: SchedulerState::Start,
            queue,
            store,
            tasks: Vec::new(),
            bundle: Vec::new(),
            bundlesize,
            max_retries: max_retries + 1, // `attempts` ceiling is max_retries + 1
            eager,
            forever,
            restart,
            startup_phase: !restart,
            halt,
            server_id: server_id.into(),
            server_host: server_host.into(),
        }
    }

    async fn start(&mut self) -> SchedulerState {
        debug!("started (scheduler)");
        if self.forever {
            info!("scheduler will run forever");
        }
        let remaining = self.store.count_remaining().unwrap_or(0);
        if remaining > 0 {
            let reverted = self.store.revert_interrupted().unwrap_or(0);
            info!(remaining, reverted, "reverted previously interrupted tasks");
        }
        SchedulerState::Load
    }

    async fn load_bundle(&mut self) -> SchedulerState {
        self.tasks = self
            .store
            .next(self.bundlesize, self.max_retries, self.eager, &self.server_id, &self.server_host)
            .unwrap_or_default();
        if !self.tasks.is_empty() {
            self.startup_phase = false;
            return SchedulerState::Pack;
        }
        let remaining = self.store.count_remaining().unwrap_or(0);
        let total = self.store.count().unwrap_or(0);
        if !self.forever && total > 0 && remaining == 0 && !self.startup_phase {
            return SchedulerState::Final;
        }
        tokio::time::sleep(QUERY_PAUSE).await;
        SchedulerState::Load
    }

    fn pack_bundle(&mut self) -> SchedulerState {
        self.bundle = self.tasks.iter().map(Task::pack).collect();
        SchedulerState::Post
    }

    async fn post_bundle(&mut self) -> SchedulerState {
        for data in self.bundle.drain(..) {
            if self.queue.put(QueueName::Scheduled, Some(data), POST_TIMEOUT).await.is_err() {
                warn!("scheduled queue busy, retrying post");
                return SchedulerState::Post;
            }
        }
        debug!(count = self.tasks.len(), "scheduled tasks");
        SchedulerState::Load
    }

    fn finalize(&mut self) -> SchedulerState {
        debug!("done (scheduler)");
        SchedulerState::Halt
    }
}

#[async_trait]
impl StateMachine for Scheduler {
    type State = SchedulerState;

    fn state(&self) -> SchedulerState {
        self.state
    }

    fn set_state(&mut self, state: SchedulerState) {
        self.state = state;
    }

    async fn action(&mut self) -> SchedulerState {
        if self.halt.is_tripped() && self.state != SchedulerState::Post {
            return SchedulerState::Final;
        }
        match self.state {
            SchedulerState::Start => self.start().await,
            SchedulerState::Load => self.load_bundle().await,
            SchedulerState::Pack => self.pack_bundle(),
            SchedulerState::Post => self.post_bundle().await,
            SchedulerState::Final => self.finalize(),
            SchedulerState::Halt => SchedulerState::Halt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<Store> {
        Arc::new(Store::in_memory())
    }

    #[tokio::test]
    async fn finalizes_once_every_task_is_complete_in_restart_mode() {
        use shared::model::TagMap;
        use shared::Task;

        let dir = tempfile::tempdir().unwrap();
        let real_store = Store::open(dir.path().join("test.db")).unwrap();
        real_store.initdb().unwrap();
        let mut task = Task::new("echo hi", TagMap::new(), "sub-1", "host-a");
        task.schedule_time = Some(chrono::Local::now());
        task.completion_time = Some(chrono::Local::now());
        task.exit_status = Some(0);
        real_store.insert_task(&task).unwrap();

        let queue = QueueServer::new("key", 4);
        let halt = Arc::new(HaltFlag::new());
        let mut scheduler = Scheduler::new(
            queue, Arc::new(real_store), 1, 0, false, false, true, halt, "server-1", "host-a",
        );
        // restart_mode with every task already complete should halt quickly
        // once load_bundle observes zero remaining and non-startup phase.
        scheduler.state = SchedulerState::Load;
        let next = scheduler.action().await;
        assert_eq!(next, SchedulerState::Final);
    }

    #[tokio::test]
    async fn an_empty_store_never_finalizes_on_its_own() {
        // Nothing was ever submitted (`count() == 0`): the scheduler keeps
        // polling rather than mistaking "no tasks yet" for "all done".
        let queue = QueueServer::new("key", 4);
        let halt = Arc::new(HaltFlag::new());
        let mut scheduler = Scheduler::new(
            queue, store(), 1, 0, false, false, true, halt, "server-1", "host-a",
        );
        scheduler.state = SchedulerState::Load;
        let next = scheduler.action().await;
        assert_eq!(next, SchedulerState::Load);
    }

    #[tokio::test]
    async fn halt_flag_short_circuits_to_final() {
        let queue = QueueServer::new("key", 4);
        let halt = Arc::new(HaltFlag::new());
        halt.trip();
        let mut scheduler = Scheduler::new(
            queue, store(), 1, 0, false, true, false, halt, "server-1", "host-a",
        );
        let next = scheduler.action().await;
        assert_eq!(next, SchedulerState::Final);
        assert_eq!(scheduler.finalize(), SchedulerState::Halt);
    }
}
