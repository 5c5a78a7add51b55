//! `HeartMonitor`: tracks per-client liveness via the `heartbeat` queue,
//! evicts clients that stop beating, and (on shutdown) signals every
//! connected client to disconnect by pushing a sentinel onto `scheduled`.
//!
//! Grounded on `original_source/server.py`'s `HeartMonitor`/`HeartbeatState`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use shared::fsm::{HaltFlag, MachineState, StateMachine};
use shared::heartbeat::{ClientState, Heartbeat};
use shared::Client;
use tracing::{debug, info, warn};

use crate::queue::{QueueError, QueueName, QueueServer};
use crate::store::Store;

const GET_TIMEOUT: Duration = Duration::from_secs(2);
const POST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Start,
    Next,
    Update,
    Switch,
    Check,
    Signal,
    Final,
    Halt,
}

impl MachineState for HeartbeatState {
    fn halt_state() -> Self {
        HeartbeatState::Halt
    }
}

pub struct HeartMonitor {
    state: HeartbeatState,
    queue: QueueServer,
    store: Arc<Store>,
    beats: HashMap<String, Heartbeat>,
    pending: Option<Heartbeat>,
    last_check: chrono::DateTime<Local>,
    wait_check: chrono::Duration,
    evict_after: chrono::Duration,
    startup_phase: bool,
    scheduler_done: Arc<HaltFlag>,
    should_signal: bool,
    signaled_clients: bool,
    server_id: String,
    server_host: String,
    halt: Arc<HaltFlag>,
}

impl HeartMonitor {
    /// `evict_after_secs` must be at least 10 (`wait_check` is a tenth of
    /// it), matching the original's validation at construction time.
    pub fn new(
        queue: QueueServer,
        store: Arc<Store>,
        evict_after_secs: i64,
        scheduler_done: Arc<HaltFlag>,
        halt: Arc<HaltFlag>,
        server_id: impl Into<String>,
        server_host: impl Into<String>,
    ) -> Self {
        let evict_after_secs = evict_after_secs.max(10);
        HeartMonitor {
            state: HeartbeatState::Start,
            queue,
            store,
            beats: HashMap::new(),
            pending: None,
            last_check: Local::now(),
            wait_check: chrono::Duration::seconds(evict_after_secs / 10),
            evict_after: chrono::Duration::seconds(evict_after_secs),
            startup_phase: true,
            scheduler_done,
            should_signal: false,
            signaled_clients: false,
            server_id: server_id.into(),
            server_host: server_host.into(),
            halt,
        }
    }

    fn start(&mut self) -> HeartbeatState {
        debug!("started (heartmonitor)");
        self.last_check = Local::now();
        HeartbeatState::Next
    }

    async fn get_next(&mut self) -> HeartbeatState {
        match self.queue.get(QueueName::Heartbeat, GET_TIMEOUT).await {
            Ok(Some(data)) => match Heartbeat::unpack(&data) {
                Ok(hb) => {
                    self.pending = Some(hb);
                    HeartbeatState::Update
                }
                Err(e) => {
                    warn!(error = %e, "failed to unpack heartbeat");
                    HeartbeatState::Switch
                }
            },
            Ok(None) => HeartbeatState::Switch,
            Err(QueueError::Timeout) => HeartbeatState::Switch,
            Err(e) => {
                warn!(error = %e, "heartbeat queue error");
                HeartbeatState::Switch
            }
        }
    }

    fn update_client(&mut self) -> HeartbeatState {
        if let Some(hb) = self.pending.take() {
            match hb.state {
                ClientState::Finished => {
                    debug!(client = %hb.uuid, "client reported finished");
                    self.beats.remove(&hb.uuid);
                    if let Err(e) = self.store.evict_client(&hb.uuid) {
                        warn!(error = %e, "failed to evict finished client");
                    }
                }
                ClientState::Running => {
                    // A beat from a client we'd previously (incorrectly)
                    // evicted means it was never actually gone; re-register
                    // it rather than leaving it evicted forever.
                    let is_rejoin = !self.beats.contains_key(&hb.uuid);
                    self.beats.insert(hb.uuid.clone(), hb.clone());
                    let client = Client::from_heartbeat(&hb, &self.server_id, &self.server_host);
                    if let Err(e) = self.store.upsert_client(&client) {
                        warn!(error = %e, "failed to persist client heartbeat");
                    }
                    if is_rejoin {
                        info!(client = %hb.uuid, "client (re)registered");
                    }
                }
            }
        }
        HeartbeatState::Next
    }

    fn switch_mode(&mut self) -> HeartbeatState {
        if self.halt.is_tripped() {
            self.should_signal = true;
            return HeartbeatState::Signal;
        }
        if self.scheduler_done.is_tripped() {
            if self.beats.is_empty() {
                return HeartbeatState::Final;
            }
            if !self.signaled_clients {
                self.should_signal = true;
                return HeartbeatState::Signal;
            }
        }
        let elapsed = Local::now() - self.last_check;
        if elapsed >= self.wait_check {
            return HeartbeatState::Check;
        }
        HeartbeatState::Next
    }

    fn check_clients(&mut self) -> HeartbeatState {
        self.last_check = Local::now();
        let deadline = Local::now() - self.evict_after;
        let stale: Vec<String> = self
            .beats
            .iter()
            .filter(|(_, hb)| hb.time < deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            warn!(client = %id, "evicting client, no heartbeat in evict_after window");
            self.beats.remove(&id);
            if let Err(e) = self.store.evict_client(&id) {
                warn!(error = %e, "failed to evict stale client");
            }
        }
        if self.startup_phase {
            self.startup_phase = false;
        }
        if self.scheduler_done.is_tripped() && self.beats.is_empty() {
            return HeartbeatState::Final;
        }
        HeartbeatState::Next
    }

    async fn signal_clients(&mut self) -> HeartbeatState {
        if self.should_signal {
            for _ in 0..self.beats.len().max(1) {
                if let Err(e) = self.queue.put(QueueName::Scheduled, None, POST_TIMEOUT).await {
                    warn!(error = %e, "failed to signal client disconnect");
                }
            }
            self.should_signal = false;
            self.signaled_clients = true;
        }
        // An external kill (`halt`) tears down immediately; a normal
        // scheduler-done shutdown waits for the connected-client map to
        // empty as clients disconnect in response to the sentinel.
        if self.halt.is_tripped() {
            return HeartbeatState::Final;
        }
        HeartbeatState::Next
    }

    fn finalize(&mut self) -> HeartbeatState {
        debug!(connected = self.beats.len(), "done (heartmonitor)");
        HeartbeatState::Halt
    }
}

#[async_trait]
impl StateMachine for HeartMonitor {
    type State = HeartbeatState;

    fn state(&self) -> HeartbeatState {
        self.state
    }

    fn set_state(&mut self, state: HeartbeatState) {
        self.state = state;
    }

    async fn action(&mut self) -> HeartbeatState {
        match self.state {
            HeartbeatState::Start => self.start(),
            HeartbeatState::Next => self.get_next().await,
            HeartbeatState::Update => self.update_client(),
            HeartbeatState::Switch => self.switch_mode(),
            HeartbeatState::Check => self.check_clients(),
            HeartbeatState::Signal => self.signal_clients().await,
            HeartbeatState::Final => self.finalize(),
            HeartbeatState::Halt => HeartbeatState::Halt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HeartMonitor {
        let queue = QueueServer::new("key", 4);
        let store = Arc::new(Store::in_memory());
        let scheduler_done = Arc::new(HaltFlag::new());
        let halt = Arc::new(HaltFlag::new());
        HeartMonitor::new(queue, store, 10, scheduler_done, halt, "server-1", "host-a")
    }

    #[tokio::test]
    async fn running_beat_registers_client() {
        let mut hm = monitor();
        let hb = Heartbeat::new("client-1", "host-b", ClientState::Running);
        hm.pending = Some(hb);
        hm.state = HeartbeatState::Update;
        let next = hm.action().await;
        assert_eq!(next, HeartbeatState::Next);
        assert!(hm.beats.contains_key("client-1"));
    }

    #[tokio::test]
    async fn finished_beat_removes_client() {
        let mut hm = monitor();
        let hb = Heartbeat::new("client-1", "host-b", ClientState::Running);
        hm.beats.insert("client-1".to_string(), hb);
        hm.pending = Some(Heartbeat::new("client-1", "host-b", ClientState::Finished));
        hm.state = HeartbeatState::Update;
        hm.action().await;
        assert!(!hm.beats.contains_key("client-1"));
    }

    #[tokio::test]
    async fn halt_flag_moves_to_signal() {
        let mut hm = monitor();
        hm.halt.trip();
        hm.state = HeartbeatState::Switch;
        let next = hm.action().await;
        assert_eq!(next, HeartbeatState::Signal);
        assert!(hm.should_signal);
    }

    #[tokio::test]
    async fn stale_beat_is_evicted_on_check() {
        let mut hm = monitor();
        let mut hb = Heartbeat::new("client-1", "host-b", ClientState::Running);
        hb.time = Local::now() - chrono::Duration::seconds(30);
        hm.beats.insert("client-1".to_string(), hb);
        hm.state = HeartbeatState::Check;
        hm.action().await;
        assert!(hm.beats.is_empty());
    }

    #[tokio::test]
    async fn finalizes_when_scheduler_done_and_no_clients() {
        let mut hm = monitor();
        hm.scheduler_done.trip();
        hm.state = HeartbeatState::Switch;
        hm.last_check = Local::now();
        let next = hm.action().await;
        assert_eq!(next, HeartbeatState::Final);
    }

    #[tokio::test]
    async fn scheduler_done_with_connected_clients_signals_before_finalizing() {
        let mut hm = monitor();
        hm.beats.insert("client-1".to_string(), Heartbeat::new("client-1", "host-b", ClientState::Running));
        hm.scheduler_done.trip();
        hm.last_check = Local::now();

        hm.state = HeartbeatState::Switch;
        let next = hm.action().await;
        assert_eq!(next, HeartbeatState::Signal);
        assert!(hm.should_signal);

        hm.state = HeartbeatState::Signal;
        let next = hm.action().await;
        assert_eq!(next, HeartbeatState::Next, "still waiting on a connected client");
        assert!(hm.signaled_clients);

        // Once every client has disconnected (e.g. after evicting the last
        // one), the monitor finalizes without signaling again.
        hm.beats.clear();
        hm.state = HeartbeatState::Switch;
        let next = hm.action().await;
        assert_eq!(next, HeartbeatState::Final);
    }
}
