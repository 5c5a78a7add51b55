//! `ClientHeartbeat`: periodically posts a liveness record to the server's
//! `heartbeat` queue until told the client is finished.
//!
//! Grounded on `original_source/client.py`'s `ClientHeartbeat`/`HeartbeatState`.
//! The Python original tracks a separate `no_wait` flag alongside its own
//! stop signal; here the same `Arc<HaltFlag>` the scheduler/collector use to
//! learn about a shutdown request also carries "this is the last beat, send
//! it and stop" — tripping it is structurally identical to `trip()` on any
//! other halt flag, so no second type is introduced.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use shared::fsm::{HaltFlag, MachineState, StateMachine};
use shared::heartbeat::{ClientState, Heartbeat};
use tracing::{debug, trace, warn};

use crate::queue::{QueueConn, QueueError};

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(2);
const WAIT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Start,
    Submit,
    Wait,
    Final,
    Halt,
}

impl MachineState for HeartbeatState {
    fn halt_state() -> Self {
        HeartbeatState::Halt
    }
}

pub struct ClientHeartbeat {
    state: HeartbeatState,
    conn: QueueConn,
    client_id: String,
    client_host: String,
    heartrate: chrono::Duration,
    previous: chrono::DateTime<Local>,
    finished: Arc<HaltFlag>,
}

impl ClientHeartbeat {
    pub fn new(
        conn: QueueConn,
        client_id: impl Into<String>,
        client_host: impl Into<String>,
        heartrate_secs: u64,
        finished: Arc<HaltFlag>,
    ) -> Self {
        ClientHeartbeat {
            state: HeartbeatState::Start,
            conn,
            client_id: client_id.into(),
            client_host: client_host.into(),
            heartrate: chrono::Duration::seconds(heartrate_secs.max(1) as i64),
            previous: Local::now(),
            finished,
        }
    }

    fn start(&mut self) -> HeartbeatState {
        debug!("started (heartbeat)");
        self.previous = Local::now();
        HeartbeatState::Submit
    }

    async fn submit(&mut self) -> HeartbeatState {
        let state = if self.finished.is_tripped() { ClientState::Finished } else { ClientState::Running };
        let hb = Heartbeat::new(self.client_id.clone(), self.client_host.clone(), state);
        let data = hb.pack();

        match self.conn.put(Some(&data), SUBMIT_TIMEOUT).await {
            Ok(()) => {
                trace!(?state, "heartbeat sent");
                self.previous = Local::now();
                match state {
                    ClientState::Finished => HeartbeatState::Final,
                    ClientState::Running => HeartbeatState::Wait,
                }
            }
            Err(QueueError::Timeout) => HeartbeatState::Submit,
            Err(e) => {
                warn!(error = %e, "failed to send heartbeat");
                HeartbeatState::Submit
            }
        }
    }

    async fn wait(&mut self) -> HeartbeatState {
        if self.finished.is_tripped() {
            return HeartbeatState::Submit;
        }
        let elapsed = Local::now() - self.previous;
        if elapsed < self.heartrate {
            tokio::time::sleep(WAIT_POLL).await;
            HeartbeatState::Wait
        } else {
            HeartbeatState::Submit
        }
    }

    fn finalize(&mut self) -> HeartbeatState {
        debug!("done (heartbeat)");
        HeartbeatState::Halt
    }
}

#[async_trait]
impl StateMachine for ClientHeartbeat {
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
            HeartbeatState::Submit => self.submit().await,
            HeartbeatState::Wait => self.wait().await,
            HeartbeatState::Final => self.finalize(),
            HeartbeatState::Halt => HeartbeatState::Halt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueClient, QueueConfig, QueueName};
    use shared::wire::read_raw_frame;
    use tokio::net::TcpListener;

    async fn dummy_conn() -> QueueConn {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let client = QueueClient::new(QueueConfig::new("127.0.0.1", addr.port(), "key"));
        client.connect_put(QueueName::Heartbeat).await.unwrap()
    }

    #[tokio::test]
    async fn submit_sends_running_state_and_advances_to_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stub = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            use tokio::io::AsyncReadExt;
            let mut secret = [0u8; crate::queue::AUTH_KEY_LEN];
            stream.read_exact(&mut secret).await.unwrap();
            let _handshake = read_raw_frame(&mut stream).await.unwrap().unwrap();
            let frame = read_raw_frame(&mut stream).await.unwrap().unwrap();
            let hb: Heartbeat = serde_json::from_slice(&frame).unwrap();
            assert_eq!(hb.state, ClientState::Running);
        });

        let client = QueueClient::new(QueueConfig::new("127.0.0.1", addr.port(), "key"));
        let conn = client.connect_put(QueueName::Heartbeat).await.unwrap();
        let mut hb = ClientHeartbeat::new(conn, "client-1", "host-a", 10, Arc::new(HaltFlag::new()));
        let next = hb.action().await;
        assert_eq!(next, HeartbeatState::Wait);
        stub.await.unwrap();
    }

    #[tokio::test]
    async fn wait_returns_to_submit_once_finished_is_tripped() {
        let mut hb = ClientHeartbeat::new(dummy_conn().await, "client-1", "host-a", 10, Arc::new(HaltFlag::new()));
        hb.finished.trip();
        hb.state = HeartbeatState::Wait;
        let next = hb.action().await;
        assert_eq!(next, HeartbeatState::Submit);
    }

    #[tokio::test]
    async fn wait_loops_until_heartrate_elapses() {
        let mut hb = ClientHeartbeat::new(dummy_conn().await, "client-1", "host-a", 100, Arc::new(HaltFlag::new()));
        hb.previous = Local::now();
        hb.state = HeartbeatState::Wait;
        let next = hb.wait().await;
        assert_eq!(next, HeartbeatState::Wait);
    }

    #[tokio::test]
    async fn submit_with_finished_flag_goes_to_final() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stub = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            use tokio::io::AsyncReadExt;
            let mut secret = [0u8; crate::queue::AUTH_KEY_LEN];
            stream.read_exact(&mut secret).await.unwrap();
            let _handshake = read_raw_frame(&mut stream).await.unwrap().unwrap();
            let _frame = read_raw_frame(&mut stream).await.unwrap().unwrap();
        });

        let client = QueueClient::new(QueueConfig::new("127.0.0.1", addr.port(), "key"));
        let conn = client.connect_put(QueueName::Heartbeat).await.unwrap();
        let finished = Arc::new(HaltFlag::new());
        finished.trip();
        let mut hb = ClientHeartbeat::new(conn, "client-1", "host-a", 10, finished);
        let next = hb.action().await;
        assert_eq!(next, HeartbeatState::Final);
        stub.await.unwrap();
    }
}
