//! Client liveness heartbeat, sent periodically over the `heartbeat` queue.
//!
//! Grounded on `original_source/core/heartbeat.py`'s `ClientState` enum and
//! `Heartbeat` dataclass.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::wire::iso_space;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Running,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub uuid: String,
    pub host: String,
    #[serde(with = "iso_space")]
    pub time: DateTime<Local>,
    pub state: ClientState,
}

impl Heartbeat {
    pub fn new(uuid: impl Into<String>, host: impl Into<String>, state: ClientState) -> Self {
        Heartbeat {
            uuid: uuid.into(),
            host: host.into(),
            time: Local::now(),
            state,
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Heartbeat serialization is infallible")
    }

    pub fn unpack(data: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips() {
        let hb = Heartbeat::new("client-1", "host-a", ClientState::Running);
        let packed = hb.pack();
        let unpacked = Heartbeat::unpack(&packed).unwrap();
        assert_eq!(hb, unpacked);
    }

    #[test]
    fn finished_state_serializes_lowercase() {
        let hb = Heartbeat::new("client-1", "host-a", ClientState::Finished);
        let json = serde_json::to_string(&hb).unwrap();
        assert!(json.contains("\"finished\""));
    }
}
