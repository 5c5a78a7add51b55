//! Persistent `Task` and `Client` records.
//!
//! Field lists and invariants (I-1..I-4) mirror `original_source/data/model.py`;
//! the store-facing query methods (`select_new`, `next`, `revert_orphaned`,
//! ...) live in `server::store` since they require a live connection — this
//! module only owns the shape of a row and its wire (de)serialization.

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::wire::iso_space;

/// A tag value: bool / int / float / string / null (an empty-string value on
/// the command line is represented as `Tag::String(String::new())`, the
/// "bare tag" case).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Null,
}

pub type TagMap = BTreeMap<String, TagValue>;

/// A persistent task record. Created once by `Task::new`, updated in place
/// thereafter; no task is ever re-keyed (I-1..I-4 in `spec.md` §3.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub args: String,

    pub submit_id: String,
    pub submit_host: String,
    #[serde(with = "iso_space")]
    pub submit_time: DateTime<Local>,

    pub server_id: Option<String>,
    pub server_host: Option<String>,
    #[serde(with = "iso_space::option")]
    pub schedule_time: Option<DateTime<Local>>,

    pub client_id: Option<String>,
    pub client_host: Option<String>,

    pub command: Option<String>,

    #[serde(with = "iso_space::option")]
    pub start_time: Option<DateTime<Local>>,
    #[serde(with = "iso_space::option")]
    pub completion_time: Option<DateTime<Local>>,
    pub exit_status: Option<i32>,

    pub outpath: Option<String>,
    pub errpath: Option<String>,

    pub attempt: i32,
    pub retried: bool,
    pub previous_id: Option<String>,
    pub next_id: Option<String>,

    pub waited: Option<i64>,
    pub duration: Option<i64>,

    pub tag: TagMap,
}

/// Derived (not stored) lifecycle view of a task, per `spec.md` §3.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Scheduled,
    Running,
    Completed,
    Cancelled,
    Retried,
}

impl Task {
    /// Construct a new task for submission: fresh id, `attempt = 1`,
    /// `retried = false`, no retry-chain links.
    pub fn new(
        args: impl Into<String>,
        tag: TagMap,
        submit_id: impl Into<String>,
        submit_host: impl Into<String>,
    ) -> Self {
        Task {
            id: Uuid::new_v4().to_string(),
            args: args.into(),
            submit_id: submit_id.into(),
            submit_host: submit_host.into(),
            submit_time: Local::now(),
            server_id: None,
            server_host: None,
            schedule_time: None,
            client_id: None,
            client_host: None,
            command: None,
            start_time: None,
            completion_time: None,
            exit_status: None,
            outpath: None,
            errpath: None,
            attempt: 1,
            retried: false,
            previous_id: None,
            next_id: None,
            waited: None,
            duration: None,
            tag,
        }
    }

    /// Construct the next attempt in a retry chain from a failed
    /// predecessor. Caller is responsible for stamping `retried = true` and
    /// `next_id` on `self` once the new task's id is known (see
    /// `server::store::next`, which resolves Open Question (b): both eager
    /// and non-eager scheduling update `next_id`).
    pub fn retry_of(&self) -> Self {
        Task {
            id: Uuid::new_v4().to_string(),
            args: self.args.clone(),
            submit_id: self.submit_id.clone(),
            submit_host: self.submit_host.clone(),
            submit_time: self.submit_time,
            server_id: None,
            server_host: None,
            schedule_time: None,
            client_id: None,
            client_host: None,
            command: None,
            start_time: None,
            completion_time: None,
            exit_status: None,
            outpath: None,
            errpath: None,
            attempt: self.attempt + 1,
            retried: false,
            previous_id: Some(self.id.clone()),
            next_id: None,
            waited: None,
            duration: None,
            tag: self.tag.clone(),
        }
    }

    /// Derived lifecycle state (not stored directly).
    pub fn state(&self) -> TaskState {
        if self.schedule_time.is_none() {
            TaskState::New
        } else if self.retried {
            TaskState::Retried
        } else if self.exit_status == Some(-1) && self.start_time.is_none() {
            TaskState::Cancelled
        } else if self.completion_time.is_some() {
            TaskState::Completed
        } else if self.start_time.is_some() {
            TaskState::Running
        } else {
            TaskState::Scheduled
        }
    }

    /// Eligible for retry iff non-zero exit, not already retried, and under
    /// the attempt ceiling (I-4).
    pub fn is_retry_eligible(&self, max_attempts: i32) -> bool {
        matches!(self.exit_status, Some(status) if status != 0)
            && !self.retried
            && self.attempt < max_attempts
    }

    /// Serialize to the wire bundle representation (UTF-8 JSON bytes).
    pub fn pack(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Task serialization is infallible")
    }

    /// Deserialize from packed bundle bytes.
    pub fn unpack(data: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Clear every run-derived field, returning the row to `NEW`. Used by
    /// `revert_interrupted`/`revert_orphaned`/operator `task update --revert`.
    pub fn revert(&mut self) {
        self.server_id = None;
        self.server_host = None;
        self.schedule_time = None;
        self.client_id = None;
        self.client_host = None;
        self.command = None;
        self.start_time = None;
        self.completion_time = None;
        self.exit_status = None;
        self.outpath = None;
        self.errpath = None;
        self.waited = None;
        self.duration = None;
    }
}

/// A connected (or formerly connected) worker instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub host: String,
    pub server_id: String,
    pub server_host: String,
    #[serde(with = "iso_space")]
    pub connected_at: DateTime<Local>,
    #[serde(with = "iso_space::option")]
    pub disconnected_at: Option<DateTime<Local>>,
    pub evicted: bool,
}

impl Client {
    pub fn from_heartbeat(
        hb: &crate::heartbeat::Heartbeat,
        server_id: impl Into<String>,
        server_host: impl Into<String>,
    ) -> Self {
        Client {
            id: hb.uuid.clone(),
            host: hb.host.clone(),
            server_id: server_id.into(),
            server_host: server_host.into(),
            connected_at: hb.time,
            disconnected_at: None,
            evicted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(k: &str, v: &str) -> TagMap {
        let mut m = TagMap::new();
        m.insert(k.to_string(), TagValue::String(v.to_string()));
        m
    }

    #[test]
    fn new_task_has_attempt_one_and_no_chain() {
        let t = Task::new("echo hi", TagMap::new(), "sub-1", "host-a");
        assert_eq!(t.attempt, 1);
        assert!(!t.retried);
        assert!(t.previous_id.is_none());
        assert!(t.next_id.is_none());
        assert_eq!(t.state(), TaskState::New);
    }

    #[test]
    fn retry_of_increments_attempt_and_links_chain() {
        let t = Task::new("false", TagMap::new(), "sub-1", "host-a");
        let retry = t.retry_of();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.previous_id.as_deref(), Some(t.id.as_str()));
        assert_eq!(retry.args, t.args);
    }

    #[test]
    fn pack_unpack_round_trips() {
        let mut t = Task::new("echo hi", tag("k", "v"), "sub-1", "host-a");
        t.schedule_time = Some(Local::now());
        t.exit_status = Some(0);
        let packed = t.pack();
        let unpacked = Task::unpack(&packed).unwrap();
        assert_eq!(t, unpacked);
    }

    #[test]
    fn retry_eligibility_respects_attempt_ceiling() {
        let mut t = Task::new("false", TagMap::new(), "sub-1", "host-a");
        t.exit_status = Some(1);
        assert!(t.is_retry_eligible(2));
        t.attempt = 2;
        assert!(!t.is_retry_eligible(2));
    }

    #[test]
    fn revert_clears_run_fields_but_not_identity() {
        let mut t = Task::new("echo hi", TagMap::new(), "sub-1", "host-a");
        t.schedule_time = Some(Local::now());
        t.exit_status = Some(0);
        t.completion_time = Some(Local::now());
        t.revert();
        assert!(t.schedule_time.is_none());
        assert!(t.exit_status.is_none());
        assert_eq!(t.state(), TaskState::New);
    }
}
