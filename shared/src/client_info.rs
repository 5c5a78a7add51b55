//! `ClientInfo`: the confirmation bundle a client posts back to the server
//! naming which tasks it has taken ownership of.
//!
//! Grounded on `original_source/client.py`'s `ClientInfo` dataclass.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub client_host: String,
    pub task_ids: Vec<String>,
}

/// One row of the flattened `(task id, client id, client host)` triple this
/// bundle represents, used to update each task's ownership columns.
pub struct TaskAssignment {
    pub id: String,
    pub client_id: String,
    pub client_host: String,
}

impl ClientInfo {
    pub fn new(client_id: impl Into<String>, client_host: impl Into<String>, task_ids: Vec<String>) -> Self {
        ClientInfo {
            client_id: client_id.into(),
            client_host: client_host.into(),
            task_ids,
        }
    }

    pub fn from_tasks(
        client_id: impl Into<String>,
        client_host: impl Into<String>,
        tasks: &[crate::Task],
    ) -> Self {
        ClientInfo::new(client_id, client_host, tasks.iter().map(|t| t.id.clone()).collect())
    }

    pub fn pack(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ClientInfo serialization is infallible")
    }

    pub fn unpack(data: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Flatten into per-task assignment rows for a store update.
    pub fn transpose(&self) -> Vec<TaskAssignment> {
        self.task_ids
            .iter()
            .map(|id| TaskAssignment {
                id: id.clone(),
                client_id: self.client_id.clone(),
                client_host: self.client_host.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips() {
        let info = ClientInfo::new("client-1", "host-a", vec!["t1".into(), "t2".into()]);
        let packed = info.pack();
        let unpacked = ClientInfo::unpack(&packed).unwrap();
        assert_eq!(info, unpacked);
    }

    #[test]
    fn transpose_flattens_to_one_row_per_task() {
        let info = ClientInfo::new("client-1", "host-a", vec!["t1".into(), "t2".into()]);
        let rows = info.transpose();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "t1");
        assert_eq!(rows[0].client_id, "client-1");
        assert_eq!(rows[1].client_host, "host-a");
    }
}
