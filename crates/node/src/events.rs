//! Transfer event broadcast for the gateway layer.
//!
//! The RPC surface subscribes here to answer client polling: per-slice results, progress,
//! completion and the results of queries it forwarded to the indexing server.

use sds_protocol::{ListedFile, ResultCode};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum TransferEvent {
    Registered {
        sp_p2p_address: String,
        is_pp: bool,
    },
    UploadAccepted {
        file_hash: String,
        task_id: String,
        slices: usize,
    },
    SliceResult {
        task_key: String,
        file_hash: String,
        slice_hash: String,
        slice_number: u64,
        success: bool,
        peer: String,
    },
    Progress {
        task_key: String,
        file_hash: String,
        done_bytes: u64,
        total_bytes: u64,
    },
    Completed {
        task_key: String,
        file_hash: String,
        kind: String,
    },
    Failed {
        task_key: String,
        file_hash: String,
        code: String,
        reason: String,
    },
    Downloaded {
        req_id: String,
        file_hash: String,
        file_name: String,
        save_path: String,
        #[serde(skip)]
        data: Arc<Vec<u8>>,
    },
    FileList {
        req_id: String,
        files: Vec<ListedFile>,
        total: u64,
        page_id: u64,
    },
    Maintenance {
        starting: bool,
        success: bool,
        msg: String,
    },
    SliceMigrated {
        task_id: String,
        slice_hash: String,
        success: bool,
    },
    SliceVerified {
        task_id: String,
        slice_hash: String,
        success: bool,
    },
}

impl TransferEvent {
    pub fn failed(task_key: &str, file_hash: &str, code: ResultCode, reason: impl Into<String>) -> Self {
        TransferEvent::Failed {
            task_key: task_key.to_string(),
            file_hash: file_hash.to_string(),
            code: code.as_str().to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TransferEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishing without subscribers is not an error.
    pub fn publish(&self, event: TransferEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::default();
        bus.publish(TransferEvent::failed("k", "fh", ResultCode::Timeout, "dropped"));
        let mut rx = bus.subscribe();
        bus.publish(TransferEvent::failed("k", "fh", ResultCode::WrongFileSize, "size"));
        match rx.recv().await.unwrap() {
            TransferEvent::Failed { code, .. } => assert_eq!(code, "-4"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn serializes_tagged() {
        let event = TransferEvent::Progress {
            task_key: "fh".into(),
            file_hash: "fh".into(),
            done_bytes: 10,
            total_bytes: 20,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["data"]["done_bytes"], 10);
    }
}
