//! Teardown of transfer state: terminal task failures, closed links and stale entries.

use std::time::Duration;
use tracing::{debug, info, warn};

use super::SliceProtocolEngine;
use crate::conn::ConnId;
use crate::error::NodeError;
use crate::events::TransferEvent;
use crate::task::{Task, TaskKind};

/// Entry counts of the engine's per-transfer maps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub tasks: usize,
    pub routes: usize,
    pub outgoing: usize,
    pub incoming: usize,
    pub downloads: usize,
    pub pending_secrets: usize,
    pub migrations: usize,
}

impl BufferStats {
    /// No transfer holds any state. Routes are not counted.
    pub fn is_idle(&self) -> bool {
        self.tasks == 0
            && self.outgoing == 0
            && self.incoming == 0
            && self.downloads == 0
            && self.pending_secrets == 0
            && self.migrations == 0
    }
}

impl SliceProtocolEngine {
    pub fn buffer_stats(&self) -> BufferStats {
        BufferStats {
            tasks: self.tasks.len(),
            routes: self.routes.len(),
            outgoing: self.outgoing.len(),
            incoming: self.incoming.len(),
            downloads: self.downloads.len(),
            pending_secrets: self.secrets.len(),
            migrations: self.migrations.len(),
        }
    }

    /// Stops driving the task under `key` and releases what it holds. False if there is none.
    pub fn cancel_task(&self, key: &str) -> bool {
        let Some(task) = self.tasks.get_task(key) else {
            return false;
        };
        self.fail_task(&task, &NodeError::FileRequest("cancelled".into()))
    }

    /// Abandons `task`, drops its buffers and session links and publishes one `Failed` event.
    /// Returns false when the task was already gone.
    pub(super) fn fail_task(&self, task: &Task, err: &NodeError) -> bool {
        if self.tasks.abandon(&task.key).is_none() {
            return false;
        }
        match task.kind {
            TaskKind::Upload | TaskKind::Backup => {
                self.outgoing.remove(&task.file_hash);
            }
            TaskKind::Download => {
                self.downloads.remove(&task.key);
            }
        }
        self.conns.evict_all_with_prefix(&task.file_hash);
        warn!(key = %task.key, kind = task.kind.as_str(), code = %err.code(), error = %err, "Task abandoned");
        self.events
            .publish(TransferEvent::failed(&task.key, &task.file_hash, err.code(), err.to_string()));
        true
    }

    /// Drops routes through a closed link and the partial slices it was carrying.
    pub fn forget_connection(&self, id: ConnId) {
        self.routes.retain(|_, conn| conn.id() != id);
        let dropped = self.drop_incoming_from(id);
        if dropped > 0 {
            debug!(conn = id, dropped, "Dropped partial slices of a closed link");
        }
    }

    /// Drops every transfer that has not moved for `max_idle`. Returns how many entries went.
    pub fn sweep_stale(&self, max_idle: Duration) -> usize {
        let mut dropped = 0;
        for task in self.tasks.idle(max_idle) {
            let err = NodeError::Timeout(format!(
                "{} made no progress for {}s",
                task.kind.as_str(),
                max_idle.as_secs()
            ));
            if self.fail_task(&task, &err) {
                dropped += 1;
            }
        }
        dropped += self.sweep_uploads(max_idle);
        dropped += self.sweep_downloads(max_idle);
        dropped += self.sweep_migrations(max_idle);
        self.routes.retain(|_, conn| !conn.is_closed());
        if dropped > 0 {
            info!(dropped, "Dropped stale transfer state");
        }
        dropped
    }
}
