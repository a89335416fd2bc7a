//! In-flight upload, download and backup tasks with per-slice state.

use dashmap::DashMap;
use sds_protocol::{DownloadSliceInfo, PpInfo, SliceHashAddr, SliceOffset};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{NodeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Upload,
    Download,
    Backup,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Upload => "upload",
            TaskKind::Download => "download",
            TaskKind::Backup => "backup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    InProgress,
    Complete,
    PartiallyFailed,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    Success,
    Failed,
}

/// Uploads and backups are keyed by content hash alone, downloads by content hash and wallet.
pub fn task_key(kind: TaskKind, file_hash: &str, wallet_address: &str) -> String {
    match kind {
        TaskKind::Upload | TaskKind::Backup => file_hash.to_string(),
        TaskKind::Download => format!("{file_hash}{wallet_address}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSlice {
    pub slice_hash: String,
    pub slice_number: u64,
    /// Wire length.
    pub slice_size: u64,
    /// Raw range within the file.
    pub offset: SliceOffset,
    pub peer: PpInfo,
}

impl From<&SliceHashAddr> for TaskSlice {
    fn from(slice: &SliceHashAddr) -> Self {
        Self {
            slice_hash: slice.slice_hash.clone(),
            slice_number: slice.slice_number,
            slice_size: slice.slice_size,
            offset: slice.slice_offset,
            peer: slice.pp_info.clone(),
        }
    }
}

impl From<&DownloadSliceInfo> for TaskSlice {
    fn from(slice: &DownloadSliceInfo) -> Self {
        Self {
            slice_hash: slice.slice_storage_info.slice_hash.clone(),
            slice_number: slice.slice_number,
            slice_size: slice.slice_storage_info.slice_size,
            offset: slice.slice_offset,
            peer: slice.storage_pp_info.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub task_id: String,
    pub file_hash: String,
    pub file_size: u64,
    pub owner_wallet: String,
    pub sp_address: String,
    pub slices: Vec<TaskSlice>,
}

#[derive(Debug)]
struct TaskInner {
    task_id: String,
    state: TaskState,
    slices: BTreeMap<u64, TaskSlice>,
    status: BTreeMap<u64, SliceStatus>,
    failed_slices: BTreeSet<String>,
    failed_peers: Vec<PpInfo>,
    visited: BTreeSet<u64>,
    started: HashMap<u64, Instant>,
    /// Last time any slice of the task moved.
    touched: Instant,
}

#[derive(Debug)]
pub struct Task {
    pub kind: TaskKind,
    pub key: String,
    pub file_hash: String,
    pub file_size: u64,
    pub owner_wallet: String,
    pub sp_address: String,
    progress: AtomicU64,
    inner: Mutex<TaskInner>,
}

/// Slice hashes and peers to hand the indexing server for reassignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WrongSlices {
    pub failed_slices: Vec<TaskSlice>,
    pub excluded_peers: Vec<PpInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceLookup {
    pub slice: TaskSlice,
    pub status: SliceStatus,
    pub first_visit: bool,
}

impl Task {
    fn lock(&self) -> Result<MutexGuard<'_, TaskInner>> {
        self.inner
            .lock()
            .map_err(|_| NodeError::InternalData(format!("task {} state poisoned", self.key)))
    }

    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    pub fn task_id(&self) -> String {
        self.lock().map(|inner| inner.task_id.clone()).unwrap_or_default()
    }

    pub fn state(&self) -> TaskState {
        self.lock().map(|inner| inner.state).unwrap_or(TaskState::Abandoned)
    }

    pub fn slices(&self) -> Vec<TaskSlice> {
        self.lock()
            .map(|inner| inner.slices.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn slice(&self, slice_number: u64) -> Option<TaskSlice> {
        self.lock().ok()?.slices.get(&slice_number).cloned()
    }

    pub fn slice_status(&self, slice_number: u64) -> Option<SliceStatus> {
        self.lock().ok()?.status.get(&slice_number).copied()
    }

    pub fn failed_slice_hashes(&self) -> Vec<String> {
        self.lock()
            .map(|inner| inner.failed_slices.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Marks a slice as sent and remembers when, for cost-time reporting.
    pub fn mark_in_flight(&self, slice_number: u64) -> Result<()> {
        let mut inner = self.lock()?;
        let Some(status) = inner.status.get_mut(&slice_number) else {
            return Err(NodeError::WrongInput(format!(
                "task {} has no slice {slice_number}",
                self.key
            )));
        };
        if *status == SliceStatus::Done {
            return Ok(());
        }
        *status = SliceStatus::InFlight;
        let now = Instant::now();
        inner.started.insert(slice_number, now);
        inner.touched = now;
        if inner.state == TaskState::Created {
            inner.state = TaskState::InProgress;
        }
        Ok(())
    }

    /// Milliseconds since the slice went in flight, zero if it never did.
    pub fn elapsed_ms(&self, slice_number: u64) -> i64 {
        self.lock()
            .ok()
            .and_then(|inner| inner.started.get(&slice_number).copied())
            .map(|at| at.elapsed().as_millis() as i64)
            .unwrap_or(0)
    }

    /// Time since any slice of the task last moved.
    pub fn idle_for(&self) -> Duration {
        self.lock()
            .map(|inner| inner.touched.elapsed())
            .unwrap_or(Duration::MAX)
    }
}

impl TaskInner {
    fn recompute(&mut self) -> TaskState {
        if matches!(self.state, TaskState::Abandoned | TaskState::Complete) {
            return self.state;
        }
        let all_done = self.status.values().all(|s| *s == SliceStatus::Done);
        let any_open = self
            .status
            .values()
            .any(|s| matches!(s, SliceStatus::Pending | SliceStatus::InFlight));
        let any_failed = self.status.values().any(|s| *s == SliceStatus::Failed);
        let untouched = self.status.values().all(|s| *s == SliceStatus::Pending);
        self.state = if all_done {
            TaskState::Complete
        } else if any_failed && !any_open {
            TaskState::PartiallyFailed
        } else if untouched && self.state == TaskState::Created {
            TaskState::Created
        } else {
            TaskState::InProgress
        };
        self.state
    }

    /// First slice carrying `slice_hash`, preferring one that is not yet done.
    fn number_for_hash(&self, slice_hash: &str) -> Option<u64> {
        let mut matching = self
            .slices
            .values()
            .filter(|s| s.slice_hash == slice_hash)
            .map(|s| s.slice_number)
            .peekable();
        let first = *matching.peek()?;
        Some(
            matching
                .find(|n| self.status.get(n) != Some(&SliceStatus::Done))
                .unwrap_or(first),
        )
    }
}

/// Checks that slice numbers run 1..=n and that the raw ranges tile `[0, file_size)`.
pub fn validate_plan(file_size: u64, slices: &[TaskSlice]) -> Result<()> {
    if slices.is_empty() {
        return Err(NodeError::WrongFileInfo("empty slice plan".into()));
    }
    let mut ordered: Vec<&TaskSlice> = slices.iter().collect();
    ordered.sort_by_key(|s| s.slice_number);
    let mut expected_start = 0u64;
    for (idx, slice) in ordered.iter().enumerate() {
        let expected_number = idx as u64 + 1;
        if slice.slice_number != expected_number {
            return Err(NodeError::WrongFileInfo(format!(
                "slice numbers not contiguous: expected {expected_number}, got {}",
                slice.slice_number
            )));
        }
        if slice.offset.start != expected_start || slice.offset.end < slice.offset.start {
            return Err(NodeError::WrongFileInfo(format!(
                "slice {} range [{},{}) does not follow {expected_start}",
                slice.slice_number, slice.offset.start, slice.offset.end
            )));
        }
        expected_start = slice.offset.end;
    }
    if expected_start != file_size {
        return Err(NodeError::WrongFileInfo(format!(
            "slices cover {expected_start} bytes of a {file_size} byte file"
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a task under `key`, replacing any earlier one.
    pub fn create_task(&self, kind: TaskKind, key: &str, spec: TaskSpec) -> Result<Arc<Task>> {
        validate_plan(spec.file_size, &spec.slices)?;
        let status = spec
            .slices
            .iter()
            .map(|s| (s.slice_number, SliceStatus::Pending))
            .collect();
        let slices = spec
            .slices
            .into_iter()
            .map(|s| (s.slice_number, s))
            .collect();
        let task = Arc::new(Task {
            kind,
            key: key.to_string(),
            file_hash: spec.file_hash,
            file_size: spec.file_size,
            owner_wallet: spec.owner_wallet,
            sp_address: spec.sp_address,
            progress: AtomicU64::new(0),
            inner: Mutex::new(TaskInner {
                task_id: spec.task_id,
                state: TaskState::Created,
                slices,
                status,
                failed_slices: BTreeSet::new(),
                failed_peers: Vec::new(),
                visited: BTreeSet::new(),
                started: HashMap::new(),
                touched: Instant::now(),
            }),
        });
        if let Some(previous) = self.tasks.insert(key.to_string(), task.clone()) {
            warn!(key = %key, previous_kind = ?previous.kind, "Replacing live task with the same key");
        }
        debug!(key = %key, kind = ?kind, "Task created");
        Ok(task)
    }

    pub fn get_task(&self, key: &str) -> Option<Arc<Task>> {
        self.tasks.get(key).map(|t| t.value().clone())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Applies one slice outcome and returns the task's resulting state.
    ///
    /// A success only counts toward progress on the transition into `Done`, so duplicate
    /// acknowledgements never push the counter past the file size.
    pub fn record_slice_result(
        &self,
        key: &str,
        slice_hash: &str,
        outcome: SliceOutcome,
        peer: &PpInfo,
    ) -> Result<TaskState> {
        let task = self
            .get_task(key)
            .ok_or_else(|| NodeError::FileRequest(format!("no task under {key}")))?;
        let mut inner = task.lock()?;
        let number = inner.number_for_hash(slice_hash).ok_or_else(|| {
            NodeError::WrongInput(format!("slice {slice_hash} is not part of task {key}"))
        })?;
        inner.touched = Instant::now();
        match outcome {
            SliceOutcome::Success => {
                let was_done = inner.status.insert(number, SliceStatus::Done) == Some(SliceStatus::Done);
                if !was_done {
                    let len = inner.slices.get(&number).map(|s| s.offset.len()).unwrap_or(0);
                    task.progress.fetch_add(len, Ordering::AcqRel);
                }
                let still_failing = inner
                    .slices
                    .values()
                    .any(|s| s.slice_hash == slice_hash && inner.status.get(&s.slice_number) == Some(&SliceStatus::Failed));
                if !still_failing {
                    inner.failed_slices.remove(slice_hash);
                }
            }
            SliceOutcome::Failed => {
                if inner.status.get(&number) != Some(&SliceStatus::Done) {
                    inner.status.insert(number, SliceStatus::Failed);
                    inner.failed_slices.insert(slice_hash.to_string());
                    if !inner.failed_peers.contains(peer) {
                        inner.failed_peers.push(peer.clone());
                    }
                }
            }
        }
        Ok(inner.recompute())
    }

    /// Looks a slice up by hash and marks it visited. `first_visit` is true exactly once.
    pub fn get_slice_info(&self, key: &str, slice_hash: &str) -> Option<SliceLookup> {
        let task = self.get_task(key)?;
        let mut inner = task.lock().ok()?;
        let number = inner
            .slices
            .values()
            .filter(|s| s.slice_hash == slice_hash)
            .map(|s| s.slice_number)
            .find(|n| !inner.visited.contains(n))
            .or_else(|| inner.number_for_hash(slice_hash))?;
        let first_visit = inner.visited.insert(number);
        let slice = inner.slices.get(&number)?.clone();
        let status = inner.status.get(&number).copied().unwrap_or(SliceStatus::Pending);
        Some(SliceLookup {
            slice,
            status,
            first_visit,
        })
    }

    pub fn build_wrong_slices_request(&self, key: &str) -> Option<WrongSlices> {
        let task = self.get_task(key)?;
        let inner = task.lock().ok()?;
        let failed_slices = inner
            .slices
            .values()
            .filter(|s| inner.status.get(&s.slice_number) == Some(&SliceStatus::Failed))
            .cloned()
            .collect();
        Some(WrongSlices {
            failed_slices,
            excluded_peers: inner.failed_peers.clone(),
        })
    }

    /// Points failed slices at their new peers and moves them back to pending.
    /// Returns the slices that were reassigned.
    pub fn apply_reassignment(&self, key: &str, reassigned: &[TaskSlice]) -> Result<Vec<TaskSlice>> {
        let task = self
            .get_task(key)
            .ok_or_else(|| NodeError::FileRequest(format!("no task under {key}")))?;
        let mut inner = task.lock()?;
        inner.touched = Instant::now();
        let mut applied = Vec::new();
        for update in reassigned {
            if inner.status.get(&update.slice_number) == Some(&SliceStatus::Done) {
                continue;
            }
            let Some(slice) = inner.slices.get_mut(&update.slice_number) else {
                warn!(key = %key, slice = update.slice_number, "Reassignment names unknown slice");
                continue;
            };
            if slice.slice_hash != update.slice_hash {
                warn!(key = %key, slice = update.slice_number, "Reassignment hash mismatch");
                continue;
            }
            slice.peer = update.peer.clone();
            let slice = slice.clone();
            inner.status.insert(slice.slice_number, SliceStatus::Pending);
            inner.visited.remove(&slice.slice_number);
            applied.push(slice);
        }
        let still_failed: BTreeSet<String> = inner
            .slices
            .values()
            .filter(|s| inner.status.get(&s.slice_number) == Some(&SliceStatus::Failed))
            .map(|s| s.slice_hash.clone())
            .collect();
        inner.failed_slices = still_failed;
        if !applied.is_empty() && inner.state == TaskState::PartiallyFailed {
            inner.state = TaskState::InProgress;
        }
        Ok(applied)
    }

    /// Tasks nothing has happened to for longer than `max_idle`.
    pub fn idle(&self, max_idle: Duration) -> Vec<Arc<Task>> {
        self.tasks
            .iter()
            .filter(|entry| entry.value().idle_for() > max_idle)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn remove(&self, key: &str) -> Option<Arc<Task>> {
        self.tasks.remove(key).map(|(_, task)| task)
    }

    /// Drops the task; late responses for it are ignored.
    pub fn abandon(&self, key: &str) -> Option<Arc<Task>> {
        let task = self.remove(key)?;
        if let Ok(mut inner) = task.lock() {
            inner.state = TaskState::Abandoned;
        }
        Some(task)
    }
}
