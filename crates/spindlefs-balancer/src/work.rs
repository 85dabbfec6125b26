//! Work accounting for plan execution.
//!
//! A submitted plan is translated into one `WorkItem` per distinct
//! source/destination volume pair. The mover task mutates item counters while
//! status queries take snapshots, so counters are atomics and the map hands
//! out shared handles.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{BalancerError, BalancerResult};
use crate::volume::BlockVolume;

/// Source and destination volumes for one work item.
///
/// Identity is the pair of base paths, which is stable for the duration of a
/// plan; two references to the same device compare equal.
#[derive(Clone)]
pub struct VolumePair {
    source: Arc<dyn BlockVolume>,
    dest: Arc<dyn BlockVolume>,
}

impl VolumePair {
    /// Pairs a source volume with a destination volume.
    pub fn new(source: Arc<dyn BlockVolume>, dest: Arc<dyn BlockVolume>) -> Self {
        Self { source, dest }
    }

    /// The volume bytes move off.
    pub fn source(&self) -> &Arc<dyn BlockVolume> {
        &self.source
    }

    /// The volume bytes move onto.
    pub fn dest(&self) -> &Arc<dyn BlockVolume> {
        &self.dest
    }
}

impl PartialEq for VolumePair {
    fn eq(&self, other: &Self) -> bool {
        self.source.base_path() == other.source.base_path()
            && self.dest.base_path() == other.dest.base_path()
    }
}

impl Eq for VolumePair {}

impl Hash for VolumePair {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.base_path().hash(state);
        self.dest.base_path().hash(state);
    }
}

impl fmt::Debug for VolumePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumePair")
            .field("source", &self.source.base_path())
            .field("dest", &self.dest.base_path())
            .finish()
    }
}

/// Mutable accounting record for one volume pair during execution.
///
/// The byte target and the per-item overrides are fixed at admission; the
/// counters are written only by the mover task.
pub struct WorkItem {
    bytes_to_copy: u64,
    bandwidth: i64,
    tolerance_percent: i64,
    max_disk_errors: i64,
    bytes_copied: AtomicU64,
    blocks_copied: AtomicU64,
    error_count: AtomicU64,
    start_time_ms: AtomicU64,
    seconds_elapsed: AtomicU64,
    err_msg: Mutex<Option<String>>,
}

impl WorkItem {
    /// Creates a work item targeting `bytes_to_copy` bytes, with all
    /// per-item overrides inherited from the node defaults.
    pub fn new(bytes_to_copy: u64) -> Self {
        Self {
            bytes_to_copy,
            bandwidth: 0,
            tolerance_percent: 0,
            max_disk_errors: 0,
            bytes_copied: AtomicU64::new(0),
            blocks_copied: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            start_time_ms: AtomicU64::new(0),
            seconds_elapsed: AtomicU64::new(0),
            err_msg: Mutex::new(None),
        }
    }

    /// Sets the per-item overrides; zero or negative values inherit the node
    /// defaults.
    pub fn with_limits(mut self, bandwidth: i64, tolerance_percent: i64, max_disk_errors: i64) -> Self {
        self.bandwidth = bandwidth;
        self.tolerance_percent = tolerance_percent;
        self.max_disk_errors = max_disk_errors;
        self
    }

    /// Total byte target for this pair.
    pub fn bytes_to_copy(&self) -> u64 {
        self.bytes_to_copy
    }

    /// Per-item bandwidth override in MB/s.
    pub fn bandwidth(&self) -> i64 {
        self.bandwidth
    }

    /// Per-item tolerance override in percent.
    pub fn tolerance_percent(&self) -> i64 {
        self.tolerance_percent
    }

    /// Per-item error budget override.
    pub fn max_disk_errors(&self) -> i64 {
        self.max_disk_errors
    }

    /// Bytes copied so far.
    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::SeqCst)
    }

    /// Blocks copied so far.
    pub fn blocks_copied(&self) -> u64 {
        self.blocks_copied.load(Ordering::SeqCst)
    }

    /// I/O errors accounted so far.
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Adds a moved block's bytes to the copied counter.
    pub fn inc_bytes_copied(&self, bytes: u64) {
        self.bytes_copied.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Counts one moved block.
    pub fn inc_blocks_copied(&self) {
        self.blocks_copied.fetch_add(1, Ordering::SeqCst);
    }

    /// Accounts one I/O failure against the error budget.
    pub fn inc_error_count(&self) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Records when the mover started on this pair, in ms since the epoch.
    pub fn set_start_time(&self, ms: u64) {
        self.start_time_ms.store(ms, Ordering::SeqCst);
    }

    /// Records how long the mover has been on this pair.
    pub fn set_seconds_elapsed(&self, seconds: u64) {
        self.seconds_elapsed.store(seconds, Ordering::SeqCst);
    }

    /// Records a terminal diagnostic for this pair.
    pub fn set_err_msg(&self, msg: impl Into<String>) {
        *self.err_msg.lock().unwrap() = Some(msg.into());
    }

    /// Copies the counters into an immutable snapshot.
    pub fn snapshot(&self) -> WorkItemSnapshot {
        WorkItemSnapshot {
            bytes_to_copy: self.bytes_to_copy,
            bytes_copied: self.bytes_copied(),
            blocks_copied: self.blocks_copied(),
            error_count: self.error_count(),
            bandwidth: self.bandwidth,
            tolerance_percent: self.tolerance_percent,
            max_disk_errors: self.max_disk_errors,
            start_time_ms: self.start_time_ms.load(Ordering::SeqCst),
            seconds_elapsed: self.seconds_elapsed.load(Ordering::SeqCst),
            err_msg: self.err_msg.lock().unwrap().clone(),
        }
    }
}

/// Point-in-time copy of a work item's counters, safe to serialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemSnapshot {
    /// Total byte target for the pair.
    pub bytes_to_copy: u64,
    /// Bytes copied so far.
    pub bytes_copied: u64,
    /// Blocks copied so far.
    pub blocks_copied: u64,
    /// I/O errors accounted so far.
    pub error_count: u64,
    /// Per-item bandwidth override in MB/s; zero or negative inherits.
    pub bandwidth: i64,
    /// Per-item tolerance override in percent; zero or negative inherits.
    pub tolerance_percent: i64,
    /// Per-item error budget override; zero or negative inherits.
    pub max_disk_errors: i64,
    /// When the mover started on this pair, ms since the epoch.
    pub start_time_ms: u64,
    /// How long the mover has been on this pair.
    pub seconds_elapsed: u64,
    /// Terminal diagnostic, if the pair was abandoned.
    pub err_msg: Option<String>,
}

/// Mapping from volume pair to work item, in plan order.
///
/// Pairs are processed in the order the plan listed them, so entries live in
/// an ordered sequence; lookup is a scan, which is fine at plan sizes (one
/// entry per disk pair). Cleared and repopulated at admission, read
/// concurrently thereafter.
#[derive(Default)]
pub struct WorkMap {
    entries: RwLock<Vec<(VolumePair, Arc<WorkItem>)>>,
}

impl WorkMap {
    /// Creates an empty work map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all entries, ahead of admitting a new plan.
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    /// Byte target already recorded for a pair, if present.
    pub fn bytes_to_copy(&self, pair: &VolumePair) -> Option<u64> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .find(|(p, _)| p == pair)
            .map(|(_, item)| item.bytes_to_copy())
    }

    /// Inserts a work item for a pair, replacing any existing entry in
    /// place so plan order is kept.
    pub fn insert(&self, pair: VolumePair, item: WorkItem) {
        let mut entries = self.entries.write().unwrap();
        let item = Arc::new(item);
        if let Some(slot) = entries.iter_mut().find(|(p, _)| *p == pair) {
            slot.1 = item;
        } else {
            entries.push((pair, item));
        }
    }

    /// Shared handles to every entry, in plan order.
    pub fn snapshot(&self) -> Vec<(VolumePair, Arc<WorkItem>)> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|(p, i)| (p.clone(), Arc::clone(i)))
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// True when no plan work is recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Worker lifecycle state, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkResult {
    /// No plan has been admitted since startup (or shutdown).
    NoPlan,
    /// The mover task for the current plan is still live.
    PlanUnderProgress,
    /// The mover task finished and a status query observed it.
    PlanDone,
    /// The current plan was cancelled.
    PlanCancelled,
}

/// One pair's worth of status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkEntry {
    /// Base path of the source volume.
    pub source_path: String,
    /// Base path of the destination volume.
    pub dest_path: String,
    /// Counters for the pair.
    pub work_item: WorkItemSnapshot,
}

/// Full status of the worker: state, plan identity, per-pair counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkStatus {
    /// Current lifecycle state.
    pub result: WorkResult,
    /// SHA-512 identity of the current plan, empty when none.
    #[serde(rename = "planID")]
    pub plan_id: String,
    /// Per-pair counters, in plan order.
    pub work_entries: Vec<WorkEntry>,
}

impl WorkStatus {
    /// Renders the status as JSON for the RPC layer.
    pub fn to_json(&self) -> BalancerResult<String> {
        serde_json::to_string(self)
            .map_err(|e| BalancerError::Internal(format!("unable to serialize status: {e}")))
    }
}
