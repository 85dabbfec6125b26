//! Storage interfaces the balancer programs against.
//!
//! The data node owns the real volume set; the balancer only consumes these
//! seams. `MockVolume` and `MockDataset` are in-memory implementations with
//! failure injection, used by the balancer's own tests and by embedders that
//! want to exercise plan execution without disks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BalancerError, BalancerResult};

/// A finalized block as seen by the balancer: pool, identity, length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Block pool the block belongs to.
    pub pool_id: String,
    /// Block identity within the pool.
    pub block_id: u64,
    /// Length of the block in bytes.
    pub num_bytes: u64,
}

impl BlockRecord {
    /// Creates a block record.
    pub fn new(pool_id: impl Into<String>, block_id: u64, num_bytes: u64) -> Self {
        Self {
            pool_id: pool_id.into(),
            block_id,
            num_bytes,
        }
    }
}

/// Walks the blocks of one block pool on one volume.
///
/// Implementations may perform blocking I/O in `next_block`.
pub trait BlockIterator: Send {
    /// True once the iterator has no more blocks to yield.
    fn at_end(&self) -> bool;

    /// Returns the next block, `Ok(None)` when drained.
    fn next_block(&mut self) -> BalancerResult<Option<BlockRecord>>;

    /// Releases any resources held by the iterator.
    fn close(&mut self) -> BalancerResult<()>;
}

/// A storage device or mount attached to this node.
pub trait BlockVolume: Send + Sync {
    /// Stable storage ID of this volume.
    fn storage_id(&self) -> String;

    /// Mount point of this volume; stable for the duration of a plan and
    /// used as the volume's identity in work accounting.
    fn base_path(&self) -> String;

    /// IDs of the block pools hosted on this volume.
    fn block_pool_ids(&self) -> Vec<String>;

    /// Opens a block iterator over one pool. The tag names the consumer in
    /// the data node's iterator bookkeeping.
    fn new_block_iterator(&self, pool_id: &str, tag: &str) -> Box<dyn BlockIterator>;

    /// True for in-memory storage tiers, which the balancer never touches.
    fn is_transient_storage(&self) -> bool;

    /// Free space on this volume in bytes.
    fn available(&self) -> BalancerResult<u64>;
}

/// The data node's block dataset: volume enumeration and the cross-volume
/// move primitive.
#[async_trait]
pub trait BlockDataset: Send + Sync {
    /// Returns references to every currently attached volume. Dropping the
    /// vector releases the references.
    fn volume_references(&self) -> BalancerResult<Vec<Arc<dyn BlockVolume>>>;

    /// True when the block is finalized and safe to move.
    fn is_valid_block(&self, block: &BlockRecord) -> bool;

    /// Copies one block onto the destination volume, blocking for the
    /// duration of the copy.
    async fn move_block_across_volumes(
        &self,
        block: &BlockRecord,
        dest: &dyn BlockVolume,
    ) -> BalancerResult<()>;
}

/// In-memory volume for tests and embedding without disks.
pub struct MockVolume {
    storage_id: String,
    base_path: String,
    transient: AtomicBool,
    available: AtomicU64,
    pools: Mutex<Vec<(String, Vec<BlockRecord>)>>,
    next_block_id: AtomicU64,
    iterator_errors: AtomicU64,
    available_errors: AtomicU64,
}

impl MockVolume {
    /// Creates a volume with the given identity and free space.
    pub fn new(
        storage_id: impl Into<String>,
        base_path: impl Into<String>,
        available: u64,
    ) -> Self {
        Self {
            storage_id: storage_id.into(),
            base_path: base_path.into(),
            transient: AtomicBool::new(false),
            available: AtomicU64::new(available),
            pools: Mutex::new(Vec::new()),
            next_block_id: AtomicU64::new(1),
            iterator_errors: AtomicU64::new(0),
            available_errors: AtomicU64::new(0),
        }
    }

    /// Marks this volume as an in-memory tier.
    pub fn set_transient(&self, transient: bool) {
        self.transient.store(transient, Ordering::SeqCst);
    }

    /// Adds a pool holding one block per entry of `block_sizes`.
    pub fn add_pool(&self, pool_id: impl Into<String>, block_sizes: &[u64]) {
        let pool_id = pool_id.into();
        let blocks = block_sizes
            .iter()
            .map(|&bytes| {
                let id = self.next_block_id.fetch_add(1, Ordering::SeqCst);
                BlockRecord::new(pool_id.clone(), id, bytes)
            })
            .collect();
        self.pools.lock().unwrap().push((pool_id, blocks));
    }

    /// Makes the next opened iterator fail its first `count` reads.
    pub fn inject_iterator_errors(&self, count: u64) {
        self.iterator_errors.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` calls to `available` fail.
    pub fn inject_available_errors(&self, count: u64) {
        self.available_errors.store(count, Ordering::SeqCst);
    }
}

impl BlockVolume for MockVolume {
    fn storage_id(&self) -> String {
        self.storage_id.clone()
    }

    fn base_path(&self) -> String {
        self.base_path.clone()
    }

    fn block_pool_ids(&self) -> Vec<String> {
        self.pools
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn new_block_iterator(&self, pool_id: &str, _tag: &str) -> Box<dyn BlockIterator> {
        let blocks = self
            .pools
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == pool_id)
            .map(|(_, blocks)| blocks.clone())
            .unwrap_or_default();
        // the first iterator opened consumes the whole injected error budget
        let failures = self.iterator_errors.swap(0, Ordering::SeqCst);
        Box::new(MockBlockIterator {
            blocks,
            pos: 0,
            failures,
        })
    }

    fn is_transient_storage(&self) -> bool {
        self.transient.load(Ordering::SeqCst)
    }

    fn available(&self) -> BalancerResult<u64> {
        let failures = self.available_errors.load(Ordering::SeqCst);
        if failures > 0 {
            self.available_errors.store(failures - 1, Ordering::SeqCst);
            return Err(BalancerError::Io(std::io::Error::other(
                "statfs failed on mock volume",
            )));
        }
        Ok(self.available.load(Ordering::SeqCst))
    }
}

/// Iterator over a snapshot of one mock pool.
struct MockBlockIterator {
    blocks: Vec<BlockRecord>,
    pos: usize,
    failures: u64,
}

impl BlockIterator for MockBlockIterator {
    fn at_end(&self) -> bool {
        self.failures == 0 && self.pos >= self.blocks.len()
    }

    fn next_block(&mut self) -> BalancerResult<Option<BlockRecord>> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(BalancerError::Io(std::io::Error::other(
                "injected block read failure",
            )));
        }
        if self.pos >= self.blocks.len() {
            return Ok(None);
        }
        let block = self.blocks[self.pos].clone();
        self.pos += 1;
        Ok(Some(block))
    }

    fn close(&mut self) -> BalancerResult<()> {
        Ok(())
    }
}

/// In-memory dataset over a set of mock volumes, with failure injection.
pub struct MockDataset {
    volumes: Mutex<Vec<Arc<MockVolume>>>,
    invalid_blocks: Mutex<Vec<u64>>,
    moved: Mutex<Vec<(BlockRecord, String)>>,
    move_failures: AtomicU64,
    enumeration_fails: AtomicBool,
    move_delay: Mutex<Duration>,
}

impl MockDataset {
    /// Creates a dataset over the given volumes.
    pub fn new(volumes: Vec<Arc<MockVolume>>) -> Self {
        Self {
            volumes: Mutex::new(volumes),
            invalid_blocks: Mutex::new(Vec::new()),
            moved: Mutex::new(Vec::new()),
            move_failures: AtomicU64::new(0),
            enumeration_fails: AtomicBool::new(false),
            move_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Marks a block as non-finalized; the balancer must skip it.
    pub fn mark_invalid(&self, block_id: u64) {
        self.invalid_blocks.lock().unwrap().push(block_id);
    }

    /// Makes the next `count` move calls fail with an I/O error.
    pub fn inject_move_failures(&self, count: u64) {
        self.move_failures.store(count, Ordering::SeqCst);
    }

    /// Makes volume enumeration fail, to exercise internal-error paths.
    pub fn fail_enumeration(&self, fail: bool) {
        self.enumeration_fails.store(fail, Ordering::SeqCst);
    }

    /// Stalls every move by `delay`, to keep a plan running in tests.
    pub fn set_move_delay(&self, delay: Duration) {
        *self.move_delay.lock().unwrap() = delay;
    }

    /// Blocks moved so far, with the destination storage ID of each.
    pub fn moved_blocks(&self) -> Vec<(BlockRecord, String)> {
        self.moved.lock().unwrap().clone()
    }

    /// Total bytes moved so far.
    pub fn moved_bytes(&self) -> u64 {
        self.moved
            .lock()
            .unwrap()
            .iter()
            .map(|(block, _)| block.num_bytes)
            .sum()
    }
}

#[async_trait]
impl BlockDataset for MockDataset {
    fn volume_references(&self) -> BalancerResult<Vec<Arc<dyn BlockVolume>>> {
        if self.enumeration_fails.load(Ordering::SeqCst) {
            return Err(BalancerError::Io(std::io::Error::other(
                "injected enumeration failure",
            )));
        }
        Ok(self
            .volumes
            .lock()
            .unwrap()
            .iter()
            .map(|v| Arc::clone(v) as Arc<dyn BlockVolume>)
            .collect())
    }

    fn is_valid_block(&self, block: &BlockRecord) -> bool {
        !self.invalid_blocks.lock().unwrap().contains(&block.block_id)
    }

    async fn move_block_across_volumes(
        &self,
        block: &BlockRecord,
        dest: &dyn BlockVolume,
    ) -> BalancerResult<()> {
        let delay = *self.move_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failures = self.move_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.move_failures.store(failures - 1, Ordering::SeqCst);
            return Err(BalancerError::Io(std::io::Error::other(
                "injected move failure",
            )));
        }
        self.moved
            .lock()
            .unwrap()
            .push((block.clone(), dest.storage_id()));
        Ok(())
    }
}
