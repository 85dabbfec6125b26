//! The block mover: the copy loop that executes one work item.
//!
//! Copies run in burst mode, full throttle per block, and then sleep long
//! enough that the average transfer rate stays under the configured ceiling.
//! Per-block I/O failures are accounted against the item's error budget; the
//! loop keeps going until the budget is spent, the pair is close enough to
//! its byte target, the source runs out of movable blocks, or the
//! destination runs out of room.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::BalancerConfig;
use crate::verifier::now_ms;
use crate::volume::{BlockDataset, BlockIterator, BlockRecord, BlockVolume};
use crate::work::{VolumePair, WorkItem};

const MEGABYTE: u64 = 1024 * 1024;

/// Moves blocks across volumes on behalf of the worker.
#[async_trait]
pub trait BlockMover: Send + Sync {
    /// Copies blocks for one volume pair until a stop condition is hit.
    async fn copy_blocks(&self, pair: &VolumePair, item: &WorkItem);

    /// Arms the copy loop; called before a plan starts executing.
    fn set_runnable(&self);

    /// Tells the copy loop to exit at its next observation point.
    fn set_exit_flag(&self);

    /// True while the copy loop is allowed to keep going.
    fn should_run(&self) -> bool;

    /// The dataset this mover operates against.
    fn dataset(&self) -> Arc<dyn BlockDataset>;

    /// When the current plan started executing, in ms since the epoch.
    fn start_time_ms(&self) -> u64;

    /// Seconds spent on the pair currently being copied.
    fn elapsed_seconds(&self) -> u64;
}

/// The production mover.
pub struct DiskMover {
    dataset: Arc<dyn BlockDataset>,
    disk_bandwidth: u64,
    block_tolerance: u64,
    max_disk_errors: u64,
    pool_index: AtomicUsize,
    should_run: AtomicBool,
    start_time_ms: AtomicU64,
    seconds_elapsed: AtomicU64,
}

impl DiskMover {
    /// Creates a mover with node defaults taken from the sanitized config.
    pub fn new(dataset: Arc<dyn BlockDataset>, config: &BalancerConfig) -> Self {
        let cfg = config.sanitized();
        Self {
            dataset,
            disk_bandwidth: cfg.max_disk_throughput_mb,
            block_tolerance: cfg.block_tolerance_percent,
            max_disk_errors: cfg.max_disk_errors,
            pool_index: AtomicUsize::new(0),
            should_run: AtomicBool::new(false),
            start_time_ms: AtomicU64::new(0),
            seconds_elapsed: AtomicU64::new(0),
        }
    }

    /// Tolerance band for an item: its own override when positive, else the
    /// node default.
    fn block_tolerance(&self, item: &WorkItem) -> u64 {
        if item.tolerance_percent() > 0 {
            item.tolerance_percent() as u64
        } else {
            self.block_tolerance
        }
    }

    /// Bandwidth ceiling for an item in MB/s: its own override when
    /// positive, else the node default.
    fn disk_bandwidth(&self, item: &WorkItem) -> u64 {
        if item.bandwidth() > 0 {
            item.bandwidth() as u64
        } else {
            self.disk_bandwidth
        }
    }

    /// Error budget for an item: its own override when positive, else the
    /// node default.
    fn max_error(&self, item: &WorkItem) -> u64 {
        if item.max_disk_errors() > 0 {
            item.max_disk_errors() as u64
        } else {
            self.max_disk_errors
        }
    }

    /// First-fit test: does this block fit under the remaining byte target,
    /// inflated by the tolerance band?
    fn is_less_than_needed(&self, block_size: u64, item: &WorkItem) -> bool {
        let remaining = item.bytes_to_copy().saturating_sub(item.bytes_copied());
        let needed = remaining + (remaining * self.block_tolerance(item)) / 100;
        block_size <= needed
    }

    /// Inflates the copied count by the tolerance band; once that exceeds
    /// the target, the pair is done. Avoids chasing a final small block that
    /// may not exist.
    fn is_close_enough(&self, item: &WorkItem) -> bool {
        let inflated =
            item.bytes_copied() + (item.bytes_copied() * self.block_tolerance(item)) / 100;
        item.bytes_to_copy() < inflated
    }

    /// Sleep needed after a block copy so the average transfer rate matches
    /// the configured ceiling. Integer arithmetic throughout; the shaping
    /// only bites for copies spanning whole seconds.
    fn compute_delay(&self, bytes_copied: u64, time_used_ms: u64, item: &WorkItem) -> Duration {
        // zero-interval reading, ignore it
        if time_used_ms == 0 {
            return Duration::ZERO;
        }
        let mb = bytes_copied / MEGABYTE;
        let seconds = time_used_ms / 1000;
        let last_throughput = if seconds == 0 { 0 } else { mb / seconds };
        let delay_secs = (mb / self.disk_bandwidth(item)).saturating_sub(last_throughput);
        Duration::from_millis(delay_secs * 1000)
    }

    /// Scans one pool iterator for the next finalized block that fits the
    /// remaining target. Read failures are accounted; returns `None` when
    /// the pool is drained or the error budget is spent.
    fn get_block_to_copy(
        &self,
        iter: &mut dyn BlockIterator,
        item: &WorkItem,
    ) -> Option<BlockRecord> {
        while !iter.at_end() && item.error_count() < self.max_error(item) {
            match iter.next_block() {
                Ok(Some(block)) => {
                    // only finalized blocks are movable
                    if !self.dataset.is_valid_block(&block) {
                        continue;
                    }
                    // first fit, not best fit
                    if self.is_less_than_needed(block.num_bytes, item) {
                        return Some(block);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("block read failed while scanning pool: {}", e);
                    item.inc_error_count();
                }
            }
        }

        if item.error_count() >= self.max_error(item) {
            item.set_err_msg("Error count exceeded.");
            info!(
                "maximum error count exceeded, error count: {} max errors: {}",
                item.error_count(),
                self.max_error(item)
            );
        }
        None
    }

    /// Picks the next block across all pools, round-robin. The rotating
    /// index lives on the mover so successive calls keep cycling from where
    /// the last one left off.
    fn get_next_block(
        &self,
        pool_iters: &mut [Box<dyn BlockIterator>],
        item: &WorkItem,
    ) -> Option<BlockRecord> {
        let mut tried = 0;
        while tried < pool_iters.len() {
            tried += 1;
            let index = self.pool_index.fetch_add(1, Ordering::SeqCst) % pool_iters.len();
            if let Some(block) = self.get_block_to_copy(&mut *pool_iters[index], item) {
                return Some(block);
            }
        }

        item.set_err_msg("No source blocks found to move.");
        match serde_json::to_string(&item.snapshot()) {
            Ok(json) => error!("no movable source blocks found: {}", json),
            Err(_) => error!("no movable source blocks found"),
        }
        None
    }

    /// Opens one iterator per block pool on the source volume.
    fn open_pool_iters(&self, source: &Arc<dyn BlockVolume>) -> Vec<Box<dyn BlockIterator>> {
        source
            .block_pool_ids()
            .iter()
            .map(|pool_id| source.new_block_iterator(pool_id, "DiskBalancerSource"))
            .collect()
    }

    fn close_pool_iters(&self, pool_iters: &mut [Box<dyn BlockIterator>]) {
        for iter in pool_iters {
            if let Err(e) = iter.close() {
                error!("error closing a block pool iterator: {}", e);
            }
        }
    }
}

#[async_trait]
impl BlockMover for DiskMover {
    async fn copy_blocks(&self, pair: &VolumePair, item: &WorkItem) {
        let source = pair.source();
        let dest = pair.dest();

        let start_time = now_ms();
        self.start_time_ms.store(start_time, Ordering::SeqCst);
        self.seconds_elapsed.store(0, Ordering::SeqCst);
        item.set_start_time(start_time);

        // in-memory tiers are never balanced
        if source.is_transient_storage() || dest.is_transient_storage() {
            return;
        }

        let mut pool_iters = self.open_pool_iters(source);
        if pool_iters.is_empty() {
            error!(
                "no block pools found on volume {}, exiting",
                source.base_path()
            );
            return;
        }

        while self.should_run() {
            if item.error_count() > self.max_error(item) {
                error!(
                    "exceeded the max error count, source: {} dest: {} error count: {}",
                    source.base_path(),
                    dest.base_path(),
                    item.error_count()
                );
                break;
            }

            if self.is_close_enough(item) {
                info!(
                    "copy from {} to {} done, copied {} bytes and {} blocks",
                    source.base_path(),
                    dest.base_path(),
                    item.bytes_copied(),
                    item.blocks_copied()
                );
                break;
            }

            let Some(block) = self.get_next_block(&mut pool_iters, item) else {
                error!(
                    "no source blocks, exiting the copy, source: {} dest: {}",
                    source.base_path(),
                    dest.base_path()
                );
                break;
            };

            // selection can take a while, observe cancellation again before
            // committing to a move
            if !self.should_run() {
                break;
            }

            // the guard compares against the total remaining target, not the
            // block at hand, and abandons the pair as soon as free space
            // drops below it
            match dest.available() {
                Ok(available) => {
                    if available <= item.bytes_to_copy() {
                        error!(
                            "destination volume {} does not have enough space, block size: {}, exiting",
                            dest.base_path(),
                            block.num_bytes
                        );
                        break;
                    }
                }
                Err(e) => {
                    error!("unable to read free space on {}: {}", dest.base_path(), e);
                    item.inc_error_count();
                    continue;
                }
            }

            let begin = Instant::now();
            match self
                .dataset
                .move_block_across_volumes(&block, dest.as_ref())
                .await
            {
                Ok(()) => {
                    let time_used_ms = begin.elapsed().as_millis() as u64;
                    debug!(
                        "moved block with size {} from {} to {}",
                        block.num_bytes,
                        source.base_path(),
                        dest.base_path()
                    );

                    // burst, then sleep enough to keep the average under the
                    // ceiling; cancellation during the sleep is handled by
                    // the forced-abort phase of shutdown
                    let delay = self.compute_delay(block.num_bytes, time_used_ms, item);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }

                    // counters are updated after the sleep so reported
                    // progress stays under the throughput threshold
                    item.inc_bytes_copied(block.num_bytes);
                    item.inc_blocks_copied();
                    let elapsed = (now_ms().saturating_sub(start_time)) / 1000;
                    self.seconds_elapsed.store(elapsed, Ordering::SeqCst);
                    item.set_seconds_elapsed(elapsed);
                }
                Err(e) => {
                    error!("exception while trying to copy blocks: {}", e);
                    item.inc_error_count();
                }
            }
        }

        self.close_pool_iters(&mut pool_iters);
    }

    fn set_runnable(&self) {
        self.should_run.store(true, Ordering::SeqCst);
    }

    fn set_exit_flag(&self) {
        self.should_run.store(false, Ordering::SeqCst);
    }

    fn should_run(&self) -> bool {
        self.should_run.load(Ordering::SeqCst)
    }

    fn dataset(&self) -> Arc<dyn BlockDataset> {
        Arc::clone(&self.dataset)
    }

    fn start_time_ms(&self) -> u64 {
        self.start_time_ms.load(Ordering::SeqCst)
    }

    fn elapsed_seconds(&self) -> u64 {
        self.seconds_elapsed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{MockDataset, MockVolume};

    const MB: u64 = MEGABYTE;

    struct Env {
        dataset: Arc<MockDataset>,
        source: Arc<MockVolume>,
        dest: Arc<MockVolume>,
        mover: DiskMover,
    }

    fn env(dest_available: u64) -> Env {
        let source = Arc::new(MockVolume::new("DS-src", "/data/disk1", 10 * MB));
        let dest = Arc::new(MockVolume::new("DS-dst", "/data/disk2", dest_available));
        let dataset = Arc::new(MockDataset::new(vec![
            Arc::clone(&source),
            Arc::clone(&dest),
        ]));
        let config = BalancerConfig::default();
        let mover = DiskMover::new(
            Arc::clone(&dataset) as Arc<dyn BlockDataset>,
            &config,
        );
        mover.set_runnable();
        Env {
            dataset,
            source,
            dest,
            mover,
        }
    }

    fn pair(env: &Env) -> VolumePair {
        VolumePair::new(
            Arc::clone(&env.source) as Arc<dyn BlockVolume>,
            Arc::clone(&env.dest) as Arc<dyn BlockVolume>,
        )
    }

    #[tokio::test]
    async fn test_copies_until_close_enough() {
        let env = env(10_000 * MB);
        env.source.add_pool("BP-1", &[10 * MB; 20]);
        let item = WorkItem::new(100 * MB);

        env.mover.copy_blocks(&pair(&env), &item).await;

        assert_eq!(item.bytes_copied(), 100 * MB);
        assert_eq!(item.blocks_copied(), 10);
        assert_eq!(item.error_count(), 0);
        assert_eq!(env.dataset.moved_bytes(), 100 * MB);
    }

    #[tokio::test]
    async fn test_transient_storage_is_a_no_op() {
        let env = env(10_000 * MB);
        env.source.add_pool("BP-1", &[10 * MB]);
        env.source.set_transient(true);
        let item = WorkItem::new(10 * MB);

        env.mover.copy_blocks(&pair(&env), &item).await;

        assert_eq!(item.bytes_copied(), 0);
        assert_eq!(env.dataset.moved_bytes(), 0);
    }

    #[tokio::test]
    async fn test_no_block_pools_returns_immediately() {
        let env = env(10_000 * MB);
        let item = WorkItem::new(10 * MB);

        env.mover.copy_blocks(&pair(&env), &item).await;

        assert_eq!(item.bytes_copied(), 0);
        assert_eq!(item.error_count(), 0);
    }

    #[tokio::test]
    async fn test_exit_flag_prevents_any_copy() {
        let env = env(10_000 * MB);
        env.source.add_pool("BP-1", &[10 * MB]);
        env.mover.set_exit_flag();
        let item = WorkItem::new(10 * MB);

        env.mover.copy_blocks(&pair(&env), &item).await;

        assert_eq!(env.dataset.moved_bytes(), 0);
    }

    #[tokio::test]
    async fn test_first_fit_skips_oversized_blocks() {
        let env = env(10_000 * MB);
        env.source.add_pool("BP-1", &[10 * MB, 512 * 1024]);
        let item = WorkItem::new(MB);

        env.mover.copy_blocks(&pair(&env), &item).await;

        assert_eq!(item.bytes_copied(), 512 * 1024);
        assert_eq!(item.blocks_copied(), 1);
        let snap = item.snapshot();
        assert_eq!(
            snap.err_msg.as_deref(),
            Some("No source blocks found to move.")
        );
    }

    #[tokio::test]
    async fn test_invalid_blocks_are_skipped() {
        let env = env(10_000 * MB);
        env.source.add_pool("BP-1", &[4 * MB, 4 * MB]);
        // ids are assigned sequentially from 1
        env.dataset.mark_invalid(1);
        let item = WorkItem::new(4 * MB);

        env.mover.copy_blocks(&pair(&env), &item).await;

        assert_eq!(item.blocks_copied(), 1);
        assert_eq!(env.dataset.moved_blocks()[0].0.block_id, 2);
    }

    #[tokio::test]
    async fn test_round_robin_across_pools() {
        let env = env(10_000 * MB);
        env.source.add_pool("BP-1", &[MB, MB]);
        env.source.add_pool("BP-2", &[MB, MB]);
        let item = WorkItem::new(100 * MB);

        env.mover.copy_blocks(&pair(&env), &item).await;

        let pools: Vec<String> = env
            .dataset
            .moved_blocks()
            .iter()
            .map(|(block, _)| block.pool_id.clone())
            .collect();
        assert_eq!(pools, vec!["BP-1", "BP-2", "BP-1", "BP-2"]);
    }

    #[tokio::test]
    async fn test_error_budget_spent_during_selection() {
        let env = env(10_000 * MB);
        env.source.add_pool("BP-1", &[4 * MB]);
        env.source.inject_iterator_errors(10);
        let item = WorkItem::new(4 * MB);

        env.mover.copy_blocks(&pair(&env), &item).await;

        // budget is the node default of 5
        assert_eq!(item.error_count(), 5);
        assert_eq!(item.bytes_copied(), 0);
        assert!(item.snapshot().err_msg.is_some());
    }

    #[tokio::test]
    async fn test_item_error_budget_override() {
        let env = env(10_000 * MB);
        env.source.add_pool("BP-1", &[4 * MB]);
        env.source.inject_iterator_errors(10);
        let item = WorkItem::new(4 * MB).with_limits(0, 0, 2);

        env.mover.copy_blocks(&pair(&env), &item).await;

        assert_eq!(item.error_count(), 2);
    }

    #[tokio::test]
    async fn test_move_failure_is_accounted_and_loop_continues() {
        let env = env(10_000 * MB);
        env.source.add_pool("BP-1", &[4 * MB, 4 * MB]);
        env.dataset.inject_move_failures(1);
        let item = WorkItem::new(8 * MB);

        env.mover.copy_blocks(&pair(&env), &item).await;

        assert_eq!(item.error_count(), 1);
        assert_eq!(item.bytes_copied(), 4 * MB);
        assert_eq!(item.blocks_copied(), 1);
    }

    #[tokio::test]
    async fn test_destination_capacity_guard() {
        let env = env(50 * MB);
        env.source.add_pool("BP-1", &[10 * MB; 10]);
        let item = WorkItem::new(100 * MB);

        env.mover.copy_blocks(&pair(&env), &item).await;

        // the pair is abandoned without a single move and without errors
        assert_eq!(item.bytes_copied(), 0);
        assert_eq!(item.blocks_copied(), 0);
        assert_eq!(item.error_count(), 0);
        assert_eq!(env.dataset.moved_bytes(), 0);
    }

    #[tokio::test]
    async fn test_available_failure_is_accounted() {
        let env = env(10_000 * MB);
        env.source.add_pool("BP-1", &[5 * MB, 5 * MB]);
        env.dest.inject_available_errors(1);
        let item = WorkItem::new(10 * MB);

        env.mover.copy_blocks(&pair(&env), &item).await;

        assert_eq!(item.error_count(), 1);
        assert_eq!(item.bytes_copied(), 5 * MB);
    }

    #[tokio::test]
    async fn test_start_time_and_elapsed_are_recorded() {
        let env = env(10_000 * MB);
        env.source.add_pool("BP-1", &[MB]);
        let item = WorkItem::new(MB);

        env.mover.copy_blocks(&pair(&env), &item).await;

        assert!(env.mover.start_time_ms() > 0);
        assert_eq!(item.snapshot().start_time_ms, env.mover.start_time_ms());
    }

    #[test]
    fn test_compute_delay_zero_interval() {
        let env = env(0);
        let item = WorkItem::new(0);
        assert_eq!(
            env.mover.compute_delay(100 * MB, 0, &item),
            Duration::ZERO
        );
    }

    #[test]
    fn test_compute_delay_sub_second_copy() {
        let env = env(0);
        let item = WorkItem::new(0);
        // 100 MB in half a second, ceiling 10 MB/s: the last-throughput term
        // degenerates to zero and the delay is mb / bandwidth seconds
        assert_eq!(
            env.mover.compute_delay(100 * MB, 500, &item),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_compute_delay_saturates_at_zero() {
        let env = env(0);
        let item = WorkItem::new(0);
        // 100 MB in 2 s: target term 100/10 = 10, last-throughput term
        // 100/2 = 50, and the difference saturates at zero
        assert_eq!(
            env.mover.compute_delay(100 * MB, 2000, &item),
            Duration::ZERO
        );
    }

    #[test]
    fn test_compute_delay_multi_second_copy() {
        let env = env(0);
        let item = WorkItem::new(0);
        // 100 MB in 20 s: target term 100/10 = 10, last-throughput term
        // 100/20 = 5, leaving a 5 s sleep
        assert_eq!(
            env.mover.compute_delay(100 * MB, 20_000, &item),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_compute_delay_respects_item_bandwidth() {
        let env = env(0);
        let item = WorkItem::new(0).with_limits(50, 0, 0);
        // ceiling 50 MB/s: 100 MB target time 2 s, actual 2 s, no sleep
        assert_eq!(
            env.mover.compute_delay(100 * MB, 2000, &item),
            Duration::ZERO
        );
    }

    #[test]
    fn test_effective_parameters_fall_back_to_defaults() {
        let env = env(0);
        let inherit = WorkItem::new(0);
        assert_eq!(env.mover.disk_bandwidth(&inherit), 10);
        assert_eq!(env.mover.block_tolerance(&inherit), 10);
        assert_eq!(env.mover.max_error(&inherit), 5);

        let negative = WorkItem::new(0).with_limits(-1, -5, -2);
        assert_eq!(env.mover.disk_bandwidth(&negative), 10);
        assert_eq!(env.mover.block_tolerance(&negative), 10);
        assert_eq!(env.mover.max_error(&negative), 5);

        let override_all = WorkItem::new(0).with_limits(40, 20, 9);
        assert_eq!(env.mover.disk_bandwidth(&override_all), 40);
        assert_eq!(env.mover.block_tolerance(&override_all), 20);
        assert_eq!(env.mover.max_error(&override_all), 9);
    }

    #[test]
    fn test_is_close_enough_boundaries() {
        let env = env(0);
        let item = WorkItem::new(100);
        assert!(!env.mover.is_close_enough(&item));
        item.inc_bytes_copied(90);
        // 90 + 9 = 99, not past the 100-byte target
        assert!(!env.mover.is_close_enough(&item));
        item.inc_bytes_copied(5);
        // 95 + 9 = 104 > 100
        assert!(env.mover.is_close_enough(&item));
    }

    #[test]
    fn test_is_less_than_needed_uses_inflated_remaining() {
        let env = env(0);
        let item = WorkItem::new(100);
        // remaining 100, inflated 110
        assert!(env.mover.is_less_than_needed(110, &item));
        assert!(!env.mover.is_less_than_needed(111, &item));
        item.inc_bytes_copied(60);
        // remaining 40, inflated 44
        assert!(env.mover.is_less_than_needed(44, &item));
        assert!(!env.mover.is_less_than_needed(45, &item));
    }
}
