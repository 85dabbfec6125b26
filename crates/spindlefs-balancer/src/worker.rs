//! The disk balancing worker: plan lifecycle and execution scheduling.
//!
//! Clients submit plans through `submit_plan`. After admission checks the
//! plan is translated into the work map and a single background task walks
//! the entries, handing each to the block mover. Only one plan can execute
//! on a node at a time; that is enforced by checking the task handle under
//! the worker lock before admitting the next plan.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info};

use crate::config::BalancerConfig;
use crate::error::{BalancerError, BalancerResult};
use crate::mover::BlockMover;
use crate::plan::{MoveStep, NodePlan};
use crate::verifier::PlanVerifier;
use crate::volume::BlockVolume;
use crate::work::{VolumePair, WorkEntry, WorkItem, WorkMap, WorkResult, WorkStatus};

/// Grace window for each phase of mover-task shutdown.
const TASK_WAIT_SECS: u64 = 10;

struct WorkerState {
    enabled: bool,
    current_result: WorkResult,
    plan_id: String,
    task: Option<JoinHandle<()>>,
}

/// Per-node disk balancing worker.
pub struct DiskBalancer {
    mover: Arc<dyn BlockMover>,
    verifier: PlanVerifier,
    work_map: Arc<WorkMap>,
    bandwidth: u64,
    state: Mutex<WorkerState>,
}

impl DiskBalancer {
    /// Creates a worker for the node with the given UUID, executing moves
    /// through the given mover.
    pub fn new(
        node_uuid: impl Into<String>,
        config: &BalancerConfig,
        mover: Arc<dyn BlockMover>,
    ) -> Self {
        let cfg = config.sanitized();
        Self {
            mover,
            verifier: PlanVerifier::new(node_uuid, cfg.plan_valid_hours),
            work_map: Arc::new(WorkMap::new()),
            bandwidth: cfg.max_disk_throughput_mb,
            state: Mutex::new(WorkerState {
                enabled: cfg.enabled,
                current_result: WorkResult::NoPlan,
                plan_id: String::new(),
                task: None,
            }),
        }
    }

    /// Admits a client-submitted plan and starts executing it.
    ///
    /// `plan_id` is the SHA-512 of `plan_text`; `force` skips the plan-age
    /// check. Fails without touching worker state if a prior task is still
    /// running or any admission check rejects the plan.
    pub async fn submit_plan(
        &self,
        plan_id: &str,
        plan_version: u64,
        plan_text: &str,
        force: bool,
    ) -> BalancerResult<()> {
        let mut state = self.state.lock().await;
        Self::check_enabled(&state)?;
        if let Some(task) = &state.task {
            if !task.is_finished() {
                error!("disk balancer: executing another plan, submit failed");
                return Err(BalancerError::PlanAlreadyInProgress);
            }
        }
        let plan = self
            .verifier
            .verify(plan_id, plan_version, plan_text, force)?;
        self.create_work_plan(&plan)?;
        state.plan_id = plan_id.to_string();
        state.current_result = WorkResult::PlanUnderProgress;
        self.execute_plan(&mut state);
        Ok(())
    }

    /// Reports the current state, plan identity and per-pair counters.
    ///
    /// If the current plan was under progress and its task has finished,
    /// the state moves to done before the snapshot is taken.
    pub async fn query_work_status(&self) -> BalancerResult<WorkStatus> {
        let mut state = self.state.lock().await;
        Self::check_enabled(&state)?;

        // if a plan was in progress, check whether it has finished
        let task_finished = state
            .task
            .as_ref()
            .map(|task| task.is_finished())
            .unwrap_or(false);
        if state.current_result == WorkResult::PlanUnderProgress && task_finished {
            state.current_result = WorkResult::PlanDone;
        }

        let work_entries = self
            .work_map
            .snapshot()
            .iter()
            .map(|(pair, item)| WorkEntry {
                source_path: pair.source().base_path(),
                dest_path: pair.dest().base_path(),
                work_item: item.snapshot(),
            })
            .collect();

        Ok(WorkStatus {
            result: state.current_result,
            plan_id: state.plan_id.clone(),
            work_entries,
        })
    }

    /// Cancels the running plan. The plan ID must match the current one.
    pub async fn cancel_plan(&self, plan_id: &str) -> BalancerResult<()> {
        let mut state = self.state.lock().await;
        Self::check_enabled(&state)?;
        if state.plan_id.is_empty() || state.plan_id != plan_id {
            error!(
                "disk balancer: no such plan, cancel failed, plan ID: {}",
                plan_id
            );
            return Err(BalancerError::NoSuchPlan {
                plan_id: plan_id.to_string(),
            });
        }
        let running = state
            .task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false);
        if running {
            self.mover.set_exit_flag();
            Self::shutdown_task(&mut state).await;
            state.current_result = WorkResult::PlanCancelled;
        }
        Ok(())
    }

    /// Returns a JSON object mapping storage ID to base path for every
    /// attached volume.
    pub async fn get_volume_names(&self) -> BalancerResult<String> {
        let state = self.state.lock().await;
        Self::check_enabled(&state)?;
        let path_map: HashMap<String, String> = self
            .storage_id_to_volume_map()?
            .into_iter()
            .map(|(storage_id, volume)| (storage_id, volume.base_path()))
            .collect();
        serde_json::to_string(&path_map)
            .map_err(|e| BalancerError::Internal(format!("unable to create JSON string: {e}")))
    }

    /// Node-default bandwidth ceiling, in MB/s.
    pub async fn get_bandwidth(&self) -> BalancerResult<u64> {
        let state = self.state.lock().await;
        Self::check_enabled(&state)?;
        Ok(self.bandwidth)
    }

    /// Disables the balancer and tears down any running task.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.enabled = false;
        state.current_result = WorkResult::NoPlan;
        let running = state
            .task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false);
        if running {
            state.current_result = WorkResult::PlanCancelled;
            self.mover.set_exit_flag();
            Self::shutdown_task(&mut state).await;
        }
    }

    fn check_enabled(state: &WorkerState) -> BalancerResult<()> {
        if !state.enabled {
            return Err(BalancerError::NotEnabled);
        }
        Ok(())
    }

    /// Waits for the mover task to terminate: a grace window, a forced
    /// abort, a second grace window, then give up and log.
    async fn shutdown_task(state: &mut WorkerState) {
        let Some(mut task) = state.task.take() else {
            return;
        };
        let grace = Duration::from_secs(TASK_WAIT_SECS);
        if timeout(grace, &mut task).await.is_err() {
            task.abort();
            if timeout(grace, &mut task).await.is_err() {
                error!("disk balancer: mover task did not terminate");
            }
        }
    }

    fn storage_id_to_volume_map(
        &self,
    ) -> BalancerResult<HashMap<String, Arc<dyn BlockVolume>>> {
        let references = self.mover.dataset().volume_references().map_err(|e| {
            error!("disk balancer: internal error: {}", e);
            BalancerError::Internal(format!("unable to enumerate volumes: {e}"))
        })?;
        let mut path_map = HashMap::new();
        for volume in references {
            path_map.insert(volume.storage_id(), volume);
        }
        Ok(path_map)
    }

    /// Translates a verified plan into work-map entries.
    fn create_work_plan(&self, plan: &NodePlan) -> BalancerResult<()> {
        // residual work from the previous plan is dropped here so status
        // keeps reporting it up to this point
        self.work_map.clear();
        let volume_map = self.storage_id_to_volume_map()?;

        for step in &plan.volume_set_plans {
            let source = volume_map
                .get(&step.source_volume.uuid)
                .cloned()
                .ok_or_else(|| {
                    error!("disk balancer: unable to find source volume, submit failed");
                    BalancerError::InvalidVolume {
                        storage_id: step.source_volume.uuid.clone(),
                    }
                })?;
            let dest = volume_map
                .get(&step.destination_volume.uuid)
                .cloned()
                .ok_or_else(|| {
                    error!("disk balancer: unable to find destination volume, submit failed");
                    BalancerError::InvalidVolume {
                        storage_id: step.destination_volume.uuid.clone(),
                    }
                })?;
            self.insert_work_item(source, dest, step)?;
        }
        Ok(())
    }

    fn insert_work_item(
        &self,
        source: Arc<dyn BlockVolume>,
        dest: Arc<dyn BlockVolume>,
        step: &MoveStep,
    ) -> BalancerResult<()> {
        if source.storage_id() == dest.storage_id() {
            info!("disk balancer: source and destination volumes are the same");
            return Err(BalancerError::InvalidMove {
                storage_id: source.storage_id(),
            });
        }

        let pair = VolumePair::new(source, dest);
        let mut bytes_to_move = step.bytes_to_move;
        // a plan may list the same pair more than once, fold those lines
        // into one work order
        if let Some(existing) = self.work_map.bytes_to_copy(&pair) {
            bytes_to_move += existing;
        }
        let item = WorkItem::new(bytes_to_move).with_limits(
            step.bandwidth,
            step.tolerance_percent,
            step.max_disk_errors,
        );
        self.work_map.insert(pair, item);
        Ok(())
    }

    /// Arms the mover and spawns the task that walks the work map.
    fn execute_plan(&self, state: &mut WorkerState) {
        self.mover.set_runnable();
        let mover = Arc::clone(&self.mover);
        let entries = self.work_map.snapshot();
        let plan_id = state.plan_id.clone();

        state.task = Some(tokio::spawn(async move {
            info!("executing disk balancer plan, plan ID: {}", plan_id);
            for (pair, item) in entries {
                mover.copy_blocks(&pair, &item).await;
            }
            mover.set_exit_flag();
        }));
    }
}
