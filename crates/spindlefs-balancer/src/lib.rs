#![warn(missing_docs)]

//! Spindlefs disk balancing worker: plan admission, work translation, and
//! throttled cross-volume block movement on a data node.
//!
//! Clients submit a plan (a hashed, node-targeted JSON document of byte
//! volumes to shift between local volumes) through [`DiskBalancer`]. The
//! worker verifies it, translates its steps into per-volume-pair work items,
//! and executes them on a single background task via [`DiskMover`], which
//! drains source block pools and moves blocks under a bandwidth ceiling and
//! an error budget. The storage layer is consumed through the traits in
//! [`volume`]; in-memory mocks are provided for tests and embedders.

pub mod config;
pub mod error;
pub mod mover;
pub mod plan;
pub mod verifier;
pub mod volume;
pub mod work;
pub mod worker;

pub use config::{
    BalancerConfig, DEFAULT_BLOCK_TOLERANCE_PERCENT, DEFAULT_MAX_DISK_ERRORS,
    DEFAULT_MAX_DISK_THROUGHPUT_MB, DEFAULT_PLAN_VALID_HOURS, MAX_PLAN_VERSION, MIN_PLAN_VERSION,
};
pub use error::{BalancerError, BalancerResult};
pub use mover::{BlockMover, DiskMover};
pub use plan::{plan_digest, MoveStep, NodePlan, PlanVolume, PLAN_ID_LENGTH};
pub use verifier::PlanVerifier;
pub use volume::{
    BlockDataset, BlockIterator, BlockRecord, BlockVolume, MockDataset, MockVolume,
};
pub use work::{
    VolumePair, WorkEntry, WorkItem, WorkItemSnapshot, WorkMap, WorkResult, WorkStatus,
};
pub use worker::DiskBalancer;
