//! Error types for the disk balancing worker.

use thiserror::Error;

/// Result type alias for balancer operations.
pub type BalancerResult<T> = Result<T, BalancerError>;

/// Error variants for balancer operations.
///
/// Admission-time failures are raised synchronously to the submitter and
/// leave the worker state untouched. Execution-time I/O failures are not
/// surfaced through this type at all; the mover accounts them against the
/// per-item error budget instead.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// Wraps standard I/O errors from volume and iterator implementations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The balancer is administratively disabled on this node.
    #[error("disk balancer is not enabled")]
    NotEnabled,

    /// A previously submitted plan is still executing.
    #[error("executing another plan")]
    PlanAlreadyInProgress,

    /// The plan version is outside the supported range.
    #[error("invalid plan version: {version}")]
    InvalidPlanVersion {
        /// The unsupported version that was submitted.
        version: u64,
    },

    /// The submitted plan text is empty.
    #[error("invalid plan: plan text is empty")]
    InvalidPlan,

    /// The plan ID is not the SHA-512 of the plan text.
    #[error("invalid or mis-matched plan hash")]
    InvalidPlanHash,

    /// The plan text is not a parseable plan document.
    #[error("parsing plan failed: {0}")]
    MalformedPlan(#[source] serde_json::Error),

    /// The plan is older than the validity window and `force` was not set.
    #[error("plan was generated more than {hours} hours ago")]
    OldPlanSubmitted {
        /// The validity window that was exceeded, in hours.
        hours: u64,
    },

    /// The plan was generated for a different data node.
    #[error("plan was generated for another node: {node_uuid}")]
    DatanodeIdMismatch {
        /// The node UUID named by the plan.
        node_uuid: String,
    },

    /// A step references a volume that is not attached to this node.
    #[error("unable to find volume: {storage_id}")]
    InvalidVolume {
        /// The storage ID the step referenced.
        storage_id: String,
    },

    /// A step names the same volume as both source and destination.
    #[error("source and destination volumes are the same: {storage_id}")]
    InvalidMove {
        /// The offending storage ID.
        storage_id: String,
    },

    /// Cancel targeted a plan that is not the current one.
    #[error("no such plan: {plan_id}")]
    NoSuchPlan {
        /// The plan ID the caller tried to cancel.
        plan_id: String,
    },

    /// Volume enumeration or serialization failed inside the node.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BalancerError {
    /// Stable wire code for this error, surfaced to RPC clients.
    pub fn code(&self) -> &'static str {
        match self {
            BalancerError::Io(_) => "INTERNAL_ERROR",
            BalancerError::NotEnabled => "DISK_BALANCER_NOT_ENABLED",
            BalancerError::PlanAlreadyInProgress => "PLAN_ALREADY_IN_PROGRESS",
            BalancerError::InvalidPlanVersion { .. } => "INVALID_PLAN_VERSION",
            BalancerError::InvalidPlan => "INVALID_PLAN",
            BalancerError::InvalidPlanHash => "INVALID_PLAN_HASH",
            BalancerError::MalformedPlan(_) => "MALFORMED_PLAN",
            BalancerError::OldPlanSubmitted { .. } => "OLD_PLAN_SUBMITTED",
            BalancerError::DatanodeIdMismatch { .. } => "DATANODE_ID_MISMATCH",
            BalancerError::InvalidVolume { .. } => "INVALID_VOLUME",
            BalancerError::InvalidMove { .. } => "INVALID_MOVE",
            BalancerError::NoSuchPlan { .. } => "NO_SUCH_PLAN",
            BalancerError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
