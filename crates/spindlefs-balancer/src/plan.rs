//! Plan wire format and plan identity.
//!
//! A plan is a versioned, timestamped, node-targeted JSON document listing
//! byte volumes to shift between local volumes. Its identity is the SHA-512
//! of the canonical plan text, rendered as 128 lowercase hex characters.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::error::{BalancerError, BalancerResult};

/// Length of a plan ID: SHA-512 as hex.
pub const PLAN_ID_LENGTH: usize = 128;

/// A volume named by a plan step. Only the UUID participates in execution;
/// the path is carried for operator-facing output from the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanVolume {
    /// Storage ID of the volume on the target node.
    pub uuid: String,
    /// Base path of the volume as the planner saw it.
    #[serde(default)]
    pub path: String,
}

impl PlanVolume {
    /// Creates a plan volume reference from a storage ID.
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            path: String::new(),
        }
    }
}

/// One source → destination move in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveStep {
    /// Volume to move bytes off.
    pub source_volume: PlanVolume,
    /// Volume to move bytes onto.
    pub destination_volume: PlanVolume,
    /// Byte volume to shift for this step.
    pub bytes_to_move: u64,
    /// Per-step bandwidth ceiling in MB/s; zero or negative inherits the
    /// node default.
    #[serde(default)]
    pub bandwidth: i64,
    /// Per-step tolerance band in percent; zero or negative inherits the
    /// node default.
    #[serde(default)]
    pub tolerance_percent: i64,
    /// Per-step error budget; zero or negative inherits the node default.
    #[serde(default)]
    pub max_disk_errors: i64,
}

impl MoveStep {
    /// Creates a step with inherited bandwidth, tolerance and error budget.
    pub fn new(source: PlanVolume, destination: PlanVolume, bytes_to_move: u64) -> Self {
        Self {
            source_volume: source,
            destination_volume: destination,
            bytes_to_move,
            bandwidth: 0,
            tolerance_percent: 0,
            max_disk_errors: 0,
        }
    }
}

/// A plan targeted at one data node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePlan {
    /// Plan format version.
    #[serde(default)]
    pub version: u64,
    /// UUID of the node this plan was generated for. Absence is reported by
    /// the verifier as a node mismatch, not as a parse failure.
    #[serde(default, rename = "nodeUUID")]
    pub node_uuid: String,
    /// Hostname of the node, informational only.
    #[serde(default)]
    pub node_name: String,
    /// IPC port of the node, informational only.
    #[serde(default)]
    pub port: u32,
    /// When the planner produced this plan, in ms since the epoch.
    #[serde(default)]
    pub timestamp: u64,
    /// Ordered move steps.
    #[serde(default)]
    pub volume_set_plans: Vec<MoveStep>,
}

impl NodePlan {
    /// Creates an empty plan for a node, stamped with the given time.
    pub fn new(version: u64, node_uuid: impl Into<String>, timestamp: u64) -> Self {
        Self {
            version,
            node_uuid: node_uuid.into(),
            node_name: String::new(),
            port: 0,
            timestamp,
            volume_set_plans: Vec::new(),
        }
    }

    /// Parses a plan from its JSON wire form.
    pub fn parse_json(text: &str) -> BalancerResult<Self> {
        serde_json::from_str(text).map_err(BalancerError::MalformedPlan)
    }

    /// Renders this plan to its JSON wire form.
    pub fn to_json(&self) -> BalancerResult<String> {
        serde_json::to_string(self)
            .map_err(|e| BalancerError::Internal(format!("unable to serialize plan: {e}")))
    }
}

/// Computes the plan ID for a plan text: SHA-512 over the UTF-8 bytes,
/// lowercase hex.
pub fn plan_digest(plan_text: &str) -> String {
    let hash = Sha512::digest(plan_text.as_bytes());
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> NodePlan {
        let mut plan = NodePlan::new(1, "node-1", 1_700_000_000_000);
        plan.volume_set_plans.push(MoveStep::new(
            PlanVolume::new("DS-a"),
            PlanVolume::new("DS-b"),
            100 * 1024 * 1024,
        ));
        plan
    }

    #[test]
    fn test_json_round_trip() {
        let plan = sample_plan();
        let json = plan.to_json().unwrap();
        let decoded = NodePlan::parse_json(&json).unwrap();
        assert_eq!(plan, decoded);
    }

    #[test]
    fn test_wire_field_names() {
        let json = sample_plan().to_json().unwrap();
        assert!(json.contains("\"nodeUUID\""));
        assert!(json.contains("\"volumeSetPlans\""));
        assert!(json.contains("\"sourceVolume\""));
        assert!(json.contains("\"destinationVolume\""));
        assert!(json.contains("\"bytesToMove\""));
        assert!(json.contains("\"tolerancePercent\""));
        assert!(json.contains("\"maxDiskErrors\""));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = NodePlan::parse_json("{not json").unwrap_err();
        assert_eq!(err.code(), "MALFORMED_PLAN");
    }

    #[test]
    fn test_parse_defaults_optional_fields() {
        let json = r#"{
            "version": 1,
            "nodeUUID": "node-1",
            "timestamp": 1700000000000,
            "volumeSetPlans": [
                {
                    "sourceVolume": {"uuid": "DS-a"},
                    "destinationVolume": {"uuid": "DS-b"},
                    "bytesToMove": 4096
                }
            ]
        }"#;
        let plan = NodePlan::parse_json(json).unwrap();
        assert_eq!(plan.node_name, "");
        assert_eq!(plan.port, 0);
        let step = &plan.volume_set_plans[0];
        assert_eq!(step.bandwidth, 0);
        assert_eq!(step.tolerance_percent, 0);
        assert_eq!(step.max_disk_errors, 0);
    }

    #[test]
    fn test_digest_shape() {
        let digest = plan_digest("hello world");
        assert_eq!(digest.len(), PLAN_ID_LENGTH);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, digest.to_lowercase());
    }

    #[test]
    fn test_digest_is_deterministic_and_sensitive() {
        let a = plan_digest("plan text");
        let b = plan_digest("plan text");
        let c = plan_digest("plan texT");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_known_digest() {
        // sha512 of the empty string
        assert_eq!(
            plan_digest(""),
            "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce\
             47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e"
        );
    }
}
