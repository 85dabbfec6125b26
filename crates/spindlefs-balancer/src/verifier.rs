//! Admission checks for submitted plans.
//!
//! Order is fixed: version, then hash and parse, then age (unless forced),
//! then node identity. The first failure is returned and the worker state is
//! left untouched.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::error;

use crate::config::{MAX_PLAN_VERSION, MIN_PLAN_VERSION};
use crate::error::{BalancerError, BalancerResult};
use crate::plan::{plan_digest, NodePlan, PLAN_ID_LENGTH};

/// Wall clock in ms since the epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Validates plans against this node's identity and the configured age
/// window.
pub struct PlanVerifier {
    node_uuid: String,
    plan_valid_hours: u64,
}

impl PlanVerifier {
    /// Creates a verifier for the node with the given UUID.
    pub fn new(node_uuid: impl Into<String>, plan_valid_hours: u64) -> Self {
        Self {
            node_uuid: node_uuid.into(),
            plan_valid_hours,
        }
    }

    /// Runs every admission check and returns the parsed plan.
    pub fn verify(
        &self,
        plan_id: &str,
        plan_version: u64,
        plan_text: &str,
        force: bool,
    ) -> BalancerResult<NodePlan> {
        self.verify_version(plan_version)?;
        let plan = self.verify_hash(plan_id, plan_text)?;
        if !force {
            self.verify_timestamp(&plan)?;
        }
        self.verify_node_uuid(&plan)?;
        Ok(plan)
    }

    fn verify_version(&self, version: u64) -> BalancerResult<()> {
        if !(MIN_PLAN_VERSION..=MAX_PLAN_VERSION).contains(&version) {
            error!("disk balancer: invalid plan version {}", version);
            return Err(BalancerError::InvalidPlanVersion { version });
        }
        Ok(())
    }

    /// Checks the plan ID is the SHA-512 of the plan text, then parses it.
    fn verify_hash(&self, plan_id: &str, plan_text: &str) -> BalancerResult<NodePlan> {
        if plan_text.is_empty() {
            error!("disk balancer: empty plan submitted");
            return Err(BalancerError::InvalidPlan);
        }
        if plan_id.len() != PLAN_ID_LENGTH || !plan_digest(plan_text).eq_ignore_ascii_case(plan_id)
        {
            error!("disk balancer: invalid plan hash");
            return Err(BalancerError::InvalidPlanHash);
        }
        NodePlan::parse_json(plan_text)
    }

    fn verify_timestamp(&self, plan: &NodePlan) -> BalancerResult<()> {
        let valid_for_ms = self.plan_valid_hours.saturating_mul(60 * 60 * 1000);
        if plan.timestamp.saturating_add(valid_for_ms) < now_ms() {
            error!(
                "disk balancer: plan was generated more than {} hours ago",
                self.plan_valid_hours
            );
            return Err(BalancerError::OldPlanSubmitted {
                hours: self.plan_valid_hours,
            });
        }
        Ok(())
    }

    fn verify_node_uuid(&self, plan: &NodePlan) -> BalancerResult<()> {
        if plan.node_uuid.is_empty() || plan.node_uuid != self.node_uuid {
            error!("disk balancer: plan was generated for another node");
            return Err(BalancerError::DatanodeIdMismatch {
                node_uuid: plan.node_uuid.clone(),
            });
        }
        Ok(())
    }
}
