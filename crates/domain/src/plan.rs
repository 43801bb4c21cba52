//! Plans — immutable-after-approval descriptions of proposed change sets.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status & risk
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    PendingApproval,
    Approved,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled | PlanStatus::Expired
        )
    }

    /// Legal lifecycle edges. Targets are immutable once past
    /// `pending_approval`; an amended plan is a new row.
    pub fn can_transition_to(self, next: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (self, next),
            (Draft, PendingApproval)
                | (Draft, Approved)
                | (Draft, Cancelled)
                | (PendingApproval, Approved)
                | (PendingApproval, Cancelled)
                | (PendingApproval, Expired)
                | (Approved, Executing)
                | (Approved, Cancelled)
                | (Approved, Expired)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Cancelled)
        )
    }
}

/// Blast-radius classification. Ordered so the plan level is the max over
/// all devices and topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Changes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single diffed change against one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    /// Configuration topic ("dns", "ntp", "ip_address", ...).
    pub topic: String,
    /// Operation within the topic ("set_servers", "add_address", ...).
    pub operation: String,
    pub current_value: serde_json::Value,
    pub desired_value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_impact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_check_result: Option<String>,
}

/// All changes for one device in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTarget {
    pub device_id: Uuid,
    pub device_name: String,
    pub changes: Vec<Change>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub tool_name: String,
    pub status: PlanStatus,
    pub summary: String,
    pub risk_level: RiskLevel,
    pub targets: Vec<PlanTarget>,
    pub expires_at: DateTime<Utc>,
    pub correlation_id: String,
    /// Opt-in parallel per-device apply, asserted by the planner when
    /// changes are independent. Sequential by default.
    #[serde(default)]
    pub parallel_apply: bool,
}

impl Plan {
    pub fn new(
        tool_name: String,
        created_by: String,
        summary: String,
        risk_level: RiskLevel,
        targets: Vec<PlanTarget>,
        correlation_id: String,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            created_by,
            tool_name,
            status: PlanStatus::Draft,
            summary,
            risk_level,
            targets,
            expires_at: now + ttl,
            correlation_id,
            parallel_apply: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            PlanStatus::PendingApproval | PlanStatus::Approved
        ) && now > self.expires_at
    }

    /// Total number of changes across all targets.
    pub fn change_count(&self) -> usize {
        self.targets.iter().map(|t| t.changes.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(status: PlanStatus) -> Plan {
        let mut p = Plan::new(
            "dns_set_servers".into(),
            "alice".into(),
            "update dns".into(),
            RiskLevel::Medium,
            vec![],
            "corr-1".into(),
            Duration::hours(24),
        );
        p.status = status;
        p
    }

    #[test]
    fn risk_ordering_takes_max() {
        let levels = [RiskLevel::Low, RiskLevel::High, RiskLevel::Medium];
        assert_eq!(levels.iter().max(), Some(&RiskLevel::High));
    }

    #[test]
    fn lifecycle_edges() {
        use PlanStatus::*;
        assert!(Draft.can_transition_to(PendingApproval));
        assert!(PendingApproval.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Completed));
        assert!(Executing.can_transition_to(Failed));

        // No shortcuts or reversals.
        assert!(!Draft.can_transition_to(Executing));
        assert!(!Completed.can_transition_to(Approved));
        assert!(!Approved.can_transition_to(PendingApproval));
        assert!(!Expired.can_transition_to(Approved));
    }

    #[test]
    fn expiry_applies_only_before_execution() {
        let past = Utc::now() + Duration::hours(48);
        assert!(plan(PlanStatus::PendingApproval).is_expired(past));
        assert!(plan(PlanStatus::Approved).is_expired(past));
        assert!(!plan(PlanStatus::Executing).is_expired(past));
        assert!(!plan(PlanStatus::Completed).is_expired(past));
    }

    #[test]
    fn fresh_plan_not_expired() {
        assert!(!plan(PlanStatus::PendingApproval).is_expired(Utc::now()));
    }
}
