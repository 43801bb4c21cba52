//! Append-only audit events with correlation linkage.
//!
//! Audit rows survive device decommission and are never updated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Read,
    ReadSensitive,
    Write,
    PlanCreated,
    PlanApproved,
    PlanCancelled,
    PlanExpired,
    DeviceRegistered,
    DeviceDecommissioned,
    CredentialStored,
    CredentialRotated,
    HealthTransition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
    RolledBack,
    RollbackFailed,
    Skipped,
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Monotonic per-writer sequence number.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub action: AuditAction,
    pub tool_name: String,
    pub tool_tier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    pub result: AuditResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub correlation_id: String,
}

/// Builder-style constructor; only the always-present fields are required.
impl AuditEvent {
    pub fn new(
        action: AuditAction,
        tool_name: impl Into<String>,
        tool_tier: impl Into<String>,
        result: AuditResult,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0, // assigned by the log at append time
            timestamp: Utc::now(),
            device_id: None,
            environment: None,
            action,
            tool_name: tool_name.into(),
            tool_tier: tool_tier.into(),
            plan_id: None,
            job_id: None,
            result,
            error_message: None,
            user_id: None,
            metadata: serde_json::Map::new(),
            correlation_id: correlation_id.into(),
        }
    }

    pub fn with_device(mut self, device_id: Uuid, environment: &str) -> Self {
        self.device_id = Some(device_id);
        self.environment = Some(environment.to_string());
        self
    }

    pub fn with_plan(mut self, plan_id: Uuid) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_optional_fields() {
        let device = Uuid::new_v4();
        let plan = Uuid::new_v4();
        let ev = AuditEvent::new(
            AuditAction::Write,
            "dns_set_servers",
            "advanced",
            AuditResult::Success,
            "corr-7",
        )
        .with_device(device, "lab")
        .with_plan(plan)
        .with_user("alice");

        assert_eq!(ev.device_id, Some(device));
        assert_eq!(ev.environment.as_deref(), Some("lab"));
        assert_eq!(ev.plan_id, Some(plan));
        assert_eq!(ev.user_id.as_deref(), Some("alice"));
        assert_eq!(ev.correlation_id, "corr-7");
    }

    #[test]
    fn serializes_snake_case_actions() {
        let json = serde_json::to_string(&AuditAction::ReadSensitive).unwrap();
        assert_eq!(json, r#""read_sensitive""#);
        let json = serde_json::to_string(&AuditResult::RolledBack).unwrap();
        assert_eq!(json, r#""rolled_back""#);
    }
}
