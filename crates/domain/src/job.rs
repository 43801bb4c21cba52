//! Jobs — queued units of work pulled by the executor's worker pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ApplyPlan,
    HealthCheck,
    MetricsCollection,
    ConfigBackup,
    DriftDetection,
    Rollback,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// The deadline elapsed mid-run; device consistency is unknown until the
    /// next health check re-establishes it.
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// Priority 0 (lowest) to 10 (highest). Health checks run at 10 and are
/// always accepted even when the queue is saturated.
pub const PRIORITY_MAX: u8 = 10;
pub const PRIORITY_HEALTH: u8 = 10;
pub const PRIORITY_DEFAULT: u8 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: u8,
    pub device_ids: Vec<Uuid>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub correlation_id: String,
}

impl Job {
    pub fn new(job_type: JobType, priority: u8, device_ids: Vec<Uuid>, correlation_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id: None,
            job_type,
            status: JobStatus::Pending,
            priority: priority.min(PRIORITY_MAX),
            device_ids,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts: 3,
            result_summary: None,
            error_message: None,
            correlation_id,
        }
    }

    pub fn for_plan(plan_id: Uuid, device_ids: Vec<Uuid>, correlation_id: String) -> Self {
        let mut job = Self::new(JobType::ApplyPlan, PRIORITY_DEFAULT, device_ids, correlation_id);
        job.plan_id = Some(plan_id);
        job
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }
}
