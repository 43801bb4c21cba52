//! Health probe records and metric classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Error,
}

impl HealthStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, HealthStatus::Critical | HealthStatus::Error)
    }
}

/// Why a probe ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeTrigger {
    Scheduled,
    PreChange,
    PostChange,
    ClientRequest,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HealthCheck row
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One immutable row per probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub id: Uuid,
    pub device_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub trigger: ProbeTrigger,
    pub response_time_ms: u64,
    /// Which transport answered ("rest" or "ssh"), when the probe succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// Classify resource metrics into a health status.
///
/// warning: cpu>80% OR mem>85% OR temp>70°C
/// critical: cpu>95% OR mem>95% OR temp>80°C
pub fn classify(cpu_pct: Option<f64>, mem_pct: Option<f64>, temp_c: Option<f64>) -> HealthStatus {
    let cpu = cpu_pct.unwrap_or(0.0);
    let mem = mem_pct.unwrap_or(0.0);
    let temp = temp_c.unwrap_or(0.0);

    if cpu > 95.0 || mem > 95.0 || temp > 80.0 {
        HealthStatus::Critical
    } else if cpu > 80.0 || mem > 85.0 || temp > 70.0 {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

/// Post-change degradation test against the pre-change baseline.
///
/// Degraded when cpu rose more than 30 percentage points, mem more than 20,
/// or the status crossed into critical/error.
pub fn is_critical_degradation(pre: &HealthCheck, post: &HealthCheck) -> bool {
    if post.status.is_failure() && !pre.status.is_failure() {
        return true;
    }
    let cpu_delta = post.cpu_pct.unwrap_or(0.0) - pre.cpu_pct.unwrap_or(0.0);
    let mem_delta = post.mem_pct.unwrap_or(0.0) - pre.mem_pct.unwrap_or(0.0);
    cpu_delta > 30.0 || mem_delta > 20.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(status: HealthStatus, cpu: f64, mem: f64) -> HealthCheck {
        HealthCheck {
            id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            status,
            trigger: ProbeTrigger::Scheduled,
            response_time_ms: 12,
            transport: Some("rest".into()),
            cpu_pct: Some(cpu),
            mem_pct: Some(mem),
            temp_c: None,
            voltage: None,
            uptime_sec: Some(3600),
            interface_summary: None,
            error_detail: None,
        }
    }

    #[test]
    fn classify_healthy() {
        assert_eq!(classify(Some(10.0), Some(40.0), Some(45.0)), HealthStatus::Healthy);
        assert_eq!(classify(None, None, None), HealthStatus::Healthy);
    }

    #[test]
    fn classify_warning_thresholds() {
        assert_eq!(classify(Some(81.0), None, None), HealthStatus::Warning);
        assert_eq!(classify(None, Some(86.0), None), HealthStatus::Warning);
        assert_eq!(classify(None, None, Some(71.0)), HealthStatus::Warning);
    }

    #[test]
    fn classify_critical_beats_warning() {
        assert_eq!(classify(Some(96.0), Some(86.0), None), HealthStatus::Critical);
        assert_eq!(classify(None, Some(96.0), None), HealthStatus::Critical);
        assert_eq!(classify(None, None, Some(81.0)), HealthStatus::Critical);
    }

    #[test]
    fn degradation_on_cpu_jump() {
        let pre = check(HealthStatus::Healthy, 10.0, 40.0);
        let post = check(HealthStatus::Warning, 45.0, 41.0);
        assert!(is_critical_degradation(&pre, &post));
    }

    #[test]
    fn degradation_on_status_cross() {
        let pre = check(HealthStatus::Warning, 82.0, 40.0);
        let post = check(HealthStatus::Critical, 83.0, 41.0);
        assert!(is_critical_degradation(&pre, &post));
    }

    #[test]
    fn small_drift_is_not_degradation() {
        let pre = check(HealthStatus::Healthy, 10.0, 40.0);
        let post = check(HealthStatus::Healthy, 25.0, 50.0);
        assert!(!is_critical_degradation(&pre, &post));
    }
}
