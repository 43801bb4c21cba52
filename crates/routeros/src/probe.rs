//! Reachability probe with REST→SSH fallback and failure classification.
//!
//! The probe is the foundation for health checks and the connectivity tool.
//! It reports which transport answered, normalized resource metrics, and —
//! when both transports fail — a classified reason with concrete remediation
//! suggestions for the operator.

use std::time::Instant;

use serde_json::Value;

use fg_domain::device::Device;
use fg_domain::Error;

use crate::client::{CredentialSet, RouterOsClient, TransportKind};
use crate::rest::RestRequest;
use crate::ssh::{self, SshCommand};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Auth,
    Timeout,
    Unreachable,
    Tls,
    Protocol,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Auth => "auth",
            FailureReason::Timeout => "timeout",
            FailureReason::Unreachable => "unreachable",
            FailureReason::Tls => "tls",
            FailureReason::Protocol => "protocol",
        }
    }
}

/// Normalized resource metrics from `/system/resource`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceMetrics {
    pub cpu_pct: Option<f64>,
    pub mem_pct: Option<f64>,
    pub temp_c: Option<f64>,
    pub voltage: Option<f64>,
    pub uptime_sec: Option<u64>,
    pub routeros_version: Option<String>,
    pub board_name: Option<String>,
}

/// What one probe attempt produced.
#[derive(Debug)]
pub enum ProbeOutcome {
    Reachable {
        transport: TransportKind,
        fallback_used: bool,
        metrics: ResourceMetrics,
    },
    Failed {
        reason: FailureReason,
        detail: String,
    },
}

/// Full probe report surfaced to callers and the connectivity tool.
#[derive(Debug)]
pub struct ProbeReport {
    pub outcome: ProbeOutcome,
    pub attempted_transports: Vec<&'static str>,
    pub response_time_ms: u64,
    pub remediation: Vec<String>,
}

impl ProbeReport {
    pub fn is_reachable(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Reachable { .. })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Probe protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl RouterOsClient {
    /// Probe a device: REST `/rest/system/resource` first, SSH
    /// `system_resource_print` on transport failure.
    pub async fn probe(&self, device: &Device, creds: &CredentialSet) -> ProbeReport {
        let started = Instant::now();
        let mut attempted = Vec::new();

        // 1. REST attempt.
        let request = RestRequest {
            method: "GET",
            path: "/rest/system/resource",
            body: None,
        };
        let rest_error = match creds.rest.as_ref() {
            Some(material) => {
                attempted.push("rest");
                match self
                    .transport()
                    .rest(device, material, &request, self.rest_timeout())
                    .await
                {
                    Ok(value) => {
                        return ProbeReport {
                            outcome: ProbeOutcome::Reachable {
                                transport: TransportKind::Rest,
                                fallback_used: false,
                                metrics: parse_rest_metrics(&value),
                            },
                            attempted_transports: attempted,
                            response_time_ms: started.elapsed().as_millis() as u64,
                            remediation: Vec::new(),
                        };
                    }
                    Err(err) => Some(err),
                }
            }
            None => None,
        };

        // 2. SSH fallback on transport-level failure (or missing REST creds).
        let transport_failed = rest_error
            .as_ref()
            .map(|e| matches!(e, Error::DeviceUnreachable { .. } | Error::Timeout(_)))
            .unwrap_or(true);

        if transport_failed {
            if let Some(material) = creds.ssh.as_ref() {
                attempted.push("ssh");
                match self
                    .transport()
                    .ssh(device, material, &SshCommand::SystemResourcePrint, self.ssh_timeout())
                    .await
                {
                    Ok(output) => {
                        let value = ssh::parse_print_output(&output);
                        return ProbeReport {
                            outcome: ProbeOutcome::Reachable {
                                transport: TransportKind::Ssh,
                                fallback_used: true,
                                metrics: parse_ssh_metrics(&value),
                            },
                            attempted_transports: attempted,
                            response_time_ms: started.elapsed().as_millis() as u64,
                            remediation: Vec::new(),
                        };
                    }
                    Err(ssh_err) => {
                        let err = rest_error.unwrap_or(ssh_err);
                        let (reason, detail) = classify(&err);
                        return ProbeReport {
                            remediation: remediation(reason),
                            outcome: ProbeOutcome::Failed { reason, detail },
                            attempted_transports: attempted,
                            response_time_ms: started.elapsed().as_millis() as u64,
                        };
                    }
                }
            }
        }

        let err = rest_error.unwrap_or_else(|| Error::CredentialNotFound {
            device: device.name.clone(),
            kind: "rest".into(),
        });
        let (reason, detail) = classify(&err);
        ProbeReport {
            remediation: remediation(reason),
            outcome: ProbeOutcome::Failed { reason, detail },
            attempted_transports: attempted,
            response_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Classification & remediation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn classify(err: &Error) -> (FailureReason, String) {
    let detail = err.to_string();
    let reason = match err {
        Error::AuthFailure(_) => FailureReason::Auth,
        Error::Timeout(_) => FailureReason::Timeout,
        Error::DeviceUnreachable { detail, .. } => {
            let lower = detail.to_lowercase();
            if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
                FailureReason::Tls
            } else {
                FailureReason::Unreachable
            }
        }
        Error::CredentialNotFound { .. } => FailureReason::Auth,
        _ => FailureReason::Protocol,
    };
    (reason, detail)
}

fn remediation(reason: FailureReason) -> Vec<String> {
    let suggestions: &[&str] = match reason {
        FailureReason::Auth => &[
            "verify the stored credential username and password",
            "check the RouterOS user's group has api/ssh policy",
            "rotate the credential if it may have been changed on-device",
        ],
        FailureReason::Timeout => &[
            "raise routeros.rest_timeout_secs for slow links",
            "check device CPU load — an overloaded router answers slowly",
            "verify there is no packet loss on the management path",
        ],
        FailureReason::Unreachable => &[
            "verify the management IP and port are correct",
            "check for a firewall rule blocking HTTPS to the device",
            "confirm the device is powered on and on the management VLAN",
        ],
        FailureReason::Tls => &[
            "check the device certificate validity dates",
            "enable routeros.accept_invalid_certs for self-signed certificates",
            "confirm the www-ssl service is enabled on the device",
        ],
        FailureReason::Protocol => &[
            "confirm the RouterOS version supports the REST API (v7.1+)",
            "check the www-ssl service configuration",
            "inspect the device log for api errors",
        ],
    };
    suggestions.iter().map(|s| s.to_string()).collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Metric parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_rest_metrics(value: &Value) -> ResourceMetrics {
    let free = field_f64(value, "free-memory");
    let total = field_f64(value, "total-memory");
    ResourceMetrics {
        cpu_pct: field_f64(value, "cpu-load"),
        mem_pct: mem_pct(free, total),
        temp_c: field_f64(value, "temperature").or_else(|| field_f64(value, "cpu-temperature")),
        voltage: field_f64(value, "voltage"),
        uptime_sec: value
            .get("uptime")
            .and_then(Value::as_str)
            .map(parse_uptime),
        routeros_version: field_string(value, "version"),
        board_name: field_string(value, "board-name"),
    }
}

fn parse_ssh_metrics(value: &Value) -> ResourceMetrics {
    // SSH print output is all strings with unit suffixes.
    parse_rest_metrics(value)
}

fn field_string(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Accept numbers or strings like "7%", "200.1MiB".
fn field_f64(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_metric_number(s),
        _ => None,
    }
}

fn parse_metric_number(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let (digits, suffix): (String, String) = raw
        .chars()
        .partition(|c| c.is_ascii_digit() || *c == '.' || *c == '-');
    let base: f64 = digits.parse().ok()?;
    let scale = match suffix.trim() {
        "" | "%" | "V" | "C" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    Some(base * scale)
}

fn mem_pct(free: Option<f64>, total: Option<f64>) -> Option<f64> {
    match (free, total) {
        (Some(free), Some(total)) if total > 0.0 => Some(((total - free) / total) * 100.0),
        _ => None,
    }
}

/// Parse RouterOS uptime strings ("2w3d4h5m6s") into seconds.
fn parse_uptime(raw: &str) -> u64 {
    let mut total: u64 = 0;
    let mut current = String::new();
    for c in raw.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else {
            let n: u64 = current.parse().unwrap_or(0);
            current.clear();
            total += match c {
                'w' => n * 7 * 24 * 3600,
                'd' => n * 24 * 3600,
                'h' => n * 3600,
                'm' => n * 60,
                's' => n,
                _ => 0,
            };
        }
    }
    total
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
