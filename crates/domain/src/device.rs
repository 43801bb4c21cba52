//! Device identity, environment tagging, and capability flags.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deployment tier a device belongs to. The service refuses to operate on
/// devices whose environment differs from its own configured environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Lab,
    Staging,
    Prod,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Lab => "lab",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }

    /// Parse from the closed set. Anything else is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lab" => Some(Environment::Lab),
            "staging" => Some(Environment::Staging),
            "prod" => Some(Environment::Prod),
            _ => None,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Pending,
    Healthy,
    Degraded,
    Unreachable,
    Decommissioned,
}

impl DeviceStatus {
    /// Decommissioned is terminal; every other status may move between the
    /// live states as health observations come in.
    pub fn can_transition_to(self, _next: DeviceStatus) -> bool {
        self != DeviceStatus::Decommissioned
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Device
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Management endpoint (REST and SSH share the host; ports differ).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    #[serde(default = "d_rest_port")]
    pub rest_port: u16,
    #[serde(default = "d_ssh_port")]
    pub ssh_port: u16,
}

fn d_rest_port() -> u16 {
    443
}
fn d_ssh_port() -> u16 {
    22
}

/// Write-tier gates. All default false — explicit admin action is required
/// before any tier of write is permitted on a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFlags {
    #[serde(default)]
    pub allow_advanced_writes: bool,
    #[serde(default)]
    pub allow_professional_workflows: bool,
    #[serde(default)]
    pub allow_ssh_commands: bool,
}

/// Metadata observed from the device itself (never user-supplied).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routeros_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// A managed RouterOS instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    /// Human name, unique fleet-wide.
    pub name: String,
    pub endpoint: Endpoint,
    pub environment: Environment,
    pub status: DeviceStatus,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub capabilities: CapabilityFlags,
    #[serde(default)]
    pub observed: ObservedMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    pub fn new(name: String, endpoint: Endpoint, environment: Environment) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            endpoint,
            environment,
            status: DeviceStatus::Pending,
            tags: HashMap::new(),
            capabilities: CapabilityFlags::default(),
            observed: ObservedMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_decommissioned(&self) -> bool {
        self.status == DeviceStatus::Decommissioned
    }
}

/// Partial update applied through `DeviceRegistry::update`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevicePatch {
    pub name: Option<String>,
    pub endpoint: Option<Endpoint>,
    pub tags: Option<HashMap<String, String>>,
    pub capabilities: Option<CapabilityFlags>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_closed_set() {
        assert_eq!(Environment::parse("lab"), Some(Environment::Lab));
        assert_eq!(Environment::parse("prod"), Some(Environment::Prod));
        assert_eq!(Environment::parse("production"), None);
        assert_eq!(Environment::parse(""), None);
    }

    #[test]
    fn new_device_defaults() {
        let d = Device::new(
            "r1".into(),
            Endpoint {
                host: "10.0.0.1".into(),
                rest_port: 443,
                ssh_port: 22,
            },
            Environment::Lab,
        );
        assert_eq!(d.status, DeviceStatus::Pending);
        assert!(!d.capabilities.allow_advanced_writes);
        assert!(!d.capabilities.allow_professional_workflows);
        assert!(!d.capabilities.allow_ssh_commands);
        assert!(d.tags.is_empty());
    }

    #[test]
    fn decommissioned_is_terminal() {
        assert!(!DeviceStatus::Decommissioned.can_transition_to(DeviceStatus::Healthy));
        assert!(DeviceStatus::Healthy.can_transition_to(DeviceStatus::Degraded));
        assert!(DeviceStatus::Unreachable.can_transition_to(DeviceStatus::Healthy));
    }

    #[test]
    fn endpoint_port_defaults() {
        let ep: Endpoint = serde_json::from_str(r#"{"host":"10.0.0.1"}"#).unwrap();
        assert_eq!(ep.rest_port, 443);
        assert_eq!(ep.ssh_port, 22);
    }
}
