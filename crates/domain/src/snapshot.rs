//! Configuration snapshots — captured device state for audit and rollback.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    ConfigFull,
    ConfigCompact,
    DnsNtp,
    FirewallRules,
    IpAddresses,
    PreChange,
    PostChange,
    Rollback,
}

/// Where the payload lives: small payloads stay inline in the row, larger
/// ones are externalized to a file and referenced by path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum PayloadRef {
    Inline(String),
    External(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub device_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: SnapshotKind,
    /// What caused the capture (tool name, "scheduled", "rollback", ...).
    pub trigger: String,
    pub payload: PayloadRef,
    pub size_bytes: u64,
    pub compressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&SnapshotKind::PreChange).unwrap();
        assert_eq!(json, r#""pre_change""#);
    }

    #[test]
    fn payload_ref_round_trip() {
        let inline = PayloadRef::Inline("/ip dns set servers=1.1.1.1".into());
        let json = serde_json::to_string(&inline).unwrap();
        let back: PayloadRef = serde_json::from_str(&json).unwrap();
        assert_eq!(inline, back);

        let ext = PayloadRef::External("snapshots/abc.gz".into());
        let json = serde_json::to_string(&ext).unwrap();
        assert!(json.contains("external"));
    }
}
