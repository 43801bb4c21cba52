//! Encrypted per-device credentials.
//!
//! Rows store ciphertext only. Plaintext exists transiently in memory during
//! a RouterOS call and is never persisted, logged, or returned to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which transport a credential authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Rest,
    Ssh,
}

impl CredentialKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialKind::Rest => "rest",
            CredentialKind::Ssh => "ssh",
        }
    }
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored credential row. At most one row per (device, kind) is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub device_id: Uuid,
    pub kind: CredentialKind,
    pub username: String,
    /// Base64-wrapped `nonce || ciphertext` (AES-256-GCM).
    pub ciphertext: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<DateTime<Utc>>,
}

/// Decrypted credential material handed to the RouterOS client. Deliberately
/// not serializable and redacted from debug output.
pub struct CredentialMaterial {
    pub username: String,
    pub secret: String,
}

impl std::fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trip() {
        let json = serde_json::to_string(&CredentialKind::Ssh).unwrap();
        assert_eq!(json, r#""ssh""#);
        let back: CredentialKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CredentialKind::Ssh);
    }

    #[test]
    fn material_debug_redacts_secret() {
        let m = CredentialMaterial {
            username: "admin".into(),
            secret: "hunter2".into(),
        };
        let dbg = format!("{m:?}");
        assert!(dbg.contains("admin"));
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<redacted>"));
    }
}
