//! Tool metadata — the registry entry for every named operation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Blast-radius tier of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolTier {
    /// Read-only.
    Fundamental,
    /// Single-device write.
    Advanced,
    /// Multi-device or high-risk workflow.
    Professional,
}

impl ToolTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolTier::Fundamental => "fundamental",
            ToolTier::Advanced => "advanced",
            ToolTier::Professional => "professional",
        }
    }
}

impl std::fmt::Display for ToolTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry entry for a tool. Handlers are registered separately by name in
/// the gateway; this struct is what `tools/list` serializes (minus internals).
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub tier: ToolTier,
    /// Configuration topic ("dns", "ntp", "ip_address", "system", ...).
    pub topic: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub side_effect: bool,
    pub dry_run_supported: bool,
    pub idempotent: bool,
    /// Per-call deadline in seconds.
    pub timeout_secs: u64,
    /// Rough response-size budget for the client's context window.
    pub estimated_tokens: u32,
    /// TTL for the resource cache; `None` means uncacheable.
    pub cache_ttl_secs: Option<u64>,
    /// Credential access / config exports get audited even at the
    /// fundamental tier.
    pub read_sensitive: bool,
}

impl ToolSpec {
    /// A read-only tool with sensible defaults; builder methods refine.
    pub fn read(name: &str, topic: &str, description: &str) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            tier: ToolTier::Fundamental,
            topic: topic.into(),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
            output_schema: serde_json::json!({ "type": "object" }),
            side_effect: false,
            dry_run_supported: false,
            idempotent: true,
            timeout_secs: 30,
            estimated_tokens: 500,
            cache_ttl_secs: Some(300),
            read_sensitive: false,
        }
    }

    /// A write tool: side-effecting, dry-runnable, uncacheable.
    pub fn write(name: &str, topic: &str, tier: ToolTier, description: &str) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            tier,
            topic: topic.into(),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
            output_schema: serde_json::json!({ "type": "object" }),
            side_effect: true,
            dry_run_supported: true,
            idempotent: true,
            timeout_secs: 300,
            estimated_tokens: 800,
            cache_ttl_secs: None,
            read_sensitive: false,
        }
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.read_sensitive = true;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_cache_ttl(mut self, secs: Option<u64>) -> Self {
        self.cache_ttl_secs = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ordering() {
        assert!(ToolTier::Fundamental < ToolTier::Advanced);
        assert!(ToolTier::Advanced < ToolTier::Professional);
    }

    #[test]
    fn read_defaults() {
        let t = ToolSpec::read("dns_get", "dns", "Read DNS servers");
        assert!(!t.side_effect);
        assert!(t.idempotent);
        assert_eq!(t.cache_ttl_secs, Some(300));
        assert_eq!(t.tier, ToolTier::Fundamental);
    }

    #[test]
    fn write_defaults() {
        let t = ToolSpec::write("dns_set_servers", "dns", ToolTier::Advanced, "Set DNS servers");
        assert!(t.side_effect);
        assert!(t.dry_run_supported);
        assert_eq!(t.cache_ttl_secs, None);
    }

    #[test]
    fn sensitive_builder() {
        let t = ToolSpec::read("config_export", "system", "Export config").sensitive();
        assert!(t.read_sensitive);
    }
}
