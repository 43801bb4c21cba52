//! The tool catalog: every named operation, its tier, schema, and flags.
//!
//! Specs are built once at startup and looked up by name at dispatch time.
//! Handlers live in `handlers.rs`; this file is only the surface description
//! plus the role model for the authorization cascade.

use std::collections::HashMap;

use serde_json::json;

use fg_domain::tool::{ToolSpec, ToolTier};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identity & roles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Role granted by the (external) identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "viewer" => Some(Role::Viewer),
            "operator" => Some(Role::Operator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn permits(self, tier: ToolTier) -> bool {
        match self {
            Role::Viewer => tier == ToolTier::Fundamental,
            Role::Operator => tier <= ToolTier::Advanced,
            Role::Admin => true,
        }
    }
}

/// Authenticated caller, as injected by the transport layer. Token
/// verification itself is an external collaborator.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub role: Role,
}

impl Identity {
    pub fn new(subject: impl Into<String>, role: Role) -> Self {
        Self {
            subject: subject.into(),
            role,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolRegistry {
    specs: HashMap<String, ToolSpec>,
    ordered: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            specs: HashMap::new(),
            ordered: Vec::new(),
        };
        for spec in build_tool_specs() {
            registry.ordered.push(spec.name.clone());
            registry.specs.insert(spec.name.clone(), spec);
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.get(name)
    }

    pub fn list(&self) -> Vec<&ToolSpec> {
        self.ordered
            .iter()
            .filter_map(|name| self.specs.get(name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Schema fragments ─────────────────────────────────────────────────

fn device_arg() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "device": { "type": "string", "description": "Device name or id" }
        },
        "required": ["device"]
    })
}

fn device_write_arg(extra: serde_json::Value, required: &[&str]) -> serde_json::Value {
    let mut properties = json!({
        "device": { "type": "string", "description": "Device name or id" },
        "dry_run": { "type": "boolean", "description": "Preview the change without mutating" }
    });
    if let (Some(base), Some(extra)) = (properties.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    let mut req = vec!["device"];
    req.extend_from_slice(required);
    json!({ "type": "object", "properties": properties, "required": req })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn build_tool_specs() -> Vec<ToolSpec> {
    let servers_prop = json!({
        "servers": {
            "type": "array",
            "items": { "type": "string" },
            "description": "IP addresses, in priority order"
        }
    });

    vec![
        // ── Fundamental (read-only) ───────────────────────────────────
        ToolSpec::read("device_list", "fleet", "List registered devices with status and tags.")
            .with_input_schema(json!({
                "type": "object",
                "properties": {
                    "environment": { "type": "string", "description": "lab | staging | prod" },
                    "status": { "type": "string" },
                    "tag_key": { "type": "string" },
                    "tag_value": { "type": "string" }
                }
            }))
            .with_cache_ttl(Some(30)),
        ToolSpec::read("device_health", "health", "Probe a device now and return recent health history.")
            .with_input_schema(device_arg())
            .with_cache_ttl(None),
        ToolSpec::read(
            "connectivity_check",
            "health",
            "Check reachability over REST with SSH fallback; classifies failures with remediation hints.",
        )
        .with_input_schema(device_arg())
        .with_cache_ttl(None),
        ToolSpec::read("system_resource", "system", "Read CPU, memory, uptime and board info.")
            .with_input_schema(device_arg())
            .with_cache_ttl(Some(60)),
        ToolSpec::read("dns_get", "dns", "Read configured DNS servers.")
            .with_input_schema(device_arg()),
        ToolSpec::read("ntp_get", "ntp", "Read configured NTP servers.")
            .with_input_schema(device_arg()),
        ToolSpec::read("interface_list", "interface", "List interfaces.")
            .with_input_schema(device_arg()),
        ToolSpec::read("ip_address_list", "ip_address", "List IP addresses per interface.")
            .with_input_schema(device_arg()),
        ToolSpec::read("config_export", "system", "Export the device configuration script.")
            .with_input_schema(device_arg())
            .with_cache_ttl(None)
            .with_timeout(120)
            .sensitive(),
        ToolSpec::read("plan_get", "plan", "Fetch a plan with its per-device changes.")
            .with_input_schema(json!({
                "type": "object",
                "properties": { "plan_id": { "type": "string" } },
                "required": ["plan_id"]
            }))
            .with_cache_ttl(None),
        ToolSpec::read("plan_list", "plan", "List plans pending approval.")
            .with_cache_ttl(None),

        // ── Advanced (single-device writes & plan management) ─────────
        ToolSpec::write(
            "dns_set_servers",
            "dns",
            ToolTier::Advanced,
            "Set DNS servers on one device, bracketed by snapshots and health checks.",
        )
        .with_input_schema(device_write_arg(servers_prop.clone(), &["servers"])),
        ToolSpec::write(
            "ntp_set_servers",
            "ntp",
            ToolTier::Advanced,
            "Set NTP servers on one device.",
        )
        .with_input_schema(device_write_arg(servers_prop.clone(), &["servers"])),
        ToolSpec::write(
            "identity_set",
            "identity",
            ToolTier::Advanced,
            "Set the system identity (device display name).",
        )
        .with_input_schema(device_write_arg(
            json!({ "name": { "type": "string" } }),
            &["name"],
        )),
        ToolSpec::write(
            "ip_add_secondary_address",
            "ip_address",
            ToolTier::Advanced,
            "Add a secondary IP address to an interface after overlap and management-IP pre-checks.",
        )
        .with_input_schema(device_write_arg(
            json!({
                "address": { "type": "string", "description": "CIDR, e.g. 10.2.0.1/24" },
                "interface": { "type": "string" }
            }),
            &["address", "interface"],
        )),
        ToolSpec::write(
            "address_list_add",
            "address_list",
            ToolTier::Advanced,
            "Add an entry to a firewall address list.",
        )
        .with_input_schema(device_write_arg(
            json!({
                "list": { "type": "string" },
                "address": { "type": "string" }
            }),
            &["list", "address"],
        )),
        ToolSpec::write(
            "plan_approve",
            "plan",
            ToolTier::Advanced,
            "Approve a pending plan; returns a short-lived approval token.",
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": { "plan_id": { "type": "string" } },
            "required": ["plan_id"]
        })),
        ToolSpec::write(
            "plan_apply",
            "plan",
            ToolTier::Advanced,
            "Apply an approved plan, presenting its approval token.",
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": {
                "plan_id": { "type": "string" },
                "approval_token": { "type": "string" }
            },
            "required": ["plan_id", "approval_token"]
        }))
        .with_timeout(900),
        ToolSpec::write("plan_cancel", "plan", ToolTier::Advanced, "Cancel a plan.")
            .with_input_schema(json!({
                "type": "object",
                "properties": { "plan_id": { "type": "string" } },
                "required": ["plan_id"]
            })),
        ToolSpec::write(
            "device_register",
            "fleet",
            ToolTier::Advanced,
            "Register a RouterOS device in the fleet.",
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "host": { "type": "string" },
                "rest_port": { "type": "integer" },
                "ssh_port": { "type": "integer" },
                "environment": { "type": "string" },
                "allow_advanced_writes": { "type": "boolean" },
                "allow_professional_workflows": { "type": "boolean" },
                "allow_ssh_commands": { "type": "boolean" },
                "tags": { "type": "object" }
            },
            "required": ["name", "host", "environment"]
        })),
        ToolSpec::write(
            "device_decommission",
            "fleet",
            ToolTier::Advanced,
            "Decommission a device and deactivate its credentials.",
        )
        .with_input_schema(device_arg()),
        ToolSpec::write(
            "credential_store",
            "fleet",
            ToolTier::Advanced,
            "Store or rotate an encrypted device credential.",
        )
        .with_input_schema(device_write_arg(
            json!({
                "kind": { "type": "string", "description": "rest | ssh" },
                "username": { "type": "string" },
                "password": { "type": "string" }
            }),
            &["kind", "username", "password"],
        ))
        .sensitive(),

        // ── Professional (multi-device / high-risk) ───────────────────
        ToolSpec::write(
            "dns_ntp_rollout",
            "dns",
            ToolTier::Professional,
            "Plan a DNS/NTP rollout across multiple devices; returns a plan for approval.",
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": {
                "devices": { "type": "array", "items": { "type": "string" } },
                "dns_servers": { "type": "array", "items": { "type": "string" } },
                "ntp_servers": { "type": "array", "items": { "type": "string" } },
                "parallel": { "type": "boolean", "description": "Apply devices in parallel (requires independent changes)" },
                "dry_run": { "type": "boolean" }
            },
            "required": ["devices"]
        }))
        .with_timeout(900),
        ToolSpec::write(
            "config_backup",
            "system",
            ToolTier::Professional,
            "Capture full configuration snapshots for a set of devices.",
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": {
                "devices": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["devices"]
        }))
        .with_timeout(900),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_are_unique() {
        let registry = ToolRegistry::new();
        assert_eq!(registry.len(), build_tool_specs().len());
        assert!(!registry.is_empty());
    }

    #[test]
    fn tiers_are_consistent_with_side_effects() {
        for spec in ToolRegistry::new().list() {
            if spec.tier == ToolTier::Fundamental {
                assert!(!spec.side_effect, "{} is fundamental but side-effecting", spec.name);
            } else {
                assert!(spec.side_effect, "{} is write-tier but pure", spec.name);
            }
        }
    }

    #[test]
    fn write_tools_are_uncacheable() {
        for spec in ToolRegistry::new().list() {
            if spec.side_effect {
                assert_eq!(spec.cache_ttl_secs, None, "{}", spec.name);
            }
        }
    }

    #[test]
    fn sensitive_tools_marked() {
        let registry = ToolRegistry::new();
        assert!(registry.get("config_export").unwrap().read_sensitive);
        assert!(registry.get("credential_store").unwrap().read_sensitive);
        assert!(!registry.get("dns_get").unwrap().read_sensitive);
    }

    #[test]
    fn role_gates() {
        assert!(Role::Viewer.permits(ToolTier::Fundamental));
        assert!(!Role::Viewer.permits(ToolTier::Advanced));
        assert!(Role::Operator.permits(ToolTier::Advanced));
        assert!(!Role::Operator.permits(ToolTier::Professional));
        assert!(Role::Admin.permits(ToolTier::Professional));
    }

    #[test]
    fn lookup_unknown_tool_is_none() {
        assert!(ToolRegistry::new().get("bogus_tool").is_none());
    }
}
