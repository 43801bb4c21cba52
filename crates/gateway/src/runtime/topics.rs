//! Per-topic planning logic: current-state reads, desired-state rendering,
//! diffing, and pre-checks.
//!
//! Each write tool maps to one topic. The plan service fetches the current
//! value with `read_op`, diffs it against the desired value, and runs the
//! topic's pre-checks before a change record is admitted into a plan.

use serde_json::{json, Value};

use fg_domain::device::Device;
use fg_domain::plan::{Change, RiskLevel};
use fg_domain::{Error, Result};
use fg_routeros::RosOp;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Topics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Dns,
    Ntp,
    Identity,
    IpAddress,
    AddressList,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Dns => "dns",
            Topic::Ntp => "ntp",
            Topic::Identity => "identity",
            Topic::IpAddress => "ip_address",
            Topic::AddressList => "address_list",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dns" => Some(Topic::Dns),
            "ntp" => Some(Topic::Ntp),
            "identity" => Some(Topic::Identity),
            "ip_address" => Some(Topic::IpAddress),
            "address_list" => Some(Topic::AddressList),
            _ => None,
        }
    }

    /// The read that observes this topic's current state.
    pub fn read_op(self) -> RosOp {
        match self {
            Topic::Dns => RosOp::DnsGet,
            Topic::Ntp => RosOp::NtpGet,
            Topic::Identity => RosOp::SystemIdentity,
            Topic::IpAddress => RosOp::IpAddressList,
            Topic::AddressList => RosOp::FirewallAddressList,
        }
    }

    /// Inherent risk of a single-device change on this topic.
    pub fn risk(self) -> RiskLevel {
        match self {
            Topic::Identity => RiskLevel::Low,
            Topic::Dns | Topic::Ntp | Topic::IpAddress | Topic::AddressList => RiskLevel::Medium,
        }
    }
}

/// What a write tool asks the planner to do on one topic.
#[derive(Debug, Clone)]
pub struct ChangeSpec {
    pub topic: Topic,
    pub params: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Desired state & diffing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract the topic-relevant slice of a raw device read.
pub fn current_value(topic: Topic, raw: &Value) -> Value {
    match topic {
        Topic::Dns | Topic::Ntp => {
            let servers = raw
                .get("servers")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let list: Vec<&str> = servers.split(',').filter(|s| !s.is_empty()).collect();
            json!({ "servers": list })
        }
        Topic::Identity => json!({ "name": raw.get("name").and_then(Value::as_str).unwrap_or_default() }),
        Topic::IpAddress => {
            let addresses: Vec<Value> = raw
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .map(|row| {
                            json!({
                                "address": row.get("address").and_then(Value::as_str).unwrap_or_default(),
                                "interface": row.get("interface").and_then(Value::as_str).unwrap_or_default(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            json!({ "addresses": addresses })
        }
        Topic::AddressList => {
            let entries: Vec<Value> = raw
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .map(|row| {
                            json!({
                                "list": row.get("list").and_then(Value::as_str).unwrap_or_default(),
                                "address": row.get("address").and_then(Value::as_str).unwrap_or_default(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            json!({ "entries": entries })
        }
    }
}

/// Render the desired value from tool parameters.
pub fn desired_value(topic: Topic, params: &Value) -> Result<Value> {
    match topic {
        Topic::Dns | Topic::Ntp => {
            let servers = string_list(params, "servers")?;
            if servers.is_empty() {
                return Err(Error::InvalidParams("servers must be non-empty".into()));
            }
            for s in &servers {
                if s.parse::<std::net::IpAddr>().is_err() {
                    return Err(Error::InvalidParams(format!("not an IP address: {s}")));
                }
            }
            Ok(json!({ "servers": servers }))
        }
        Topic::Identity => {
            let name = string_field(params, "name")?;
            if name.is_empty() || name.len() > 64 {
                return Err(Error::InvalidParams("identity must be 1-64 characters".into()));
            }
            Ok(json!({ "name": name }))
        }
        Topic::IpAddress => {
            let address = string_field(params, "address")?;
            parse_cidr(&address).ok_or_else(|| {
                Error::InvalidParams(format!("not a CIDR address: {address}"))
            })?;
            let interface = string_field(params, "interface")?;
            Ok(json!({ "address": address, "interface": interface }))
        }
        Topic::AddressList => {
            let list = string_field(params, "list")?;
            let address = string_field(params, "address")?;
            Ok(json!({ "list": list, "address": address }))
        }
    }
}

/// Diff desired against current. `None` means the device already matches.
pub fn diff(topic: Topic, current: &Value, desired: &Value) -> Option<Change> {
    let matches = match topic {
        Topic::Dns | Topic::Ntp | Topic::Identity => current == desired,
        Topic::IpAddress => current
            .get("addresses")
            .and_then(Value::as_array)
            .is_some_and(|rows| {
                rows.iter().any(|row| {
                    row.get("address") == desired.get("address")
                        && row.get("interface") == desired.get("interface")
                })
            }),
        Topic::AddressList => current
            .get("entries")
            .and_then(Value::as_array)
            .is_some_and(|rows| {
                rows.iter().any(|row| {
                    row.get("list") == desired.get("list")
                        && row.get("address") == desired.get("address")
                })
            }),
    };

    if matches {
        return None;
    }
    Some(Change {
        topic: topic.as_str().to_string(),
        operation: operation_name(topic).to_string(),
        current_value: current.clone(),
        desired_value: desired.clone(),
        estimated_impact: Some(estimated_impact(topic).to_string()),
        pre_check_result: None,
    })
}

fn operation_name(topic: Topic) -> &'static str {
    match topic {
        Topic::Dns => "set_servers",
        Topic::Ntp => "set_servers",
        Topic::Identity => "set_name",
        Topic::IpAddress => "add_secondary_address",
        Topic::AddressList => "add_entry",
    }
}

fn estimated_impact(topic: Topic) -> &'static str {
    match topic {
        Topic::Dns => "name resolution switches to the new servers on cache expiry",
        Topic::Ntp => "clock sync re-converges against the new servers",
        Topic::Identity => "cosmetic; affects logs and neighbor discovery only",
        Topic::IpAddress => "new subnet becomes locally reachable on the interface",
        Topic::AddressList => "firewall rules referencing the list see the new entry",
    }
}

/// The write operation that realizes a change.
pub fn apply_op(topic: Topic, desired: &Value) -> Result<RosOp> {
    match topic {
        Topic::Dns => Ok(RosOp::DnsSetServers {
            servers: string_list(desired, "servers")?,
        }),
        Topic::Ntp => Ok(RosOp::NtpSetServers {
            servers: string_list(desired, "servers")?,
        }),
        Topic::Identity => Ok(RosOp::IdentitySet {
            name: string_field(desired, "name")?,
        }),
        Topic::IpAddress => Ok(RosOp::IpAddressAdd {
            address: string_field(desired, "address")?,
            interface: string_field(desired, "interface")?,
            comment: None,
        }),
        Topic::AddressList => Ok(RosOp::AddressListAdd {
            list: string_field(desired, "list")?,
            address: string_field(desired, "address")?,
            comment: None,
        }),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pre-checks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Auxiliary reads pre-checks may need (fetched once per device).
#[derive(Debug, Default)]
pub struct PreCheckContext {
    /// Interface names present on the device.
    pub interfaces: Vec<String>,
    /// Existing `address` values from /ip/address.
    pub addresses: Vec<String>,
}

/// Run the topic's pre-checks. Ok(description) annotates the change record;
/// Err aborts plan creation.
pub fn pre_check(
    topic: Topic,
    device: &Device,
    desired: &Value,
    context: &PreCheckContext,
) -> Result<String> {
    match topic {
        Topic::Dns | Topic::Ntp | Topic::Identity | Topic::AddressList => {
            Ok("validated".to_string())
        }
        Topic::IpAddress => {
            let address = string_field(desired, "address")?;
            let interface = string_field(desired, "interface")?;

            if !context.interfaces.iter().any(|i| i == &interface) {
                return Err(Error::UnsafeOperation(format!(
                    "interface {interface} does not exist on {}",
                    device.name
                )));
            }

            let (new_net, new_len) = parse_cidr(&address)
                .ok_or_else(|| Error::InvalidParams(format!("not a CIDR address: {address}")))?;

            for existing in &context.addresses {
                if let Some((net, len)) = parse_cidr(existing) {
                    if subnets_overlap(new_net, new_len, net, len) {
                        return Err(Error::UnsafeOperation(format!(
                            "{address} overlaps existing {existing} on {}",
                            device.name
                        )));
                    }
                }
            }

            if let Ok(mgmt) = device.endpoint.host.parse::<std::net::Ipv4Addr>() {
                if in_subnet(u32::from(mgmt), new_net, new_len) {
                    return Err(Error::UnsafeOperation(format!(
                        "{address} contains the management IP {}",
                        device.endpoint.host
                    )));
                }
            }

            Ok(format!("interface {interface} exists, no subnet overlap"))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn string_field(value: &Value, key: &str) -> Result<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidParams(format!("missing string field '{key}'")))
}

fn string_list(value: &Value, key: &str) -> Result<Vec<String>> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| Error::InvalidParams(format!("missing array field '{key}'")))
}

/// Parse "a.b.c.d/len" into (network address, prefix length).
pub fn parse_cidr(raw: &str) -> Option<(u32, u8)> {
    let (addr, len) = raw.split_once('/')?;
    let addr: std::net::Ipv4Addr = addr.parse().ok()?;
    let len: u8 = len.parse().ok()?;
    if len > 32 {
        return None;
    }
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    Some((u32::from(addr) & mask, len))
}

fn in_subnet(ip: u32, network: u32, len: u8) -> bool {
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    (ip & mask) == network
}

fn subnets_overlap(net_a: u32, len_a: u8, net_b: u32, len_b: u8) -> bool {
    let len = len_a.min(len_b);
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    (net_a & mask) == (net_b & mask)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use fg_domain::device::{Endpoint, Environment};

    fn device() -> Device {
        Device::new(
            "r1".into(),
            Endpoint {
                host: "192.168.88.1".into(),
                rest_port: 443,
                ssh_port: 22,
            },
            Environment::Lab,
        )
    }

    #[test]
    fn dns_current_normalizes_to_list() {
        let raw = json!({ "servers": "8.8.8.8,8.8.4.4" });
        let current = current_value(Topic::Dns, &raw);
        assert_eq!(current["servers"], json!(["8.8.8.8", "8.8.4.4"]));
    }

    #[test]
    fn dns_diff_detects_change_and_no_change() {
        let current = json!({ "servers": ["8.8.8.8", "8.8.4.4"] });
        let desired = desired_value(Topic::Dns, &json!({ "servers": ["1.1.1.1", "1.0.0.1"] })).unwrap();
        assert!(diff(Topic::Dns, &current, &desired).is_some());
        assert!(diff(Topic::Dns, &desired.clone(), &desired).is_none());
    }

    #[test]
    fn dns_rejects_non_ip() {
        let err = desired_value(Topic::Dns, &json!({ "servers": ["not-an-ip"] })).unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[test]
    fn ip_address_diff_only_when_absent() {
        let current = json!({ "addresses": [
            { "address": "10.1.0.1/24", "interface": "ether2" }
        ]});
        let present =
            desired_value(Topic::IpAddress, &json!({ "address": "10.1.0.1/24", "interface": "ether2" }))
                .unwrap();
        assert!(diff(Topic::IpAddress, &current, &present).is_none());

        let absent =
            desired_value(Topic::IpAddress, &json!({ "address": "10.2.0.1/24", "interface": "ether2" }))
                .unwrap();
        assert!(diff(Topic::IpAddress, &current, &absent).is_some());
    }

    #[test]
    fn precheck_rejects_missing_interface() {
        let desired = json!({ "address": "10.2.0.1/24", "interface": "ether9" });
        let context = PreCheckContext {
            interfaces: vec!["ether1".into(), "ether2".into()],
            addresses: vec![],
        };
        let err = pre_check(Topic::IpAddress, &device(), &desired, &context).unwrap_err();
        assert!(matches!(err, Error::UnsafeOperation(_)));
    }

    #[test]
    fn precheck_rejects_overlapping_subnet() {
        let desired = json!({ "address": "10.1.0.200/24", "interface": "ether2" });
        let context = PreCheckContext {
            interfaces: vec!["ether2".into()],
            addresses: vec!["10.1.0.1/24".into()],
        };
        let err = pre_check(Topic::IpAddress, &device(), &desired, &context).unwrap_err();
        assert!(matches!(err, Error::UnsafeOperation(_)));
    }

    #[test]
    fn precheck_rejects_management_subnet() {
        let desired = json!({ "address": "192.168.88.0/24", "interface": "ether2" });
        let context = PreCheckContext {
            interfaces: vec!["ether2".into()],
            addresses: vec![],
        };
        let err = pre_check(Topic::IpAddress, &device(), &desired, &context).unwrap_err();
        assert!(matches!(err, Error::UnsafeOperation(_)));
    }

    #[test]
    fn precheck_accepts_clean_secondary() {
        let desired = json!({ "address": "10.2.0.1/24", "interface": "ether2" });
        let context = PreCheckContext {
            interfaces: vec!["ether2".into()],
            addresses: vec!["10.1.0.1/24".into()],
        };
        let result = pre_check(Topic::IpAddress, &device(), &desired, &context).unwrap();
        assert!(result.contains("ether2"));
    }

    #[test]
    fn cidr_parsing() {
        assert_eq!(parse_cidr("10.0.0.5/24"), Some((0x0A000000, 24)));
        assert!(parse_cidr("10.0.0.5").is_none());
        assert!(parse_cidr("10.0.0.5/33").is_none());
        assert!(parse_cidr("bogus/24").is_none());
    }

    #[test]
    fn overlap_rules() {
        let (a, al) = parse_cidr("10.1.0.0/24").unwrap();
        let (b, bl) = parse_cidr("10.1.0.128/25").unwrap();
        assert!(subnets_overlap(a, al, b, bl));

        let (c, cl) = parse_cidr("10.2.0.0/24").unwrap();
        assert!(!subnets_overlap(a, al, c, cl));
    }

    #[test]
    fn identity_risk_is_low_others_medium() {
        assert_eq!(Topic::Identity.risk(), RiskLevel::Low);
        assert_eq!(Topic::Dns.risk(), RiskLevel::Medium);
        assert_eq!(Topic::IpAddress.risk(), RiskLevel::Medium);
    }

    #[test]
    fn apply_op_renders_write() {
        let desired = json!({ "servers": ["1.1.1.1"] });
        let op = apply_op(Topic::Dns, &desired).unwrap();
        assert_eq!(
            op,
            RosOp::DnsSetServers {
                servers: vec!["1.1.1.1".into()]
            }
        );
    }
}
