//! The closed operation catalog and its REST mapping.
//!
//! Every operation the service can perform against a device is a variant
//! here. Paths are fixed template strings; parameters travel in typed JSON
//! bodies, never in the path.

use serde_json::{json, Value};

use crate::ssh::SshCommand;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A typed operation against a RouterOS device.
#[derive(Debug, Clone, PartialEq)]
pub enum RosOp {
    // ── Reads ─────────────────────────────────────────────────────
    SystemResource,
    SystemIdentity,
    SystemRouterboard,
    DnsGet,
    NtpGet,
    InterfaceList,
    IpAddressList,
    FirewallAddressList,
    FirewallRulesList,
    /// Full config export. SSH-only; used for snapshots.
    ExportCompact,

    // ── Writes ────────────────────────────────────────────────────
    DnsSetServers { servers: Vec<String> },
    NtpSetServers { servers: Vec<String> },
    IdentitySet { name: String },
    IpAddressAdd {
        address: String,
        interface: String,
        comment: Option<String>,
    },
    AddressListAdd {
        list: String,
        address: String,
        comment: Option<String>,
    },
    /// Re-import a previously captured configuration script. Payloads come
    /// only from the snapshot store, never from clients. SSH-only.
    ImportScript { script: String },
}

/// A concrete REST request derived from an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: &'static str,
    pub path: &'static str,
    pub body: Option<Value>,
}

impl RosOp {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            RosOp::DnsSetServers { .. }
                | RosOp::NtpSetServers { .. }
                | RosOp::IdentitySet { .. }
                | RosOp::IpAddressAdd { .. }
                | RosOp::AddressListAdd { .. }
                | RosOp::ImportScript { .. }
        )
    }

    /// Short name used in logs, metrics, and audit metadata.
    pub fn name(&self) -> &'static str {
        match self {
            RosOp::SystemResource => "system_resource",
            RosOp::SystemIdentity => "system_identity",
            RosOp::SystemRouterboard => "system_routerboard",
            RosOp::DnsGet => "dns_get",
            RosOp::NtpGet => "ntp_get",
            RosOp::InterfaceList => "interface_list",
            RosOp::IpAddressList => "ip_address_list",
            RosOp::FirewallAddressList => "firewall_address_list",
            RosOp::FirewallRulesList => "firewall_rules_list",
            RosOp::ExportCompact => "export_compact",
            RosOp::DnsSetServers { .. } => "dns_set_servers",
            RosOp::NtpSetServers { .. } => "ntp_set_servers",
            RosOp::IdentitySet { .. } => "identity_set",
            RosOp::IpAddressAdd { .. } => "ip_address_add",
            RosOp::AddressListAdd { .. } => "address_list_add",
            RosOp::ImportScript { .. } => "import_script",
        }
    }

    /// The REST rendering, when the operation has one. `ExportCompact` and
    /// `ImportScript` are SSH-only.
    pub fn rest_request(&self) -> Option<RestRequest> {
        let req = match self {
            RosOp::SystemResource => RestRequest {
                method: "GET",
                path: "/rest/system/resource",
                body: None,
            },
            RosOp::SystemIdentity => RestRequest {
                method: "GET",
                path: "/rest/system/identity",
                body: None,
            },
            RosOp::SystemRouterboard => RestRequest {
                method: "GET",
                path: "/rest/system/routerboard",
                body: None,
            },
            RosOp::DnsGet => RestRequest {
                method: "GET",
                path: "/rest/ip/dns",
                body: None,
            },
            RosOp::NtpGet => RestRequest {
                method: "GET",
                path: "/rest/system/ntp/client",
                body: None,
            },
            RosOp::InterfaceList => RestRequest {
                method: "GET",
                path: "/rest/interface",
                body: None,
            },
            RosOp::IpAddressList => RestRequest {
                method: "GET",
                path: "/rest/ip/address",
                body: None,
            },
            RosOp::FirewallAddressList => RestRequest {
                method: "GET",
                path: "/rest/ip/firewall/address-list",
                body: None,
            },
            RosOp::FirewallRulesList => RestRequest {
                method: "GET",
                path: "/rest/ip/firewall/filter",
                body: None,
            },
            RosOp::DnsSetServers { servers } => RestRequest {
                method: "POST",
                path: "/rest/ip/dns/set",
                body: Some(json!({ "servers": servers.join(",") })),
            },
            RosOp::NtpSetServers { servers } => RestRequest {
                method: "POST",
                path: "/rest/system/ntp/client/set",
                body: Some(json!({ "servers": servers.join(",") })),
            },
            RosOp::IdentitySet { name } => RestRequest {
                method: "POST",
                path: "/rest/system/identity/set",
                body: Some(json!({ "name": name })),
            },
            RosOp::IpAddressAdd {
                address,
                interface,
                comment,
            } => RestRequest {
                method: "PUT",
                path: "/rest/ip/address",
                body: Some(match comment {
                    Some(c) => json!({ "address": address, "interface": interface, "comment": c }),
                    None => json!({ "address": address, "interface": interface }),
                }),
            },
            RosOp::AddressListAdd {
                list,
                address,
                comment,
            } => RestRequest {
                method: "PUT",
                path: "/rest/ip/firewall/address-list",
                body: Some(match comment {
                    Some(c) => json!({ "list": list, "address": address, "comment": c }),
                    None => json!({ "list": list, "address": address }),
                }),
            },
            RosOp::ExportCompact | RosOp::ImportScript { .. } => return None,
        };
        Some(req)
    }

    /// The SSH fallback rendering, when the operation has one.
    pub fn ssh_command(&self) -> Option<SshCommand> {
        let cmd = match self {
            RosOp::SystemResource => SshCommand::SystemResourcePrint,
            RosOp::SystemIdentity => SshCommand::SystemIdentityPrint,
            RosOp::DnsGet => SshCommand::DnsPrint,
            RosOp::NtpGet => SshCommand::NtpPrint,
            RosOp::ExportCompact => SshCommand::ExportCompact,
            RosOp::DnsSetServers { servers } => SshCommand::DnsSetServers {
                servers: servers.clone(),
            },
            RosOp::IdentitySet { name } => SshCommand::IdentitySet { name: name.clone() },
            RosOp::ImportScript { script } => SshCommand::ImportScript {
                script: script.clone(),
            },
            _ => return None,
        };
        Some(cmd)
    }

    /// The read that observes this write's effect, used to compute the
    /// `changed` flag by pre/post diff within one call envelope.
    pub fn read_back(&self) -> Option<RosOp> {
        match self {
            RosOp::DnsSetServers { .. } => Some(RosOp::DnsGet),
            RosOp::NtpSetServers { .. } => Some(RosOp::NtpGet),
            RosOp::IdentitySet { .. } => Some(RosOp::SystemIdentity),
            RosOp::IpAddressAdd { .. } => Some(RosOp::IpAddressList),
            RosOp::AddressListAdd { .. } => Some(RosOp::FirewallAddressList),
            // Imports restore whole sections; there is no single read-back.
            RosOp::ImportScript { .. } => None,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_gets() {
        for op in [
            RosOp::SystemResource,
            RosOp::DnsGet,
            RosOp::InterfaceList,
            RosOp::IpAddressList,
        ] {
            let req = op.rest_request().unwrap();
            assert_eq!(req.method, "GET");
            assert!(req.body.is_none());
            assert!(!op.is_write());
        }
    }

    #[test]
    fn dns_set_joins_servers() {
        let op = RosOp::DnsSetServers {
            servers: vec!["1.1.1.1".into(), "1.0.0.1".into()],
        };
        let req = op.rest_request().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.body.unwrap()["servers"], "1.1.1.1,1.0.0.1");
        assert!(op.is_write());
    }

    #[test]
    fn export_is_ssh_only() {
        assert!(RosOp::ExportCompact.rest_request().is_none());
        assert!(RosOp::ExportCompact.ssh_command().is_some());
    }

    #[test]
    fn import_is_ssh_only() {
        let op = RosOp::ImportScript {
            script: "/ip dns set servers=1.1.1.1".into(),
        };
        assert!(op.rest_request().is_none());
        assert!(op.ssh_command().is_some());
        assert!(op.read_back().is_none());
    }

    #[test]
    fn writes_have_read_back() {
        let op = RosOp::DnsSetServers {
            servers: vec!["1.1.1.1".into()],
        };
        assert_eq!(op.read_back(), Some(RosOp::DnsGet));

        let op = RosOp::IpAddressAdd {
            address: "10.0.0.2/24".into(),
            interface: "ether1".into(),
            comment: None,
        };
        assert_eq!(op.read_back(), Some(RosOp::IpAddressList));
    }

    #[test]
    fn paths_never_contain_parameters() {
        // Parameters ride in bodies; paths are static template strings.
        let op = RosOp::IdentitySet {
            name: "core-router".into(),
        };
        let req = op.rest_request().unwrap();
        assert!(!req.path.contains("core-router"));
    }
}
