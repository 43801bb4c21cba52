//! Whitelisted SSH command templates.
//!
//! SSH is the fallback transport only. Each command is a pre-approved
//! template; user-supplied parameters pass through a typed rendering step
//! that rejects shell metacharacters outright.

use fg_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The closed set of commands the service may run over SSH.
#[derive(Debug, Clone, PartialEq)]
pub enum SshCommand {
    SystemResourcePrint,
    SystemIdentityPrint,
    DnsPrint,
    NtpPrint,
    ExportCompact,
    DnsSetServers { servers: Vec<String> },
    IdentitySet { name: String },
    /// Replays a configuration script captured by the snapshot store.
    /// Scripts are system-generated (device exports), never client input.
    ImportScript { script: String },
}

impl SshCommand {
    /// Stable identifier for whitelisting and audit metadata.
    pub fn id(&self) -> &'static str {
        match self {
            SshCommand::SystemResourcePrint => "system_resource_print",
            SshCommand::SystemIdentityPrint => "system_identity_print",
            SshCommand::DnsPrint => "dns_print",
            SshCommand::NtpPrint => "ntp_print",
            SshCommand::ExportCompact => "export_compact",
            SshCommand::DnsSetServers { .. } => "dns_set_servers",
            SshCommand::IdentitySet { .. } => "identity_set",
            SshCommand::ImportScript { .. } => "import_script",
        }
    }

    /// Render into the RouterOS CLI line(s) to execute. Fails with
    /// `UnsafeOperation` when a parameter contains shell metacharacters.
    pub fn render(&self) -> Result<String> {
        let line = match self {
            SshCommand::SystemResourcePrint => "/system/resource/print".to_string(),
            SshCommand::SystemIdentityPrint => "/system/identity/print".to_string(),
            SshCommand::DnsPrint => "/ip/dns/print".to_string(),
            SshCommand::NtpPrint => "/system/ntp/client/print".to_string(),
            SshCommand::ExportCompact => "/export compact".to_string(),
            SshCommand::DnsSetServers { servers } => {
                for s in servers {
                    check_param(s)?;
                }
                format!("/ip/dns/set servers={}", servers.join(","))
            }
            SshCommand::IdentitySet { name } => {
                check_param(name)?;
                format!("/system/identity/set name=\"{name}\"")
            }
            // Scripts are replayed verbatim; they were produced by
            // `/export` on the device itself.
            SshCommand::ImportScript { script } => script.clone(),
        };
        Ok(line)
    }
}

/// Reject anything that could escape the command template. RouterOS values
/// never legitimately contain these.
fn check_param(value: &str) -> Result<()> {
    const FORBIDDEN: &[char] = &[
        ';', '|', '&', '$', '`', '\\', '\n', '\r', '"', '\'', '<', '>', '(', ')',
    ];
    if value.is_empty() {
        return Err(Error::UnsafeOperation("empty ssh parameter".into()));
    }
    if let Some(c) = value.chars().find(|c| FORBIDDEN.contains(c)) {
        return Err(Error::UnsafeOperation(format!(
            "ssh parameter contains forbidden character {c:?}"
        )));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Print-output parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse RouterOS `print` output (`key: value` per line) into a JSON object.
/// Percent signs and unit suffixes are left to the caller.
pub fn parse_print_output(output: &str) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for line in output.lines() {
        let line = line.trim();
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if key.is_empty() || key.contains(' ') {
                continue; // table headers and flag lines
            }
            map.insert(
                key.to_string(),
                serde_json::Value::String(value.trim().to_string()),
            );
        }
    }
    serde_json::Value::Object(map)
}
