//! FleetCaller — credentials + client glued together for device operations.
//!
//! Everything that talks to a device (plan service, executor, health
//! scheduler, read tools) goes through here so credential resolution and
//! transport selection happen in exactly one place.

use std::sync::Arc;

use fg_domain::credential::CredentialKind;
use fg_domain::device::Device;
use fg_domain::Result;
use fg_registry::CredentialVault;
use fg_routeros::client::{CallOutcome, CredentialSet};
use fg_routeros::{ProbeReport, RosOp, RouterOsClient};

pub struct FleetCaller {
    vault: Arc<CredentialVault>,
    client: Arc<RouterOsClient>,
}

impl FleetCaller {
    pub fn new(vault: Arc<CredentialVault>, client: Arc<RouterOsClient>) -> Self {
        Self { vault, client }
    }

    /// Resolve whatever credentials exist for the device. Missing kinds stay
    /// `None`; the client surfaces `CredentialNotFound` only when an
    /// operation actually needs the missing side.
    pub async fn credentials(&self, device: &Device) -> CredentialSet {
        let rest = self
            .vault
            .retrieve(device.id, CredentialKind::Rest)
            .await
            .ok();
        // SSH credentials stay available as probe fallback even when
        // command-level ssh is not enabled for the device.
        let ssh = self
            .vault
            .retrieve(device.id, CredentialKind::Ssh)
            .await
            .ok();
        CredentialSet { rest, ssh }
    }

    pub async fn call(&self, device: &Device, op: RosOp) -> Result<CallOutcome> {
        let creds = self.credentials(device).await;
        self.client.call(device, &creds, op).await
    }

    pub async fn probe(&self, device: &Device) -> ProbeReport {
        let creds = self.credentials(device).await;
        self.client.probe(device, &creds).await
    }

    /// Full configuration export, used for snapshots.
    pub async fn export_config(&self, device: &Device) -> Result<String> {
        let outcome = self.call(device, RosOp::ExportCompact).await?;
        Ok(outcome
            .value
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| outcome.value.to_string()))
    }
}
