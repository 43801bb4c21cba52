//! DeviceRegistry — persisted device metadata with tag-based lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use fg_domain::device::{
    CapabilityFlags, Device, DevicePatch, DeviceStatus, Endpoint, Environment, ObservedMetadata,
};
use fg_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Query
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Filters for `query`. Tag matches are exact key+value; no globbing.
#[derive(Debug, Clone, Default)]
pub struct DeviceQuery {
    pub environment: Option<Environment>,
    pub tag: Option<(String, String)>,
    pub status: Option<DeviceStatus>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DeviceRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DeviceRegistry {
    inner: RwLock<HashMap<Uuid, Device>>,
    persist_path: PathBuf,
}

impl DeviceRegistry {
    pub fn new(state_dir: &Path) -> Self {
        let persist_path = state_dir.join("devices.json");
        let mut registry = Self {
            inner: RwLock::new(HashMap::new()),
            persist_path,
        };
        registry.load();
        registry
    }

    fn load(&mut self) {
        if let Ok(data) = std::fs::read_to_string(&self.persist_path) {
            if let Ok(devices) = serde_json::from_str::<Vec<Device>>(&data) {
                let mut map = HashMap::new();
                for d in devices {
                    map.insert(d.id, d);
                }
                let count = map.len();
                self.inner = RwLock::new(map);
                tracing::info!(count, "loaded devices from disk");
            }
        }
    }

    async fn persist(&self) {
        let map = self.inner.read().await;
        let devices: Vec<&Device> = map.values().collect();
        if let Ok(json) = serde_json::to_string_pretty(&devices) {
            let path = self.persist_path.clone();
            drop(map);
            let _ = tokio::task::spawn_blocking(move || {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::warn!(error = %e, "failed to persist devices");
                }
            })
            .await;
        }
    }

    /// Register a new device. Names are unique fleet-wide; the environment
    /// string must be in the closed set.
    pub async fn register(
        &self,
        name: String,
        endpoint: Endpoint,
        environment: &str,
        capabilities: CapabilityFlags,
        tags: HashMap<String, String>,
    ) -> Result<Device> {
        let environment =
            Environment::parse(environment).ok_or_else(|| Error::InvalidEnvironment(environment.to_string()))?;

        let mut map = self.inner.write().await;
        if map.values().any(|d| d.name == name) {
            return Err(Error::NameConflict(name));
        }

        let mut device = Device::new(name, endpoint, environment);
        device.capabilities = capabilities;
        device.tags = tags;
        map.insert(device.id, device.clone());
        drop(map);

        self.persist().await;
        Ok(device)
    }

    pub async fn lookup(&self, id: Uuid) -> Result<Device> {
        self.inner
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))
    }

    pub async fn lookup_by_name(&self, name: &str) -> Result<Device> {
        self.inner
            .read()
            .await
            .values()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(name.to_string()))
    }

    pub async fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.inner.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    pub async fn query(&self, filter: &DeviceQuery) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .inner
            .read()
            .await
            .values()
            .filter(|d| {
                filter.environment.map_or(true, |env| d.environment == env)
                    && filter.status.map_or(true, |s| d.status == s)
                    && filter
                        .tag
                        .as_ref()
                        .map_or(true, |(k, v)| d.tags.get(k) == Some(v))
            })
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    /// Apply a partial update. Renames re-check name uniqueness.
    pub async fn update(&self, id: Uuid, patch: DevicePatch) -> Result<Device> {
        let mut map = self.inner.write().await;
        if let Some(new_name) = patch.name.as_ref() {
            if map.values().any(|d| d.id != id && &d.name == new_name) {
                return Err(Error::NameConflict(new_name.clone()));
            }
        }
        let device = map
            .get_mut(&id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;

        if let Some(name) = patch.name {
            device.name = name;
        }
        if let Some(endpoint) = patch.endpoint {
            device.endpoint = endpoint;
        }
        if let Some(tags) = patch.tags {
            device.tags = tags;
        }
        if let Some(capabilities) = patch.capabilities {
            device.capabilities = capabilities;
        }
        device.updated_at = Utc::now();
        let updated = device.clone();
        drop(map);

        self.persist().await;
        Ok(updated)
    }

    /// Transition device status following the lifecycle rules.
    pub async fn set_status(&self, id: Uuid, status: DeviceStatus) -> Result<Device> {
        let mut map = self.inner.write().await;
        let device = map
            .get_mut(&id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        if device.status != status {
            if !device.status.can_transition_to(status) {
                return Err(Error::InvalidRequest(format!(
                    "device {} cannot move from {:?} to {status:?}",
                    device.name, device.status
                )));
            }
            device.status = status;
            device.updated_at = Utc::now();
        }
        let updated = device.clone();
        drop(map);

        self.persist().await;
        Ok(updated)
    }

    /// Store metadata observed from the device (version, identity, board).
    pub async fn record_observation(&self, id: Uuid, observed: ObservedMetadata) -> Result<()> {
        let mut map = self.inner.write().await;
        let device = map
            .get_mut(&id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        device.observed = observed;
        device.updated_at = Utc::now();
        drop(map);

        self.persist().await;
        Ok(())
    }

    /// Mark a device decommissioned. Credentials are deactivated by the
    /// caller (the vault); audit events are retained by design.
    pub async fn decommission(&self, id: Uuid) -> Result<Device> {
        self.set_status(id, DeviceStatus::Decommissioned).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "10.0.0.1".into(),
            rest_port: 443,
            ssh_port: 22,
        }
    }

    async fn registry() -> (DeviceRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (DeviceRegistry::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let (registry, _dir) = registry().await;
        let device = registry
            .register("r1".into(), endpoint(), "lab", CapabilityFlags::default(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(device.status, DeviceStatus::Pending);

        let found = registry.lookup(device.id).await.unwrap();
        assert_eq!(found.name, "r1");
        let by_name = registry.lookup_by_name("r1").await.unwrap();
        assert_eq!(by_name.id, device.id);
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let (registry, _dir) = registry().await;
        registry
            .register("r1".into(), endpoint(), "lab", CapabilityFlags::default(), HashMap::new())
            .await
            .unwrap();
        let err = registry
            .register("r1".into(), endpoint(), "lab", CapabilityFlags::default(), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NameConflict(_)));
    }

    #[tokio::test]
    async fn invalid_environment_rejected() {
        let (registry, _dir) = registry().await;
        let err = registry
            .register("r1".into(), endpoint(), "production", CapabilityFlags::default(), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEnvironment(_)));
    }

    #[tokio::test]
    async fn query_filters_compose() {
        let (registry, _dir) = registry().await;
        let mut tags = HashMap::new();
        tags.insert("site".to_string(), "fra1".to_string());
        registry
            .register("r1".into(), endpoint(), "lab", CapabilityFlags::default(), tags)
            .await
            .unwrap();
        registry
            .register("r2".into(), endpoint(), "prod", CapabilityFlags::default(), HashMap::new())
            .await
            .unwrap();

        let labs = registry
            .query(&DeviceQuery {
                environment: Some(Environment::Lab),
                ..Default::default()
            })
            .await;
        assert_eq!(labs.len(), 1);
        assert_eq!(labs[0].name, "r1");

        let tagged = registry
            .query(&DeviceQuery {
                tag: Some(("site".into(), "fra1".into())),
                ..Default::default()
            })
            .await;
        assert_eq!(tagged.len(), 1);

        // Exact match only — no globbing.
        let miss = registry
            .query(&DeviceQuery {
                tag: Some(("site".into(), "fra".into())),
                ..Default::default()
            })
            .await;
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn rename_conflict_rejected() {
        let (registry, _dir) = registry().await;
        registry
            .register("r1".into(), endpoint(), "lab", CapabilityFlags::default(), HashMap::new())
            .await
            .unwrap();
        let r2 = registry
            .register("r2".into(), endpoint(), "lab", CapabilityFlags::default(), HashMap::new())
            .await
            .unwrap();

        let err = registry
            .update(
                r2.id,
                DevicePatch {
                    name: Some("r1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NameConflict(_)));
    }

    #[tokio::test]
    async fn decommission_is_terminal() {
        let (registry, _dir) = registry().await;
        let device = registry
            .register("r1".into(), endpoint(), "lab", CapabilityFlags::default(), HashMap::new())
            .await
            .unwrap();
        registry.decommission(device.id).await.unwrap();

        let err = registry
            .set_status(device.id, DeviceStatus::Healthy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let registry = DeviceRegistry::new(dir.path());
            let device = registry
                .register("r1".into(), endpoint(), "staging", CapabilityFlags::default(), HashMap::new())
                .await
                .unwrap();
            // persist() runs in-line with register, nothing else to flush.
            device.id
        };

        let reloaded = DeviceRegistry::new(dir.path());
        let device = reloaded.lookup(id).await.unwrap();
        assert_eq!(device.name, "r1");
        assert_eq!(device.environment, Environment::Staging);
    }
}
