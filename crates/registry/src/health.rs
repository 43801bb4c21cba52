//! HealthStore — immutable probe history with per-device retention.
//!
//! Rows append to a JSONL file (like the audit log) and live in bounded
//! per-device rings for queries. Retention keeps the N most recent rows per
//! device plus a time window; pruning trims the in-memory rings, and a
//! cleanup job rewrites the file.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use fg_domain::health::HealthCheck;
use fg_domain::{Error, Result};

pub struct HealthStore {
    path: PathBuf,
    per_device: RwLock<HashMap<Uuid, Vec<HealthCheck>>>,
    keep_per_device: usize,
    write_lock: tokio::sync::Mutex<()>,
}

impl HealthStore {
    pub fn new(state_dir: &Path, keep_per_device: usize) -> Self {
        let path = state_dir.join("health.jsonl");
        let mut per_device: HashMap<Uuid, Vec<HealthCheck>> = HashMap::new();

        if let Ok(data) = std::fs::read_to_string(&path) {
            for line in data.lines() {
                if let Ok(check) = serde_json::from_str::<HealthCheck>(line) {
                    per_device.entry(check.device_id).or_default().push(check);
                }
            }
            for checks in per_device.values_mut() {
                checks.sort_by_key(|c| c.timestamp);
                let excess = checks.len().saturating_sub(keep_per_device);
                checks.drain(..excess);
            }
        }

        Self {
            path,
            per_device: RwLock::new(per_device),
            keep_per_device,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Record one probe result.
    pub async fn record(&self, check: HealthCheck) -> Result<()> {
        let line = serde_json::to_string(&check)?;
        let path = self.path.clone();

        let _guard = self.write_lock.lock().await;
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(file, "{line}")?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("health write task failed: {e}")))??;

        let mut map = self.per_device.write();
        let checks = map.entry(check.device_id).or_default();
        checks.push(check);
        let excess = checks.len().saturating_sub(self.keep_per_device);
        checks.drain(..excess);
        Ok(())
    }

    pub fn latest(&self, device_id: Uuid) -> Option<HealthCheck> {
        self.per_device
            .read()
            .get(&device_id)
            .and_then(|checks| checks.last().cloned())
    }

    /// Most recent rows, newest first.
    pub fn list(&self, device_id: Uuid, limit: usize) -> Vec<HealthCheck> {
        self.per_device
            .read()
            .get(&device_id)
            .map(|checks| checks.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Trim rows older than the cutoff (the per-device cap is enforced on
    /// every record). Rewrites the JSONL file with the survivors.
    pub async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let (removed, survivors) = {
            let mut map = self.per_device.write();
            let mut removed = 0;
            for checks in map.values_mut() {
                let before = checks.len();
                checks.retain(|c| c.timestamp >= cutoff);
                removed += before - checks.len();
            }
            let survivors: Vec<HealthCheck> =
                map.values().flat_map(|v| v.iter().cloned()).collect();
            (removed, survivors)
        };

        if removed > 0 {
            let path = self.path.clone();
            let _guard = self.write_lock.lock().await;
            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut lines = String::new();
                for check in survivors {
                    lines.push_str(&serde_json::to_string(&check)?);
                    lines.push('\n');
                }
                std::fs::write(&path, lines)?;
                Ok(())
            })
            .await
            .map_err(|e| Error::Internal(format!("health prune task failed: {e}")))??;
        }
        Ok(removed)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
