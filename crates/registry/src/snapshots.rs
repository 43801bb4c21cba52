//! SnapshotStore — pre/post configuration captures with payload
//! externalization.
//!
//! Rows live in a JSON-persisted map; payloads below the inline threshold
//! stay in the row, larger ones are gzip-compressed into files under
//! `<state>/snapshots/`. A capture is durable (row + payload) before
//! `capture` returns — the executor refuses to mutate a device otherwise.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::RwLock;
use uuid::Uuid;

use fg_domain::snapshot::{PayloadRef, Snapshot, SnapshotKind};
use fg_domain::{Error, Result};

pub struct SnapshotStore {
    rows: RwLock<HashMap<Uuid, Snapshot>>,
    persist_path: PathBuf,
    payload_dir: PathBuf,
    inline_max_bytes: u64,
}

impl SnapshotStore {
    pub fn new(state_dir: &Path, inline_max_bytes: u64) -> Self {
        let persist_path = state_dir.join("snapshots.json");
        let payload_dir = state_dir.join("snapshots");
        let mut store = Self {
            rows: RwLock::new(HashMap::new()),
            persist_path,
            payload_dir,
            inline_max_bytes,
        };
        store.load();
        store
    }

    fn load(&mut self) {
        if let Ok(data) = std::fs::read_to_string(&self.persist_path) {
            if let Ok(rows) = serde_json::from_str::<Vec<Snapshot>>(&data) {
                let mut map = HashMap::new();
                for s in rows {
                    map.insert(s.id, s);
                }
                let count = map.len();
                self.rows = RwLock::new(map);
                tracing::info!(count, "loaded snapshot rows from disk");
            }
        }
    }

    /// Row persistence must succeed before a capture is reported done, so
    /// errors propagate here unlike in the softer stores.
    async fn persist(&self) -> Result<()> {
        let map = self.rows.read().await;
        let rows: Vec<&Snapshot> = map.values().collect();
        let json = serde_json::to_string_pretty(&rows)?;
        drop(map);
        let path = self.persist_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, json)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("snapshot persist task failed: {e}")))?
    }

    /// Capture a payload. Large payloads are gzip-externalized; the row
    /// records size, compression, and the reference.
    pub async fn capture(
        &self,
        device_id: Uuid,
        kind: SnapshotKind,
        trigger: &str,
        payload: &str,
        correlation_id: Option<String>,
    ) -> Result<Snapshot> {
        let id = Uuid::new_v4();
        let size_bytes = payload.len() as u64;

        let (payload_ref, compressed) = if size_bytes > self.inline_max_bytes {
            let file_name = format!("{id}.gz");
            let file_path = self.payload_dir.join(&file_name);
            let data = payload.as_bytes().to_vec();
            let dir = self.payload_dir.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                std::fs::create_dir_all(&dir)?;
                let file = std::fs::File::create(&file_path)?;
                let mut encoder = GzEncoder::new(file, Compression::default());
                encoder.write_all(&data)?;
                encoder.finish()?.flush()?;
                Ok(())
            })
            .await
            .map_err(|e| Error::Internal(format!("payload write task failed: {e}")))??;
            (PayloadRef::External(file_name), true)
        } else {
            (PayloadRef::Inline(payload.to_string()), false)
        };

        let snapshot = Snapshot {
            id,
            device_id,
            timestamp: Utc::now(),
            kind,
            trigger: trigger.to_string(),
            payload: payload_ref,
            size_bytes,
            compressed,
            correlation_id,
            metadata: serde_json::Map::new(),
        };

        self.rows.write().await.insert(id, snapshot.clone());
        self.persist().await?;
        Ok(snapshot)
    }

    pub async fn get(&self, id: Uuid) -> Result<Snapshot> {
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::SnapshotNotFound(id))
    }

    /// Load the payload text, inflating externalized files.
    pub async fn payload(&self, id: Uuid) -> Result<String> {
        let snapshot = self.get(id).await?;
        match snapshot.payload {
            PayloadRef::Inline(text) => Ok(text),
            PayloadRef::External(file_name) => {
                let path = self.payload_dir.join(file_name);
                tokio::task::spawn_blocking(move || -> Result<String> {
                    let file = std::fs::File::open(&path)?;
                    let mut decoder = GzDecoder::new(file);
                    let mut text = String::new();
                    decoder.read_to_string(&mut text)?;
                    Ok(text)
                })
                .await
                .map_err(|e| Error::Internal(format!("payload read task failed: {e}")))?
            }
        }
    }

    pub async fn list_for_device(&self, device_id: Uuid) -> Vec<Snapshot> {
        let mut rows: Vec<Snapshot> = self
            .rows
            .read()
            .await
            .values()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rows
    }

    /// Most recent snapshot of a kind for (device, correlation), used by the
    /// executor to find the pre-change capture for rollback.
    pub async fn find(
        &self,
        device_id: Uuid,
        kind: SnapshotKind,
        correlation_id: &str,
    ) -> Option<Snapshot> {
        self.rows
            .read()
            .await
            .values()
            .filter(|s| {
                s.device_id == device_id
                    && s.kind == kind
                    && s.correlation_id.as_deref() == Some(correlation_id)
            })
            .max_by_key(|s| s.timestamp)
            .cloned()
    }

    /// Drop rows (and externalized payloads) older than the cutoff.
    /// Pre-change snapshots whose correlation id is still active — owned by
    /// a live plan — are always retained.
    pub async fn prune(
        &self,
        cutoff: DateTime<Utc>,
        active_correlations: &HashSet<String>,
    ) -> Result<usize> {
        let mut removed_files = Vec::new();
        let removed = {
            let mut rows = self.rows.write().await;
            let doomed: Vec<Uuid> = rows
                .values()
                .filter(|s| {
                    s.timestamp < cutoff
                        && !(s.kind == SnapshotKind::PreChange
                            && s.correlation_id
                                .as_ref()
                                .is_some_and(|c| active_correlations.contains(c)))
                })
                .map(|s| s.id)
                .collect();
            for id in &doomed {
                if let Some(snapshot) = rows.remove(id) {
                    if let PayloadRef::External(file_name) = snapshot.payload {
                        removed_files.push(self.payload_dir.join(file_name));
                    }
                }
            }
            doomed.len()
        };

        if removed > 0 {
            self.persist().await?;
            let _ = tokio::task::spawn_blocking(move || {
                for path in removed_files {
                    let _ = std::fs::remove_file(path);
                }
            })
            .await;
        }
        Ok(removed)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir, inline_max: u64) -> SnapshotStore {
        SnapshotStore::new(dir.path(), inline_max)
    }

    #[tokio::test]
    async fn small_payload_stays_inline() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 1024);
        let device = Uuid::new_v4();

        let snapshot = store
            .capture(device, SnapshotKind::DnsNtp, "dns_set_servers", "/ip dns set", None)
            .await
            .unwrap();
        assert!(!snapshot.compressed);
        assert!(matches!(snapshot.payload, PayloadRef::Inline(_)));
        assert_eq!(store.payload(snapshot.id).await.unwrap(), "/ip dns set");
    }

    #[tokio::test]
    async fn large_payload_externalizes_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 64);
        let device = Uuid::new_v4();
        let big = "/ip firewall filter add chain=forward\n".repeat(50);

        let snapshot = store
            .capture(device, SnapshotKind::ConfigFull, "config_backup", &big, None)
            .await
            .unwrap();
        assert!(snapshot.compressed);
        assert!(matches!(snapshot.payload, PayloadRef::External(_)));
        assert_eq!(snapshot.size_bytes, big.len() as u64);
        assert_eq!(store.payload(snapshot.id).await.unwrap(), big);
    }

    #[tokio::test]
    async fn find_by_correlation_picks_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 1024);
        let device = Uuid::new_v4();

        store
            .capture(device, SnapshotKind::PreChange, "apply", "old", Some("corr-1".into()))
            .await
            .unwrap();
        let newer = store
            .capture(device, SnapshotKind::PreChange, "apply", "new", Some("corr-1".into()))
            .await
            .unwrap();

        let found = store
            .find(device, SnapshotKind::PreChange, "corr-1")
            .await
            .unwrap();
        assert_eq!(found.id, newer.id);
        assert!(store.find(device, SnapshotKind::PostChange, "corr-1").await.is_none());
    }

    #[tokio::test]
    async fn missing_snapshot_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 1024);
        let err = store.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::SnapshotNotFound(_)));
    }

    #[tokio::test]
    async fn prune_respects_active_pre_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 1024);
        let device = Uuid::new_v4();

        let pre = store
            .capture(device, SnapshotKind::PreChange, "apply", "keep", Some("live".into()))
            .await
            .unwrap();
        let post = store
            .capture(device, SnapshotKind::PostChange, "apply", "drop", Some("live".into()))
            .await
            .unwrap();

        let mut active = HashSet::new();
        active.insert("live".to_string());
        // Cutoff in the future: everything is "old".
        let removed = store
            .prune(Utc::now() + chrono::Duration::hours(1), &active)
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(store.get(pre.id).await.is_ok());
        assert!(store.get(post.id).await.is_err());
    }

    #[tokio::test]
    async fn rows_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let device = Uuid::new_v4();
        let id = {
            let store = store(&dir, 1024);
            store
                .capture(device, SnapshotKind::ConfigCompact, "backup", "x", None)
                .await
                .unwrap()
                .id
        };
        let reloaded = SnapshotStore::new(dir.path(), 1024);
        assert!(reloaded.get(id).await.is_ok());
    }
}
