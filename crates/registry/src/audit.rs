//! AuditLog — append-only JSONL event stream with correlation linkage.
//!
//! Events are durably written before the triggering call returns, carry a
//! monotonic per-writer sequence number, and are never updated or deleted.
//! A bounded in-memory ring serves queries; the JSONL file is the record.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use fg_domain::audit::{AuditAction, AuditEvent};
use fg_domain::{Error, Result};

/// Query window kept in memory. The file retains everything.
const RING_CAPACITY: usize = 10_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Query
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub device_id: Option<Uuid>,
    pub action: Option<AuditAction>,
    pub plan_id: Option<Uuid>,
    pub correlation_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AuditLog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AuditLog {
    path: PathBuf,
    ring: RwLock<VecDeque<AuditEvent>>,
    next_seq: AtomicU64,
    /// Serializes file appends so sequence order on disk matches `seq`.
    write_lock: tokio::sync::Mutex<()>,
}

impl AuditLog {
    pub fn new(state_dir: &Path) -> Self {
        let path = state_dir.join("audit.jsonl");
        let mut ring = VecDeque::with_capacity(RING_CAPACITY);
        let mut last_seq = 0u64;

        if let Ok(data) = std::fs::read_to_string(&path) {
            for line in data.lines() {
                if let Ok(event) = serde_json::from_str::<AuditEvent>(line) {
                    last_seq = last_seq.max(event.seq);
                    if ring.len() == RING_CAPACITY {
                        ring.pop_front();
                    }
                    ring.push_back(event);
                }
            }
            tracing::info!(count = ring.len(), last_seq, "loaded audit tail from disk");
        }

        Self {
            path,
            ring: RwLock::new(ring),
            next_seq: AtomicU64::new(last_seq + 1),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Append one event. The write is durable before this returns; failures
    /// propagate so callers never report success without an audit row.
    pub async fn append(&self, mut event: AuditEvent) -> Result<AuditEvent> {
        event.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        let line = serde_json::to_string(&event)?;
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
            file.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("audit write task failed: {e}")))??;

        let mut ring = self.ring.write();
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(event.clone());
        Ok(event)
    }

    /// Query the in-memory window, newest first.
    pub fn query(&self, filter: &AuditQuery) -> Vec<AuditEvent> {
        let ring = self.ring.read();
        let limit = filter.limit.unwrap_or(100);
        ring.iter()
            .rev()
            .filter(|e| {
                filter.device_id.map_or(true, |d| e.device_id == Some(d))
                    && filter.action.map_or(true, |a| e.action == a)
                    && filter.plan_id.map_or(true, |p| e.plan_id == Some(p))
                    && filter
                        .correlation_id
                        .as_ref()
                        .map_or(true, |c| &e.correlation_id == c)
                    && filter.since.map_or(true, |t| e.timestamp >= t)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use fg_domain::audit::AuditResult;

    fn event(correlation: &str) -> AuditEvent {
        AuditEvent::new(
            AuditAction::Write,
            "dns_set_servers",
            "advanced",
            AuditResult::Success,
            correlation,
        )
    }

    #[tokio::test]
    async fn append_assigns_monotonic_seq() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());

        let a = log.append(event("c1")).await.unwrap();
        let b = log.append(event("c2")).await.unwrap();
        let c = log.append(event("c3")).await.unwrap();
        assert!(a.seq < b.seq && b.seq < c.seq);
    }

    #[tokio::test]
    async fn events_are_durable_and_replayed() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = AuditLog::new(dir.path());
            log.append(event("c1")).await.unwrap();
            log.append(event("c2")).await.unwrap();
        }

        let reloaded = AuditLog::new(dir.path());
        assert_eq!(reloaded.len(), 2);
        // Sequence continues, never restarts.
        let next = reloaded.append(event("c3")).await.unwrap();
        assert_eq!(next.seq, 3);
    }

    #[tokio::test]
    async fn query_by_correlation() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(event("find-me")).await.unwrap();
        log.append(event("other")).await.unwrap();

        let hits = log.query(&AuditQuery {
            correlation_id: Some("find-me".into()),
            ..Default::default()
        });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].correlation_id, "find-me");
    }

    #[tokio::test]
    async fn query_by_device_and_action() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        let device = Uuid::new_v4();

        log.append(event("c1").with_device(device, "lab")).await.unwrap();
        log.append(event("c2")).await.unwrap();

        let hits = log.query(&AuditQuery {
            device_id: Some(device),
            action: Some(AuditAction::Write),
            ..Default::default()
        });
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn query_newest_first_with_limit() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        for i in 0..5 {
            log.append(event(&format!("c{i}"))).await.unwrap();
        }
        let hits = log.query(&AuditQuery {
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].correlation_id, "c4");
        assert_eq!(hits[1].correlation_id, "c3");
    }

    #[tokio::test]
    async fn file_is_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(event("c1")).await.unwrap();
        log.append(event("c2")).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            serde_json::from_str::<AuditEvent>(line).unwrap();
        }
    }
}
