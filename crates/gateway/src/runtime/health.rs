//! HealthScheduler — jittered periodic probes and device status transitions.
//!
//! Every registered device is probed on a fixed interval with uniform
//! jitter. Probe rows are immutable history; device status transitions
//! follow streak rules: consecutive errors mark a device unreachable,
//! consecutive successes recover it, any single critical degrades it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fg_domain::audit::{AuditAction, AuditEvent, AuditResult};
use fg_domain::config::HealthConfig;
use fg_domain::device::{Device, DeviceStatus, ObservedMetadata};
use fg_domain::health::{classify, HealthCheck, HealthStatus, ProbeTrigger};
use fg_domain::Result;
use fg_registry::{AuditLog, DeviceRegistry, HealthStore};
use fg_routeros::probe::ProbeOutcome;

use super::fleet::FleetCaller;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streak tracking
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default, Clone, Copy)]
struct Streaks {
    errors: u32,
    successes: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HealthScheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HealthScheduler {
    registry: Arc<DeviceRegistry>,
    fleet: Arc<FleetCaller>,
    store: Arc<HealthStore>,
    audit: Arc<AuditLog>,
    config: HealthConfig,
    streaks: Mutex<HashMap<Uuid, Streaks>>,
}

impl HealthScheduler {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        fleet: Arc<FleetCaller>,
        store: Arc<HealthStore>,
        audit: Arc<AuditLog>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            fleet,
            store,
            audit,
            config,
            streaks: Mutex::new(HashMap::new()),
        }
    }

    /// Probe one device now, record the row, and apply status transitions.
    pub async fn probe_device(
        &self,
        device: &Device,
        trigger: ProbeTrigger,
    ) -> Result<HealthCheck> {
        let report = self.fleet.probe(device).await;

        let check = match &report.outcome {
            ProbeOutcome::Reachable {
                transport,
                fallback_used: _,
                metrics,
            } => HealthCheck {
                id: Uuid::new_v4(),
                device_id: device.id,
                timestamp: Utc::now(),
                status: classify(metrics.cpu_pct, metrics.mem_pct, metrics.temp_c),
                trigger,
                response_time_ms: report.response_time_ms,
                transport: Some(transport.as_str().to_string()),
                cpu_pct: metrics.cpu_pct,
                mem_pct: metrics.mem_pct,
                temp_c: metrics.temp_c,
                voltage: metrics.voltage,
                uptime_sec: metrics.uptime_sec,
                interface_summary: None,
                error_detail: None,
            },
            ProbeOutcome::Failed { reason, detail } => HealthCheck {
                id: Uuid::new_v4(),
                device_id: device.id,
                timestamp: Utc::now(),
                status: HealthStatus::Error,
                trigger,
                response_time_ms: report.response_time_ms,
                transport: None,
                cpu_pct: None,
                mem_pct: None,
                temp_c: None,
                voltage: None,
                uptime_sec: None,
                interface_summary: None,
                error_detail: Some(format!("{}: {detail}", reason.as_str())),
            },
        };

        metrics::counter!(
            "fleetgate_health_probes_total",
            "status" => status_label(check.status)
        )
        .increment(1);

        self.store.record(check.clone()).await?;

        // Observed metadata rides along on successful probes.
        if let ProbeOutcome::Reachable { metrics: m, .. } = &report.outcome {
            if m.routeros_version.is_some() || m.board_name.is_some() {
                let _ = self
                    .registry
                    .record_observation(
                        device.id,
                        ObservedMetadata {
                            routeros_version: m.routeros_version.clone(),
                            identity: device.observed.identity.clone(),
                            board_name: m.board_name.clone(),
                            serial_number: device.observed.serial_number.clone(),
                        },
                    )
                    .await;
            }
        }

        self.apply_transition(device, check.status).await?;
        Ok(check)
    }

    /// Streak bookkeeping and the device-status transition rules.
    async fn apply_transition(&self, device: &Device, status: HealthStatus) -> Result<()> {
        let streaks = {
            let mut map = self.streaks.lock();
            let entry = map.entry(device.id).or_default();
            if status == HealthStatus::Error {
                entry.errors += 1;
                entry.successes = 0;
            } else {
                entry.successes += 1;
                entry.errors = 0;
            }
            *entry
        };

        let next = if status == HealthStatus::Error {
            (streaks.errors >= self.config.unreachable_after)
                .then_some(DeviceStatus::Unreachable)
        } else if status == HealthStatus::Critical {
            Some(DeviceStatus::Degraded)
        } else {
            match device.status {
                DeviceStatus::Pending => Some(DeviceStatus::Healthy),
                DeviceStatus::Unreachable | DeviceStatus::Degraded => {
                    (streaks.successes >= self.config.recover_after).then_some(DeviceStatus::Healthy)
                }
                _ => None,
            }
        };

        if let Some(next) = next {
            if next != device.status {
                self.registry.set_status(device.id, next).await?;
                self.audit
                    .append(
                        AuditEvent::new(
                            AuditAction::HealthTransition,
                            "health_check",
                            "fundamental",
                            AuditResult::Success,
                            format!("health-{}", device.id),
                        )
                        .with_device(device.id, device.environment.as_str()),
                    )
                    .await?;
                tracing::info!(
                    device = %device.name,
                    from = ?device.status,
                    to = ?next,
                    "device status transition"
                );
            }
        }
        Ok(())
    }

    /// The periodic loop. Each cycle probes every live device, staggered by
    /// uniform jitter to avoid thundering herd against the fleet.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("health scheduler stopping");
                    return;
                }
            }

            for device in self.registry.list().await {
                if device.is_decommissioned() {
                    continue;
                }
                let scheduler = self.clone();
                let jitter_max = self.config.jitter_secs * 2;
                tokio::spawn(async move {
                    if jitter_max > 0 {
                        let jitter = rand::thread_rng().gen_range(0..=jitter_max);
                        tokio::time::sleep(Duration::from_secs(jitter)).await;
                    }
                    if let Err(e) = scheduler
                        .probe_device(&device, ProbeTrigger::Scheduled)
                        .await
                    {
                        tracing::warn!(device = %device.name, error = %e, "scheduled probe failed");
                    }
                });
            }
        }
    }
}

fn status_label(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Warning => "warning",
        HealthStatus::Critical => "critical",
        HealthStatus::Error => "error",
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{SimState, SimTransport};
    use fg_domain::config::RouterOsConfig;
    use fg_domain::credential::CredentialKind;
    use fg_domain::device::{CapabilityFlags, Endpoint};
    use fg_registry::CredentialVault;
    use fg_routeros::RouterOsClient;
    use std::collections::HashMap as StdHashMap;

    struct Fixture {
        scheduler: Arc<HealthScheduler>,
        registry: Arc<DeviceRegistry>,
        sim: Arc<SimTransport>,
        device: Device,
        _dir: tempfile::TempDir,
    }

    async fn fixture(state: SimState) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(DeviceRegistry::new(dir.path()));
        let vault = Arc::new(CredentialVault::new(dir.path(), Some([1u8; 32])));
        let sim = Arc::new(SimTransport::new(state));
        let client = Arc::new(RouterOsClient::new(sim.clone(), RouterOsConfig::default()));
        let fleet = Arc::new(FleetCaller::new(vault.clone(), client));
        let store = Arc::new(HealthStore::new(dir.path(), 100));
        let audit = Arc::new(AuditLog::new(dir.path()));

        let device = registry
            .register(
                "r1".into(),
                Endpoint {
                    host: "10.0.0.1".into(),
                    rest_port: 443,
                    ssh_port: 22,
                },
                "lab",
                CapabilityFlags::default(),
                StdHashMap::new(),
            )
            .await
            .unwrap();
        vault
            .store(device.id, CredentialKind::Rest, "svc".into(), "pw")
            .await
            .unwrap();
        vault
            .store(device.id, CredentialKind::Ssh, "svc".into(), "pw")
            .await
            .unwrap();

        let scheduler = Arc::new(HealthScheduler::new(
            registry.clone(),
            fleet,
            store,
            audit,
            HealthConfig::default(),
        ));
        Fixture {
            scheduler,
            registry,
            sim,
            device,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn healthy_probe_promotes_pending_device() {
        let f = fixture(SimState::default()).await;
        let check = f
            .scheduler
            .probe_device(&f.device, ProbeTrigger::Scheduled)
            .await
            .unwrap();
        assert_eq!(check.status, HealthStatus::Healthy);
        assert_eq!(check.transport.as_deref(), Some("rest"));

        let device = f.registry.lookup(f.device.id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Healthy);
    }

    #[tokio::test]
    async fn three_errors_mark_unreachable_then_recovery() {
        let f = fixture(SimState {
            rest_down: true,
            ssh_down: true,
            ..SimState::default()
        })
        .await;

        for _ in 0..2 {
            f.scheduler
                .probe_device(&f.device, ProbeTrigger::Scheduled)
                .await
                .unwrap();
            let device = f.registry.lookup(f.device.id).await.unwrap();
            assert_eq!(device.status, DeviceStatus::Pending);
        }
        f.scheduler
            .probe_device(&f.device, ProbeTrigger::Scheduled)
            .await
            .unwrap();
        let device = f.registry.lookup(f.device.id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Unreachable);

        // Bring the device back; three consecutive successes recover it.
        {
            let mut state = f.sim.state.lock();
            state.rest_down = false;
            state.ssh_down = false;
        }
        for _ in 0..2 {
            let device = f.registry.lookup(f.device.id).await.unwrap();
            f.scheduler
                .probe_device(&device, ProbeTrigger::Scheduled)
                .await
                .unwrap();
            assert_eq!(
                f.registry.lookup(f.device.id).await.unwrap().status,
                DeviceStatus::Unreachable
            );
        }
        let device = f.registry.lookup(f.device.id).await.unwrap();
        f.scheduler
            .probe_device(&device, ProbeTrigger::Scheduled)
            .await
            .unwrap();
        assert_eq!(
            f.registry.lookup(f.device.id).await.unwrap().status,
            DeviceStatus::Healthy
        );
    }

    #[tokio::test]
    async fn single_critical_degrades() {
        let f = fixture(SimState {
            cpu: 97.0,
            ..SimState::default()
        })
        .await;
        let check = f
            .scheduler
            .probe_device(&f.device, ProbeTrigger::Scheduled)
            .await
            .unwrap();
        assert_eq!(check.status, HealthStatus::Critical);
        assert_eq!(
            f.registry.lookup(f.device.id).await.unwrap().status,
            DeviceStatus::Degraded
        );
    }

    #[tokio::test]
    async fn probe_falls_back_to_ssh_when_rest_blocked() {
        let f = fixture(SimState {
            rest_down: true,
            ..SimState::default()
        })
        .await;
        let check = f
            .scheduler
            .probe_device(&f.device, ProbeTrigger::ClientRequest)
            .await
            .unwrap();
        assert_eq!(check.transport.as_deref(), Some("ssh"));
        assert_eq!(check.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn error_probe_records_detail() {
        let f = fixture(SimState {
            rest_down: true,
            ssh_down: true,
            ..SimState::default()
        })
        .await;
        let check = f
            .scheduler
            .probe_device(&f.device, ProbeTrigger::Scheduled)
            .await
            .unwrap();
        assert_eq!(check.status, HealthStatus::Error);
        assert!(check.error_detail.as_deref().unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn observed_metadata_recorded() {
        let f = fixture(SimState::default()).await;
        f.scheduler
            .probe_device(&f.device, ProbeTrigger::Scheduled)
            .await
            .unwrap();
        let device = f.registry.lookup(f.device.id).await.unwrap();
        assert_eq!(device.observed.routeros_version.as_deref(), Some("7.14.2"));
        assert_eq!(device.observed.board_name.as_deref(), Some("CHR"));
    }
}
