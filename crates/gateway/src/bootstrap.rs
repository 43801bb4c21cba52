//! Assemble the application state and spawn the background loops.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use fg_domain::config::Config;
use fg_domain::job::{Job, JobType};
use fg_registry::{AuditLog, CredentialVault, DeviceRegistry, HealthStore, SnapshotStore};
use fg_routeros::{HttpSshTransport, RouterOsClient};

use crate::mcp::catalog::ToolRegistry;
use crate::runtime::approval::ApprovalGateway;
use crate::runtime::cache::ResourceCache;
use crate::runtime::executor::JobExecutor;
use crate::runtime::fleet::FleetCaller;
use crate::runtime::health::HealthScheduler;
use crate::runtime::jobs::{JobQueue, JobStore};
use crate::runtime::plans::{PlanService, PlanStore};
use crate::runtime::rate_limit::RateLimiter;
use crate::state::AppState;

/// How often the cleanup sweep (plan expiry, snapshot/health retention) runs.
const CLEANUP_INTERVAL_SECS: u64 = 3600;

/// Build the full application state from configuration. Secrets are read
/// from the environment here, once, and never again.
pub fn build_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let state_dir = Path::new(&config.state.dir);
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("creating state directory {}", config.state.dir))?;

    // ── Fleet state ───────────────────────────────────────────────────
    let registry = Arc::new(DeviceRegistry::new(state_dir));
    let vault = Arc::new(CredentialVault::from_env(state_dir, &config.vault.key_env));
    let snapshots = Arc::new(SnapshotStore::new(
        state_dir,
        config.state.snapshot_inline_max_bytes,
    ));
    let health_store = Arc::new(HealthStore::new(
        state_dir,
        config.retention.health_keep_per_device,
    ));
    let audit = Arc::new(AuditLog::new(state_dir));

    // ── RouterOS access ───────────────────────────────────────────────
    let transport = Arc::new(
        HttpSshTransport::new(&config.routeros)
            .map_err(|e| anyhow::anyhow!("building RouterOS transport: {e}"))?,
    );
    let client = Arc::new(RouterOsClient::new(transport, config.routeros.clone()));
    let fleet = Arc::new(FleetCaller::new(vault.clone(), client));

    // ── Approval secret ───────────────────────────────────────────────
    let approval = match ApprovalGateway::from_env(
        &config.approval.secret_env,
        config.approval.token_ttl_secs,
    ) {
        Ok(gateway) => gateway,
        Err(e) => {
            // Dev fallback: an ephemeral secret keeps the gateway usable,
            // but tokens die with the process.
            tracing::warn!(error = %e, "approval secret unavailable; using an ephemeral secret");
            let mut secret = vec![0u8; 32];
            use rand::RngCore;
            rand::thread_rng().fill_bytes(&mut secret);
            ApprovalGateway::new(secret, config.approval.token_ttl_secs)
        }
    };
    let approval = Arc::new(approval);

    // ── Runtime services ──────────────────────────────────────────────
    let plans = Arc::new(PlanStore::new(state_dir));
    let plan_service = Arc::new(PlanService::new(
        plans.clone(),
        fleet.clone(),
        audit.clone(),
        config.environment,
        config.plans.clone(),
    ));
    let health = Arc::new(HealthScheduler::new(
        registry.clone(),
        fleet.clone(),
        health_store.clone(),
        audit.clone(),
        config.health.clone(),
    ));
    let cache = Arc::new(ResourceCache::new(
        config.cache.max_entries,
        config.cache.ttl_secs,
    ));
    let executor = Arc::new(JobExecutor::new(
        Arc::new(JobStore::new(state_dir)),
        Arc::new(JobQueue::new(config.jobs.queue_soft_cap)),
        plans.clone(),
        registry.clone(),
        fleet.clone(),
        snapshots.clone(),
        health.clone(),
        health_store.clone(),
        audit.clone(),
        cache.clone(),
        config.jobs.clone(),
        config.retention.clone(),
    ));

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let (resource_events, _) = broadcast::channel(256);

    Ok(AppState {
        config,
        registry,
        vault,
        snapshots,
        health_store,
        audit,
        fleet,
        plans,
        plan_service,
        approval,
        executor,
        health,
        tools: Arc::new(ToolRegistry::new()),
        cache,
        rate_limiter,
        resource_events,
    })
}

/// Start the background loops: health scheduler, job workers, cleanup.
pub fn spawn_background(state: &AppState, shutdown: CancellationToken) {
    state.executor.spawn_workers(shutdown.clone());

    let health = state.health.clone();
    tokio::spawn(health.run(shutdown.clone()));

    let executor = state.executor.clone();
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(CLEANUP_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            let job = Job::new(JobType::Cleanup, 1, vec![], format!("cleanup-{}", uuid::Uuid::new_v4()));
            if let Err(e) = executor.submit(job).await {
                tracing::warn!(error = %e, "cleanup job submission rejected");
            }
        }
    });
}
