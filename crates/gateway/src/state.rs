//! Shared application state passed to the MCP service and API handlers.

use std::sync::Arc;

use tokio::sync::broadcast;

use fg_domain::config::Config;
use fg_registry::{AuditLog, CredentialVault, DeviceRegistry, HealthStore, SnapshotStore};

use crate::mcp::catalog::ToolRegistry;
use crate::runtime::approval::ApprovalGateway;
use crate::runtime::cache::ResourceCache;
use crate::runtime::executor::JobExecutor;
use crate::runtime::fleet::FleetCaller;
use crate::runtime::health::HealthScheduler;
use crate::runtime::plans::{PlanService, PlanStore};
use crate::runtime::rate_limit::RateLimiter;

/// Emitted when a subscribed resource changes (device write, plan
/// transition). The transport layer fans these out over SSE.
#[derive(Debug, Clone)]
pub struct ResourceUpdate {
    pub uri: String,
}

/// Shared application state.
///
/// Fields are grouped by concern:
/// - **Config** — immutable after startup
/// - **Fleet state** — registry, vault, stores
/// - **Runtime** — plan service, approval gateway, executor, scheduler
/// - **Dispatch** — tool catalog, cache, rate limiter
#[derive(Clone)]
pub struct AppState {
    // ── Config ────────────────────────────────────────────────────────
    pub config: Arc<Config>,

    // ── Fleet state ───────────────────────────────────────────────────
    pub registry: Arc<DeviceRegistry>,
    pub vault: Arc<CredentialVault>,
    pub snapshots: Arc<SnapshotStore>,
    pub health_store: Arc<HealthStore>,
    pub audit: Arc<AuditLog>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub fleet: Arc<FleetCaller>,
    pub plans: Arc<PlanStore>,
    pub plan_service: Arc<PlanService>,
    pub approval: Arc<ApprovalGateway>,
    pub executor: Arc<JobExecutor>,
    pub health: Arc<HealthScheduler>,

    // ── Dispatch ──────────────────────────────────────────────────────
    pub tools: Arc<ToolRegistry>,
    pub cache: Arc<ResourceCache>,
    pub rate_limiter: Arc<RateLimiter>,

    // ── Subscriptions ─────────────────────────────────────────────────
    pub resource_events: broadcast::Sender<ResourceUpdate>,
}

impl AppState {
    pub fn publish_resource_update(&self, uri: impl Into<String>) {
        let _ = self.resource_events.send(ResourceUpdate { uri: uri.into() });
    }
}
