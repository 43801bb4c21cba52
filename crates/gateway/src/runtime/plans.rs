//! PlanService — plan materialization, diffing, risk classification, expiry.
//!
//! A plan is built from live device reads: the service resolves targets,
//! verifies environment and capability gates, fetches current state per
//! topic, diffs against the desired state, and runs pre-checks. Plans are
//! immutable once past `pending_approval`; amendment means a new plan.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use fg_domain::audit::{AuditAction, AuditEvent, AuditResult};
use fg_domain::config::PlansConfig;
use fg_domain::device::{Device, Environment};
use fg_domain::plan::{Plan, PlanStatus, PlanTarget, RiskLevel};
use fg_domain::tool::{ToolSpec, ToolTier};
use fg_domain::{Error, Result};
use fg_registry::AuditLog;
use fg_routeros::RosOp;

use super::fleet::FleetCaller;
use super::topics::{self, ChangeSpec, PreCheckContext, Topic};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PlanStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PlanStore {
    inner: RwLock<HashMap<Uuid, Plan>>,
    persist_path: PathBuf,
}

impl PlanStore {
    pub fn new(state_dir: &Path) -> Self {
        let persist_path = state_dir.join("plans.json");
        let mut store = Self {
            inner: RwLock::new(HashMap::new()),
            persist_path,
        };
        store.load();
        store
    }

    fn load(&mut self) {
        if let Ok(data) = std::fs::read_to_string(&self.persist_path) {
            if let Ok(plans) = serde_json::from_str::<Vec<Plan>>(&data) {
                let mut map = HashMap::new();
                for p in plans {
                    map.insert(p.id, p);
                }
                let count = map.len();
                self.inner = RwLock::new(map);
                tracing::info!(count, "loaded plans from disk");
            }
        }
    }

    async fn persist(&self) {
        let map = self.inner.read().await;
        let plans: Vec<&Plan> = map.values().collect();
        if let Ok(json) = serde_json::to_string_pretty(&plans) {
            let path = self.persist_path.clone();
            drop(map);
            let _ = tokio::task::spawn_blocking(move || {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::warn!(error = %e, "failed to persist plans");
                }
            })
            .await;
        }
    }

    pub async fn insert(&self, plan: Plan) {
        self.inner.write().await.insert(plan.id, plan);
        self.persist().await;
    }

    /// Fetch a plan, lazily expiring it when its deadline has passed.
    pub async fn get(&self, id: Uuid) -> Result<Plan> {
        let mut map = self.inner.write().await;
        let plan = map.get_mut(&id).ok_or(Error::PlanNotFound(id))?;
        if !plan.is_expired(Utc::now()) {
            return Ok(plan.clone());
        }
        plan.status = PlanStatus::Expired;
        let expired = plan.clone();
        drop(map);
        self.persist().await;
        Ok(expired)
    }

    /// Transition a plan along its lifecycle graph.
    pub async fn transition(&self, id: Uuid, next: PlanStatus) -> Result<Plan> {
        let plan = {
            let mut map = self.inner.write().await;
            let plan = map.get_mut(&id).ok_or(Error::PlanNotFound(id))?;
            if !plan.status.can_transition_to(next) {
                return Err(Error::InvalidRequest(format!(
                    "plan {id} cannot move from {:?} to {next:?}",
                    plan.status
                )));
            }
            plan.status = next;
            plan.clone()
        };
        self.persist().await;
        Ok(plan)
    }

    pub async fn list(&self) -> Vec<Plan> {
        let mut plans: Vec<Plan> = self.inner.read().await.values().cloned().collect();
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        plans
    }

    pub async fn list_pending(&self) -> Vec<Plan> {
        self.sweep_expired().await;
        let mut plans: Vec<Plan> = self
            .inner
            .read()
            .await
            .values()
            .filter(|p| p.status == PlanStatus::PendingApproval)
            .cloned()
            .collect();
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        plans
    }

    /// Expire every overdue plan; returns how many flipped.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let flipped = {
            let mut map = self.inner.write().await;
            let mut count = 0;
            for plan in map.values_mut() {
                if plan.is_expired(now) {
                    plan.status = PlanStatus::Expired;
                    count += 1;
                }
            }
            count
        };
        if flipped > 0 {
            self.persist().await;
        }
        flipped
    }

    /// Correlation ids of plans that still own their pre-change snapshots.
    pub async fn active_correlations(&self) -> std::collections::HashSet<String> {
        self.inner
            .read()
            .await
            .values()
            .filter(|p| !p.status.is_terminal())
            .map(|p| p.correlation_id.clone())
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PlanService
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PlanService {
    pub store: Arc<PlanStore>,
    fleet: Arc<FleetCaller>,
    audit: Arc<AuditLog>,
    service_env: Environment,
    config: PlansConfig,
}

impl PlanService {
    pub fn new(
        store: Arc<PlanStore>,
        fleet: Arc<FleetCaller>,
        audit: Arc<AuditLog>,
        service_env: Environment,
        config: PlansConfig,
    ) -> Self {
        Self {
            store,
            fleet,
            audit,
            service_env,
            config,
        }
    }

    /// Gate checks shared by planning and direct reads: environment match
    /// and capability flags for the tool tier.
    pub fn authorize_device(&self, device: &Device, tier: ToolTier) -> Result<()> {
        if device.is_decommissioned() {
            return Err(Error::DeviceNotFound(device.name.clone()));
        }
        if device.environment != self.service_env {
            return Err(Error::EnvironmentMismatch {
                device: device.name.clone(),
                device_env: device.environment.to_string(),
                service_env: self.service_env.to_string(),
            });
        }
        match tier {
            ToolTier::Fundamental => {}
            ToolTier::Advanced => {
                if !device.capabilities.allow_advanced_writes {
                    return Err(Error::CapabilityMissing {
                        device: device.name.clone(),
                        capability: "advanced writes".into(),
                    });
                }
            }
            ToolTier::Professional => {
                if !device.capabilities.allow_professional_workflows {
                    return Err(Error::CapabilityMissing {
                        device: device.name.clone(),
                        capability: "professional workflows".into(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Materialize a plan for the given devices and change specs, persist
    /// it, and audit its creation.
    pub async fn create_plan(
        &self,
        tool: &ToolSpec,
        created_by: &str,
        devices: &[Device],
        specs: &[ChangeSpec],
        correlation_id: &str,
        parallel: bool,
    ) -> Result<Plan> {
        let plan = self
            .materialize(tool, created_by, devices, specs, correlation_id, parallel)
            .await?;

        self.store.insert(plan.clone()).await;
        self.audit
            .append(
                AuditEvent::new(
                    AuditAction::PlanCreated,
                    &tool.name,
                    tool.tier.as_str(),
                    AuditResult::Success,
                    correlation_id,
                )
                .with_plan(plan.id)
                .with_user(created_by),
            )
            .await?;

        Ok(plan)
    }

    /// The planning path only: same resolution, diffing, and pre-checks,
    /// but nothing is persisted. Backs `dry_run=true`.
    pub async fn preview_plan(
        &self,
        tool: &ToolSpec,
        created_by: &str,
        devices: &[Device],
        specs: &[ChangeSpec],
        correlation_id: &str,
    ) -> Result<Plan> {
        self.materialize(tool, created_by, devices, specs, correlation_id, false)
            .await
    }

    async fn materialize(
        &self,
        tool: &ToolSpec,
        created_by: &str,
        devices: &[Device],
        specs: &[ChangeSpec],
        correlation_id: &str,
        parallel: bool,
    ) -> Result<Plan> {
        let mut targets = Vec::with_capacity(devices.len());
        let mut max_risk = RiskLevel::Low;

        for device in devices {
            self.authorize_device(device, tool.tier)?;

            let mut changes = Vec::new();
            for spec in specs {
                let desired = topics::desired_value(spec.topic, &spec.params)?;
                let raw = self
                    .fleet
                    .call(device, spec.topic.read_op())
                    .await?
                    .value;
                let current = topics::current_value(spec.topic, &raw);

                let context = self.pre_check_context(device, spec.topic).await?;
                let description = topics::pre_check(spec.topic, device, &desired, &context)?;

                if let Some(mut change) = topics::diff(spec.topic, &current, &desired) {
                    change.pre_check_result = Some(description);
                    max_risk = max_risk.max(spec.topic.risk());
                    changes.push(change);
                }
            }

            targets.push(PlanTarget {
                device_id: device.id,
                device_name: device.name.clone(),
                changes,
            });
        }

        if tool.tier == ToolTier::Professional || devices.len() > 1 {
            max_risk = RiskLevel::High;
        }

        let summary = summarize(tool, &targets);
        let mut plan = Plan::new(
            tool.name.clone(),
            created_by.to_string(),
            summary,
            max_risk,
            targets,
            correlation_id.to_string(),
            Duration::hours(self.config.ttl_hours),
        );
        plan.parallel_apply = parallel;

        // Draft → pending_approval, or straight to approved when the
        // environment allows auto-approval of low-risk work.
        plan.status = if self.config.auto_approve_low_risk && max_risk == RiskLevel::Low {
            PlanStatus::Approved
        } else {
            PlanStatus::PendingApproval
        };

        Ok(plan)
    }

    /// Fetch the auxiliary reads a topic's pre-checks need.
    async fn pre_check_context(&self, device: &Device, topic: Topic) -> Result<PreCheckContext> {
        if topic != Topic::IpAddress {
            return Ok(PreCheckContext::default());
        }
        let interfaces = self
            .fleet
            .call(device, RosOp::InterfaceList)
            .await?
            .value
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| r.get("name").and_then(serde_json::Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let addresses = self
            .fleet
            .call(device, RosOp::IpAddressList)
            .await?
            .value
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| r.get("address").and_then(serde_json::Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(PreCheckContext {
            interfaces,
            addresses,
        })
    }

    pub async fn get_plan(&self, id: Uuid) -> Result<Plan> {
        self.store.get(id).await
    }

    pub async fn cancel(&self, id: Uuid, cancelled_by: &str) -> Result<Plan> {
        let plan = self.store.transition(id, PlanStatus::Cancelled).await?;
        self.audit
            .append(
                AuditEvent::new(
                    AuditAction::PlanCancelled,
                    &plan.tool_name,
                    "plan",
                    AuditResult::Success,
                    &plan.correlation_id,
                )
                .with_plan(plan.id)
                .with_user(cancelled_by),
            )
            .await?;
        Ok(plan)
    }

    pub async fn list_pending(&self) -> Vec<Plan> {
        self.store.list_pending().await
    }
}

fn summarize(tool: &ToolSpec, targets: &[PlanTarget]) -> String {
    let change_count: usize = targets.iter().map(|t| t.changes.len()).sum();
    let names: Vec<&str> = targets.iter().map(|t| t.device_name.as_str()).collect();
    format!(
        "{}: {} change(s) across {} device(s) [{}]",
        tool.name,
        change_count,
        targets.len(),
        names.join(", ")
    )
}
