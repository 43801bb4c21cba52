//! Tool handlers — one per catalog entry, dispatched by name.
//!
//! Handlers return `ToolCallResult` (short text summary + structured
//! `_meta`) or a typed domain error; the dispatcher converts errors to
//! JSON-RPC envelopes. Writes flow through the plan/approve/apply pipeline —
//! single-device advanced tools use a system-approved plan internally, while
//! professional workflows hand the plan back for explicit approval.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use fg_domain::audit::{AuditAction, AuditEvent, AuditResult};
use fg_domain::credential::CredentialKind;
use fg_domain::device::{CapabilityFlags, Device, DeviceStatus, Endpoint, Environment};
use fg_domain::health::ProbeTrigger;
use fg_domain::job::{Job, JobStatus, JobType};
use fg_domain::plan::{Plan, PlanStatus};
use fg_domain::tool::{ToolSpec, ToolTier};
use fg_domain::{Error, Result};
use fg_mcp::ToolCallResult;
use fg_routeros::probe::ProbeOutcome;
use fg_routeros::RosOp;

use crate::mcp::catalog::Identity;
use crate::runtime::topics::{self, ChangeSpec, Topic};
use crate::state::AppState;

/// Approver identity used for the internal fast path of single-device
/// advanced writes; distinct from any client subject so the anti-self-
/// approval rule holds.
const SYSTEM_APPROVER: &str = "fleetgate:auto-approval";

/// Per-request context assembled by the dispatcher.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub identity: Identity,
    pub correlation_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch by name
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn call_tool(
    state: &AppState,
    ctx: &RequestContext,
    spec: &ToolSpec,
    args: &Value,
) -> Result<ToolCallResult> {
    match spec.name.as_str() {
        // ── Fundamental ──────────────────────────────────────────────
        "device_list" => device_list(state, args).await,
        "device_health" => device_health(state, args).await,
        "connectivity_check" => connectivity_check(state, args).await,
        "system_resource" => device_read(state, args, RosOp::SystemResource).await,
        "dns_get" => topic_read(state, args, Topic::Dns).await,
        "ntp_get" => topic_read(state, args, Topic::Ntp).await,
        "interface_list" => device_read(state, args, RosOp::InterfaceList).await,
        "ip_address_list" => device_read(state, args, RosOp::IpAddressList).await,
        "config_export" => config_export(state, args).await,
        "plan_get" => plan_get(state, args).await,
        "plan_list" => plan_list(state).await,

        // ── Advanced writes ──────────────────────────────────────────
        "dns_set_servers" => {
            single_write(state, ctx, spec, args, Topic::Dns, json!({ "servers": args["servers"] })).await
        }
        "ntp_set_servers" => {
            single_write(state, ctx, spec, args, Topic::Ntp, json!({ "servers": args["servers"] })).await
        }
        "identity_set" => {
            single_write(state, ctx, spec, args, Topic::Identity, json!({ "name": args["name"] })).await
        }
        "ip_add_secondary_address" => {
            single_write(
                state,
                ctx,
                spec,
                args,
                Topic::IpAddress,
                json!({ "address": args["address"], "interface": args["interface"] }),
            )
            .await
        }
        "address_list_add" => {
            single_write(
                state,
                ctx,
                spec,
                args,
                Topic::AddressList,
                json!({ "list": args["list"], "address": args["address"] }),
            )
            .await
        }
        "plan_approve" => plan_approve(state, ctx, args).await,
        "plan_apply" => plan_apply(state, ctx, spec, args).await,
        "plan_cancel" => plan_cancel(state, ctx, args).await,
        "device_register" => device_register(state, ctx, args).await,
        "device_decommission" => device_decommission(state, ctx, args).await,
        "credential_store" => credential_store(state, ctx, args).await,

        // ── Professional ─────────────────────────────────────────────
        "dns_ntp_rollout" => dns_ntp_rollout(state, ctx, spec, args).await,
        "config_backup" => config_backup(state, ctx, args).await,

        other => Err(Error::MethodNotFound(other.to_string())),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn str_arg(args: &Value, key: &str) -> Result<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidParams(format!("missing argument '{key}'")))
}

fn str_list_arg(args: &Value, key: &str) -> Result<Vec<String>> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| Error::InvalidParams(format!("missing array argument '{key}'")))
}

fn dry_run(args: &Value) -> bool {
    args.get("dry_run").and_then(Value::as_bool).unwrap_or(false)
}

/// Resolve a device by UUID or by name.
async fn resolve_device(state: &AppState, reference: &str) -> Result<Device> {
    if let Ok(id) = reference.parse::<Uuid>() {
        state.registry.lookup(id).await
    } else {
        state.registry.lookup_by_name(reference).await
    }
}

async fn resolve_device_arg(state: &AppState, args: &Value) -> Result<Device> {
    resolve_device(state, &str_arg(args, "device")?).await
}

fn parse_plan_id(args: &Value) -> Result<Uuid> {
    str_arg(args, "plan_id")?
        .parse::<Uuid>()
        .map_err(|_| Error::InvalidParams("plan_id is not a UUID".into()))
}

fn plan_meta(plan: &Plan) -> Value {
    json!({
        "plan_id": plan.id,
        "status": plan.status,
        "risk_level": plan.risk_level,
        "summary": plan.summary,
        "created_by": plan.created_by,
        "expires_at": plan.expires_at,
        "correlation_id": plan.correlation_id,
        "targets": plan.targets,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fundamental reads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn device_list(state: &AppState, args: &Value) -> Result<ToolCallResult> {
    let mut filter = fg_registry::DeviceQuery::default();
    if let Some(env) = args.get("environment").and_then(Value::as_str) {
        filter.environment =
            Some(Environment::parse(env).ok_or_else(|| Error::InvalidEnvironment(env.into()))?);
    }
    if let Some(status) = args.get("status").and_then(Value::as_str) {
        filter.status = serde_json::from_value(Value::String(status.to_string()))
            .map_err(|_| Error::InvalidParams(format!("unknown status '{status}'")))?;
    }
    if let (Some(k), Some(v)) = (
        args.get("tag_key").and_then(Value::as_str),
        args.get("tag_value").and_then(Value::as_str),
    ) {
        filter.tag = Some((k.to_string(), v.to_string()));
    }

    let devices = state.registry.query(&filter).await;
    let summary = format!("{} device(s)", devices.len());
    Ok(ToolCallResult::ok(summary, json!({ "devices": devices })))
}

async fn device_health(state: &AppState, args: &Value) -> Result<ToolCallResult> {
    let device = resolve_device_arg(state, args).await?;
    state
        .plan_service
        .authorize_device(&device, ToolTier::Fundamental)?;

    let check = state
        .health
        .probe_device(&device, ProbeTrigger::ClientRequest)
        .await?;
    let history = state.health_store.list(device.id, 10);
    let summary = format!("{}: {:?}", device.name, check.status);
    Ok(ToolCallResult::ok(
        summary,
        json!({
            "device": device.name,
            "device_status": state.registry.lookup(device.id).await?.status,
            "current": check,
            "history": history,
        }),
    ))
}

async fn connectivity_check(state: &AppState, args: &Value) -> Result<ToolCallResult> {
    let device = resolve_device_arg(state, args).await?;
    state
        .plan_service
        .authorize_device(&device, ToolTier::Fundamental)?;

    let report = state.fleet.probe(&device).await;
    let meta = match &report.outcome {
        ProbeOutcome::Reachable {
            transport,
            fallback_used,
            metrics,
        } => json!({
            "reachable": true,
            "transport": transport.as_str(),
            "fallback_used": fallback_used,
            "attempted_transports": report.attempted_transports,
            "response_time_ms": report.response_time_ms,
            "routeros_version": metrics.routeros_version,
        }),
        ProbeOutcome::Failed { reason, detail } => json!({
            "reachable": false,
            "attempted_transports": report.attempted_transports,
            "response_time_ms": report.response_time_ms,
            "failure_reason": reason.as_str(),
            "detail": detail,
            "remediation": report.remediation,
        }),
    };
    let summary = if report.is_reachable() {
        format!("{} reachable", device.name)
    } else {
        format!("{} unreachable", device.name)
    };
    Ok(ToolCallResult::ok(summary, meta))
}

async fn device_read(state: &AppState, args: &Value, op: RosOp) -> Result<ToolCallResult> {
    let device = resolve_device_arg(state, args).await?;
    state
        .plan_service
        .authorize_device(&device, ToolTier::Fundamental)?;
    let op_name = op.name();
    let outcome = state.fleet.call(&device, op).await?;
    Ok(ToolCallResult::ok(
        format!("{} {}", device.name, op_name),
        json!({ "device": device.name, "result": outcome.value }),
    ))
}

async fn topic_read(state: &AppState, args: &Value, topic: Topic) -> Result<ToolCallResult> {
    let device = resolve_device_arg(state, args).await?;
    state
        .plan_service
        .authorize_device(&device, ToolTier::Fundamental)?;
    let outcome = state.fleet.call(&device, topic.read_op()).await?;
    let value = topics::current_value(topic, &outcome.value);
    Ok(ToolCallResult::ok(
        format!("{} {}", device.name, topic.as_str()),
        json!({ "device": device.name, "result": value }),
    ))
}

async fn config_export(state: &AppState, args: &Value) -> Result<ToolCallResult> {
    let device = resolve_device_arg(state, args).await?;
    state
        .plan_service
        .authorize_device(&device, ToolTier::Fundamental)?;
    let script = state.fleet.export_config(&device).await?;
    Ok(ToolCallResult::ok(
        format!("{} configuration exported ({} bytes)", device.name, script.len()),
        json!({
            "device": device.name,
            "mime_type": "text/x-routeros-script",
            "script": script,
        }),
    ))
}

async fn plan_get(state: &AppState, args: &Value) -> Result<ToolCallResult> {
    let plan = state.plans.get(parse_plan_id(args)?).await?;
    Ok(ToolCallResult::ok(plan.summary.clone(), plan_meta(&plan)))
}

async fn plan_list(state: &AppState) -> Result<ToolCallResult> {
    let plans = state.plan_service.list_pending().await;
    let meta: Vec<Value> = plans.iter().map(plan_meta).collect();
    Ok(ToolCallResult::ok(
        format!("{} plan(s) pending approval", plans.len()),
        json!({ "plans": meta }),
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Write pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Single-device advanced write: plan, system-approve, apply, report.
async fn single_write(
    state: &AppState,
    ctx: &RequestContext,
    spec: &ToolSpec,
    args: &Value,
    topic: Topic,
    params: Value,
) -> Result<ToolCallResult> {
    let device = resolve_device_arg(state, args).await?;
    let specs = [ChangeSpec { topic, params }];

    if dry_run(args) {
        let preview = state
            .plan_service
            .preview_plan(spec, &ctx.identity.subject, std::slice::from_ref(&device), &specs, &ctx.correlation_id)
            .await?;
        let changed = preview.change_count() > 0;
        return Ok(ToolCallResult::ok(
            format!(
                "dry run: {} change(s) on {}",
                preview.change_count(),
                device.name
            ),
            json!({
                "dry_run": true,
                "changed": changed,
                "device": device.name,
                "changes": preview.targets.first().map(|t| t.changes.clone()).unwrap_or_default(),
                "risk_level": preview.risk_level,
            }),
        ));
    }

    let plan = state
        .plan_service
        .create_plan(
            spec,
            &ctx.identity.subject,
            std::slice::from_ref(&device),
            &specs,
            &ctx.correlation_id,
            false,
        )
        .await?;

    // Nothing to do: succeed idempotently without touching the executor.
    if plan.change_count() == 0 {
        state.plans.transition(plan.id, PlanStatus::Cancelled).await?;
        return Ok(ToolCallResult::ok(
            format!("{} already matches the desired state", device.name),
            json!({ "changed": false, "device": device.name, "plan_id": plan.id }),
        ));
    }

    let plan = approve_internally(state, plan).await?;
    apply_plan_and_report(state, ctx, &plan, spec).await
}

/// Advanced single-device writes are approved by the service itself; the
/// token still flows through the gateway so the verified-token invariant
/// holds for every executed plan.
async fn approve_internally(state: &AppState, plan: Plan) -> Result<Plan> {
    let token = state.approval.issue(&plan, SYSTEM_APPROVER)?;
    let plan = state.plans.transition(plan.id, PlanStatus::Approved).await?;
    state.approval.verify(&token.encode(), &plan)?;
    state
        .audit
        .append(
            AuditEvent::new(
                AuditAction::PlanApproved,
                &plan.tool_name,
                "advanced",
                AuditResult::Success,
                &plan.correlation_id,
            )
            .with_plan(plan.id)
            .with_user(SYSTEM_APPROVER),
        )
        .await?;
    Ok(plan)
}

/// Submit the apply job, wait for it, and shape the per-device breakdown.
async fn apply_plan_and_report(
    state: &AppState,
    ctx: &RequestContext,
    plan: &Plan,
    spec: &ToolSpec,
) -> Result<ToolCallResult> {
    let job = Job::for_plan(
        plan.id,
        plan.targets.iter().map(|t| t.device_id).collect(),
        plan.correlation_id.clone(),
    );
    let deadline = Duration::from_secs(spec.timeout_secs.max(60));
    let job = state.executor.submit_and_wait(job, deadline).await?;

    let breakdown: Value = job
        .result_summary
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_else(|| json!({}));
    let final_plan = state.plans.get(plan.id).await?;
    let succeeded = breakdown["succeeded"].as_array().map(|a| a.len()).unwrap_or(0);
    let ok = job.status == JobStatus::Completed && final_plan.status == PlanStatus::Completed;

    let meta = json!({
        "changed": ok && plan.change_count() > 0,
        "plan_id": plan.id,
        "plan_status": final_plan.status,
        "job_id": job.id,
        "job_status": job.status,
        "devices": breakdown,
        "correlation_id": ctx.correlation_id,
    });

    if ok {
        Ok(ToolCallResult::ok(
            format!("applied {} to {} device(s)", plan.tool_name, succeeded),
            meta,
        ))
    } else {
        // Applied-then-rolled-back is a tool-level failure with a full
        // breakdown, not a protocol error.
        Ok(ToolCallResult::error(
            format!("{} failed; see per-device breakdown", plan.tool_name),
            meta,
        ))
    }
}

async fn plan_approve(state: &AppState, ctx: &RequestContext, args: &Value) -> Result<ToolCallResult> {
    let plan = state.plans.get(parse_plan_id(args)?).await?;
    let token = state.approval.issue(&plan, &ctx.identity.subject)?;
    let plan = state.plans.transition(plan.id, PlanStatus::Approved).await?;
    state
        .audit
        .append(
            AuditEvent::new(
                AuditAction::PlanApproved,
                &plan.tool_name,
                "advanced",
                AuditResult::Success,
                &plan.correlation_id,
            )
            .with_plan(plan.id)
            .with_user(&ctx.identity.subject),
        )
        .await?;
    state.publish_resource_update(format!("plan://{}", plan.id));

    Ok(ToolCallResult::ok(
        format!("plan {} approved", plan.id),
        json!({
            "plan_id": plan.id,
            "approval_token": token.encode(),
            "expires_at": token.expires_at,
        }),
    ))
}

async fn plan_apply(
    state: &AppState,
    ctx: &RequestContext,
    spec: &ToolSpec,
    args: &Value,
) -> Result<ToolCallResult> {
    let plan = state.plans.get(parse_plan_id(args)?).await?;
    let token = str_arg(args, "approval_token")?;

    // The verification gate for the executor's apply path.
    state.approval.verify(&token, &plan)?;
    let result = apply_plan_and_report(state, ctx, &plan, spec).await?;
    state.publish_resource_update(format!("plan://{}", plan.id));
    Ok(result)
}

async fn plan_cancel(state: &AppState, ctx: &RequestContext, args: &Value) -> Result<ToolCallResult> {
    let plan = state
        .plan_service
        .cancel(parse_plan_id(args)?, &ctx.identity.subject)
        .await?;
    state.publish_resource_update(format!("plan://{}", plan.id));
    Ok(ToolCallResult::ok(
        format!("plan {} cancelled", plan.id),
        plan_meta(&plan),
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fleet management
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn device_register(state: &AppState, ctx: &RequestContext, args: &Value) -> Result<ToolCallResult> {
    let name = str_arg(args, "name")?;
    let host = str_arg(args, "host")?;
    let environment = str_arg(args, "environment")?;
    let capabilities = CapabilityFlags {
        allow_advanced_writes: args
            .get("allow_advanced_writes")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        allow_professional_workflows: args
            .get("allow_professional_workflows")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        allow_ssh_commands: args
            .get("allow_ssh_commands")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    };
    let tags: HashMap<String, String> = args
        .get("tags")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let endpoint = Endpoint {
        host,
        rest_port: args
            .get("rest_port")
            .and_then(Value::as_u64)
            .map(|p| p as u16)
            .unwrap_or(443),
        ssh_port: args
            .get("ssh_port")
            .and_then(Value::as_u64)
            .map(|p| p as u16)
            .unwrap_or(22),
    };

    let device = state
        .registry
        .register(name, endpoint, &environment, capabilities, tags)
        .await?;
    state
        .audit
        .append(
            AuditEvent::new(
                AuditAction::DeviceRegistered,
                "device_register",
                "advanced",
                AuditResult::Success,
                &ctx.correlation_id,
            )
            .with_device(device.id, device.environment.as_str())
            .with_user(&ctx.identity.subject),
        )
        .await?;

    Ok(ToolCallResult::ok(
        format!("registered {}", device.name),
        json!({ "device": device }),
    ))
}

async fn device_decommission(
    state: &AppState,
    ctx: &RequestContext,
    args: &Value,
) -> Result<ToolCallResult> {
    let device = resolve_device_arg(state, args).await?;
    let device = state.registry.decommission(device.id).await?;
    let deactivated = state.vault.deactivate_all(device.id).await;
    state.cache.invalidate_device(&device.name);
    state.cache.invalidate_device(&device.id.to_string());
    state
        .audit
        .append(
            AuditEvent::new(
                AuditAction::DeviceDecommissioned,
                "device_decommission",
                "advanced",
                AuditResult::Success,
                &ctx.correlation_id,
            )
            .with_device(device.id, device.environment.as_str())
            .with_user(&ctx.identity.subject),
        )
        .await?;

    Ok(ToolCallResult::ok(
        format!(
            "decommissioned {} ({} credential(s) deactivated)",
            device.name, deactivated
        ),
        json!({ "device": device.name, "status": DeviceStatus::Decommissioned }),
    ))
}

async fn credential_store(state: &AppState, ctx: &RequestContext, args: &Value) -> Result<ToolCallResult> {
    let device = resolve_device_arg(state, args).await?;
    let kind = match str_arg(args, "kind")?.as_str() {
        "rest" => CredentialKind::Rest,
        "ssh" => CredentialKind::Ssh,
        other => return Err(Error::InvalidParams(format!("unknown credential kind '{other}'"))),
    };
    let username = str_arg(args, "username")?;
    let password = str_arg(args, "password")?;

    let existed = state.vault.active_count(device.id, kind).await > 0;
    state
        .vault
        .store(device.id, kind, username, &password)
        .await?;
    state
        .audit
        .append(
            AuditEvent::new(
                if existed {
                    AuditAction::CredentialRotated
                } else {
                    AuditAction::CredentialStored
                },
                "credential_store",
                "advanced",
                AuditResult::Success,
                &ctx.correlation_id,
            )
            .with_device(device.id, device.environment.as_str())
            .with_user(&ctx.identity.subject),
        )
        .await?;

    // The secret itself never appears in the response.
    Ok(ToolCallResult::ok(
        format!("stored {kind} credential for {}", device.name),
        json!({ "device": device.name, "kind": kind, "rotated": existed }),
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Professional workflows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn dns_ntp_rollout(
    state: &AppState,
    ctx: &RequestContext,
    spec: &ToolSpec,
    args: &Value,
) -> Result<ToolCallResult> {
    let mut devices = Vec::new();
    for reference in str_list_arg(args, "devices")? {
        devices.push(resolve_device(state, &reference).await?);
    }
    if devices.is_empty() {
        return Err(Error::InvalidParams("devices must be non-empty".into()));
    }

    let mut specs = Vec::new();
    if let Some(dns) = args.get("dns_servers").filter(|v| !v.is_null()) {
        specs.push(ChangeSpec {
            topic: Topic::Dns,
            params: json!({ "servers": dns }),
        });
    }
    if let Some(ntp) = args.get("ntp_servers").filter(|v| !v.is_null()) {
        specs.push(ChangeSpec {
            topic: Topic::Ntp,
            params: json!({ "servers": ntp }),
        });
    }
    if specs.is_empty() {
        return Err(Error::InvalidParams(
            "at least one of dns_servers or ntp_servers is required".into(),
        ));
    }
    let parallel = args.get("parallel").and_then(Value::as_bool).unwrap_or(false);

    if dry_run(args) {
        let preview = state
            .plan_service
            .preview_plan(spec, &ctx.identity.subject, &devices, &specs, &ctx.correlation_id)
            .await?;
        return Ok(ToolCallResult::ok(
            format!("dry run: {}", preview.summary),
            json!({
                "dry_run": true,
                "changed": preview.change_count() > 0,
                "targets": preview.targets,
                "risk_level": preview.risk_level,
            }),
        ));
    }

    let plan = state
        .plan_service
        .create_plan(spec, &ctx.identity.subject, &devices, &specs, &ctx.correlation_id, parallel)
        .await?;
    state.publish_resource_update(format!("plan://{}", plan.id));

    Ok(ToolCallResult::ok(
        format!(
            "plan {} awaiting approval ({:?} risk, {} change(s))",
            plan.id,
            plan.risk_level,
            plan.change_count()
        ),
        plan_meta(&plan),
    ))
}

async fn config_backup(state: &AppState, ctx: &RequestContext, args: &Value) -> Result<ToolCallResult> {
    let mut device_ids = Vec::new();
    let mut names = Vec::new();
    for reference in str_list_arg(args, "devices")? {
        let device = resolve_device(state, &reference).await?;
        state
            .plan_service
            .authorize_device(&device, ToolTier::Professional)?;
        device_ids.push(device.id);
        names.push(device.name);
    }

    let job = Job::new(
        JobType::ConfigBackup,
        3,
        device_ids,
        ctx.correlation_id.clone(),
    );
    let job = state
        .executor
        .submit_and_wait(job, Duration::from_secs(state.config.jobs.backup_timeout_secs))
        .await?;

    let ok = job.status == JobStatus::Completed;
    let meta = json!({
        "job_id": job.id,
        "job_status": job.status,
        "devices": names,
        "detail": job.result_summary,
    });
    if ok {
        Ok(ToolCallResult::ok("configuration backups captured", meta))
    } else {
        Ok(ToolCallResult::error("configuration backup failed", meta))
    }
}
