//! Read-only addressable resources served through the registry.
//!
//! URIs: `fleet://{env}/summary`, `device://{ref}/health`,
//! `device://{ref}/config`, `plan://{id}`, `audit://{deviceRef}`,
//! `snapshot://{id}`. All are GET-semantics, never mutate, and the
//! device-backed ones flow through the resource cache.

use serde_json::{json, Value};
use uuid::Uuid;

use fg_domain::device::Environment;
use fg_domain::tool::ToolTier;
use fg_domain::{Error, Result};
use fg_mcp::{ResourceContents, ResourceDef};
use fg_registry::audit::AuditQuery;

use crate::runtime::cache::ResourceCache;
use crate::state::AppState;

const MIME_JSON: &str = "application/json";
const MIME_ROS_SCRIPT: &str = "text/x-routeros-script";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Listing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list(state: &AppState) -> Result<Value> {
    let mut resources = vec![ResourceDef {
        uri: format!("fleet://{}/summary", state.config.environment),
        name: "Fleet summary".into(),
        description: "Device counts by status and recent health overview".into(),
        mime_type: MIME_JSON.into(),
    }];

    for device in state.registry.list().await {
        if device.is_decommissioned() {
            continue;
        }
        resources.push(ResourceDef {
            uri: format!("device://{}/health", device.id),
            name: format!("{} health", device.name),
            description: "Current status and recent probe history".into(),
            mime_type: MIME_JSON.into(),
        });
        resources.push(ResourceDef {
            uri: format!("device://{}/config", device.id),
            name: format!("{} configuration", device.name),
            description: "Exported configuration script".into(),
            mime_type: MIME_ROS_SCRIPT.into(),
        });
        resources.push(ResourceDef {
            uri: format!("audit://{}", device.id),
            name: format!("{} audit trail", device.name),
            description: "Recent audit events for this device".into(),
            mime_type: MIME_JSON.into(),
        });
    }

    for plan in state.plans.list().await.into_iter().take(20) {
        resources.push(ResourceDef {
            uri: format!("plan://{}", plan.id),
            name: plan.summary.clone(),
            description: format!("Plan in status {:?}", plan.status),
            mime_type: MIME_JSON.into(),
        });
    }

    Ok(json!({ "resources": resources }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse and dispatch a resource URI.
pub async fn read(state: &AppState, uri: &str) -> Result<Value> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| Error::InvalidRequest(format!("not a resource uri: {uri}")))?;

    let contents = match scheme {
        "fleet" => fleet_summary(state, rest, uri).await?,
        "device" => device_resource(state, rest, uri).await?,
        "plan" => plan_resource(state, rest, uri).await?,
        "audit" => audit_resource(state, rest, uri).await?,
        "snapshot" => snapshot_resource(state, rest, uri).await?,
        other => {
            return Err(Error::InvalidRequest(format!(
                "unknown resource scheme '{other}'"
            )))
        }
    };

    Ok(json!({ "contents": [contents] }))
}

/// Cheap syntactic check used by `resources/subscribe`.
pub fn validate_uri(uri: &str) -> Result<()> {
    let (scheme, _) = uri
        .split_once("://")
        .ok_or_else(|| Error::InvalidRequest(format!("not a resource uri: {uri}")))?;
    match scheme {
        "fleet" | "device" | "plan" | "audit" | "snapshot" => Ok(()),
        other => Err(Error::InvalidRequest(format!(
            "unknown resource scheme '{other}'"
        ))),
    }
}

fn json_contents(uri: &str, value: &Value) -> ResourceContents {
    ResourceContents {
        uri: uri.to_string(),
        mime_type: MIME_JSON.into(),
        text: serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
    }
}

async fn fleet_summary(state: &AppState, rest: &str, uri: &str) -> Result<ResourceContents> {
    let env_str = rest
        .strip_suffix("/summary")
        .ok_or_else(|| Error::InvalidRequest(format!("malformed fleet uri: {uri}")))?;
    let environment =
        Environment::parse(env_str).ok_or_else(|| Error::InvalidEnvironment(env_str.into()))?;

    let key = ResourceCache::key(uri, None);
    if let Some(hit) = state.cache.get(&key) {
        return Ok(json_contents(uri, &hit));
    }

    let devices = state
        .registry
        .query(&fg_registry::DeviceQuery {
            environment: Some(environment),
            ..Default::default()
        })
        .await;

    let mut by_status: std::collections::BTreeMap<String, u32> = Default::default();
    let mut overview = Vec::new();
    for device in &devices {
        *by_status
            .entry(format!("{:?}", device.status).to_lowercase())
            .or_default() += 1;
        let latest = state.health_store.latest(device.id);
        overview.push(json!({
            "device": device.name,
            "status": device.status,
            "last_probe": latest.map(|c| json!({
                "status": c.status,
                "timestamp": c.timestamp,
                "cpu_pct": c.cpu_pct,
                "mem_pct": c.mem_pct,
            })),
        }));
    }

    let value = json!({
        "environment": environment,
        "total": devices.len(),
        "by_status": by_status,
        "devices": overview,
    });
    state.cache.put(key, value.clone(), Some(30));
    Ok(json_contents(uri, &value))
}

async fn device_resource(state: &AppState, rest: &str, uri: &str) -> Result<ResourceContents> {
    let (reference, view) = rest
        .split_once('/')
        .ok_or_else(|| Error::InvalidRequest(format!("malformed device uri: {uri}")))?;
    let device = if let Ok(id) = reference.parse::<Uuid>() {
        state.registry.lookup(id).await?
    } else {
        state.registry.lookup_by_name(reference).await?
    };
    state
        .plan_service
        .authorize_device(&device, ToolTier::Fundamental)?;

    match view {
        "health" => {
            let key = ResourceCache::key(uri, None);
            if let Some(hit) = state.cache.get(&key) {
                return Ok(json_contents(uri, &hit));
            }
            let value = json!({
                "device": device.name,
                "status": device.status,
                "observed": device.observed,
                "history": state.health_store.list(device.id, 25),
            });
            state.cache.put(key, value.clone(), Some(state.config.cache.ttl_secs));
            Ok(json_contents(uri, &value))
        }
        "config" => {
            let key = ResourceCache::key(uri, None);
            if let Some(hit) = state.cache.get(&key) {
                return Ok(ResourceContents {
                    uri: uri.to_string(),
                    mime_type: MIME_ROS_SCRIPT.into(),
                    text: hit.as_str().unwrap_or_default().to_string(),
                });
            }
            let script = state.fleet.export_config(&device).await?;
            state
                .cache
                .put(key, Value::String(script.clone()), Some(state.config.cache.ttl_secs));
            Ok(ResourceContents {
                uri: uri.to_string(),
                mime_type: MIME_ROS_SCRIPT.into(),
                text: script,
            })
        }
        other => Err(Error::InvalidRequest(format!(
            "unknown device view '{other}'"
        ))),
    }
}

async fn plan_resource(state: &AppState, rest: &str, uri: &str) -> Result<ResourceContents> {
    let id: Uuid = rest
        .parse()
        .map_err(|_| Error::InvalidRequest(format!("malformed plan uri: {uri}")))?;
    let plan = state.plans.get(id).await?;
    Ok(json_contents(uri, &serde_json::to_value(&plan)?))
}

async fn audit_resource(state: &AppState, rest: &str, uri: &str) -> Result<ResourceContents> {
    let (reference, limit) = match rest.split_once('?') {
        Some((device, query)) => {
            let limit = query
                .strip_prefix("limit=")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(50);
            (device, limit)
        }
        None => (rest, 50),
    };
    let device = if let Ok(id) = reference.parse::<Uuid>() {
        state.registry.lookup(id).await?
    } else {
        state.registry.lookup_by_name(reference).await?
    };

    let events = state.audit.query(&AuditQuery {
        device_id: Some(device.id),
        limit: Some(limit),
        ..Default::default()
    });
    Ok(json_contents(
        uri,
        &json!({ "device": device.name, "events": events }),
    ))
}

async fn snapshot_resource(state: &AppState, rest: &str, uri: &str) -> Result<ResourceContents> {
    let id: Uuid = rest
        .parse()
        .map_err(|_| Error::InvalidRequest(format!("malformed snapshot uri: {uri}")))?;
    let snapshot = state.snapshots.get(id).await?;
    let payload = state.snapshots.payload(id).await?;
    Ok(json_contents(
        uri,
        &json!({
            "snapshot": snapshot,
            "payload": payload,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_validation() {
        assert!(validate_uri("device://r1/health").is_ok());
        assert!(validate_uri("fleet://lab/summary").is_ok());
        assert!(validate_uri("ftp://nope").is_err());
        assert!(validate_uri("no-scheme").is_err());
    }
}
