//! MCP dispatch — the one place JSON-RPC messages meet the domain.
//!
//! The transport (stdio framing, HTTP) hands this service one parsed-or-raw
//! message at a time. Dispatch runs the authorization cascade, validates
//! arguments against the tool's schema, serves cacheable reads through the
//! resource cache, and converts typed errors into JSON-RPC envelopes in
//! exactly one place.

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use fg_domain::tool::{ToolSpec, ToolTier};
use fg_domain::{Error, Result};
use fg_mcp::{
    initialize_result, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ResourceReadParams,
    ToolCallParams, ToolCallResult, ToolDef,
};

use fg_domain::audit::{AuditAction, AuditEvent, AuditResult};

use crate::mcp::catalog::Identity;
use crate::mcp::handlers::{self, RequestContext};
use crate::mcp::prompts;
use crate::mcp::resources;
use crate::state::AppState;

pub struct McpService {
    state: AppState,
    /// URIs clients subscribed to; the transport drains `resource_events`
    /// filtered against this set.
    subscriptions: Mutex<HashSet<String>>,
}

impl McpService {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            subscriptions: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_subscribed(&self, uri: &str) -> bool {
        self.subscriptions.lock().contains(uri)
    }

    /// Handle one raw JSON message. Returns the serialized response, or
    /// `None` for notifications.
    pub async fn handle_message(&self, raw: &str, identity: Identity) -> Option<String> {
        let request: JsonRpcRequest = match serde_json::from_str(raw) {
            Ok(request) => request,
            Err(e) => {
                let response = JsonRpcResponse::failure(
                    Value::Null,
                    JsonRpcError::from(&Error::Parse(e.to_string())),
                );
                return serde_json::to_string(&response).ok();
            }
        };
        let response = self.handle(request, identity).await?;
        serde_json::to_string(&response).ok()
    }

    /// Handle one parsed request. Notifications produce no response.
    pub async fn handle(&self, request: JsonRpcRequest, identity: Identity) -> Option<JsonRpcResponse> {
        if request.jsonrpc != "2.0" {
            let id = request.id.unwrap_or(Value::Null);
            return Some(JsonRpcResponse::failure(
                id,
                JsonRpcError::from(&Error::InvalidRequest("jsonrpc must be \"2.0\"".into())),
            ));
        }
        if request.is_notification() {
            tracing::debug!(method = %request.method, "notification received");
            return None;
        }
        let id = request.id.clone().unwrap_or(Value::Null);

        let ctx = RequestContext {
            identity,
            correlation_id: correlation_from(&request),
        };

        let result = self
            .dispatch(&request.method, request.params.unwrap_or(Value::Null), &ctx)
            .await;

        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(err) => {
                if matches!(err, Error::Internal(_) | Error::Io(_) | Error::Json(_)) {
                    tracing::error!(method = %request.method, error = %err, "internal dispatch error");
                }
                JsonRpcResponse::failure(id, JsonRpcError::from(&err))
            }
        })
    }

    async fn dispatch(&self, method: &str, params: Value, ctx: &RequestContext) -> Result<Value> {
        metrics::counter!("fleetgate_mcp_requests_total", "method" => method.to_string())
            .increment(1);

        match method {
            "initialize" => Ok(serde_json::to_value(initialize_result())?),
            "ping" => Ok(json!({})),
            "tools/list" => self.tools_list(),
            "tools/call" => self.tools_call(params, ctx).await,
            "resources/list" => resources::list(&self.state).await,
            "resources/read" => {
                let params: ResourceReadParams = parse_params(params)?;
                resources::read(&self.state, &params.uri).await
            }
            "resources/subscribe" => {
                let params: ResourceReadParams = parse_params(params)?;
                resources::validate_uri(&params.uri)?;
                self.subscriptions.lock().insert(params.uri);
                Ok(json!({}))
            }
            "prompts/list" => prompts::list(),
            "prompts/get" => prompts::get(parse_params(params)?),
            other => Err(Error::MethodNotFound(other.to_string())),
        }
    }

    fn tools_list(&self) -> Result<Value> {
        let tools: Vec<ToolDef> = self
            .state
            .tools
            .list()
            .into_iter()
            .map(|spec| ToolDef {
                name: spec.name.clone(),
                description: spec.description.clone(),
                input_schema: spec.input_schema.clone(),
            })
            .collect();
        Ok(json!({ "tools": tools }))
    }

    // ── tools/call ───────────────────────────────────────────────────

    async fn tools_call(&self, params: Value, ctx: &RequestContext) -> Result<Value> {
        let params: ToolCallParams = parse_params(params)?;

        // 1. Tool lookup.
        let spec = self
            .state
            .tools
            .get(&params.name)
            .ok_or_else(|| Error::MethodNotFound(params.name.clone()))?
            .clone();

        // 2. Schema validation.
        validate_args(&spec.input_schema, &params.arguments)?;

        // 3. Authorization cascade: rate limit, then role. Environment and
        //    capability gates run against the resolved device(s) inside the
        //    handlers via `authorize_device`.
        let outcome = self.authorize_and_run(&spec, &params.arguments, ctx).await;

        // 6. Audit advanced/professional invocations and read-sensitive
        //    fundamentals, success or failure.
        if spec.tier != ToolTier::Fundamental || spec.read_sensitive {
            let (result, error) = match &outcome {
                Ok(result) if !result.is_error => (AuditResult::Success, None),
                Ok(_) => (AuditResult::Failure, Some("tool reported failure".to_string())),
                Err(err) => (
                    match err {
                        Error::RateLimitExceeded { .. }
                        | Error::RoleInsufficient { .. }
                        | Error::Unauthorized(_)
                        | Error::Forbidden(_)
                        | Error::EnvironmentMismatch { .. }
                        | Error::CapabilityMissing { .. } => AuditResult::Denied,
                        _ => AuditResult::Failure,
                    },
                    Some(err.to_string()),
                ),
            };
            let action = if spec.side_effect {
                AuditAction::Write
            } else {
                AuditAction::ReadSensitive
            };
            let mut event = AuditEvent::new(
                action,
                &spec.name,
                spec.tier.as_str(),
                result,
                &ctx.correlation_id,
            )
            .with_user(&ctx.identity.subject);
            if let Some(error) = error {
                event = event.with_error(error);
            }
            self.state.audit.append(event).await?;
        }

        let result = outcome?;
        Ok(serde_json::to_value(result)?)
    }

    async fn authorize_and_run(
        &self,
        spec: &ToolSpec,
        args: &Value,
        ctx: &RequestContext,
    ) -> Result<ToolCallResult> {
        // 3a. Rate limit per identity, per tier.
        self.state
            .rate_limiter
            .check(&ctx.identity.subject, spec.tier)?;

        // 3b. Role must permit the tier.
        if !ctx.identity.role.permits(spec.tier) {
            return Err(Error::RoleInsufficient {
                role: format!("{:?}", ctx.identity.role).to_lowercase(),
                tier: spec.tier.to_string(),
            });
        }

        // Cacheable reads go through the resource cache with per-key
        // single-flight on cold entries.
        let cache_key = (!spec.side_effect)
            .then(|| spec.cache_ttl_secs.map(|_| tool_cache_key(spec, args)))
            .flatten();

        if let Some(key) = &cache_key {
            if let Some(hit) = self.state.cache.get(key) {
                metrics::counter!("fleetgate_cache_hits_total").increment(1);
                return Ok(serde_json::from_value(hit)?);
            }
        }

        let run = async {
            match &cache_key {
                Some(key) => {
                    let lock = self.state.cache.flight_lock(key);
                    let _guard = lock.lock().await;
                    // Another flight may have filled it while we waited.
                    if let Some(hit) = self.state.cache.get(key) {
                        return Ok(serde_json::from_value::<ToolCallResult>(hit)?);
                    }
                    let result = handlers::call_tool(&self.state, ctx, spec, args).await?;
                    if !result.is_error {
                        self.state
                            .cache
                            .put(key.clone(), serde_json::to_value(&result)?, spec.cache_ttl_secs);
                    }
                    drop(_guard);
                    drop(lock);
                    self.state.cache.flight_done(key);
                    Ok(result)
                }
                None => handlers::call_tool(&self.state, ctx, spec, args).await,
            }
        };

        // 5. Per-tool deadline.
        match tokio::time::timeout(Duration::from_secs(spec.timeout_secs), run).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "tool {} exceeded its {}s deadline",
                spec.name, spec.timeout_secs
            ))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| Error::InvalidParams(e.to_string()))
}

fn correlation_from(request: &JsonRpcRequest) -> String {
    request
        .params
        .as_ref()
        .and_then(|p| p.get("_meta"))
        .and_then(|m| m.get("correlationId"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn tool_cache_key(spec: &ToolSpec, args: &Value) -> String {
    // serde_json maps are ordered, so the rendering is deterministic.
    format!("tool:{}:{}", spec.name, args)
}

/// Minimal JSON-schema check: the argument object must carry every
/// `required` property, and present top-level properties must match their
/// declared primitive `type`.
pub fn validate_args(schema: &Value, args: &Value) -> Result<()> {
    if !args.is_object() && !args.is_null() {
        return Err(Error::InvalidParams("arguments must be an object".into()));
    }
    let empty = serde_json::Map::new();
    let args_map = args.as_object().unwrap_or(&empty);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args_map.contains_key(key) {
                return Err(Error::InvalidParams(format!("missing required argument '{key}'")));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in args_map {
            let Some(declared) = properties.get(key) else {
                continue; // unknown keys pass through untouched
            };
            let Some(expected) = declared.get("type").and_then(Value::as_str) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "boolean" => value.is_boolean(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(Error::InvalidParams(format!(
                    "argument '{key}' must be of type {expected}"
                )));
            }
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
