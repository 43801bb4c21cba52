//! Error taxonomy shared by all FleetGate crates.
//!
//! Every public domain operation returns one of these variants. Each carries
//! a stable string code (used in audit rows and client-facing envelopes) and
//! maps to a JSON-RPC error code in the reserved `-32000..-32099` range.
//! Infrastructure failures (network, IO) are mapped into the taxonomy at the
//! RouterOS-client / store boundary; nothing else leaks upward.

use uuid::Uuid;

/// Shared error type used across all FleetGate crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // ── Protocol ──────────────────────────────────────────────────────
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("internal error: {0}")]
    Internal(String),

    // ── Authorization ─────────────────────────────────────────────────
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("device {device} is in environment '{device_env}' but this service manages '{service_env}'")]
    EnvironmentMismatch {
        device: String,
        device_env: String,
        service_env: String,
    },

    #[error("device {device} does not allow {capability}")]
    CapabilityMissing { device: String, capability: String },

    #[error("role '{role}' may not invoke {tier}-tier tools")]
    RoleInsufficient { role: String, tier: String },

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    // ── Resource lookup ───────────────────────────────────────────────
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("plan not found: {0}")]
    PlanNotFound(Uuid),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(Uuid),

    #[error("no active {kind} credential for device {device}")]
    CredentialNotFound { device: String, kind: String },

    // ── Registry ──────────────────────────────────────────────────────
    #[error("device name already registered: {0}")]
    NameConflict(String),

    #[error("invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("credential vault is locked (no encryption key configured)")]
    VaultLocked,

    // ── State / lifecycle ─────────────────────────────────────────────
    #[error("plan {0} has already been applied")]
    PlanAlreadyApplied(Uuid),

    #[error("plan {0} has expired")]
    PlanExpired(Uuid),

    #[error("approval token has expired")]
    ApprovalTokenExpired,

    #[error("approval token signature is invalid")]
    ApprovalTokenInvalid,

    #[error("plan creator may not approve their own plan")]
    SelfApprovalForbidden,

    // ── Safety checks ─────────────────────────────────────────────────
    #[error("pre-change health check failed on {device}: {detail}")]
    PreChangeHealthFailed { device: String, detail: String },

    #[error("post-change health check failed on {device}: {detail}")]
    PostChangeHealthFailed { device: String, detail: String },

    #[error("snapshot capture failed on {device}: {detail}")]
    SnapshotCreateFailed { device: String, detail: String },

    #[error("rollback failed on {device}: {detail}")]
    RollbackFailed { device: String, detail: String },

    #[error("unsafe operation rejected: {0}")]
    UnsafeOperation(String),

    // ── Device interaction ────────────────────────────────────────────
    #[error("device {device} unreachable: {detail}")]
    DeviceUnreachable { device: String, detail: String },

    #[error("authentication failed against device {0}")]
    AuthFailure(String),

    #[error("device error (HTTP {status}): {message}")]
    DeviceError { status: u16, message: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("no change: device already in desired state")]
    NoChange,

    // ── Resource limits ───────────────────────────────────────────────
    #[error("job queue is saturated")]
    QueueSaturated,

    #[error("per-device concurrency limit exceeded")]
    ConcurrentLimitExceeded,

    #[error("estimated token budget exceeded for this tool")]
    TokenBudgetExceeded,

    // ── Infrastructure passthrough (mapped at the boundary) ───────────
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable string code for audit rows and client envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Parse(_) => "ParseError",
            Error::InvalidRequest(_) => "InvalidRequest",
            Error::MethodNotFound(_) => "MethodNotFound",
            Error::InvalidParams(_) => "InvalidParams",
            Error::Internal(_) => "InternalError",
            Error::Unauthorized(_) => "Unauthorized",
            Error::Forbidden(_) => "Forbidden",
            Error::EnvironmentMismatch { .. } => "EnvironmentMismatch",
            Error::CapabilityMissing { .. } => "CapabilityMissing",
            Error::RoleInsufficient { .. } => "RoleInsufficient",
            Error::RateLimitExceeded { .. } => "RateLimitExceeded",
            Error::DeviceNotFound(_) => "DeviceNotFound",
            Error::PlanNotFound(_) => "PlanNotFound",
            Error::SnapshotNotFound(_) => "SnapshotNotFound",
            Error::CredentialNotFound { .. } => "CredentialNotFound",
            Error::NameConflict(_) => "NameConflict",
            Error::InvalidEnvironment(_) => "InvalidEnvironment",
            Error::VaultLocked => "VaultLocked",
            Error::PlanAlreadyApplied(_) => "PlanAlreadyApplied",
            Error::PlanExpired(_) => "PlanExpired",
            Error::ApprovalTokenExpired => "ApprovalTokenExpired",
            Error::ApprovalTokenInvalid => "ApprovalTokenInvalid",
            Error::SelfApprovalForbidden => "SelfApprovalForbidden",
            Error::PreChangeHealthFailed { .. } => "PreChangeHealthFailed",
            Error::PostChangeHealthFailed { .. } => "PostChangeHealthFailed",
            Error::SnapshotCreateFailed { .. } => "SnapshotCreateFailed",
            Error::RollbackFailed { .. } => "RollbackFailed",
            Error::UnsafeOperation(_) => "UnsafeOperation",
            Error::DeviceUnreachable { .. } => "DeviceUnreachable",
            Error::AuthFailure(_) => "AuthFailure",
            Error::DeviceError { .. } => "DeviceError",
            Error::Timeout(_) => "Timeout",
            Error::NoChange => "NoChange",
            Error::QueueSaturated => "QueueSaturated",
            Error::ConcurrentLimitExceeded => "ConcurrentLimitExceeded",
            Error::TokenBudgetExceeded => "TokenBudgetExceeded",
            Error::Io(_) => "InternalError",
            Error::Json(_) => "InternalError",
        }
    }

    /// JSON-RPC error code. Standard codes for protocol errors, the reserved
    /// `-32000..-32099` range for domain errors.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Error::Parse(_) => -32700,
            Error::InvalidRequest(_) => -32600,
            Error::MethodNotFound(_) => -32601,
            Error::InvalidParams(_) => -32602,
            Error::Internal(_) | Error::Io(_) | Error::Json(_) => -32603,

            Error::Unauthorized(_) => -32000,
            Error::Forbidden(_) => -32001,
            Error::EnvironmentMismatch { .. } => -32002,
            Error::CapabilityMissing { .. } => -32003,
            Error::RoleInsufficient { .. } => -32004,
            Error::RateLimitExceeded { .. } => -32005,

            Error::DeviceNotFound(_) => -32010,
            Error::PlanNotFound(_) => -32011,
            Error::SnapshotNotFound(_) => -32012,
            Error::CredentialNotFound { .. } => -32013,
            Error::NameConflict(_) => -32014,
            Error::InvalidEnvironment(_) => -32015,
            Error::VaultLocked => -32016,

            Error::PlanAlreadyApplied(_) => -32020,
            Error::PlanExpired(_) => -32021,
            Error::ApprovalTokenExpired => -32022,
            Error::ApprovalTokenInvalid => -32023,
            Error::SelfApprovalForbidden => -32024,

            Error::PreChangeHealthFailed { .. } => -32030,
            Error::PostChangeHealthFailed { .. } => -32031,
            Error::SnapshotCreateFailed { .. } => -32032,
            Error::RollbackFailed { .. } => -32033,
            Error::UnsafeOperation(_) => -32034,

            Error::DeviceUnreachable { .. } => -32040,
            Error::AuthFailure(_) => -32041,
            Error::DeviceError { .. } => -32042,
            Error::Timeout(_) => -32043,
            Error::NoChange => -32044,

            Error::QueueSaturated => -32050,
            Error::ConcurrentLimitExceeded => -32051,
            Error::TokenBudgetExceeded => -32052,
        }
    }

    /// Whether a retry with backoff may succeed (transient device/transport
    /// conditions). Permanent errors fail immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::DeviceUnreachable { .. }
                | Error::Timeout(_)
                | Error::RateLimitExceeded { .. }
                | Error::QueueSaturated
        )
    }
}
