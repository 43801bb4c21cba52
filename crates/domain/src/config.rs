//! Gateway configuration.
//!
//! Precedence: built-in defaults < config file (TOML) < environment
//! variables < command-line flags. Secrets (approval HMAC secret, vault
//! encryption key) are only ever read from the environment — the config file
//! carries the *names* of the env vars, never the values.

use serde::{Deserialize, Serialize};

use crate::device::Environment;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Environment tier this service instance manages.
    #[serde(default = "d_environment")]
    pub environment: Environment,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub routeros: RouterOsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub plans: PlansConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: d_environment(),
            server: ServerConfig::default(),
            state: StateConfig::default(),
            routeros: RouterOsConfig::default(),
            health: HealthConfig::default(),
            jobs: JobsConfig::default(),
            plans: PlansConfig::default(),
            approval: ApprovalConfig::default(),
            vault: VaultConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

fn d_environment() -> Environment {
    Environment::Lab
}

/// A problem found during config validation, with a severity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl Config {
    /// Sanity-check values that serde cannot express.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.health.jitter_secs >= self.health.interval_secs {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Fatal,
                message: format!(
                    "health.jitter_secs ({}) must be below health.interval_secs ({})",
                    self.health.jitter_secs, self.health.interval_secs
                ),
            });
        }
        if self.jobs.workers == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Fatal,
                message: "jobs.workers must be at least 1".into(),
            });
        }
        if self.jobs.per_device_concurrency == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Fatal,
                message: "jobs.per_device_concurrency must be at least 1".into(),
            });
        }
        if self.environment == Environment::Prod && self.plans.auto_approve_low_risk {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "auto-approval of low-risk plans is enabled in prod".into(),
            });
        }
        if self.retention.audit_days < 365 && self.environment == Environment::Prod {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Fatal,
                message: "retention.audit_days must be >= 365 in prod".into(),
            });
        }
        issues
    }

    /// Apply environment-variable overrides (between file and CLI flags).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(env) = std::env::var("FLEETGATE_ENVIRONMENT") {
            if let Some(parsed) = Environment::parse(&env) {
                self.environment = parsed;
            } else {
                tracing::warn!(value = %env, "ignoring invalid FLEETGATE_ENVIRONMENT");
            }
        }
        if let Ok(port) = std::env::var("FLEETGATE_PORT") {
            if let Ok(parsed) = port.parse() {
                self.server.port = parsed;
            }
        }
        if let Ok(dir) = std::env::var("FLEETGATE_STATE_DIR") {
            self.state.dir = dir;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
        }
    }
}

fn d_port() -> u16 {
    3443
}
fn d_host() -> String {
    "127.0.0.1".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State directory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Root directory for persisted state (devices, plans, audit, snapshots).
    #[serde(default = "d_state_dir")]
    pub dir: String,
    /// Snapshot payloads above this size are externalized to files.
    #[serde(default = "d_inline_max")]
    pub snapshot_inline_max_bytes: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: d_state_dir(),
            snapshot_inline_max_bytes: d_inline_max(),
        }
    }
}

fn d_state_dir() -> String {
    "./data".into()
}
fn d_inline_max() -> u64 {
    1024 * 1024
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RouterOS client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterOsConfig {
    #[serde(default = "d_5")]
    pub rest_timeout_secs: u64,
    #[serde(default = "d_10")]
    pub ssh_timeout_secs: u64,
    /// Per-device connection/request cap.
    #[serde(default = "d_8")]
    pub pool_per_device: usize,
    /// Accept self-signed device certificates (common on RouterOS).
    #[serde(default = "d_true")]
    pub accept_invalid_certs: bool,
}

impl Default for RouterOsConfig {
    fn default() -> Self {
        Self {
            rest_timeout_secs: 5,
            ssh_timeout_secs: 10,
            pool_per_device: 8,
            accept_invalid_certs: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Health scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "d_60")]
    pub interval_secs: u64,
    /// Uniform jitter applied per probe to avoid thundering herd.
    #[serde(default = "d_10")]
    pub jitter_secs: u64,
    #[serde(default = "d_30")]
    pub probe_timeout_secs: u64,
    /// Consecutive probe errors before a device is marked unreachable.
    #[serde(default = "d_3u32")]
    pub unreachable_after: u32,
    /// Consecutive successes before an unreachable device recovers.
    #[serde(default = "d_3u32")]
    pub recover_after: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            jitter_secs: 10,
            probe_timeout_secs: 30,
            unreachable_after: 3,
            recover_after: 3,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "d_4")]
    pub workers: usize,
    #[serde(default = "d_3usize")]
    pub per_device_concurrency: usize,
    /// Soft cap; non-critical submissions beyond this are rejected.
    #[serde(default = "d_500")]
    pub queue_soft_cap: usize,
    /// Post-apply settle period before the post-change health probe.
    #[serde(default = "d_30")]
    pub settle_secs: u64,
    #[serde(default = "d_300")]
    pub apply_timeout_secs: u64,
    #[serde(default = "d_900")]
    pub backup_timeout_secs: u64,
    #[serde(default = "d_60")]
    pub retry_base_secs: u64,
    #[serde(default = "d_2f")]
    pub retry_factor: f64,
    #[serde(default = "d_3u32")]
    pub max_attempts: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            per_device_concurrency: 3,
            queue_soft_cap: 500,
            settle_secs: 30,
            apply_timeout_secs: 300,
            backup_timeout_secs: 900,
            retry_base_secs: 60,
            retry_factor: 2.0,
            max_attempts: 3,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plans & approval
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlansConfig {
    #[serde(default = "d_24")]
    pub ttl_hours: i64,
    /// Auto-approve low-risk plans in this environment (never prod-safe;
    /// validation warns).
    #[serde(default)]
    pub auto_approve_low_risk: bool,
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            auto_approve_low_risk: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Env var holding the HMAC signing secret.
    #[serde(default = "d_approval_env")]
    pub secret_env: String,
    #[serde(default = "d_600")]
    pub token_ttl_secs: i64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            secret_env: d_approval_env(),
            token_ttl_secs: 600,
        }
    }
}

fn d_approval_env() -> String {
    "FLEETGATE_APPROVAL_SECRET".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Env var holding the base64-wrapped 32-byte AES key.
    #[serde(default = "d_vault_env")]
    pub key_env: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            key_env: d_vault_env(),
        }
    }
}

fn d_vault_env() -> String {
    "FLEETGATE_VAULT_KEY".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache, rate limit, retention
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "d_1000")]
    pub max_entries: usize,
    #[serde(default = "d_300")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "d_60")]
    pub window_secs: u64,
    /// Calls per window per identity, per tier.
    #[serde(default = "d_120")]
    pub fundamental_per_window: u32,
    #[serde(default = "d_30u32")]
    pub advanced_per_window: u32,
    #[serde(default = "d_10u32")]
    pub professional_per_window: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            fundamental_per_window: 120,
            advanced_per_window: 30,
            professional_per_window: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Keep the N most recent health checks per device.
    #[serde(default = "d_1000")]
    pub health_keep_per_device: usize,
    #[serde(default = "d_30i64")]
    pub health_days: i64,
    #[serde(default = "d_365")]
    pub audit_days: i64,
    #[serde(default = "d_90")]
    pub snapshot_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            health_keep_per_device: 1000,
            health_days: 30,
            audit_days: 365,
            snapshot_days: 90,
        }
    }
}

// ── serde default helpers ────────────────────────────────────────────

fn d_3u32() -> u32 {
    3
}
fn d_3usize() -> usize {
    3
}
fn d_4() -> usize {
    4
}
fn d_5() -> u64 {
    5
}
fn d_8() -> usize {
    8
}
fn d_10() -> u64 {
    10
}
fn d_10u32() -> u32 {
    10
}
fn d_24() -> i64 {
    24
}
fn d_30() -> u64 {
    30
}
fn d_30u32() -> u32 {
    30
}
fn d_30i64() -> i64 {
    30
}
fn d_60() -> u64 {
    60
}
fn d_90() -> i64 {
    90
}
fn d_120() -> u32 {
    120
}
fn d_300() -> u64 {
    300
}
fn d_365() -> i64 {
    365
}
fn d_500() -> usize {
    500
}
fn d_600() -> i64 {
    600
}
fn d_900() -> u64 {
    900
}
fn d_1000() -> usize {
    1000
}
fn d_2f() -> f64 {
    2.0
}
fn d_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        let issues = config.validate();
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 3443);
        assert_eq!(config.routeros.rest_timeout_secs, 5);
        assert_eq!(config.jobs.workers, 4);
        assert_eq!(config.health.interval_secs, 60);
    }

    #[test]
    fn partial_toml_overrides() {
        let config: Config = toml::from_str(
            r#"
            environment = "staging"

            [routeros]
            rest_timeout_secs = 12

            [jobs]
            workers = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.environment, Environment::Staging);
        assert_eq!(config.routeros.rest_timeout_secs, 12);
        assert_eq!(config.jobs.workers, 8);
        // Untouched sections keep defaults.
        assert_eq!(config.cache.max_entries, 1000);
    }

    #[test]
    fn jitter_above_interval_is_fatal() {
        let mut config = Config::default();
        config.health.jitter_secs = 90;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Fatal && i.message.contains("jitter")));
    }

    #[test]
    fn prod_short_audit_retention_is_fatal() {
        let mut config = Config::default();
        config.environment = Environment::Prod;
        config.retention.audit_days = 30;
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.severity == ConfigSeverity::Fatal));
    }

    #[test]
    fn prod_auto_approve_warns() {
        let mut config = Config::default();
        config.environment = Environment::Prod;
        config.plans.auto_approve_low_risk = true;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Warning && i.message.contains("auto-approval")));
    }
}
