//! Test support: an in-process simulated RouterOS device.
//!
//! `SimTransport` implements the raw transport seam with a tiny config
//! model (dns, ntp, identity, addresses) so plan/apply/rollback paths can be
//! exercised end-to-end without a device.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use fg_domain::config::{Config, JobsConfig};
use fg_domain::credential::CredentialMaterial;
use fg_domain::device::Device;
use fg_domain::{Error, Result};
use fg_registry::{AuditLog, CredentialVault, DeviceRegistry, HealthStore, SnapshotStore};
use fg_routeros::rest::RestRequest;
use fg_routeros::ssh::SshCommand;
use fg_routeros::{RouterOsClient, Transport};

use crate::mcp::catalog::ToolRegistry;
use crate::mcp::service::McpService;
use crate::runtime::approval::ApprovalGateway;
use crate::runtime::cache::ResourceCache;
use crate::runtime::executor::JobExecutor;
use crate::runtime::fleet::FleetCaller;
use crate::runtime::health::HealthScheduler;
use crate::runtime::jobs::{JobQueue, JobStore};
use crate::runtime::plans::{PlanService, PlanStore};
use crate::runtime::rate_limit::RateLimiter;
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct SimState {
    pub dns: Vec<String>,
    pub ntp: Vec<String>,
    pub identity: String,
    pub interfaces: Vec<String>,
    /// (address, interface)
    pub addresses: Vec<(String, String)>,
    /// (list, address)
    pub address_list: Vec<(String, String)>,
    pub cpu: f64,
    pub mem: f64,
    pub rest_down: bool,
    pub ssh_down: bool,
    /// Simulate a device that accepts exports but fails imports, to
    /// exercise the rollback-failed path deterministically.
    pub import_fails: bool,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            dns: vec!["8.8.8.8".into(), "8.8.4.4".into()],
            ntp: vec!["0.pool.ntp.org".into()],
            identity: "MikroTik".into(),
            interfaces: vec!["ether1".into(), "ether2".into()],
            addresses: vec![("192.168.88.1/24".into(), "ether1".into())],
            address_list: Vec::new(),
            cpu: 5.0,
            mem: 40.0,
            rest_down: false,
            ssh_down: false,
            import_fails: false,
        }
    }
}

pub struct SimTransport {
    pub state: Mutex<SimState>,
    /// Scripted (cpu, mem) overrides consumed by resource reads; once empty,
    /// reads fall back to the live state values.
    pub resource_script: Mutex<VecDeque<(f64, f64)>>,
}

impl SimTransport {
    pub fn new(state: SimState) -> Self {
        Self {
            state: Mutex::new(state),
            resource_script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn script_resources(&self, readings: Vec<(f64, f64)>) {
        *self.resource_script.lock() = readings.into();
    }

    fn resource_reading(&self) -> (f64, f64) {
        if let Some(reading) = self.resource_script.lock().pop_front() {
            return reading;
        }
        let state = self.state.lock();
        (state.cpu, state.mem)
    }

    fn export(&self) -> String {
        let state = self.state.lock();
        format!(
            "/ip dns set servers={}\n/system ntp client set servers={}\n/system identity set name={}\n",
            state.dns.join(","),
            state.ntp.join(","),
            state.identity
        )
    }

    fn import(&self, script: &str) {
        let mut state = self.state.lock();
        for line in script.lines() {
            if let Some(rest) = line.strip_prefix("/ip dns set servers=") {
                state.dns = rest.split(',').map(str::to_string).collect();
            } else if let Some(rest) = line.strip_prefix("/system ntp client set servers=") {
                state.ntp = rest.split(',').map(str::to_string).collect();
            } else if let Some(rest) = line.strip_prefix("/system identity set name=") {
                state.identity = rest.to_string();
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Full-stack harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const TEST_APPROVAL_SECRET: &[u8] = b"test-approval-secret-0123456789";

/// The whole gateway wired over simulated devices. Sims are registered
/// lazily: `add_sim` before registering the matching device through the
/// `device_register` tool.
pub struct TestStack {
    pub state: AppState,
    pub service: McpService,
    pub fleet_sims: Arc<Mutex<std::collections::HashMap<String, Arc<SimTransport>>>>,
    pub shutdown: CancellationToken,
    pub _dir: tempfile::TempDir,
}

impl Drop for TestStack {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Shared-map variant of [`FleetSim`] so tests can add devices after the
/// client is built.
pub struct DynFleetSim {
    pub devices: Arc<Mutex<std::collections::HashMap<String, Arc<SimTransport>>>>,
}

impl DynFleetSim {
    fn device(&self, name: &str) -> Result<Arc<SimTransport>> {
        self.devices
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(name.to_string()))
    }
}

#[async_trait]
impl Transport for DynFleetSim {
    async fn rest(
        &self,
        device: &Device,
        creds: &CredentialMaterial,
        request: &RestRequest,
        timeout: Duration,
    ) -> Result<Value> {
        self.device(&device.name)?
            .rest(device, creds, request, timeout)
            .await
    }

    async fn ssh(
        &self,
        device: &Device,
        creds: &CredentialMaterial,
        command: &SshCommand,
        timeout: Duration,
    ) -> Result<String> {
        self.device(&device.name)?
            .ssh(device, creds, command, timeout)
            .await
    }
}

/// Build the complete stack: stores on a temp dir, simulated transports, a
/// fixed vault key and approval secret, zero settle time, and live workers.
pub fn build_test_stack(approval_ttl_secs: i64) -> TestStack {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path();
    let mut config = Config::default();
    config.state.dir = state_dir.to_string_lossy().into_owned();

    let registry = Arc::new(DeviceRegistry::new(state_dir));
    let vault = Arc::new(CredentialVault::new(state_dir, Some([1u8; 32])));
    let snapshots = Arc::new(SnapshotStore::new(state_dir, 1024 * 1024));
    let health_store = Arc::new(HealthStore::new(state_dir, 100));
    let audit = Arc::new(AuditLog::new(state_dir));

    let fleet_sims: Arc<Mutex<std::collections::HashMap<String, Arc<SimTransport>>>> =
        Arc::new(Mutex::new(std::collections::HashMap::new()));
    let transport = Arc::new(DynFleetSim {
        devices: fleet_sims.clone(),
    });
    let client = Arc::new(RouterOsClient::new(transport, config.routeros.clone()));
    let fleet = Arc::new(FleetCaller::new(vault.clone(), client));

    let approval = Arc::new(ApprovalGateway::new(
        TEST_APPROVAL_SECRET.to_vec(),
        approval_ttl_secs,
    ));
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
        JobsConfig {
            settle_secs: 0,
            ..config.jobs.clone()
        },
        config.retention.clone(),
    ));

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let (resource_events, _) = tokio::sync::broadcast::channel(64);

    let state = AppState {
        config: Arc::new(config),
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
    };

    let shutdown = CancellationToken::new();
    state.executor.spawn_workers(shutdown.clone());

    TestStack {
        service: McpService::new(state.clone()),
        state,
        fleet_sims,
        shutdown,
        _dir: dir,
    }
}

impl TestStack {
    /// Attach a simulated device under the given name.
    pub fn add_sim(&self, name: &str, state: SimState) -> Arc<SimTransport> {
        let sim = Arc::new(SimTransport::new(state));
        self.fleet_sims.lock().insert(name.to_string(), sim.clone());
        sim
    }
}

/// Routes transport calls to a per-device simulator by device name, for
/// multi-device rollout tests.
#[derive(Default)]
pub struct FleetSim {
    pub devices: std::collections::HashMap<String, std::sync::Arc<SimTransport>>,
}

impl FleetSim {
    fn device(&self, name: &str) -> Result<&SimTransport> {
        self.devices
            .get(name)
            .map(|t| t.as_ref())
            .ok_or_else(|| Error::DeviceNotFound(name.to_string()))
    }
}

#[async_trait]
impl Transport for FleetSim {
    async fn rest(
        &self,
        device: &Device,
        creds: &CredentialMaterial,
        request: &RestRequest,
        timeout: Duration,
    ) -> Result<Value> {
        self.device(&device.name)?
            .rest(device, creds, request, timeout)
            .await
    }

    async fn ssh(
        &self,
        device: &Device,
        creds: &CredentialMaterial,
        command: &SshCommand,
        timeout: Duration,
    ) -> Result<String> {
        self.device(&device.name)?
            .ssh(device, creds, command, timeout)
            .await
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn rest(
        &self,
        device: &Device,
        _creds: &CredentialMaterial,
        request: &RestRequest,
        _timeout: Duration,
    ) -> Result<Value> {
        if self.state.lock().rest_down {
            return Err(Error::DeviceUnreachable {
                device: device.name.clone(),
                detail: "connection refused".into(),
            });
        }

        let body = request.body.clone().unwrap_or(Value::Null);
        match (request.method, request.path) {
            ("GET", "/rest/system/resource") => {
                let (cpu, mem) = self.resource_reading();
                Ok(json!({
                    "cpu-load": cpu,
                    "free-memory": 100.0 - mem,
                    "total-memory": 100.0,
                    "uptime": "1h2m3s",
                    "version": "7.14.2",
                    "board-name": "CHR",
                }))
            }
            ("GET", "/rest/system/identity") => {
                Ok(json!({ "name": self.state.lock().identity }))
            }
            ("GET", "/rest/system/routerboard") => Ok(json!({ "serial-number": "SIM0001" })),
            ("GET", "/rest/ip/dns") => Ok(json!({ "servers": self.state.lock().dns.join(",") })),
            ("GET", "/rest/system/ntp/client") => {
                Ok(json!({ "servers": self.state.lock().ntp.join(",") }))
            }
            ("GET", "/rest/interface") => {
                let names: Vec<Value> = self
                    .state
                    .lock()
                    .interfaces
                    .iter()
                    .map(|n| json!({ "name": n }))
                    .collect();
                Ok(Value::Array(names))
            }
            ("GET", "/rest/ip/address") => {
                let rows: Vec<Value> = self
                    .state
                    .lock()
                    .addresses
                    .iter()
                    .map(|(a, i)| json!({ "address": a, "interface": i }))
                    .collect();
                Ok(Value::Array(rows))
            }
            ("GET", "/rest/ip/firewall/address-list") => {
                let rows: Vec<Value> = self
                    .state
                    .lock()
                    .address_list
                    .iter()
                    .map(|(l, a)| json!({ "list": l, "address": a }))
                    .collect();
                Ok(Value::Array(rows))
            }
            ("GET", "/rest/ip/firewall/filter") => Ok(json!([])),
            ("POST", "/rest/ip/dns/set") => {
                let servers = body["servers"].as_str().unwrap_or_default();
                self.state.lock().dns = servers.split(',').map(str::to_string).collect();
                Ok(json!({}))
            }
            ("POST", "/rest/system/ntp/client/set") => {
                let servers = body["servers"].as_str().unwrap_or_default();
                self.state.lock().ntp = servers.split(',').map(str::to_string).collect();
                Ok(json!({}))
            }
            ("POST", "/rest/system/identity/set") => {
                self.state.lock().identity = body["name"].as_str().unwrap_or_default().to_string();
                Ok(json!({}))
            }
            ("PUT", "/rest/ip/address") => {
                let address = body["address"].as_str().unwrap_or_default().to_string();
                let interface = body["interface"].as_str().unwrap_or_default().to_string();
                self.state.lock().addresses.push((address, interface));
                Ok(json!({}))
            }
            ("PUT", "/rest/ip/firewall/address-list") => {
                let list = body["list"].as_str().unwrap_or_default().to_string();
                let address = body["address"].as_str().unwrap_or_default().to_string();
                self.state.lock().address_list.push((list, address));
                Ok(json!({}))
            }
            (method, path) => Err(Error::InvalidRequest(format!(
                "sim device has no handler for {method} {path}"
            ))),
        }
    }

    async fn ssh(
        &self,
        device: &Device,
        _creds: &CredentialMaterial,
        command: &SshCommand,
        _timeout: Duration,
    ) -> Result<String> {
        if self.state.lock().ssh_down {
            return Err(Error::DeviceUnreachable {
                device: device.name.clone(),
                detail: "ssh connect failed: connection refused".into(),
            });
        }

        match command {
            SshCommand::SystemResourcePrint => {
                let (cpu, mem) = self.resource_reading();
                Ok(format!(
                    "uptime: 1h2m3s\ncpu-load: {cpu}%\nfree-memory: {}MiB\ntotal-memory: 100.0MiB\nversion: 7.14.2\nboard-name: CHR\n",
                    100.0 - mem
                ))
            }
            SshCommand::SystemIdentityPrint => {
                Ok(format!("name: {}\n", self.state.lock().identity))
            }
            SshCommand::DnsPrint => Ok(format!("servers: {}\n", self.state.lock().dns.join(","))),
            SshCommand::NtpPrint => Ok(format!("servers: {}\n", self.state.lock().ntp.join(","))),
            SshCommand::ExportCompact => Ok(self.export()),
            SshCommand::ImportScript { script } => {
                if self.state.lock().import_fails {
                    return Err(Error::DeviceError {
                        status: 0,
                        message: "script import rejected".into(),
                    });
                }
                self.import(script);
                Ok(String::new())
            }
            SshCommand::DnsSetServers { servers } => {
                self.state.lock().dns = servers.clone();
                Ok(String::new())
            }
            SshCommand::IdentitySet { name } => {
                self.state.lock().identity = name.clone();
                Ok(String::new())
            }
        }
    }
}
