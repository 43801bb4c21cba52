//! The RouterOS client: REST preferred, SSH fallback, typed errors.
//!
//! A [`Transport`] performs raw REST/SSH exchanges; [`RouterOsClient`] owns
//! the per-device concurrency caps, the fallback decision, and the
//! pre/post-diff that computes `changed` for writes. Tests inject a fake
//! transport and exercise everything above the wire.

use std::collections::HashMap;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;
use uuid::Uuid;

use fg_domain::config::RouterOsConfig;
use fg_domain::credential::CredentialMaterial;
use fg_domain::device::Device;
use fg_domain::{Error, Result};

use crate::rest::{RestRequest, RosOp};
use crate::ssh::{self, SshCommand};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Rest,
    Ssh,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Rest => "rest",
            TransportKind::Ssh => "ssh",
        }
    }
}

/// Decrypted credentials for both transports. Either side may be absent.
#[derive(Debug, Default)]
pub struct CredentialSet {
    pub rest: Option<CredentialMaterial>,
    pub ssh: Option<CredentialMaterial>,
}

/// Result of one `call` envelope.
#[derive(Debug)]
pub struct CallOutcome {
    pub value: Value,
    /// `Some(changed)` for writes with a read-back; `None` for reads and
    /// section imports.
    pub changed: Option<bool>,
    pub transport: TransportKind,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Raw wire exchanges. Implemented by [`HttpSshTransport`] in production and
/// by fakes in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn rest(
        &self,
        device: &Device,
        creds: &CredentialMaterial,
        request: &RestRequest,
        timeout: Duration,
    ) -> Result<Value>;

    async fn ssh(
        &self,
        device: &Device,
        creds: &CredentialMaterial,
        command: &SshCommand,
        timeout: Duration,
    ) -> Result<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Production transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpSshTransport {
    http: reqwest::Client,
}

impl HttpSshTransport {
    pub fn new(config: &RouterOsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .pool_max_idle_per_host(config.pool_per_device)
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client build failed: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for HttpSshTransport {
    async fn rest(
        &self,
        device: &Device,
        creds: &CredentialMaterial,
        request: &RestRequest,
        timeout: Duration,
    ) -> Result<Value> {
        let url = format!(
            "https://{}:{}{}",
            device.endpoint.host, device.endpoint.rest_port, request.path
        );

        let mut req = match request.method {
            "GET" => self.http.get(&url),
            "POST" => self.http.post(&url),
            "PUT" => self.http.put(&url),
            "PATCH" => self.http.patch(&url),
            "DELETE" => self.http.delete(&url),
            other => return Err(Error::Internal(format!("unsupported method {other}"))),
        };
        req = req
            .basic_auth(&creds.username, Some(&creds.secret))
            .timeout(timeout);
        if let Some(ref body) = request.body {
            req = req.json(body);
        }

        let response = req
            .send()
            .await
            .map_err(|e| map_reqwest_error(&device.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(map_http_status(&device.name, status.as_u16(), message));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| Error::DeviceError {
                status: status.as_u16(),
                message: format!("invalid JSON from device: {e}"),
            })
    }

    async fn ssh(
        &self,
        device: &Device,
        creds: &CredentialMaterial,
        command: &SshCommand,
        timeout: Duration,
    ) -> Result<String> {
        let line = command.render()?;
        let host = device.endpoint.host.clone();
        let port = device.endpoint.ssh_port;
        let device_name = device.name.clone();
        let username = creds.username.clone();
        let secret = creds.secret.clone();

        // ssh2 is a blocking library; run the whole exchange off the
        // executor and race it against the deadline.
        let exchange = tokio::task::spawn_blocking(move || {
            run_ssh_exchange(&device_name, &host, port, &username, &secret, &line, timeout)
        });

        match tokio::time::timeout(timeout + Duration::from_secs(1), exchange).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::Internal(format!("ssh task failed: {join_err}"))),
            Err(_) => Err(Error::Timeout(format!(
                "ssh exchange with {} exceeded {}s",
                device.name,
                timeout.as_secs()
            ))),
        }
    }
}

fn run_ssh_exchange(
    device_name: &str,
    host: &str,
    port: u16,
    username: &str,
    secret: &str,
    line: &str,
    timeout: Duration,
) -> Result<String> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::DeviceUnreachable {
            device: device_name.to_string(),
            detail: format!("dns resolution failed: {e}"),
        })?
        .next()
        .ok_or_else(|| Error::DeviceUnreachable {
            device: device_name.to_string(),
            detail: "no address resolved".into(),
        })?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| Error::DeviceUnreachable {
        device: device_name.to_string(),
        detail: format!("ssh connect failed: {e}"),
    })?;
    tcp.set_read_timeout(Some(timeout)).ok();
    tcp.set_write_timeout(Some(timeout)).ok();

    let mut session = ssh2::Session::new().map_err(|e| Error::Internal(e.to_string()))?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| Error::DeviceUnreachable {
        device: device_name.to_string(),
        detail: format!("ssh handshake failed: {e}"),
    })?;

    session
        .userauth_password(username, secret)
        .map_err(|_| Error::AuthFailure(device_name.to_string()))?;

    let mut channel = session
        .channel_session()
        .map_err(|e| Error::DeviceError {
            status: 0,
            message: format!("ssh channel failed: {e}"),
        })?;
    channel.exec(line).map_err(|e| Error::DeviceError {
        status: 0,
        message: format!("ssh exec failed: {e}"),
    })?;

    let mut output = String::new();
    channel
        .read_to_string(&mut output)
        .map_err(|e| Error::DeviceError {
            status: 0,
            message: format!("ssh read failed: {e}"),
        })?;
    channel.wait_close().ok();

    Ok(output)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn map_reqwest_error(device_name: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("request to {device_name} timed out"))
    } else if e.is_connect() {
        Error::DeviceUnreachable {
            device: device_name.to_string(),
            detail: e.to_string(),
        }
    } else {
        Error::DeviceError {
            status: 0,
            message: e.to_string(),
        }
    }
}

fn map_http_status(device_name: &str, status: u16, message: String) -> Error {
    match status {
        401 | 403 => Error::AuthFailure(device_name.to_string()),
        400..=499 => Error::InvalidRequest(format!("device rejected request ({status}): {message}")),
        _ => Error::DeviceError { status, message },
    }
}

/// Fall back to SSH only on transport-level failure, never on auth or
/// device-side rejection.
fn should_fallback(err: &Error) -> bool {
    matches!(err, Error::DeviceUnreachable { .. } | Error::Timeout(_))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RouterOsClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Typed operations against devices, with per-device concurrency caps.
pub struct RouterOsClient {
    transport: Arc<dyn Transport>,
    config: RouterOsConfig,
    /// One semaphore per device. Requests beyond the cap queue here without
    /// blocking other devices.
    pools: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

impl RouterOsClient {
    pub fn new(transport: Arc<dyn Transport>, config: RouterOsConfig) -> Self {
        Self {
            transport,
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    fn pool(&self, device_id: Uuid) -> Arc<Semaphore> {
        self.pools
            .lock()
            .entry(device_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.pool_per_device)))
            .clone()
    }

    pub fn rest_timeout(&self) -> Duration {
        Duration::from_secs(self.config.rest_timeout_secs)
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.config.ssh_timeout_secs)
    }

    /// Perform one typed operation. Writes with a read-back run as
    /// read → write → read within a single envelope and report `changed`.
    pub async fn call(
        &self,
        device: &Device,
        creds: &CredentialSet,
        op: RosOp,
    ) -> Result<CallOutcome> {
        let pool = self.pool(device.id);
        let _permit = pool
            .acquire()
            .await
            .map_err(|_| Error::Internal("device pool closed".into()))?;

        if !op.is_write() {
            let (value, transport) = self.execute(device, creds, &op).await?;
            return Ok(CallOutcome {
                value,
                changed: None,
                transport,
            });
        }

        let read_back = op.read_back();
        let before = match read_back {
            Some(ref read) => Some(self.execute(device, creds, read).await?.0),
            None => None,
        };

        let (_, transport) = self.execute(device, creds, &op).await?;

        match read_back {
            Some(read) => {
                let (after, _) = self.execute(device, creds, &read).await?;
                let changed = before.as_ref() != Some(&after);
                Ok(CallOutcome {
                    value: after,
                    changed: Some(changed),
                    transport,
                })
            }
            None => Ok(CallOutcome {
                value: Value::Null,
                changed: None,
                transport,
            }),
        }
    }

    /// One REST-or-SSH exchange with the fallback decision.
    async fn execute(
        &self,
        device: &Device,
        creds: &CredentialSet,
        op: &RosOp,
    ) -> Result<(Value, TransportKind)> {
        let rest_attempt = match (op.rest_request(), creds.rest.as_ref()) {
            (Some(request), Some(material)) => Some(
                self.transport
                    .rest(device, material, &request, self.rest_timeout())
                    .await,
            ),
            _ => None,
        };

        match rest_attempt {
            Some(Ok(value)) => return Ok((value, TransportKind::Rest)),
            Some(Err(err)) if !should_fallback(&err) => return Err(err),
            Some(Err(err)) => {
                tracing::debug!(
                    device = %device.name,
                    op = op.name(),
                    error = %err,
                    "rest transport failed, trying ssh fallback"
                );
            }
            None => {}
        }

        let command = op.ssh_command().ok_or_else(|| Error::DeviceUnreachable {
            device: device.name.clone(),
            detail: "rest transport failed and operation has no ssh fallback".into(),
        })?;
        let material = creds.ssh.as_ref().ok_or_else(|| Error::CredentialNotFound {
            device: device.name.clone(),
            kind: "ssh".into(),
        })?;

        let output = self
            .transport
            .ssh(device, material, &command, self.ssh_timeout())
            .await?;

        let value = match command {
            SshCommand::ExportCompact | SshCommand::ImportScript { .. } => Value::String(output),
            _ => ssh::parse_print_output(&output),
        };
        Ok((value, TransportKind::Ssh))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use fg_domain::device::{Endpoint, Environment};
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    fn device() -> Device {
        Device::new(
            "r1".into(),
            Endpoint {
                host: "10.0.0.1".into(),
                rest_port: 443,
                ssh_port: 22,
            },
            Environment::Lab,
        )
    }

    fn creds() -> CredentialSet {
        CredentialSet {
            rest: Some(CredentialMaterial {
                username: "svc".into(),
                secret: "pw".into(),
            }),
            ssh: Some(CredentialMaterial {
                username: "svc".into(),
                secret: "pw".into(),
            }),
        }
    }

    /// Scriptable fake transport: REST behavior per call index, SSH always
    /// answers with canned print output.
    struct FakeTransport {
        rest_responses: PlMutex<Vec<Result<Value>>>,
        rest_calls: PlMutex<Vec<String>>,
        ssh_calls: PlMutex<Vec<String>>,
        ssh_output: String,
    }

    impl FakeTransport {
        fn new(rest_responses: Vec<Result<Value>>) -> Self {
            Self {
                rest_responses: PlMutex::new(rest_responses),
                rest_calls: PlMutex::new(Vec::new()),
                ssh_calls: PlMutex::new(Vec::new()),
                ssh_output: "cpu-load: 3%\nfree-memory: 100\n".into(),
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn rest(
            &self,
            _device: &Device,
            _creds: &CredentialMaterial,
            request: &RestRequest,
            _timeout: Duration,
        ) -> Result<Value> {
            self.rest_calls.lock().push(request.path.to_string());
            let mut responses = self.rest_responses.lock();
            if responses.is_empty() {
                Ok(json!({}))
            } else {
                responses.remove(0)
            }
        }

        async fn ssh(
            &self,
            _device: &Device,
            _creds: &CredentialMaterial,
            command: &SshCommand,
            _timeout: Duration,
        ) -> Result<String> {
            self.ssh_calls.lock().push(command.id().to_string());
            Ok(self.ssh_output.clone())
        }
    }

    fn client(transport: FakeTransport) -> (RouterOsClient, Arc<FakeTransport>) {
        let transport = Arc::new(transport);
        (
            RouterOsClient::new(transport.clone(), RouterOsConfig::default()),
            transport,
        )
    }

    #[tokio::test]
    async fn read_uses_rest() {
        let (client, fake) = client(FakeTransport::new(vec![Ok(json!({"servers": "8.8.8.8"}))]));
        let outcome = client.call(&device(), &creds(), RosOp::DnsGet).await.unwrap();
        assert_eq!(outcome.transport, TransportKind::Rest);
        assert_eq!(outcome.value["servers"], "8.8.8.8");
        assert!(outcome.changed.is_none());
        assert!(fake.ssh_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_falls_back_to_ssh() {
        let (client, fake) = client(FakeTransport::new(vec![Err(Error::DeviceUnreachable {
            device: "r1".into(),
            detail: "connect refused".into(),
        })]));
        let outcome = client
            .call(&device(), &creds(), RosOp::SystemResource)
            .await
            .unwrap();
        assert_eq!(outcome.transport, TransportKind::Ssh);
        assert_eq!(outcome.value["cpu-load"], "3%");
        assert_eq!(fake.ssh_calls.lock().as_slice(), ["system_resource_print"]);
    }

    #[tokio::test]
    async fn auth_failure_does_not_fall_back() {
        let (client, fake) = client(FakeTransport::new(vec![Err(Error::AuthFailure("r1".into()))]));
        let err = client
            .call(&device(), &creds(), RosOp::SystemResource)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailure(_)));
        assert!(fake.ssh_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn write_reports_changed_true() {
        // before read, write, after read.
        let (client, fake) = client(FakeTransport::new(vec![
            Ok(json!({"servers": "8.8.8.8,8.8.4.4"})),
            Ok(json!({})),
            Ok(json!({"servers": "1.1.1.1,1.0.0.1"})),
        ]));
        let outcome = client
            .call(
                &device(),
                &creds(),
                RosOp::DnsSetServers {
                    servers: vec!["1.1.1.1".into(), "1.0.0.1".into()],
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.changed, Some(true));
        assert_eq!(outcome.value["servers"], "1.1.1.1,1.0.0.1");
        assert_eq!(
            fake.rest_calls.lock().as_slice(),
            ["/rest/ip/dns", "/rest/ip/dns/set", "/rest/ip/dns"]
        );
    }

    #[tokio::test]
    async fn idempotent_write_reports_changed_false() {
        let desired = json!({"servers": "1.1.1.1,1.0.0.1"});
        let (client, _) = client(FakeTransport::new(vec![
            Ok(desired.clone()),
            Ok(json!({})),
            Ok(desired),
        ]));
        let outcome = client
            .call(
                &device(),
                &creds(),
                RosOp::DnsSetServers {
                    servers: vec!["1.1.1.1".into(), "1.0.0.1".into()],
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.changed, Some(false));
    }

    #[tokio::test]
    async fn missing_ssh_credential_surfaces_typed_error() {
        let (client, _) = client(FakeTransport::new(vec![]));
        let mut creds = creds();
        creds.rest = None;
        creds.ssh = None;
        let err = client
            .call(&device(), &creds, RosOp::SystemResource)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CredentialNotFound { .. }));
    }

    #[tokio::test]
    async fn http_status_mapping() {
        assert!(matches!(
            map_http_status("r1", 401, String::new()),
            Error::AuthFailure(_)
        ));
        assert!(matches!(
            map_http_status("r1", 404, String::new()),
            Error::InvalidRequest(_)
        ));
        assert!(matches!(
            map_http_status("r1", 500, String::new()),
            Error::DeviceError { status: 500, .. }
        ));
    }

    #[test]
    fn fallback_only_on_transport_errors() {
        assert!(should_fallback(&Error::Timeout("x".into())));
        assert!(should_fallback(&Error::DeviceUnreachable {
            device: "r1".into(),
            detail: "refused".into()
        }));
        assert!(!should_fallback(&Error::AuthFailure("r1".into())));
        assert!(!should_fallback(&Error::DeviceError {
            status: 500,
            message: "x".into()
        }));
    }
}
