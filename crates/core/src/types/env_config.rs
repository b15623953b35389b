//! Per-session environment configuration.

use secrecy::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::BackendVariant;

/// Configuration of one session. Validated at creation, immutable afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Isolation variant.
    pub backend: BackendVariant,
    /// Code run once when the session starts.
    pub setup_code: Option<String>,
    /// Initial namespace content.
    pub seed: Option<serde_json::Value>,
    /// Bind address of the bridge listener (isolated variants).
    /// Auto-assigned when absent.
    pub bridge_address: Option<String>,
    /// Timeout for one `execute` call.
    pub execute_timeout_ms: u64,
    /// Timeout for one query round trip.
    pub query_timeout_ms: u64,
    /// How long a cancelled backend may take to wind down.
    pub cancel_grace_ms: u64,
    /// Resource caps applied by every variant.
    pub limits: ExecutionLimits,
    pub in_process: InProcessOptions,
    pub container: ContainerOptions,
    pub remote: Option<RemoteOptions>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            backend: BackendVariant::InProcess,
            setup_code: None,
            seed: None,
            bridge_address: None,
            execute_timeout_ms: 60_000,
            query_timeout_ms: 300_000,
            cancel_grace_ms: 5_000,
            limits: ExecutionLimits::default(),
            in_process: InProcessOptions::default(),
            container: ContainerOptions::default(),
            remote: None,
        }
    }
}

impl EnvironmentConfig {
    /// Config for the given variant with every other field defaulted.
    pub fn for_variant(backend: BackendVariant) -> Self {
        Self {
            backend,
            ..Default::default()
        }
    }

    pub fn with_setup_code(mut self, code: impl Into<String>) -> Self {
        self.setup_code = Some(code.into());
        self
    }

    pub fn with_seed(mut self, seed: serde_json::Value) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_remote(mut self, remote: RemoteOptions) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Listener bind address, defaulting to an ephemeral port on all interfaces.
    pub fn bridge_bind_address(&self) -> Result<SocketAddr> {
        let raw = self.bridge_address.as_deref().unwrap_or("0.0.0.0:0");
        raw.parse()
            .map_err(|e| Error::config(format!("invalid bridge_address '{}': {}", raw, e)))
    }

    /// Check required fields and value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.execute_timeout_ms == 0 {
            return Err(Error::config("execute_timeout_ms must be greater than zero"));
        }
        if self.query_timeout_ms == 0 {
            return Err(Error::config("query_timeout_ms must be greater than zero"));
        }
        if let Some(code) = &self.setup_code {
            if code.trim().is_empty() {
                return Err(Error::config("setup_code must not be blank when present"));
            }
        }
        if self.bridge_address.is_some() {
            self.bridge_bind_address()?;
        }
        if self.limits.max_output_bytes == 0 {
            return Err(Error::config("limits.max_output_bytes must be greater than zero"));
        }

        match self.backend {
            BackendVariant::InProcess => Ok(()),
            BackendVariant::Container => self.container.validate(),
            BackendVariant::Remote => match &self.remote {
                Some(remote) => remote.validate(),
                None => Err(Error::config(
                    "backend 'remote' requires a [remote] section with endpoint and public_bridge_address",
                )),
            },
        }
    }
}

/// Interpreter limits, enforced in-process or by the runner inside the sandbox.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Cap on captured output per block.
    pub max_output_bytes: usize,
    /// Interpreter memory ceiling.
    pub max_memory_bytes: Option<usize>,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_output_bytes: 64 * 1024,
            max_memory_bytes: Some(256 * 1024 * 1024),
        }
    }
}

/// Options for the in-process variant.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InProcessOptions {
    /// Directory exposed to the file primitives. A private temporary
    /// directory is created when absent.
    pub workdir: Option<PathBuf>,
}

/// Options for the container-isolated variant.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerOptions {
    /// Base image reference.
    pub image: String,
    /// Maximum memory in bytes.
    pub memory_limit: i64,
    /// CPU quota per 100ms period.
    pub cpu_quota: i64,
    /// Maximum number of processes.
    pub pids_limit: i64,
    /// Host path of the runner binary installed into the container.
    /// Defaults to `codebox-runner` next to the current executable.
    pub runner_path: Option<PathBuf>,
    /// Hostname under which the container reaches the host bridge.
    pub advertise_host: String,
    /// Docker network mode. Must allow reaching the host.
    pub network: String,
    /// Container user. Defaults to the owner of the shared volume.
    pub user: Option<String>,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            image: "debian:bookworm-slim".to_string(),
            memory_limit: 512 * 1024 * 1024,
            cpu_quota: 100_000,
            pids_limit: 100,
            runner_path: None,
            advertise_host: "host.docker.internal".to_string(),
            network: "bridge".to_string(),
            user: None,
        }
    }
}

impl ContainerOptions {
    fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::config("container.image must not be empty"));
        }
        if self.memory_limit <= 0 || self.cpu_quota <= 0 || self.pids_limit <= 0 {
            return Err(Error::config(
                "container memory_limit, cpu_quota and pids_limit must be positive",
            ));
        }
        if self.network == "none" {
            return Err(Error::config(
                "container.network 'none' leaves the sandbox unable to reach the query bridge",
            ));
        }
        if self.advertise_host.trim().is_empty() {
            return Err(Error::config("container.advertise_host must not be empty"));
        }
        Ok(())
    }
}

/// Options for the remote-isolated variant.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteOptions {
    /// Base URL of the sandbox service.
    pub endpoint: String,
    /// Bearer token for the service.
    pub api_token: Option<Secret<String>>,
    /// Image requested for the sandbox.
    #[serde(default = "default_remote_image")]
    pub image: String,
    /// `host:port` at which the remote sandbox reaches this host's bridge.
    pub public_bridge_address: String,
    /// Working directory inside the remote sandbox.
    #[serde(default = "default_remote_workdir")]
    pub workdir: String,
    /// Runner binary uploaded into the sandbox.
    #[serde(default)]
    pub runner_path: Option<PathBuf>,
    /// Retries per service call after a network error or gateway failure.
    #[serde(default = "default_request_retries")]
    pub request_retries: u32,
    /// Lifetime requested for the remote sandbox.
    #[serde(default = "default_sandbox_timeout")]
    pub sandbox_timeout_secs: u64,
}

fn default_remote_image() -> String {
    "debian:bookworm-slim".to_string()
}

fn default_remote_workdir() -> String {
    "/codebox".to_string()
}

fn default_request_retries() -> u32 {
    3
}

fn default_sandbox_timeout() -> u64 {
    3600
}

impl RemoteOptions {
    pub fn new(endpoint: impl Into<String>, public_bridge_address: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_token: None,
            image: default_remote_image(),
            public_bridge_address: public_bridge_address.into(),
            workdir: default_remote_workdir(),
            runner_path: None,
            request_retries: default_request_retries(),
            sandbox_timeout_secs: default_sandbox_timeout(),
        }
    }

    fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.endpoint)
            .map_err(|e| Error::config(format!("invalid remote.endpoint '{}': {}", self.endpoint, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::config("remote.endpoint must be an http(s) URL"));
        }
        match self.public_bridge_address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => {
                return Err(Error::config(format!(
                    "remote.public_bridge_address '{}' must be host:port",
                    self.public_bridge_address
                )))
            }
        }
        if !self.workdir.starts_with('/') {
            return Err(Error::config("remote.workdir must be an absolute path"));
        }
        Ok(())
    }
}
