//! Backend for the container-isolated and remote-isolated variants.
//!
//! Both variants run blocks the same way: push the namespace snapshot and a
//! job file into the sandbox, exec the runner, parse its outcome line and
//! pull the snapshot back. Only the [`SandboxEngine`] underneath differs.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use codebox_bridge::BridgeChannel;
use codebox_core::{BackendVariant, EnvironmentConfig, Error, Namespace, Result};
use codebox_runtime::{parse_outcome, RunnerJob};

use crate::backend::{BlockOutput, BlockRequest, CancelReason, ExecControl, SandboxBackend};
use crate::docker::DockerEngine;
use crate::engine::{SandboxEngine, SandboxId};
use crate::remote::RemoteEngine;

const SNAPSHOT_FILE: &str = "state/namespace.json";
const PID_FILE: &str = "state/runner.pid";

/// Extra time the engine exec gets beyond the block's own deadline.
const EXEC_SLACK: Duration = Duration::from_secs(30);

/// How long a killed runner has to exit before the sandbox is discarded.
const INTERRUPT_SETTLE: Duration = Duration::from_secs(5);

/// How the sandbox learns the bridge address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advertise {
    /// `host:<listener port>`.
    Host(String),
    /// A fixed `host:port`, e.g. a tunnel in front of the listener.
    Fixed(String),
}

impl Advertise {
    fn address(&self, listener: SocketAddr) -> String {
        match self {
            Advertise::Host(host) => format!("{}:{}", host, listener.port()),
            Advertise::Fixed(address) => address.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IsolatedOptions {
    pub bind: SocketAddr,
    pub advertise: Advertise,
    pub max_output_bytes: usize,
    pub max_memory_bytes: Option<usize>,
    pub connect_retries: u32,
}

impl IsolatedOptions {
    pub fn from_config(config: &EnvironmentConfig, advertise: Advertise) -> Result<Self> {
        Ok(Self {
            bind: config.bridge_bind_address()?,
            advertise,
            max_output_bytes: config.limits.max_output_bytes,
            max_memory_bytes: config.limits.max_memory_bytes,
            connect_retries: 3,
        })
    }
}

/// Drives the runner inside a sandbox provided by a [`SandboxEngine`].
pub struct IsolatedBackend {
    engine: Arc<dyn SandboxEngine>,
    options: IsolatedOptions,
    sandbox: Option<SandboxId>,
    runner: Option<String>,
    bridge_address: Option<String>,
    bridge_token: Option<String>,
}

impl IsolatedBackend {
    pub fn new(engine: Arc<dyn SandboxEngine>, options: IsolatedOptions) -> Self {
        Self {
            engine,
            options,
            sandbox: None,
            runner: None,
            bridge_address: None,
            bridge_token: None,
        }
    }

    /// Container-isolated backend on the local Docker daemon.
    pub fn container(config: &EnvironmentConfig) -> Result<Self> {
        let engine = DockerEngine::connect(config.container.clone())?;
        let options =
            IsolatedOptions::from_config(config, Advertise::Host(config.container.advertise_host.clone()))?;
        Ok(Self::new(Arc::new(engine), options))
    }

    /// Remote-isolated backend on a managed sandbox service.
    pub fn remote(config: &EnvironmentConfig) -> Result<Self> {
        let remote = config
            .remote
            .as_ref()
            .ok_or_else(|| Error::config("backend 'remote' requires a [remote] section"))?;
        let engine = RemoteEngine::new(remote.clone())?;
        let options = IsolatedOptions::from_config(config, Advertise::Fixed(remote.public_bridge_address.clone()))?;
        Ok(Self::new(Arc::new(engine), options))
    }

    /// Address handed to the runner, known once started.
    pub fn bridge_address(&self) -> Option<&str> {
        self.bridge_address.as_deref()
    }

    fn job(&self, block: &BlockRequest) -> RunnerJob {
        let path = |rel: &str| PathBuf::from(self.engine.sandbox_path(rel));
        RunnerJob {
            session_id: block.session_id.clone(),
            block: block.ordinal,
            code: block.code.clone(),
            snapshot_path: path(SNAPSHOT_FILE),
            workdir: Some(path("work")),
            bridge_address: self.bridge_address.clone(),
            bridge_token: self.bridge_token.clone(),
            query_timeout_ms: block.query_timeout.as_millis() as u64,
            connect_retries: self.options.connect_retries,
            execute_timeout_ms: block.execute_timeout.as_millis() as u64,
            max_output_bytes: self.options.max_output_bytes,
            max_memory_bytes: self.options.max_memory_bytes,
            pid_file: Some(path(PID_FILE)),
        }
    }

    async fn discard(&mut self) {
        if let Some(id) = self.sandbox.take() {
            if let Err(e) = self.engine.destroy(&id).await {
                warn!(sandbox = %id, error = %e, "Failed to destroy sandbox");
            }
        }
    }
}

#[async_trait]
impl SandboxBackend for IsolatedBackend {
    fn variant(&self) -> BackendVariant {
        self.engine.variant()
    }

    async fn start(&mut self, bridge: Arc<BridgeChannel>) -> Result<()> {
        if !self.engine.is_available().await {
            return Err(Error::backend_init(format!(
                "{} sandbox engine is not available",
                self.engine.variant()
            )));
        }

        let listener = bridge.listen(self.options.bind).await.map_err(|e| Error::backend_init(e.to_string()))?;
        let address = self.options.advertise.address(listener);

        let id = self
            .engine
            .create(bridge.session_id())
            .await
            .map_err(|e| match e {
                Error::BackendInit(_) => e,
                other => Error::backend_init(other.to_string()),
            })?;
        self.sandbox = Some(id.clone());

        match self.engine.install_runner(&id).await {
            Ok(runner) => self.runner = Some(runner),
            Err(e) => {
                self.discard().await;
                return Err(Error::backend_init(format!("failed to install runner: {}", e)));
            }
        }

        info!(sandbox = %id, variant = %self.engine.variant(), bridge = %address, "Isolated sandbox ready");
        self.bridge_address = Some(address);
        self.bridge_token = Some(bridge.token().to_string());
        Ok(())
    }

    async fn run_block(
        &mut self,
        namespace: &mut Namespace,
        block: &BlockRequest,
        ctl: &ExecControl,
    ) -> Result<BlockOutput> {
        let (id, runner) = match (&self.sandbox, &self.runner) {
            (Some(id), Some(runner)) => (id.clone(), runner.clone()),
            _ => return Err(Error::execution_fault("sandbox is not running")),
        };
        let engine = Arc::clone(&self.engine);

        engine.write_file(&id, SNAPSHOT_FILE, &namespace.encode()?).await?;
        let job = self.job(block);
        let job_file = format!("jobs/block-{}.json", block.ordinal);
        engine.write_file(&id, &job_file, job.to_json()?.as_bytes()).await?;

        let command = vec![runner, engine.sandbox_path(&job_file)];
        let exec = engine.exec(&id, &command, block.execute_timeout + EXEC_SLACK);
        tokio::pin!(exec);

        let raced = tokio::select! {
            result = &mut exec => Ok(result),
            reason = ctl.cancelled() => Err(reason),
        };

        let result = match raced {
            Ok(result) => result?,
            Err(reason) => {
                let pid_file = engine.sandbox_path(PID_FILE);
                let clean = match engine.interrupt(&id, &pid_file).await {
                    Ok(true) => tokio::time::timeout(INTERRUPT_SETTLE, &mut exec).await.is_ok(),
                    Ok(false) => false,
                    Err(e) => {
                        warn!(sandbox = %id, error = %e, "Runner interrupt failed");
                        false
                    }
                };
                if !clean {
                    debug!(sandbox = %id, "Discarding sandbox after cancellation");
                    self.discard().await;
                }
                return Ok(BlockOutput::cancelled(reason, clean));
            }
        };

        if result.timed_out {
            return Err(Error::execution_fault(format!(
                "sandbox runner did not finish within {:?}",
                block.execute_timeout + EXEC_SLACK
            )));
        }
        if !result.stderr.is_empty() {
            debug!(sandbox = %id, stderr = %result.stderr, "Runner stderr");
        }

        let outcome = parse_outcome(&result.stdout).map_err(|e| {
            Error::execution_fault(format!(
                "{} (exit code {}): {}",
                e,
                result.exit_code,
                result.stderr.trim()
            ))
        })?;

        if outcome.interrupted {
            let reason = ctl.reason().unwrap_or(CancelReason::TimedOut);
            let mut output = BlockOutput::cancelled(reason, true);
            output.stdout = outcome.stdout;
            output.stderr = outcome.stderr;
            return Ok(output);
        }

        if outcome.error.is_none() {
            let bytes = engine.read_file(&id, SNAPSHOT_FILE).await?;
            *namespace = Namespace::decode(&bytes)?;
        }

        Ok(BlockOutput::completed(
            outcome.stdout,
            outcome.stderr,
            outcome.return_value,
            outcome.error,
        ))
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.discard().await;
        self.runner = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertised_address() {
        let listener: SocketAddr = "0.0.0.0:41234".parse().unwrap();
        assert_eq!(
            Advertise::Host("host.docker.internal".into()).address(listener),
            "host.docker.internal:41234"
        );
        assert_eq!(
            Advertise::Fixed("tunnel.example.com:7000".into()).address(listener),
            "tunnel.example.com:7000"
        );
    }

    #[test]
    fn test_options_from_config() {
        let mut config = EnvironmentConfig::default();
        config.bridge_address = Some("127.0.0.1:9100".into());
        config.backend = BackendVariant::Container;
        config.limits.max_output_bytes = 4096;
        config.limits.max_memory_bytes = None;
        let options = IsolatedOptions::from_config(&config, Advertise::Host("h".into())).unwrap();
        assert_eq!(options.bind, "127.0.0.1:9100".parse::<SocketAddr>().unwrap());
        assert_eq!(options.max_output_bytes, 4096);
        assert_eq!(options.max_memory_bytes, None);
    }
}
