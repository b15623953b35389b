//! Engine for a managed remote sandbox service.
//!
//! The service exposes a small HTTP API:
//!
//! | Method | Path                             | Body / result                          |
//! |--------|----------------------------------|----------------------------------------|
//! | GET    | `/v1/health`                     | 2xx when ready                         |
//! | POST   | `/v1/sandboxes`                  | `{image, timeout_secs}` → `{id}`       |
//! | PUT    | `/v1/sandboxes/{id}/files?path=` | raw bytes                              |
//! | GET    | `/v1/sandboxes/{id}/files?path=` | raw bytes                              |
//! | POST   | `/v1/sandboxes/{id}/exec`        | `{command, timeout_secs}` → exec result |
//! | DELETE | `/v1/sandboxes/{id}`             |                                        |

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use codebox_core::{BackendVariant, Error, RemoteOptions, Result, SessionId};

use crate::engine::{ExecResult, SandboxEngine, SandboxId, RUNNER_NAME};

const BASE_BACKOFF: Duration = Duration::from_millis(200);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct CreateRequest<'a> {
    image: &'a str,
    timeout_secs: u64,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Serialize)]
struct ExecRequest<'a> {
    command: &'a [String],
    timeout_secs: u64,
}

/// Sandbox engine backed by the remote service.
pub struct RemoteEngine {
    client: reqwest::Client,
    endpoint: String,
    options: RemoteOptions,
}

impl RemoteEngine {
    pub fn new(options: RemoteOptions) -> Result<Self> {
        let endpoint = url::Url::parse(&options.endpoint)
            .map_err(|e| Error::config(format!("invalid remote.endpoint '{}': {}", options.endpoint, e)))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::backend_init(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.as_str().trim_end_matches('/').to_string(),
            options,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.endpoint, path)
    }

    /// Send a request, retrying network errors and gateway failures with
    /// exponential backoff. Makes at most `request_retries + 1` attempts.
    async fn send<F>(&self, what: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let attempts = self.options.request_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = BASE_BACKOFF * 2u32.saturating_pow(attempt - 1);
                debug!(what, attempt, ?delay, "Retrying sandbox service call");
                tokio::time::sleep(delay).await;
            }

            let mut request = build(&self.client);
            if let Some(token) = &self.options.api_token {
                request = request.bearer_auth(token.expose_secret());
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if is_transient(resp.status()) => {
                    last_error = format!("service returned {}", resp.status());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(Error::execution_fault(format!(
                        "{} failed: service returned {}: {}",
                        what,
                        status,
                        body.trim()
                    )));
                }
                Err(e) => last_error = e.to_string(),
            }
            warn!(what, attempt, error = %last_error, "Sandbox service call failed");
        }

        Err(Error::execution_fault(format!(
            "{} failed after {} attempts: {}",
            what, attempts, last_error
        )))
    }

    async fn run_checked(&self, id: &SandboxId, command: Vec<String>) -> Result<()> {
        let result = self.exec(id, &command, CONTROL_TIMEOUT).await?;
        if !result.success() {
            return Err(Error::execution_fault(format!(
                "`{}` failed in sandbox (exit {}): {}",
                command.join(" "),
                result.exit_code,
                result.stderr.trim()
            )));
        }
        Ok(())
    }
}

fn is_transient(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

#[async_trait]
impl SandboxEngine for RemoteEngine {
    fn variant(&self) -> BackendVariant {
        BackendVariant::Remote
    }

    fn root(&self) -> &str {
        &self.options.workdir
    }

    async fn create(&self, session: &SessionId) -> Result<SandboxId> {
        let body = CreateRequest {
            image: &self.options.image,
            timeout_secs: self.options.sandbox_timeout_secs,
        };
        let created: CreateResponse = self
            .send("create sandbox", |c| c.post(self.url("sandboxes")).json(&body).timeout(CONTROL_TIMEOUT))
            .await
            .map_err(|e| Error::backend_init(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::backend_init(format!("malformed create response: {}", e)))?;
        let id = SandboxId(created.id);

        let mut mkdir = vec!["mkdir".to_string(), "-p".to_string()];
        mkdir.extend(["bin", "state", "jobs", "work"].iter().map(|d| self.sandbox_path(d)));
        if let Err(e) = self.run_checked(&id, mkdir).await {
            let _ = self.destroy(&id).await;
            return Err(Error::backend_init(e.to_string()));
        }

        info!(sandbox_id = %id, session_id = %session, endpoint = %self.endpoint, "Remote sandbox created");
        Ok(id)
    }

    async fn install_runner(&self, id: &SandboxId) -> Result<String> {
        let Some(local) = &self.options.runner_path else {
            // The image is expected to ship the runner on PATH.
            return Ok(RUNNER_NAME.to_string());
        };
        let binary = tokio::fs::read(local)
            .await
            .map_err(|e| Error::backend_init(format!("cannot read runner {}: {}", local.display(), e)))?;
        let rel = format!("bin/{}", RUNNER_NAME);
        self.write_file(id, &rel, &binary).await?;
        let target = self.sandbox_path(&rel);
        self.run_checked(id, vec!["chmod".to_string(), "755".to_string(), target.clone()])
            .await?;
        Ok(target)
    }

    async fn exec(&self, id: &SandboxId, command: &[String], timeout: Duration) -> Result<ExecResult> {
        let body = ExecRequest {
            command,
            timeout_secs: timeout.as_secs().max(1),
        };
        let response = self
            .send("exec", |c| {
                c.post(self.url(&format!("sandboxes/{}/exec", id)))
                    .json(&body)
                    .timeout(timeout + Duration::from_secs(10))
            })
            .await?;
        response
            .json::<ExecResult>()
            .await
            .map_err(|e| Error::execution_fault(format!("malformed exec response: {}", e)))
    }

    async fn write_file(&self, id: &SandboxId, path: &str, content: &[u8]) -> Result<()> {
        let target = self.sandbox_path(path);
        self.send("upload file", |c| {
            c.put(self.url(&format!("sandboxes/{}/files", id)))
                .query(&[("path", target.as_str())])
                .body(content.to_vec())
                .timeout(CONTROL_TIMEOUT)
        })
        .await?;
        Ok(())
    }

    async fn read_file(&self, id: &SandboxId, path: &str) -> Result<Vec<u8>> {
        let target = self.sandbox_path(path);
        let response = self
            .send("download file", |c| {
                c.get(self.url(&format!("sandboxes/{}/files", id)))
                    .query(&[("path", target.as_str())])
                    .timeout(CONTROL_TIMEOUT)
            })
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::execution_fault(format!("failed to download {}: {}", path, e)))?;
        Ok(bytes.to_vec())
    }

    async fn destroy(&self, id: &SandboxId) -> Result<()> {
        self.send("destroy sandbox", |c| {
            c.delete(self.url(&format!("sandboxes/{}", id))).timeout(CONTROL_TIMEOUT)
        })
        .await?;
        info!(sandbox_id = %id, "Remote sandbox destroyed");
        Ok(())
    }

    async fn is_available(&self) -> bool {
        match self
            .client
            .get(self.url("health"))
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Sandbox service unreachable");
                false
            }
        }
    }
}
