//! Backend construction from an environment configuration.

use codebox_core::{BackendVariant, EnvironmentConfig, Result};

use crate::backend::SandboxBackend;
use crate::in_process::InProcessBackend;
use crate::isolated::IsolatedBackend;

/// Builds the backend for a new session.
pub trait BackendFactory: Send + Sync {
    fn create(&self, config: &EnvironmentConfig) -> Result<Box<dyn SandboxBackend>>;
}

/// Picks the backend matching `config.backend`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create(&self, config: &EnvironmentConfig) -> Result<Box<dyn SandboxBackend>> {
        Ok(match config.backend {
            BackendVariant::InProcess => {
                Box::new(InProcessBackend::new(config.in_process.clone(), config.limits.clone()))
            },
            BackendVariant::Container => Box::new(IsolatedBackend::container(config)?),
            BackendVariant::Remote => Box::new(IsolatedBackend::remote(config)?),
        })
    }
}
