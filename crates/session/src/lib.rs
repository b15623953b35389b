//! Session management for Codebox.
//!
//! A session binds one sandbox backend, one namespace and one bridge
//! channel together and walks them through the lifecycle:
//!
//! ```text
//! initializing -> ready -> executing -> ready -> ... -> closed
//!        \           \         \
//!         +-----------+---------+--> failed -> closed
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let handler = Arc::new(QueryHandler::new(model, 16));
//! let manager = SessionManager::new(handler, Arc::new(TracingEventEmitter), Arc::new(DefaultBackendFactory));
//!
//! let id = manager.create_session(EnvironmentConfig::default()).await?;
//! let block = manager.execute(&id, "x = 1 + 1\nprint(x)").await?;
//! manager.teardown(&id).await?;
//! ```

pub mod manager;
mod session;

pub use codebox_sandbox::{BackendFactory, DefaultBackendFactory};
pub use manager::SessionManager;
