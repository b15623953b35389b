//! Core type definitions for Codebox.
//!
//! Broken down into submodules: values and namespaces (the state store),
//! code blocks, session identity and lifecycle, bridged queries, and the
//! per-session environment configuration.

pub mod block;
pub mod env_config;
pub mod namespace;
pub mod query;
pub mod session;
pub mod value;

pub use block::*;
pub use env_config::*;
pub use namespace::*;
pub use query::*;
pub use session::*;
pub use value::*;
