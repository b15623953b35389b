//! Core types, traits, and error definitions for Codebox.
//!
//! This crate provides the building blocks shared by every layer of the
//! code-execution environment: the value and namespace model, code blocks,
//! session lifecycle states, the query bridge wire protocol, environment
//! configuration, and the traits for model backends and event emission.

pub mod config;
pub mod error;
pub mod events;
pub mod mocks;
pub mod tracing_layer;
pub mod traits;
pub mod types;
pub mod wire;

pub use error::{Error, Result};
pub use events::*;
pub use traits::*;
pub use types::*;
