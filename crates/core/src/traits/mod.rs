//! Core traits for Codebox.
//!
//! - `model`: the opaque model backend the query handler forwards to
//! - `events`: lifecycle event emission toward presentation collaborators

pub mod events;
pub mod model;

pub use events::*;
pub use model::*;
