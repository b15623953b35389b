//! Query bridge for Codebox.
//!
//! Sandboxed code never talks to a model directly. Its queries travel over
//! the session's [`BridgeChannel`] (direct dispatch in-process, a framed TCP
//! listener for isolated sandboxes) to the shared [`QueryHandler`], the
//! only holder of a live [`ModelBackend`](codebox_core::ModelBackend).

pub mod channel;
pub mod codec;
pub mod handler;
pub mod model;

pub use channel::BridgeChannel;
pub use handler::QueryHandler;
pub use model::{build_model, OfflineModel, OpenAiCompatModel};
