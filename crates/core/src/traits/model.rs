//! Model backend trait.

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Model backend interface.
///
/// The query handler is the only component holding a live handle to an
/// implementation. Sandboxes never reach it directly.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Answer a single prompt.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Answer several prompts in one logical call, in order.
    ///
    /// Only called when [`supports_batch`](Self::supports_batch) is true.
    async fn complete_batch(&self, prompts: &[String]) -> Result<Vec<String>> {
        let _ = prompts;
        Err(Error::model_backend("batch completion is not supported"))
    }

    /// Whether [`complete_batch`](Self::complete_batch) is implemented.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Name used in logs.
    fn name(&self) -> &str {
        "model"
    }
}
