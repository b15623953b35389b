use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use codebox_core::config::HandlerConfig;
use codebox_core::{
    ModelBackend, QueryErrorKind, QueryOutcome, QueryPayload, QueryRequest, QueryResponse, QueryResult,
};

/// Host-side authority forwarding bridged queries to the model backend.
///
/// One instance is shared by every session. Backend calls are admitted
/// first-come-first-served through a fair semaphore, so no session can
/// starve another beyond the concurrency bound.
pub struct QueryHandler {
    backend: Arc<dyn ModelBackend>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    served: AtomicU64,
}

impl QueryHandler {
    pub fn new(backend: Arc<dyn ModelBackend>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            backend,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            served: AtomicU64::new(0),
        }
    }

    pub fn from_config(backend: Arc<dyn ModelBackend>, config: &HandlerConfig) -> Self {
        Self::new(backend, config.max_concurrent_queries)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Requests answered so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Answer one request. Backend failures become error responses.
    #[instrument(skip(self, request), fields(session_id = %request.session_id, request_id = %request.request_id, prompts = request.payload.prompt_count()))]
    pub async fn handle(&self, request: QueryRequest) -> QueryResponse {
        let outcome = match &request.payload {
            QueryPayload::Single { prompt } => match self.complete_one(prompt).await {
                Ok(result) => QueryOutcome::Single { result },
                Err(reason) => {
                    warn!(%reason, "Model backend failed");
                    QueryOutcome::Error {
                        error_kind: QueryErrorKind::Backend,
                        reason,
                    }
                }
            },
            QueryPayload::Batched { prompts } => self.complete_batch(prompts).await,
        };
        self.served.fetch_add(1, Ordering::Relaxed);
        debug!("Query answered");
        QueryResponse::for_request(&request, outcome)
    }

    async fn complete_one(&self, prompt: &str) -> Result<String, String> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| "query handler is shut down".to_string())?;
        self.backend.complete(prompt).await.map_err(|e| e.to_string())
    }

    async fn complete_batch(&self, prompts: &[String]) -> QueryOutcome {
        if prompts.is_empty() {
            return QueryOutcome::Batched { results: Vec::new() };
        }

        if self.backend.supports_batch() {
            let answered = match self.permits.acquire().await {
                Ok(_permit) => self.backend.complete_batch(prompts).await,
                Err(_) => {
                    return QueryOutcome::Error {
                        error_kind: QueryErrorKind::Backend,
                        reason: "query handler is shut down".to_string(),
                    }
                }
            };
            return match answered {
                Ok(results) if results.len() == prompts.len() => QueryOutcome::Batched {
                    results: results.into_iter().map(QueryResult::Ok).collect(),
                },
                Ok(results) => QueryOutcome::Error {
                    error_kind: QueryErrorKind::Backend,
                    reason: format!(
                        "model backend returned {} results for {} prompts",
                        results.len(),
                        prompts.len()
                    ),
                },
                Err(e) => {
                    warn!(error = %e, "Batch completion failed");
                    QueryOutcome::Error {
                        error_kind: QueryErrorKind::Backend,
                        reason: e.to_string(),
                    }
                }
            };
        }

        let answers = join_all(prompts.iter().map(|p| self.complete_one(p))).await;
        QueryOutcome::Batched {
            results: answers
                .into_iter()
                .map(|answer| match answer {
                    Ok(text) => QueryResult::Ok(text),
                    Err(reason) => QueryResult::Err(reason),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codebox_core::mocks::MockModel;
    use codebox_core::SessionId;
    use std::time::{Duration, Instant};

    fn handler(model: MockModel, max: usize) -> (Arc<MockModel>, QueryHandler) {
        let model = Arc::new(model);
        let handler = QueryHandler::new(model.clone(), max);
        (model, handler)
    }

    #[tokio::test]
    async fn test_single_query() {
        let (_, handler) = handler(MockModel::new().with_reply("ping", "pong"), 4);
        let request = QueryRequest::single(SessionId::new(), 1, "ping");
        let response = handler.handle(request.clone()).await;
        assert_eq!(response.request_id, request.request_id);
        assert_eq!(response.session_id, request.session_id);
        assert_eq!(response.into_single(), Ok("pong".to_string()));
        assert_eq!(handler.served(), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_is_error_response() {
        let (_, handler) = handler(MockModel::new().failing_on("boom"), 4);
        let response = handler.handle(QueryRequest::single(SessionId::new(), 1, "boom")).await;
        assert!(matches!(
            response.outcome,
            QueryOutcome::Error {
                error_kind: QueryErrorKind::Backend,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_batch_fan_out_keeps_order() {
        let model = MockModel::new()
            .with_delay_for("a", Duration::from_millis(60))
            .with_delay_for("b", Duration::from_millis(10))
            .failing_on("c");
        let (model, handler) = handler(model, 4);

        let prompts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let response = handler
            .handle(QueryRequest::batched(SessionId::new(), 1, prompts))
            .await;
        let results = response.into_batch(3);
        assert_eq!(results[0], Ok("echo: a".to_string()));
        assert_eq!(results[1], Ok("echo: b".to_string()));
        assert!(results[2].is_err());
        assert_eq!(model.call_count(), 3);
        assert_eq!(model.batch_call_count(), 0);
    }

    #[tokio::test]
    async fn test_native_batch_used_when_supported() {
        let (model, handler) = handler(MockModel::new().with_batch_support(), 4);
        let prompts = vec!["x".to_string(), "y".to_string()];
        let response = handler
            .handle(QueryRequest::batched(SessionId::new(), 1, prompts))
            .await;
        assert_eq!(
            response.into_batch(2),
            vec![Ok("echo: x".to_string()), Ok("echo: y".to_string())]
        );
        assert_eq!(model.batch_call_count(), 1);
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_native_batch_failure_repeats_reason() {
        let (_, handler) = handler(MockModel::new().with_batch_support().failing_on("bad"), 4);
        let prompts = vec!["ok".to_string(), "bad".to_string()];
        let results = handler
            .handle(QueryRequest::batched(SessionId::new(), 1, prompts))
            .await
            .into_batch(2);
        assert!(results.iter().all(|r| r.is_err()));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (model, handler) = handler(MockModel::new(), 1);
        let response = handler
            .handle(QueryRequest::batched(SessionId::new(), 1, Vec::new()))
            .await;
        assert!(response.into_batch(0).is_empty());
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let (_, handler) = handler(MockModel::new().with_delay(Duration::from_millis(50)), 1);
        let handler = Arc::new(handler);
        let started = Instant::now();
        let a = handler.handle(QueryRequest::single(SessionId::new(), 1, "a"));
        let b = handler.handle(QueryRequest::single(SessionId::new(), 1, "b"));
        let (a, b) = tokio::join!(a, b);
        assert!(a.into_single().is_ok());
        assert!(b.into_single().is_ok());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
