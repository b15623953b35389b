use serde::{Deserialize, Serialize};

use crate::types::SessionId;

// =============================================================================
// Query Requests & Responses
// =============================================================================

/// Unique identifier of a bridged query.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Prompt payload of a query. The `kind` tag doubles as the batch flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryPayload {
    Single { prompt: String },
    Batched { prompts: Vec<String> },
}

impl QueryPayload {
    pub fn is_batched(&self) -> bool {
        matches!(self, QueryPayload::Batched { .. })
    }

    pub fn prompt_count(&self) -> usize {
        match self {
            QueryPayload::Single { .. } => 1,
            QueryPayload::Batched { prompts } => prompts.len(),
        }
    }
}

/// A privileged query issued by sandboxed code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub session_id: SessionId,
    pub request_id: RequestId,
    /// Ordinal of the block that issued the request.
    pub block: u64,
    pub payload: QueryPayload,
    /// Per-session secret required on connections to a bridge listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl QueryRequest {
    pub fn single(session_id: SessionId, block: u64, prompt: impl Into<String>) -> Self {
        Self {
            session_id,
            request_id: RequestId::new(),
            block,
            payload: QueryPayload::Single {
                prompt: prompt.into(),
            },
            token: None,
        }
    }

    pub fn batched(session_id: SessionId, block: u64, prompts: Vec<String>) -> Self {
        Self {
            session_id,
            request_id: RequestId::new(),
            block,
            payload: QueryPayload::Batched { prompts },
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

/// Per-prompt result inside a batched response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryResult {
    Ok(String),
    Err(String),
}

impl QueryResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, QueryResult::Ok(_))
    }

    pub fn into_result(self) -> std::result::Result<String, String> {
        match self {
            QueryResult::Ok(text) => Ok(text),
            QueryResult::Err(reason) => Err(reason),
        }
    }
}

/// Category of a query-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorKind {
    /// The model backend failed to answer.
    Backend,
    /// No response within the query timeout.
    Timeout,
    /// The bridge refused the request (wrong session, stale block, closed).
    Rejected,
    /// The request could not be delivered (network).
    Transport,
}

/// Outcome carried by a [`QueryResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryOutcome {
    Single { result: String },
    Batched { results: Vec<QueryResult> },
    Error { error_kind: QueryErrorKind, reason: String },
}

/// Response to exactly one [`QueryRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub outcome: QueryOutcome,
}

impl QueryResponse {
    pub fn for_request(request: &QueryRequest, outcome: QueryOutcome) -> Self {
        Self {
            session_id: request.session_id.clone(),
            request_id: request.request_id.clone(),
            outcome,
        }
    }

    pub fn error(request: &QueryRequest, error_kind: QueryErrorKind, reason: impl Into<String>) -> Self {
        Self::for_request(
            request,
            QueryOutcome::Error {
                error_kind,
                reason: reason.into(),
            },
        )
    }

    pub fn is_error(&self) -> bool {
        match &self.outcome {
            QueryOutcome::Error { .. } => true,
            QueryOutcome::Batched { results } => results.iter().any(|r| !r.is_ok()),
            QueryOutcome::Single { .. } => false,
        }
    }

    /// Interpret as the answer to a single prompt.
    pub fn into_single(self) -> std::result::Result<String, String> {
        match self.outcome {
            QueryOutcome::Single { result } => Ok(result),
            QueryOutcome::Batched { mut results } if results.len() == 1 => {
                results.remove(0).into_result()
            }
            QueryOutcome::Batched { results } => Err(format!(
                "expected a single result, got a batch of {}",
                results.len()
            )),
            QueryOutcome::Error { reason, .. } => Err(reason),
        }
    }

    /// Interpret as the answers to `expected` prompts, in order.
    ///
    /// A request-level error is repeated for every prompt.
    pub fn into_batch(self, expected: usize) -> Vec<std::result::Result<String, String>> {
        match self.outcome {
            QueryOutcome::Batched { results } if results.len() == expected => {
                results.into_iter().map(QueryResult::into_result).collect()
            }
            QueryOutcome::Batched { results } => vec![
                Err(format!(
                    "batch length mismatch: sent {}, received {}",
                    expected,
                    results.len()
                ));
                expected
            ],
            QueryOutcome::Single { result } if expected == 1 => vec![Ok(result)],
            QueryOutcome::Single { .. } => {
                vec![Err("expected a batch, got a single result".to_string()); expected]
            }
            QueryOutcome::Error { reason, .. } => vec![Err(reason); expected],
        }
    }
}
