//! Model backend adapters.

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use codebox_core::config::ModelConfig;
use codebox_core::{Error, ModelBackend, Result};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatModel {
    client: reqwest::Client,
    endpoint: Url,
    model: String,
    api_key: Option<Secret<String>>,
}

impl OpenAiCompatModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let base = config.base_url.trim_end_matches('/');
        let endpoint = Url::parse(&format!("{}/chat/completions", base))
            .map_err(|e| Error::config(format!("invalid model base_url '{}': {}", config.base_url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::model_backend(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatModel {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::model_backend(format!("request to {} failed: {}", self.endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::model_backend(format!(
                "model endpoint returned {}: {}",
                status,
                detail.chars().take(500).collect::<String>()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::model_backend(format!("unreadable completion: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| Error::model_backend("completion contained no message content"))
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Backend used when no model is configured. Every query fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineModel;

#[async_trait]
impl ModelBackend for OfflineModel {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(Error::model_backend("no model backend is configured"))
    }

    fn name(&self) -> &str {
        "offline"
    }
}

/// Build the model backend described by the host configuration.
pub fn build_model(config: Option<&ModelConfig>) -> Result<Arc<dyn ModelBackend>> {
    match config {
        Some(config) => Ok(Arc::new(OpenAiCompatModel::new(config)?)),
        None => Ok(Arc::new(OfflineModel)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn fake_completions(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer sk-test") {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"})));
        }
        let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();
        let reply = format!("{} says {}", body["model"].as_str().unwrap_or_default(), prompt);
        (
            StatusCode::OK,
            Json(json!({"choices": [{"message": {"role": "assistant", "content": reply}}]})),
        )
    }

    async fn serve() -> String {
        let app = Router::new().route("/v1/chat/completions", post(fake_completions));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    fn config(base_url: String, key: Option<&str>) -> ModelConfig {
        ModelConfig {
            base_url,
            model: "tiny".to_string(),
            api_key: key.map(|k| Secret::new(k.to_string())),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_openai_compatible_completion() {
        let base = serve().await;
        let model = OpenAiCompatModel::new(&config(base, Some("sk-test"))).unwrap();
        assert_eq!(model.complete("hello").await.unwrap(), "tiny says hello");
        assert_eq!(model.name(), "tiny");
    }

    #[tokio::test]
    async fn test_http_error_is_backend_error() {
        let base = serve().await;
        let model = OpenAiCompatModel::new(&config(base, None)).unwrap();
        let err = model.complete("hello").await.unwrap_err();
        assert!(matches!(err, Error::ModelBackend(_)));
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn test_offline_model_fails() {
        let model = build_model(None).unwrap();
        assert_eq!(model.name(), "offline");
        assert!(model.complete("x").await.is_err());
    }

    #[test]
    fn test_invalid_base_url() {
        let result = OpenAiCompatModel::new(&config("not a url".to_string(), None));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
