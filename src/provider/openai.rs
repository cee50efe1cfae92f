use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{RecallError, RecallResult};

use super::traits::{CompletionProvider, EmbeddingProvider};

/// Model tried once when the configured embedding deployment does not exist.
pub const FALLBACK_EMBEDDING_MODEL: &str = "text-embedding-ada-002";

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn has_version_suffix(base_url: &str) -> bool {
    let Some(last_segment) = base_url.rsplit('/').next() else {
        return false;
    };
    let Some(rest) = last_segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

fn endpoint(base_url: &str, path: &str) -> String {
    let normalized = normalize_base_url(base_url);
    if normalized.ends_with(path) {
        return normalized;
    }
    if has_version_suffix(&normalized) {
        return format!("{normalized}/{path}");
    }
    format!("{normalized}/v1/{path}")
}

/// Newlines degrade embedding quality on these endpoints.
fn sanitize(text: &str) -> String {
    text.replace('\n', " ")
}

fn deployment_missing(status: StatusCode, body: &str) -> bool {
    status == StatusCode::NOT_FOUND || body.contains("DeploymentNotFound")
}

fn status_error(service: &str, status: StatusCode, body: &str) -> RecallError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return RecallError::RateLimited {
            provider: service.into(),
            retry_after_ms: 5000,
        };
    }
    RecallError::Provider(format!("{service} API error {status}: {body}"))
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

enum Attempt {
    Done(Vec<Vec<f32>>),
    DeploymentMissing(String),
}

/// Embedding provider for OpenAI-compatible `/v1/embeddings` endpoints.
pub struct OpenAiEmbeddingProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    fallback_model: Option<String>,
}

impl OpenAiEmbeddingProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            model: "text-embedding-3-small".into(),
            fallback_model: Some(FALLBACK_EMBEDDING_MODEL.into()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = normalize_base_url(&base_url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// `None` disables the deployment fallback.
    pub fn with_fallback_model(mut self, model: Option<String>) -> Self {
        self.fallback_model = model;
        self
    }

    async fn request(&self, model: &str, input: &[String]) -> RecallResult<Attempt> {
        let response = self
            .client
            .post(endpoint(&self.base_url, "embeddings"))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": model, "input": input }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if deployment_missing(status, &body) {
                return Ok(Attempt::DeploymentMissing(format!(
                    "embedding deployment '{model}' not found ({status})"
                )));
            }
            return Err(status_error("embedding", status, &body));
        }

        let mut parsed: EmbeddingResponse = response.json().await?;
        if parsed.data.len() != input.len() {
            return Err(RecallError::Provider(format!(
                "embedding API returned {} vectors for {} inputs",
                parsed.data.len(),
                input.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index);
        Ok(Attempt::Done(
            parsed.data.into_iter().map(|d| d.embedding).collect(),
        ))
    }

    /// Primary model, then the fixed fallback model if the deployment is missing.
    async fn request_with_fallback(&self, input: &[String]) -> RecallResult<Vec<Vec<f32>>> {
        let reason = match self.request(&self.model, input).await? {
            Attempt::Done(vectors) => return Ok(vectors),
            Attempt::DeploymentMissing(reason) => reason,
        };

        let Some(fallback) = self
            .fallback_model
            .as_deref()
            .filter(|f| *f != self.model)
        else {
            return Err(RecallError::Provider(reason));
        };

        warn!(
            primary = %self.model,
            fallback,
            "primary embedding deployment failed, trying fallback"
        );
        match self.request(fallback, input).await? {
            Attempt::Done(vectors) => Ok(vectors),
            Attempt::DeploymentMissing(reason) => Err(RecallError::Provider(reason)),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, text: &str) -> RecallResult<Vec<f32>> {
        self.request_with_fallback(&[sanitize(text)])
            .await?
            .pop()
            .ok_or_else(|| RecallError::Provider("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> RecallResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let sanitized: Vec<String> = texts.iter().map(|t| sanitize(t)).collect();
        match self.request_with_fallback(&sanitized).await {
            Ok(vectors) => Ok(vectors),
            Err(e @ RecallError::RateLimited { .. }) => Err(e),
            Err(e) => {
                // e.g. context length exceeded for the combined payload
                warn!(error = %e, count = texts.len(), "batch embedding failed, embedding individually");
                let mut out = Vec::with_capacity(texts.len());
                for text in texts {
                    out.push(self.embed(text).await?);
                }
                Ok(out)
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Completion provider for OpenAI-compatible `/v1/chat/completions` endpoints.
pub struct OpenAiCompletionProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    system: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl OpenAiCompletionProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            model: "gpt-4o".into(),
            system: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = normalize_base_url(&base_url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn build_body(&self, prompt: &str) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &self.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = self.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompletionProvider {
    async fn complete(&self, prompt: &str) -> RecallResult<String> {
        let response = self
            .client
            .post(endpoint(&self.base_url, "chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&self.build_body(prompt))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("completion", status, &body));
        }

        let data: serde_json::Value = response.json().await?;
        if let Some(total) = data
            .get("usage")
            .and_then(|u| u.get("total_tokens"))
            .and_then(|v| v.as_u64())
        {
            debug!(model = %self.model, total_tokens = total, "completion usage");
        }

        data.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| RecallError::Provider("completion response has no content".into()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn embedding_body(vectors: &[&[f32]]) -> String {
        let data: Vec<serde_json::Value> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| json!({"object": "embedding", "index": i, "embedding": v}))
            .collect();
        json!({"data": data}).to_string()
    }

    #[test]
    fn endpoint_from_host_base_uses_v1() {
        assert_eq!(
            endpoint("https://api.openai.com", "embeddings"),
            "https://api.openai.com/v1/embeddings"
        );
        assert_eq!(
            endpoint("https://api.openai.com/", "chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn endpoint_keeps_version_suffix() {
        assert_eq!(
            endpoint("https://open.bigmodel.cn/api/paas/v4", "embeddings"),
            "https://open.bigmodel.cn/api/paas/v4/embeddings"
        );
        assert_eq!(
            endpoint("https://example.com/v1/embeddings", "embeddings"),
            "https://example.com/v1/embeddings"
        );
    }

    #[test]
    fn sanitize_replaces_newlines() {
        assert_eq!(sanitize("a\nb\n"), "a b ");
    }

    #[test]
    fn completion_body_includes_options() {
        let provider = OpenAiCompletionProvider::new("k")
            .with_model("gpt-4o-mini")
            .with_system("be brief")
            .with_temperature(0.5)
            .with_max_tokens(200);
        let body = provider.build_body("hello");
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["max_tokens"], 200);

        let plain = OpenAiCompletionProvider::new("k").build_body("hi");
        assert!(plain.get("temperature").is_none());
        assert_eq!(plain["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn embeds_batch_in_order() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/embeddings")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(
                json!({"model": "text-embedding-3-small", "input": ["a b", "c"]}),
            ))
            .with_status(200)
            .with_body(embedding_body(&[&[1.0, 0.0], &[0.0, 1.0]]))
            .create_async()
            .await;

        let provider = OpenAiEmbeddingProvider::new("sk-test").with_base_url(server.url());
        let vectors = provider
            .embed_batch(&["a\nb".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn falls_back_when_deployment_missing() {
        let mut server = mockito::Server::new_async().await;
        let primary = server
            .mock("POST", "/v1/embeddings")
            .match_body(Matcher::PartialJson(json!({"model": "custom-deploy"})))
            .with_status(404)
            .with_body(r#"{"error":{"code":"DeploymentNotFound"}}"#)
            .create_async()
            .await;
        let fallback = server
            .mock("POST", "/v1/embeddings")
            .match_body(Matcher::PartialJson(json!({"model": FALLBACK_EMBEDDING_MODEL})))
            .with_status(200)
            .with_body(embedding_body(&[&[0.25, 0.75]]))
            .create_async()
            .await;

        let provider = OpenAiEmbeddingProvider::new("k")
            .with_base_url(server.url())
            .with_model("custom-deploy");
        let vector = provider.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.25, 0.75]);
        primary.assert_async().await;
        fallback.assert_async().await;
    }

    #[tokio::test]
    async fn missing_deployment_without_fallback_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/embeddings")
            .with_status(404)
            .create_async()
            .await;

        let provider = OpenAiEmbeddingProvider::new("k")
            .with_base_url(server.url())
            .with_fallback_model(None);
        let err = provider.embed("hello").await.unwrap_err();
        assert!(matches!(err, RecallError::Provider(_)));
    }

    #[tokio::test]
    async fn rate_limit_maps_to_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/embeddings")
            .with_status(429)
            .expect(1)
            .create_async()
            .await;

        let provider = OpenAiEmbeddingProvider::new("k").with_base_url(server.url());
        let err = provider
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, RecallError::RateLimited { .. }));
        // No per-text retry storm after a 429.
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_propagates_as_provider_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/embeddings")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let provider = OpenAiEmbeddingProvider::new("k").with_base_url(server.url());
        let err = provider.embed("x").await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn completion_returns_message_content() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(Matcher::PartialJson(json!({"model": "gpt-4o"})))
            .with_status(200)
            .with_body(
                json!({
                    "choices": [{"message": {"role": "assistant", "content": "42"}}],
                    "usage": {"total_tokens": 7}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let provider = OpenAiCompletionProvider::new("k").with_base_url(server.url());
        assert_eq!(provider.complete("answer?").await.unwrap(), "42");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn completion_without_content_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices": []}"#)
            .create_async()
            .await;

        let provider = OpenAiCompletionProvider::new("k").with_base_url(server.url());
        assert!(provider.complete("x").await.is_err());
    }
}
