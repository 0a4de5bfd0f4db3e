use super::EmbeddingProvider;
use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const MAX_ERROR_BODY: usize = 500;

/// Client for Mistral-compatible `POST {endpoint}/embeddings` APIs.
///
/// One call is one HTTP request; pacing, batching and retries belong to the
/// adapter in front of it.
pub struct MistralEmbeddingClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
    /// `None` defers `MissingCredentials` to the first request, so commands
    /// that never embed work without a key
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl MistralEmbeddingClient {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("autocommit-rag/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EmbeddingError::Transient(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimension,
            api_key,
            timeout,
        })
    }

    /// Build from configuration, resolving the API key against the storage
    /// directory
    pub fn from_config(config: &EmbeddingConfig, storage_dir: &Path) -> Result<Self, EmbeddingError> {
        let api_key = match config.resolve_api_key(storage_dir) {
            Ok(key) => Some(key),
            Err(EmbeddingError::MissingCredentials) => {
                tracing::debug!("No embedding API key configured");
                None
            }
            Err(e) => return Err(e),
        };
        Self::new(
            config.endpoint.clone(),
            config.model_name.clone(),
            config.dimension,
            api_key,
            config.timeout(),
        )
    }

    fn classify_transport(&self, err: reqwest::Error) -> EmbeddingError {
        if err.is_timeout() {
            EmbeddingError::Timeout(self.timeout.as_secs())
        } else if err.is_decode() {
            EmbeddingError::InvalidResponse(err.to_string())
        } else {
            EmbeddingError::Transient(err.to_string())
        }
    }
}

/// Map a non-success HTTP status to an error
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    message: String,
) -> EmbeddingError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EmbeddingError::Unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS => EmbeddingError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT => EmbeddingError::Transient(message),
        s if s.is_server_error() => EmbeddingError::Transient(format!("{}: {}", s, message)),
        s => EmbeddingError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

/// `Retry-After` in its delay-seconds form
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

#[async_trait]
impl EmbeddingProvider for MistralEmbeddingClient {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(EmbeddingError::MissingCredentials)?;

        tracing::debug!("Requesting embeddings for {} texts", texts.len());

        let response = self
            .http
            .post(format!("{}/embeddings", self.endpoint))
            .bearer_auth(api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let mut message = response.text().await.unwrap_or_default();
            if message.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|&i| message.is_char_boundary(i))
                    .unwrap_or(0);
                message.truncate(cut);
            }
            return Err(classify_status(status, retry_after, message));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        if body.data.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.data.len()
            )));
        }

        let mut data = body.data;
        data.sort_by_key(|d| d.index);
        if data.iter().enumerate().any(|(i, d)| d.index != i) {
            return Err(EmbeddingError::InvalidResponse(
                "embedding indices do not cover the request".to_string(),
            ));
        }

        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, key: Option<&str>) -> MistralEmbeddingClient {
        MistralEmbeddingClient::new(
            format!("{}/v1/", server.uri()),
            "mistral-embed",
            3,
            key.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_embed_batch_success_sorted_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({
                "model": "mistral-embed",
                "input": ["first", "second"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "emb-1",
                "object": "list",
                "data": [
                    {"object": "embedding", "embedding": [0.0, 1.0, 0.0], "index": 1},
                    {"object": "embedding", "embedding": [1.0, 0.0, 0.0], "index": 0}
                ],
                "model": "mistral-embed",
                "usage": {"prompt_tokens": 4, "total_tokens": 4}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let vectors = client(&server, Some("test-key"))
            .embed_batch(&texts(&["first", "second"]))
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]);
    }

    #[tokio::test]
    async fn test_missing_key_never_calls_service() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = client(&server, None)
            .embed_batch(&texts(&["x"]))
            .await
            .unwrap_err();
        assert_eq!(err, EmbeddingError::MissingCredentials);
    }

    #[tokio::test]
    async fn test_empty_batch_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let vectors = client(&server, Some("k")).embed_batch(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&server)
            .await;

        let err = client(&server, Some("bad"))
            .embed_batch(&texts(&["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::Unauthorized(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_rate_limited_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let err = client(&server, Some("k"))
            .embed_batch(&texts(&["x"]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EmbeddingError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server, Some("k"))
            .embed_batch(&texts(&["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::Transient(_)));
    }

    #[tokio::test]
    async fn test_bad_request_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Too many tokens"))
            .mount(&server)
            .await;

        let err = client(&server, Some("k"))
            .embed_batch(&texts(&["x"]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EmbeddingError::Rejected {
                status: 400,
                message: "Too many tokens".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("this is not json {{{"))
            .mount(&server)
            .await;

        let err = client(&server, Some("k"))
            .embed_batch(&texts(&["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_count_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [1.0, 0.0, 0.0], "index": 0}]
            })))
            .mount(&server)
            .await;

        let err = client(&server, Some("k"))
            .embed_batch(&texts(&["a", "b"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let client = MistralEmbeddingClient::new(
            "http://127.0.0.1:9",
            "mistral-embed",
            3,
            Some("k".to_string()),
            Duration::from_secs(2),
        )
        .unwrap();
        let err = client.embed_batch(&texts(&["x"])).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, String::new()),
            EmbeddingError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT, None, String::new()),
            EmbeddingError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, None, String::new()),
            EmbeddingError::Rejected { status: 422, .. }
        ));
    }
}
