//! External collaborators invoked by the stage workers.
//!
//! The metadata resolver and the inference provider are separate services
//! reached over HTTP/JSON. Stage handlers only see the traits.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use tscribe_models::{DialogueTurn, MediaMetadata, MediaSource, ProviderConfig};

use crate::error::{WorkerError, WorkerResult};
use crate::prompt::{CompiledPrompt, PROMPT_VERSION};

/// Resolves structured metadata for a media source.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, media: &MediaSource) -> WorkerResult<MediaMetadata>;
}

/// Turns a compiled prompt into dialogue turns.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn infer(&self, prompt: &CompiledPrompt) -> WorkerResult<Vec<DialogueTurn>>;

    /// Settings recorded on every execution artifact.
    fn provider_config(&self) -> ProviderConfig;
}

#[derive(Debug, Serialize)]
struct ResolveRequest<'a> {
    media: &'a MediaSource,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    turns: Vec<DialogueTurn>,
}

/// Metadata resolver service client (`POST {base}/resolve`).
#[derive(Debug, Clone)]
pub struct HttpMetadataResolver {
    base_url: String,
    client: Client,
}

impl HttpMetadataResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    pub fn from_env() -> WorkerResult<Self> {
        let base_url = std::env::var("METADATA_RESOLVER_URL")
            .map_err(|_| WorkerError::config_error("METADATA_RESOLVER_URL not set"))?;
        Ok(Self::new(base_url))
    }
}

#[async_trait]
impl MetadataResolver for HttpMetadataResolver {
    async fn resolve(&self, media: &MediaSource) -> WorkerResult<MediaMetadata> {
        let url = format!("{}/resolve", self.base_url);
        debug!(kind = media.kind(), "Resolving media metadata");

        let response = self
            .client
            .post(&url)
            .json(&ResolveRequest { media })
            .send()
            .await
            .map_err(|e| WorkerError::metadata_failed(format!("resolver request failed: {}", e)))?;

        let response = check_status(response, "metadata").await?;

        response
            .json()
            .await
            .map_err(|e| WorkerError::metadata_failed(format!("Failed to parse resolver response: {}", e)))
    }
}

/// Inference service client (`POST {base}/infer`).
#[derive(Debug, Clone)]
pub struct HttpInferenceProvider {
    base_url: String,
    config: ProviderConfig,
    client: Client,
}

impl HttpInferenceProvider {
    pub fn new(base_url: impl Into<String>, config: ProviderConfig) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            config,
            client: Client::new(),
        }
    }

    pub fn from_env() -> WorkerResult<Self> {
        let base_url = std::env::var("INFERENCE_PROVIDER_URL")
            .map_err(|_| WorkerError::config_error("INFERENCE_PROVIDER_URL not set"))?;

        let config = ProviderConfig {
            provider: std::env::var("INFERENCE_PROVIDER_NAME").unwrap_or_else(|_| "http".to_string()),
            model: std::env::var("INFERENCE_MODEL").unwrap_or_else(|_| "default".to_string()),
            prompt_version: PROMPT_VERSION.to_string(),
            temperature: std::env::var("INFERENCE_TEMPERATURE")
                .ok()
                .and_then(|s| s.parse().ok()),
        };

        Ok(Self::new(base_url, config))
    }
}

#[async_trait]
impl InferenceProvider for HttpInferenceProvider {
    async fn infer(&self, prompt: &CompiledPrompt) -> WorkerResult<Vec<DialogueTurn>> {
        let url = format!("{}/infer", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("x-model", &self.config.model)
            .json(prompt)
            .send()
            .await
            .map_err(|e| WorkerError::inference_failed(format!("inference request failed: {}", e)))?;

        let response = check_status(response, "inference").await?;

        let body: InferResponse = response
            .json()
            .await
            .map_err(|e| WorkerError::inference_failed(format!("Failed to parse inference response: {}", e)))?;

        if body.turns.is_empty() {
            return Err(WorkerError::inference_failed("No turns in inference response"));
        }

        debug!(job_id = %prompt.job_id, turns = body.turns.len(), "Inference returned");
        Ok(body.turns)
    }

    fn provider_config(&self) -> ProviderConfig {
        self.config.clone()
    }
}

/// 4xx other than 408/429 is a permanent rejection; anything else is transient.
async fn check_status(response: Response, service: &'static str) -> WorkerResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", service, status, error_text);

    let transient = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;

    if !transient && status.is_client_error() {
        return Err(WorkerError::rejected(service, message));
    }

    Err(match service {
        "metadata" => WorkerError::metadata_failed(message),
        _ => WorkerError::inference_failed(message),
    })
}
