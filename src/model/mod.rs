// Model client module
// Embedding and text generation against an Ollama-compatible endpoint

pub mod params;

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ModelConfig;
use crate::{QaError, Result};
pub use params::{GenerationOverrides, GenerationParams, ModelFamily};

const EXPONENTIAL_BACKOFF_BASE: u64 = 2;
const BACKOFF_UNIT_MS: u64 = 500;

/// Embedding and generation capabilities the pipeline depends on.
///
/// Implementations are blocking; async callers run them on the blocking pool.
pub trait LanguageModel: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    #[inline]
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }

    fn generate(&self, prompt: &str, overrides: &GenerationOverrides) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct ModelClient {
    base_url: Url,
    embedding_model: String,
    generation_model: String,
    generation: GenerationOverrides,
    agent: ureq::Agent,
    retry_attempts: u32,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize, PartialEq)]
struct GenerateOptions {
    num_predict: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

impl From<GenerationParams> for GenerateOptions {
    #[inline]
    fn from(params: GenerationParams) -> Self {
        Self {
            num_predict: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stop: params.stop,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

impl ModelClient {
    #[inline]
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let base_url = config.base_url()?;

        Ok(Self {
            base_url,
            embedding_model: config.embedding_model.clone(),
            generation_model: config.generation_model.clone(),
            generation: config.generation.clone(),
            agent: build_agent(Duration::from_secs(config.timeout_seconds)),
            retry_attempts: config.retry_attempts.max(1),
        })
    }

    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[inline]
    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    #[inline]
    pub fn generation_model(&self) -> &str {
        &self.generation_model
    }

    /// Check the endpoint is reachable and both configured models are served
    #[inline]
    pub fn health_check(&self) -> Result<()> {
        debug!("Performing health check for model endpoint at {}", self.base_url);

        let models = self.list_models()?;
        for wanted in [&self.embedding_model, &self.generation_model] {
            if !models.iter().any(|m| model_matches(&m.name, wanted)) {
                let available: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
                warn!(
                    "Model {} not found. Available models: {:?}",
                    wanted, available
                );
                return Err(QaError::Upstream(format!(
                    "model '{wanted}' is not available (available: {available:?})"
                )));
            }
        }

        info!(
            "Health check passed for {} (embedding: {}, generation: {})",
            self.base_url, self.embedding_model, self.generation_model
        );
        Ok(())
    }

    /// Check the endpoint responds at all
    #[inline]
    pub fn ping(&self) -> Result<()> {
        let url = self.endpoint("/api/tags")?;
        debug!("Pinging model endpoint at {}", url);

        self.make_request_with_retry(|| {
            self.agent
                .get(url.as_str())
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        debug!("Endpoint ping successful");
        Ok(())
    }

    #[inline]
    pub fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self.endpoint("/api/tags")?;
        debug!("Fetching available models from {}", url);

        let response_text = self.make_request_with_retry(|| {
            self.agent
                .get(url.as_str())
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let models: ModelsResponse = parse_response(&response_text, "model list")?;
        debug!("Found {} models", models.models.len());
        Ok(models.models)
    }

    fn request_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some(position) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(QaError::Upstream(format!(
                "empty input at position {position} cannot be embedded"
            )));
        }

        let request = EmbedRequest {
            model: &self.embedding_model,
            input: texts,
        };
        let request_json = serde_json::to_string(&request)
            .map_err(|e| QaError::Upstream(format!("could not encode embed request: {e}")))?;
        let url = self.endpoint("/api/embed")?;

        let response_text = self.make_request_with_retry(|| {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&request_json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let response: EmbedResponse = parse_response(&response_text, "embedding")?;

        if response.embeddings.len() != texts.len() {
            return Err(QaError::Upstream(format!(
                "Mismatch between request and response counts: {} vs {}",
                texts.len(),
                response.embeddings.len()
            )));
        }
        if response.embeddings.iter().any(Vec::is_empty) {
            return Err(QaError::Upstream(
                "endpoint returned an empty embedding".to_string(),
            ));
        }

        Ok(response.embeddings)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| QaError::Config(format!("invalid endpoint path {path}: {e}")))
    }

    fn make_request_with_retry<F>(&self, mut request_fn: F) -> Result<String>
    where
        F: FnMut() -> std::result::Result<String, ureq::Error>,
    {
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            debug!("HTTP request attempt {}/{}", attempt, self.retry_attempts);

            match request_fn() {
                Ok(response_text) => return Ok(response_text),
                Err(error) => {
                    let mapped = map_transport_error(&self.base_url, &error);

                    let retryable = match &error {
                        ureq::Error::StatusCode(status) => *status >= 500,
                        ureq::Error::ConnectionFailed
                        | ureq::Error::HostNotFound
                        | ureq::Error::Timeout(_)
                        | ureq::Error::Io(_) => true,
                        _ => false,
                    };

                    if !retryable {
                        warn!("Non-retryable error from {}: {}", self.base_url, error);
                        return Err(mapped);
                    }

                    warn!(
                        "Request error: {}, attempt {}/{}",
                        error, attempt, self.retry_attempts
                    );
                    last_error = Some(mapped);

                    if attempt < self.retry_attempts {
                        let delay = Duration::from_millis(
                            EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1) * BACKOFF_UNIT_MS,
                        );
                        debug!("Waiting {:?} before retry", delay);
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        if self.retry_attempts > 1 {
            error!("All retry attempts failed for request to {}", self.base_url);
        }

        Err(last_error
            .unwrap_or_else(|| QaError::Upstream("request failed after retries".to_string())))
    }
}

impl LanguageModel for ModelClient {
    #[inline]
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Embedding text ({} chars)", text.len());
        let mut embeddings = self.request_embeddings(&[text.to_string()])?;
        embeddings
            .pop()
            .ok_or_else(|| QaError::Upstream("endpoint returned no embedding".to_string()))
    }

    #[inline]
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Embedding batch of {} texts", texts.len());
        self.request_embeddings(texts)
    }

    #[inline]
    fn generate(&self, prompt: &str, overrides: &GenerationOverrides) -> Result<String> {
        let params = GenerationParams::resolve(
            &self.generation_model,
            &self.generation.merged_with(overrides),
        );
        debug!(
            "Generating with {} (max_tokens={}, temperature={})",
            self.generation_model, params.max_tokens, params.temperature
        );

        let request = GenerateRequest {
            model: &self.generation_model,
            prompt,
            stream: false,
            options: params.into(),
        };
        let request_json = serde_json::to_string(&request)
            .map_err(|e| QaError::Upstream(format!("could not encode generate request: {e}")))?;
        let url = self.endpoint("/api/generate")?;

        let response_text = self.make_request_with_retry(|| {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&request_json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let response: GenerateResponse = parse_response(&response_text, "generation")?;
        debug!("Generated {} chars", response.response.len());
        Ok(response.response)
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

fn parse_response<T: serde::de::DeserializeOwned>(text: &str, what: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| QaError::Upstream(format!("malformed {what} response: {e}")))
}

/// Map a transport failure onto the pipeline's error taxonomy
pub(crate) fn map_transport_error(base_url: &Url, error: &ureq::Error) -> QaError {
    match error {
        ureq::Error::Timeout(_) => QaError::Timeout(format!("{base_url}: {error}")),
        ureq::Error::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
            QaError::Timeout(format!("{base_url}: {error}"))
        }
        ureq::Error::StatusCode(status) => {
            QaError::Upstream(format!("{base_url} responded with HTTP {status}"))
        }
        _ => QaError::Upstream(format!("{base_url}: {error}")),
    }
}

/// Run a blocking model call on the blocking thread pool
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| QaError::Other(anyhow::anyhow!("blocking task failed: {e}")))?
}

/// Served names carry an implicit `:latest` tag
fn model_matches(served: &str, wanted: &str) -> bool {
    served == wanted
        || served.strip_suffix(":latest") == Some(wanted)
        || wanted.strip_suffix(":latest") == Some(served)
}
