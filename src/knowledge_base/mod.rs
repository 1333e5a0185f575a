// Managed knowledge base module
// Retrieve and retrieve-and-generate calls against a Bedrock agent-runtime
// compatible endpoint, plus the managed QA system built on them


use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::KnowledgeBaseConfig;
use crate::model::{map_transport_error, run_blocking};
use crate::qa::{
    Answer, DEFAULT_PREVIEW_CHARS, QueryResult, Source, SourceMetadata, preview,
};
use crate::{QaError, Result};

pub const PAGE_NUMBER_KEY: &str = "x-amz-bedrock-kb-document-page-number";

/// Generated answer with the passages the service cited
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KbAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    /// Span of the answer this citation supports
    pub generated_text: String,
    pub references: Vec<RetrievedReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedReference {
    pub content: String,
    pub source_location: Option<String>,
    pub metadata: Map<String, Value>,
}

impl RetrievedReference {
    /// Page number recorded by the service at ingestion time
    #[inline]
    pub fn page_number(&self) -> Option<u32> {
        page_number(&self.metadata)
    }
}

/// One passage returned by a bare retrieval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedPassage {
    pub content: String,
    pub source_location: Option<String>,
    pub score: Option<f64>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveAndGenerateResponse {
    output: WireOutput,
    #[serde(default)]
    citations: Vec<WireCitation>,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireOutput {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCitation {
    generated_response_part: Option<WireGeneratedPart>,
    #[serde(default)]
    retrieved_references: Vec<WireReference>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireGeneratedPart {
    text_response_part: Option<WireOutput>,
}

#[derive(Debug, Deserialize)]
struct WireReference {
    content: Option<WireOutput>,
    location: Option<WireLocation>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLocation {
    s3_location: Option<WireUri>,
    web_location: Option<WireUrl>,
}

#[derive(Debug, Deserialize)]
struct WireUri {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct WireUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveResponse {
    #[serde(default)]
    retrieval_results: Vec<WireRetrievalResult>,
}

#[derive(Debug, Deserialize)]
struct WireRetrievalResult {
    content: Option<WireOutput>,
    location: Option<WireLocation>,
    score: Option<f64>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

impl WireLocation {
    fn into_uri(self) -> Option<String> {
        self.s3_location
            .map(|s3| s3.uri)
            .or_else(|| self.web_location.map(|web| web.url))
    }
}

impl From<WireReference> for RetrievedReference {
    fn from(wire: WireReference) -> Self {
        Self {
            content: wire.content.map(|c| c.text).unwrap_or_default(),
            source_location: wire.location.and_then(WireLocation::into_uri),
            metadata: wire.metadata,
        }
    }
}

impl From<WireCitation> for Citation {
    fn from(wire: WireCitation) -> Self {
        Self {
            generated_text: wire
                .generated_response_part
                .and_then(|part| part.text_response_part)
                .map(|part| part.text)
                .unwrap_or_default(),
            references: wire
                .retrieved_references
                .into_iter()
                .map(RetrievedReference::from)
                .collect(),
        }
    }
}

/// Client for the managed retrieval service
#[derive(Debug, Clone)]
pub struct KnowledgeBaseClient {
    endpoint: Url,
    knowledge_base_id: String,
    model_arn: String,
    max_results: u32,
    api_key: Option<String>,
    agent: ureq::Agent,
}

impl KnowledgeBaseClient {
    #[inline]
    pub fn new(config: &KnowledgeBaseConfig) -> Result<Self> {
        if config.knowledge_base_id.trim().is_empty() {
            return Err(QaError::Config(
                "knowledge base id is not configured (KNOWLEDGE_BASE_ID)".to_string(),
            ));
        }

        Ok(Self {
            endpoint: config.endpoint_url()?,
            knowledge_base_id: config.knowledge_base_id.clone(),
            model_arn: config.model_arn(),
            max_results: config.max_results,
            api_key: config.api_key.clone(),
            agent: build_agent(Duration::from_secs(config.timeout_seconds)),
        })
    }

    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    #[inline]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    #[inline]
    pub fn model_arn(&self) -> &str {
        &self.model_arn
    }

    /// Retrieve passages and generate an answer in one call
    #[inline]
    pub fn retrieve_and_generate(&self, query: &str) -> Result<KbAnswer> {
        let body = json!({
            "input": {"text": query},
            "retrieveAndGenerateConfiguration": {
                "type": "KNOWLEDGE_BASE",
                "knowledgeBaseConfiguration": {
                    "knowledgeBaseId": self.knowledge_base_id,
                    "modelArn": self.model_arn,
                    "retrievalConfiguration": {
                        "vectorSearchConfiguration": {"numberOfResults": self.max_results}
                    }
                }
            }
        });

        let url = self.url("/retrieveAndGenerate")?;
        debug!("retrieveAndGenerate against {}", url);
        let response: RetrieveAndGenerateResponse = self.post(&url, &body)?;

        let citations: Vec<Citation> = response
            .citations
            .into_iter()
            .map(Citation::from)
            .collect();
        debug!("Received answer with {} citations", citations.len());

        Ok(KbAnswer {
            answer: response.output.text,
            citations,
            session_id: response.session_id,
        })
    }

    /// Retrieve the `max_results` passages most relevant to `query`
    #[inline]
    pub fn retrieve(&self, query: &str, max_results: u32) -> Result<Vec<RetrievedPassage>> {
        let body = json!({
            "retrievalQuery": {"text": query},
            "retrievalConfiguration": {
                "vectorSearchConfiguration": {"numberOfResults": max_results}
            }
        });

        let url = self.url(&format!("/knowledgebases/{}/retrieve", self.knowledge_base_id))?;
        debug!("retrieve against {}", url);
        let response: RetrieveResponse = self.post(&url, &body)?;

        Ok(response
            .retrieval_results
            .into_iter()
            .map(|result| RetrievedPassage {
                content: result.content.map(|c| c.text).unwrap_or_default(),
                source_location: result.location.and_then(WireLocation::into_uri),
                score: result.score,
                metadata: result.metadata,
            })
            .collect())
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.endpoint
            .join(path)
            .map_err(|e| QaError::Config(format!("invalid knowledge base path {path}: {e}")))
    }

    fn post<T: serde::de::DeserializeOwned>(&self, url: &Url, body: &Value) -> Result<T> {
        let body = serde_json::to_string(body)
            .map_err(|e| QaError::Upstream(format!("could not encode request: {e}")))?;

        let mut request = self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let text = request
            .send(&body)
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .map_err(|e| {
                warn!("Knowledge base request to {} failed: {}", url, e);
                map_transport_error(&self.endpoint, &e)
            })?;

        serde_json::from_str(&text)
            .map_err(|e| QaError::Upstream(format!("malformed knowledge base response: {e}")))
    }
}

/// QA system backed entirely by the managed service
#[derive(Debug, Clone)]
pub struct ManagedQaSystem {
    client: Arc<KnowledgeBaseClient>,
    preview_chars: usize,
}

impl ManagedQaSystem {
    #[inline]
    pub fn new(client: KnowledgeBaseClient) -> Self {
        Self {
            client: Arc::new(client),
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_preview_chars(mut self, preview_chars: usize) -> Self {
        self.preview_chars = preview_chars;
        self
    }

    #[inline]
    pub fn client(&self) -> &KnowledgeBaseClient {
        &self.client
    }
}

#[async_trait]
impl Answer for ManagedQaSystem {
    async fn ask(&self, question: &str) -> Result<QueryResult> {
        let started = Instant::now();
        info!("Question: {}", question);

        let client = Arc::clone(&self.client);
        let query = question.to_string();
        let response = run_blocking(move || client.retrieve_and_generate(&query)).await?;

        let sources = response
            .citations
            .iter()
            .flat_map(|citation| &citation.references)
            .map(|reference| Source {
                content_preview: preview(&reference.content, self.preview_chars),
                metadata: SourceMetadata {
                    source_path: reference
                        .source_location
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                    page_number: reference.page_number(),
                },
            })
            .collect();

        let elapsed = started.elapsed();
        info!("Answered in {:.2}s", elapsed.as_secs_f64());

        Ok(QueryResult {
            question: question.to_string(),
            answer: response.answer,
            sources,
            elapsed,
            session_id: response.session_id,
        })
    }
}

/// Page numbers arrive as JSON numbers (often floats) or strings
fn page_number(metadata: &Map<String, Value>) -> Option<u32> {
    match metadata.get(PAGE_NUMBER_KEY)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
                    .map(|f| f as u64)
            })
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}
