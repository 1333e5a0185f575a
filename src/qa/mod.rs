// QA orchestration module
// Embed, retrieve, prompt and generate over the local vector index

pub mod prompt;


use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::Config;
use crate::documents::{self, Chunk};
use crate::documents::splitter::ChunkingConfig;
use crate::index::{IndexPhase, SearchHit, VectorIndex};
use crate::model::{GenerationOverrides, LanguageModel, ModelClient, run_blocking};
use crate::{QaError, Result};
use prompt::{PromptTemplate, format_context};

pub const DEFAULT_TOP_K: usize = 3;
pub const DEFAULT_PREVIEW_CHARS: usize = 300;

/// Where a source passage came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub source_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub content_preview: String,
    pub metadata: SourceMetadata,
}

/// Answer to one question together with the passages it was conditioned on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub question: String,
    pub answer: String,
    pub sources: Vec<Source>,
    #[serde(rename = "elapsed_secs", with = "duration_secs")]
    pub elapsed: Duration,
    /// Conversation handle returned by the managed service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Anything that turns a question into a [`QueryResult`]
#[async_trait]
pub trait Answer: Send + Sync {
    async fn ask(&self, question: &str) -> Result<QueryResult>;
}

/// Local retrieval-augmented QA over a [`VectorIndex`]
pub struct QaSystem {
    model: Arc<dyn LanguageModel>,
    template: PromptTemplate,
    generation: GenerationOverrides,
    top_k: usize,
    preview_chars: usize,
    phase: Mutex<IndexPhase>,
    index: OnceCell<VectorIndex>,
}

impl std::fmt::Debug for QaSystem {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QaSystem")
            .field("top_k", &self.top_k)
            .field("preview_chars", &self.preview_chars)
            .field("phase", &self.phase())
            .field("index", &self.index.get())
            .finish_non_exhaustive()
    }
}

impl QaSystem {
    #[inline]
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            template: PromptTemplate::default(),
            generation: GenerationOverrides::default(),
            top_k: DEFAULT_TOP_K,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            phase: Mutex::new(IndexPhase::Uninitialized),
            index: OnceCell::new(),
        }
    }

    /// A system talking to the configured model endpoint, not yet initialized
    #[inline]
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = ModelClient::new(&config.model)?;
        Ok(Self::new(Arc::new(client))
            .with_top_k(config.retrieval.top_k)
            .with_preview_chars(config.retrieval.preview_chars)
            .with_generation_overrides(config.model.generation.clone()))
    }

    /// Attach an index that is already open
    #[inline]
    #[must_use]
    pub fn with_index(self, index: VectorIndex) -> Self {
        let Self {
            model,
            template,
            generation,
            top_k,
            preview_chars,
            ..
        } = self;
        Self {
            model,
            template,
            generation,
            top_k,
            preview_chars,
            phase: Mutex::new(IndexPhase::Ready),
            index: OnceCell::new_with(Some(index)),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_preview_chars(mut self, preview_chars: usize) -> Self {
        self.preview_chars = preview_chars;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = template;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_generation_overrides(mut self, overrides: GenerationOverrides) -> Self {
        self.generation = overrides;
        self
    }

    #[inline]
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    #[inline]
    pub fn phase(&self) -> IndexPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn index(&self) -> Option<&VectorIndex> {
        self.index.get()
    }

    /// Load the index at `index_path` or build it from `chunks`.
    ///
    /// Does nothing once the system is ready. A failed attempt leaves the
    /// system uninitialized.
    #[inline]
    pub async fn initialize<P>(
        &self,
        chunks: P,
        index_path: &Path,
        force_rebuild: bool,
        batch_size: usize,
    ) -> Result<&VectorIndex>
    where
        P: FnOnce() -> Result<Vec<Chunk>> + Send + 'static,
    {
        let result = self
            .index
            .get_or_try_init(|| async {
                let index = VectorIndex::build_or_load(
                    chunks,
                    index_path,
                    force_rebuild,
                    Arc::clone(&self.model),
                    batch_size,
                    |phase| self.set_phase(phase),
                )
                .await?;
                self.set_phase(IndexPhase::Ready);
                Ok::<_, QaError>(index)
            })
            .await;

        if result.is_err() {
            self.set_phase(IndexPhase::Uninitialized);
        } else {
            info!("QA system ready");
        }
        result
    }

    /// Initialize from the configured corpus and index locations
    #[inline]
    pub async fn initialize_from_config(
        &self,
        config: &Config,
        force_rebuild: bool,
    ) -> Result<&VectorIndex> {
        let data_path = config.corpus.data_path.clone();
        let chunking: ChunkingConfig = config.chunking.clone();
        let loader = move || {
            documents::load_and_split(data_path, chunking.chunk_size, chunking.chunk_overlap)
        };

        self.initialize(
            loader,
            &config.index.path,
            force_rebuild,
            config.index.batch_size,
        )
        .await
    }

    fn set_phase(&self, phase: IndexPhase) {
        debug!("Index phase: {}", phase);
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    fn to_sources(&self, hits: &[SearchHit]) -> Vec<Source> {
        hits.iter()
            .map(|hit| Source {
                content_preview: preview(&hit.chunk.text, self.preview_chars),
                metadata: SourceMetadata {
                    source_path: hit.chunk.source_path.clone(),
                    page_number: Some(hit.chunk.page_number),
                },
            })
            .collect()
    }
}

#[async_trait]
impl Answer for QaSystem {
    async fn ask(&self, question: &str) -> Result<QueryResult> {
        let index = self
            .index
            .get()
            .ok_or_else(|| QaError::NotReady(format!("index is {}", self.phase())))?;

        let started = Instant::now();
        info!("Question: {}", question);

        let model = Arc::clone(&self.model);
        let query = question.to_string();
        let embedding = run_blocking(move || model.embed(&query)).await?;

        let hits = index.search(&embedding, self.top_k).await?;
        debug!("Retrieved {} passages", hits.len());

        let prompt = self.template.render(&format_context(&hits), question);
        let model = Arc::clone(&self.model);
        let overrides = self.generation.clone();
        let answer = run_blocking(move || model.generate(&prompt, &overrides)).await?;

        let elapsed = started.elapsed();
        info!("Answered in {:.2}s", elapsed.as_secs_f64());

        Ok(QueryResult {
            question: question.to_string(),
            answer,
            sources: self.to_sources(&hits),
            elapsed,
            session_id: None,
        })
    }
}

/// First `max_chars` characters of `text`, with `...` when anything was cut
#[inline]
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
