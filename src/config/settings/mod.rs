
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::QaError;
use crate::documents::splitter::ChunkingConfig;
use crate::model::params::GenerationOverrides;

const CONFIG_FILE_NAME: &str = "config.toml";
const APP_DIR_NAME: &str = "battery-qa";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub knowledge_base: KnowledgeBaseConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Model-serving endpoint used for embeddings and generation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub embedding_model: String,
    pub generation_model: String,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    pub generation: GenerationOverrides,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            embedding_model: "nomic-embed-text:latest".to_string(),
            generation_model: "llama3.2:latest".to_string(),
            timeout_seconds: 60,
            retry_attempts: 1,
            generation: GenerationOverrides::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CorpusConfig {
    /// A single PDF or a directory searched recursively for PDFs
    pub data_path: PathBuf,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data/raw"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    pub path: PathBuf,
    /// Chunks embedded and inserted per step while building
    pub batch_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/embeddings/battery_vectorstore"),
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub max_workers: usize,
    pub preview_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            max_workers: 4,
            preview_chars: 300,
        }
    }
}

/// Managed retrieve-and-generate service settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KnowledgeBaseConfig {
    pub region: String,
    pub knowledge_base_id: String,
    pub data_source_id: String,
    pub s3_bucket: String,
    pub model_id: String,
    pub max_results: u32,
    /// Budget for a single call to the service
    pub timeout_seconds: u64,
    /// Overrides the regional agent-runtime endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Only ever read from the environment
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            region: "us-west-2".to_string(),
            knowledge_base_id: String::new(),
            data_source_id: String::new(),
            s3_bucket: String::new(),
            model_id: "anthropic.claude-3-haiku-20240307-v1:0".to_string(),
            max_results: 5,
            timeout_seconds: 60,
            endpoint: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid retry attempts: {0} (must be between 1 and 10)")]
    InvalidRetryAttempts(u32),
    #[error("Invalid chunk size: {0} (must be between 50 and 8192 characters)")]
    InvalidChunkSize(usize),
    #[error("Chunk overlap ({0}) must be smaller than chunk size ({1})")]
    InvalidChunkOverlap(usize, usize),
    #[error("Invalid index batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(usize),
    #[error("Invalid retrieval depth: {0} (must be between 1 and 100)")]
    InvalidTopK(usize),
    #[error("Invalid worker count: {0} (must be between 1 and 64)")]
    InvalidWorkerCount(usize),
    #[error("Invalid preview length: {0} (must be greater than 0)")]
    InvalidPreviewLength(usize),
    #[error("Invalid knowledge base result count: {0} (must be between 1 and 100)")]
    InvalidMaxResults(u32),
    #[error("Invalid value for {name}: {value}")]
    InvalidEnvValue { name: String, value: String },
    #[error("Missing required knowledge base settings: {0}")]
    MissingKnowledgeBaseSettings(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl From<ConfigError> for QaError {
    #[inline]
    fn from(error: ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

impl Config {
    /// Default location of the configuration directory
    #[inline]
    pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR_NAME))
            .ok_or(ConfigError::DirectoryError)
    }

    /// Load `config.toml` from `config_dir`, falling back to defaults when absent
    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join(CONFIG_FILE_NAME)
    }

    #[inline]
    pub fn model_url(&self) -> Result<Url, ConfigError> {
        self.model.base_url()
    }

    /// Overlay settings taken from environment variables.
    ///
    /// `lookup` is normally `std::env::var(..).ok()`; it is a parameter so the
    /// overlay can be exercised without touching the process environment.
    #[inline]
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(path) = non_empty("BATTERY_QA_DATA_PATH") {
            self.corpus.data_path = PathBuf::from(path);
        }
        if let Some(path) = non_empty("BATTERY_QA_INDEX_PATH") {
            self.index.path = PathBuf::from(path);
        }
        if let Some(model) = non_empty("EMBEDDING_MODEL") {
            self.model.embedding_model = model;
        }
        if let Some(model) = non_empty("LLM_MODEL") {
            self.model.generation_model = model;
        }
        if let Some(host) = non_empty("BATTERY_QA_MODEL_HOST") {
            self.model.host = host;
        }
        if let Some(port) = non_empty("BATTERY_QA_MODEL_PORT") {
            self.model.port = port.parse().map_err(|_| ConfigError::InvalidEnvValue {
                name: "BATTERY_QA_MODEL_PORT".to_string(),
                value: port,
            })?;
        }
        if let Some(region) = non_empty("AWS_REGION") {
            self.knowledge_base.region = region;
        }
        if let Some(id) = non_empty("KNOWLEDGE_BASE_ID") {
            self.knowledge_base.knowledge_base_id = id;
        }
        if let Some(id) = non_empty("DATA_SOURCE_ID") {
            self.knowledge_base.data_source_id = id;
        }
        if let Some(bucket) = non_empty("S3_BUCKET") {
            self.knowledge_base.s3_bucket = bucket;
        }
        if let Some(endpoint) = non_empty("BATTERY_QA_KB_ENDPOINT") {
            self.knowledge_base.endpoint = Some(endpoint);
        }
        if let Some(timeout) = non_empty("BATTERY_QA_KB_TIMEOUT") {
            self.knowledge_base.timeout_seconds =
                timeout.parse().map_err(|_| ConfigError::InvalidEnvValue {
                    name: "BATTERY_QA_KB_TIMEOUT".to_string(),
                    value: timeout,
                })?;
        }
        if let Some(key) = non_empty("AWS_BEARER_TOKEN_BEDROCK") {
            self.knowledge_base.api_key = Some(key);
        }

        Ok(())
    }

    /// Validate everything the local pipeline depends on
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate()?;
        self.validate_chunking_config()?;
        self.index.validate()?;
        self.retrieval.validate()?;
        Ok(())
    }

    /// Validate what the managed pipeline depends on; local model, chunking
    /// and index settings are not consulted
    #[inline]
    pub fn validate_managed(&self) -> Result<(), ConfigError> {
        self.retrieval.validate()?;
        self.knowledge_base.validate()?;
        Ok(())
    }

    fn validate_chunking_config(&self) -> Result<(), ConfigError> {
        let config = &self.chunking;

        if !(50..=8192).contains(&config.chunk_size) {
            return Err(ConfigError::InvalidChunkSize(config.chunk_size));
        }

        if config.chunk_overlap >= config.chunk_size {
            return Err(ConfigError::InvalidChunkOverlap(
                config.chunk_overlap,
                config.chunk_size,
            ));
        }

        Ok(())
    }
}

impl ModelConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        self.base_url()?;

        if self.embedding_model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.embedding_model.clone()));
        }

        if self.generation_model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.generation_model.clone()));
        }

        if !(1..=600).contains(&self.timeout_seconds) {
            return Err(ConfigError::InvalidTimeout(self.timeout_seconds));
        }

        if !(1..=10).contains(&self.retry_attempts) {
            return Err(ConfigError::InvalidRetryAttempts(self.retry_attempts));
        }

        Ok(())
    }

    #[inline]
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    #[inline]
    pub fn set_protocol(&mut self, protocol: String) -> Result<(), ConfigError> {
        if protocol != "http" && protocol != "https" {
            return Err(ConfigError::InvalidProtocol(protocol));
        }
        self.protocol = protocol;
        Ok(())
    }

    #[inline]
    pub fn set_host(&mut self, host: String) -> Result<(), ConfigError> {
        let candidate = ModelConfig {
            host: host.clone(),
            ..self.clone()
        };
        candidate.base_url()?;
        self.host = host;
        Ok(())
    }

    #[inline]
    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }
        self.port = port;
        Ok(())
    }

    #[inline]
    pub fn set_embedding_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.embedding_model = model;
        Ok(())
    }

    #[inline]
    pub fn set_generation_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.generation_model = model;
        Ok(())
    }
}

impl IndexConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=1000).contains(&self.batch_size) {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }
        Ok(())
    }
}

impl RetrievalConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.top_k) {
            return Err(ConfigError::InvalidTopK(self.top_k));
        }
        if !(1..=64).contains(&self.max_workers) {
            return Err(ConfigError::InvalidWorkerCount(self.max_workers));
        }
        if self.preview_chars == 0 {
            return Err(ConfigError::InvalidPreviewLength(self.preview_chars));
        }
        Ok(())
    }
}

impl KnowledgeBaseConfig {
    /// Fail fast when any setting the managed pipeline needs is blank
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("KNOWLEDGE_BASE_ID", &self.knowledge_base_id),
            ("DATA_SOURCE_ID", &self.data_source_id),
            ("S3_BUCKET", &self.s3_bucket),
            ("AWS_REGION", &self.region),
        ];

        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            return Err(ConfigError::MissingKnowledgeBaseSettings(missing.join(", ")));
        }

        if self.model_id.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model_id.clone()));
        }

        if !(1..=100).contains(&self.max_results) {
            return Err(ConfigError::InvalidMaxResults(self.max_results));
        }

        if !(1..=600).contains(&self.timeout_seconds) {
            return Err(ConfigError::InvalidTimeout(self.timeout_seconds));
        }

        self.endpoint_url()?;
        Ok(())
    }

    #[inline]
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        let url_str = self.endpoint.clone().unwrap_or_else(|| {
            format!("https://bedrock-agent-runtime.{}.amazonaws.com", self.region)
        });
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    #[inline]
    pub fn model_arn(&self) -> String {
        format!(
            "arn:aws:bedrock:{}::foundation-model/{}",
            self.region, self.model_id
        )
    }
}
