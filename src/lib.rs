use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QaError>;

#[derive(Error, Debug)]
pub enum QaError {
    #[error("Path does not exist: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("Persisted index at {} is unreadable: {reason}", path.display())]
    CorruptIndex { path: PathBuf, reason: String },

    #[error("Index not ready: {0}")]
    NotReady(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream call timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("No document text to index into {}", .0.display())]
    EmptyCorpus(PathBuf),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl QaError {
    /// Stable snake_case name of the variant, for machine-readable reports
    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PathNotFound(_) => "path_not_found",
            Self::CorruptIndex { .. } => "corrupt_index",
            Self::NotReady(_) => "not_ready",
            Self::Upstream(_) => "upstream",
            Self::Timeout(_) => "timeout",
            Self::Config(_) => "config",
            Self::Extraction(_) => "extraction",
            Self::EmptyCorpus(_) => "empty_corpus",
            Self::Database(_) => "database",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub mod batch;
pub mod commands;
pub mod config;
pub mod documents;
pub mod index;
pub mod knowledge_base;
pub mod model;
pub mod qa;
