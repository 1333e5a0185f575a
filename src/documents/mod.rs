// Document loading module
// PDF text extraction per page and recursive chunking

pub mod splitter;

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{QaError, Result};
use splitter::{ChunkingConfig, TextSplitter};

/// A window of page text, the unit of retrieval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub source_path: String,
    /// Zero-based page index within the source PDF
    pub page_number: u32,
}

/// Extracted text of a single non-blank page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub source_path: String,
    pub page_number: u32,
    pub text: String,
}

/// Loads PDFs from a single file or a directory tree
#[derive(Debug, Clone)]
pub struct DocumentLoader {
    data_path: PathBuf,
}

impl DocumentLoader {
    #[inline]
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
        }
    }

    #[inline]
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Extract every non-blank page.
    ///
    /// A directory is searched recursively; files that fail to parse are
    /// logged and skipped. A single file that fails to parse is an error.
    #[inline]
    pub fn load_pages(&self) -> Result<Vec<PageText>> {
        let path = self.data_path.as_path();

        if path.is_file() {
            info!("Loading single PDF: {}", path.display());
            let pages = extract_pdf_pages(path)?;
            info!("Loaded {} pages", pages.len());
            return Ok(pages);
        }

        if !path.is_dir() {
            return Err(QaError::PathNotFound(path.to_path_buf()));
        }

        info!("Loading PDFs from directory: {}", path.display());
        let pdf_files = discover_pdfs(path);
        let mut pages = Vec::new();

        for pdf_file in &pdf_files {
            match extract_pdf_pages(pdf_file) {
                Ok(file_pages) => {
                    debug!("{}: {} pages", pdf_file.display(), file_pages.len());
                    pages.extend(file_pages);
                }
                Err(e) => {
                    warn!("Skipping {}: {}", pdf_file.display(), e);
                }
            }
        }

        info!(
            "Loaded {} pages from {} PDFs",
            pages.len(),
            pdf_files.len()
        );
        Ok(pages)
    }

    #[inline]
    pub fn load_and_split(&self, config: &ChunkingConfig) -> Result<Vec<Chunk>> {
        let splitter = TextSplitter::new(config)?;
        let pages = self.load_pages()?;
        Ok(split_pages(&pages, &splitter))
    }
}

/// Load `path` and split it into chunks of `chunk_size` characters
/// overlapping by `chunk_overlap`.
#[inline]
pub fn load_and_split(
    path: impl Into<PathBuf>,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Result<Vec<Chunk>> {
    DocumentLoader::new(path).load_and_split(&ChunkingConfig {
        chunk_size,
        chunk_overlap,
    })
}

/// Split pages into chunks; chunks never span pages
#[inline]
pub fn split_pages(pages: &[PageText], splitter: &TextSplitter) -> Vec<Chunk> {
    info!(
        "Splitting {} pages (chunk_size={}, overlap={})",
        pages.len(),
        splitter.chunk_size(),
        splitter.chunk_overlap()
    );

    let chunks: Vec<Chunk> = pages
        .iter()
        .filter(|page| !page.text.trim().is_empty())
        .flat_map(|page| {
            splitter
                .split_text(&page.text)
                .into_iter()
                .map(move |text| Chunk {
                    text,
                    source_path: page.source_path.clone(),
                    page_number: page.page_number,
                })
        })
        .collect();

    info!("Created {} chunks", chunks.len());
    chunks
}

/// Extract the text of each page of a PDF, dropping whitespace-only pages
#[inline]
pub fn extract_pdf_pages(path: &Path) -> Result<Vec<PageText>> {
    let document = lopdf::Document::load(path)
        .map_err(|e| QaError::Extraction(format!("{}: {}", path.display(), e)))?;

    let source_path = path.display().to_string();
    let mut pages = Vec::new();

    for (index, page_number) in document.get_pages().keys().enumerate() {
        let text = document.extract_text(&[*page_number]).map_err(|e| {
            QaError::Extraction(format!(
                "{} page {}: {}",
                path.display(),
                page_number,
                e
            ))
        })?;

        if text.trim().is_empty() {
            debug!("Dropping blank page {} of {}", index, path.display());
            continue;
        }

        pages.push(PageText {
            source_path: source_path.clone(),
            page_number: u32::try_from(index).unwrap_or(u32::MAX),
            text,
        });
    }

    Ok(pages)
}

/// All `.pdf` files below `dir`, in a stable order
#[inline]
pub fn discover_pdfs(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Could not read directory entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
        })
        .collect()
}
