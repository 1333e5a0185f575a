use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::batch::{BatchOutcome, BatchSummary, ask_batch, ask_batch_with_timeout};
use crate::config::Config;
use crate::index::{IndexProbe, probe};
use crate::knowledge_base::{KnowledgeBaseClient, ManagedQaSystem};
use crate::model::{ModelClient, run_blocking};
use crate::qa::{Answer, QaSystem, QueryResult};

const RULE_WIDTH: usize = 80;
const MAX_LISTED_SOURCES: usize = 3;

/// Command-line settings that take precedence over the file and environment
#[derive(Debug, Clone, Default, clap::Args)]
pub struct PipelineArgs {
    /// PDF file or directory of PDFs to index
    #[arg(long)]
    pub data_path: Option<PathBuf>,
    /// Directory holding the persisted vector index
    #[arg(long)]
    pub index_path: Option<PathBuf>,
    /// Number of passages retrieved per question
    #[arg(long, short = 'k')]
    pub top_k: Option<usize>,
    /// Chunk length in characters
    #[arg(long)]
    pub chunk_size: Option<usize>,
    /// Characters shared by consecutive chunks
    #[arg(long)]
    pub chunk_overlap: Option<usize>,
    /// Embedding model id
    #[arg(long)]
    pub embedding_model: Option<String>,
    /// Generation model id
    #[arg(long)]
    pub llm_model: Option<String>,
    /// Rebuild the index even if one exists
    #[arg(long)]
    pub force_rebuild: bool,
}

impl PipelineArgs {
    #[inline]
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(path) = &self.data_path {
            config.corpus.data_path.clone_from(path);
        }
        if let Some(path) = &self.index_path {
            config.index.path.clone_from(path);
        }
        if let Some(top_k) = self.top_k {
            config.retrieval.top_k = top_k;
        }
        if let Some(size) = self.chunk_size {
            config.chunking.chunk_size = size;
        }
        if let Some(overlap) = self.chunk_overlap {
            config.chunking.chunk_overlap = overlap;
        }
        if let Some(model) = &self.embedding_model {
            config.model.embedding_model.clone_from(model);
        }
        if let Some(model) = &self.llm_model {
            config.model.generation_model.clone_from(model);
        }
    }
}

/// Build (or load) the vector index and report what it holds
#[inline]
pub async fn build_index(config: &Config, force_rebuild: bool) -> Result<()> {
    let system = QaSystem::from_config(config)?;
    let index = system
        .initialize_from_config(config, force_rebuild)
        .await
        .context("Failed to prepare vector index")?;

    println!("✅ Vector index ready");
    println!("   Path: {}", index.path().display());
    println!("   Records: {}", index.count());
    println!("   Dimensions: {}", index.dimension());
    Ok(())
}

/// Answer one question with the local pipeline
#[inline]
pub async fn ask_question(
    config: &Config,
    question: &str,
    force_rebuild: bool,
    json: bool,
) -> Result<()> {
    let system = ready_local_system(config, force_rebuild).await?;
    let result = system.ask(question).await?;
    emit_result(&result, json)
}

/// Answer many questions with the local pipeline
#[inline]
pub async fn ask_questions(
    config: &Config,
    questions: &[String],
    max_workers: usize,
    timeout: Option<Duration>,
    force_rebuild: bool,
    json: bool,
) -> Result<()> {
    let system = ready_local_system(config, force_rebuild).await?;
    run_batch(&system, questions, max_workers, timeout, json).await
}

/// Answer one question through the managed knowledge base
#[inline]
pub async fn kb_ask(config: &Config, question: &str, json: bool) -> Result<()> {
    let system = managed_system(config)?;
    let result = system.ask(question).await?;
    emit_result(&result, json)
}

/// Answer many questions through the managed knowledge base
#[inline]
pub async fn kb_ask_batch(
    config: &Config,
    questions: &[String],
    max_workers: usize,
    timeout: Option<Duration>,
    json: bool,
) -> Result<()> {
    let system = managed_system(config)?;
    run_batch(&system, questions, max_workers, timeout, json).await
}

/// Show the raw passages the knowledge base retrieves for `query`
#[inline]
pub async fn kb_retrieve(
    config: &Config,
    query: &str,
    max_results: Option<u32>,
    json: bool,
) -> Result<()> {
    config.knowledge_base.validate()?;
    let client = KnowledgeBaseClient::new(&config.knowledge_base)?;
    let max_results = max_results.unwrap_or(config.knowledge_base.max_results);
    let query_owned = query.to_string();
    let passages = run_blocking(move || client.retrieve(&query_owned, max_results)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&passages)?);
        return Ok(());
    }

    println!("Query: {query}");
    println!("{}", "-".repeat(RULE_WIDTH));
    if passages.is_empty() {
        println!("No passages retrieved.");
    }
    for (i, passage) in passages.iter().enumerate() {
        let score = passage
            .score
            .map_or_else(|| "n/a".to_string(), |s| format!("{s:.3}"));
        println!(
            "{}. [{}] {}",
            i + 1,
            score,
            passage.source_location.as_deref().unwrap_or("unknown")
        );
        println!("   {}", crate::qa::preview(&passage.content, 200));
    }
    Ok(())
}

/// Check the model endpoint and report the state of the local index
#[inline]
pub async fn health(config: &Config) -> Result<()> {
    let client = ModelClient::new(&config.model)?;
    let url = client.base_url().clone();

    match run_blocking(move || client.health_check()).await {
        Ok(()) => println!("✅ Model endpoint healthy: {url}"),
        Err(e) => {
            println!("❌ Model endpoint check failed: {e}");
            return Err(e.into());
        }
    }

    match probe(&config.index.path) {
        IndexProbe::Present => println!(
            "✅ Vector index present: {}",
            config.index.path.display()
        ),
        IndexProbe::Missing => println!(
            "⚠️  No vector index at {} (run 'battery-qa build')",
            config.index.path.display()
        ),
    }

    match config.knowledge_base.validate() {
        Ok(()) => println!(
            "✅ Knowledge base configured: {}",
            config.knowledge_base.knowledge_base_id
        ),
        Err(e) => println!("ℹ️  Knowledge base not configured: {e}"),
    }

    Ok(())
}

/// Questions from a file, one per line; blank lines and `#` comments skipped
#[inline]
pub fn read_questions(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read questions from {}", path.display()))?;
    Ok(parse_questions(&content))
}

#[inline]
pub fn parse_questions(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[inline]
pub fn print_result(result: &QueryResult, show_sources: bool) {
    println!("\nQuestion: {}", result.question);
    println!("{}", "-".repeat(RULE_WIDTH));
    println!("\nAnswer:\n{}\n", result.answer);
    println!(
        "Time: {:.2}s | Sources: {}",
        result.elapsed.as_secs_f64(),
        result.sources.len()
    );
    if let Some(session) = &result.session_id {
        println!("Session: {session}");
    }

    if show_sources && !result.sources.is_empty() {
        println!("\nSources:");
        for (i, source) in result.sources.iter().take(MAX_LISTED_SOURCES).enumerate() {
            let name = source
                .metadata
                .source_path
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or(&source.metadata.source_path);
            match source.metadata.page_number {
                Some(page) => println!("  {}. {} (page {})", i + 1, name, page),
                None => println!("  {}. {}", i + 1, name),
            }
        }
    }
}

#[inline]
pub fn print_batch_summary(summary: &BatchSummary) {
    println!("\n{}", "=".repeat(RULE_WIDTH));
    println!("BATCH SUMMARY");
    println!("{}", "=".repeat(RULE_WIDTH));
    println!("Total questions: {}", summary.total);
    println!("Success: {}/{}", summary.succeeded, summary.total);
    println!("Total time: {:.2}s", summary.total_elapsed.as_secs_f64());
    println!(
        "Average time: {:.2}s per question",
        summary.average_elapsed.as_secs_f64()
    );
    println!("{}", "=".repeat(RULE_WIDTH));
}

async fn ready_local_system(config: &Config, force_rebuild: bool) -> Result<QaSystem> {
    let system = QaSystem::from_config(config)?;
    system
        .initialize_from_config(config, force_rebuild)
        .await
        .context("Failed to prepare vector index")?;
    Ok(system)
}

fn managed_system(config: &Config) -> Result<ManagedQaSystem> {
    config.knowledge_base.validate()?;
    let client = KnowledgeBaseClient::new(&config.knowledge_base)?;
    info!("Using knowledge base {}", config.knowledge_base.knowledge_base_id);
    Ok(ManagedQaSystem::new(client).with_preview_chars(config.retrieval.preview_chars))
}

async fn run_batch<A>(
    system: &A,
    questions: &[String],
    max_workers: usize,
    timeout: Option<Duration>,
    json: bool,
) -> Result<()>
where
    A: Answer + ?Sized,
{
    if questions.is_empty() {
        warn!("No questions to process");
        return Ok(());
    }

    let outcomes = match timeout {
        Some(timeout) => ask_batch_with_timeout(system, questions, max_workers, timeout).await?,
        None => ask_batch(system, questions, max_workers).await,
    };
    let summary = BatchSummary::from_outcomes(&outcomes);

    if json {
        let report = serde_json::json!({
            "results": outcomes,
            "summary": summary,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for outcome in &outcomes {
        match outcome {
            BatchOutcome::Success(result) => print_result(result, false),
            BatchOutcome::Failed {
                question,
                kind,
                error,
            } => {
                println!("\nQuestion: {question}");
                println!("{}", "-".repeat(RULE_WIDTH));
                println!("\nError ({kind}): {error}");
            }
        }
    }
    print_batch_summary(&summary);
    Ok(())
}

fn emit_result(result: &QueryResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print_result(result, true);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_file_parsing() {
        let content = "# warm-up\nWhat is NCM?\n\n  What is LFP?  \n#skip\n";
        assert_eq!(
            parse_questions(content),
            vec!["What is NCM?".to_string(), "What is LFP?".to_string()]
        );
    }

    #[test]
    fn cli_values_override_config() {
        let mut config = Config::default();
        let args = PipelineArgs {
            data_path: Some(PathBuf::from("corpus")),
            top_k: Some(7),
            chunk_size: Some(500),
            chunk_overlap: Some(50),
            llm_model: Some("mistral:7b".to_string()),
            ..PipelineArgs::default()
        };

        args.apply_to(&mut config);

        assert_eq!(config.corpus.data_path, PathBuf::from("corpus"));
        assert_eq!(config.retrieval.top_k, 7);
        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.chunking.chunk_overlap, 50);
        assert_eq!(config.model.generation_model, "mistral:7b");
        assert_eq!(
            config.index.path,
            Config::default().index.path,
            "unset flags keep the configured value"
        );
    }

    #[test]
    fn read_questions_reports_missing_file() {
        let temp_dir = tempfile::TempDir::new().expect("should create TempDir successfully");
        let result = read_questions(&temp_dir.path().join("missing.txt"));
        assert!(result.is_err());
    }
}
