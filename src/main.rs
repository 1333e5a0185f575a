use std::path::PathBuf;
use std::time::Duration;

use battery_qa::Result;
use battery_qa::commands::{
    PipelineArgs, ask_question, ask_questions, build_index, health, kb_ask, kb_ask_batch,
    kb_retrieve, read_questions,
};
use battery_qa::config::{Config, load_with_env, run_interactive_config, show_config};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "battery-qa")]
#[command(about = "Question answering over battery technology documents")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the model endpoint and pipeline settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Build the vector index from the document corpus
    Build {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Answer a single question with the local pipeline
    Ask {
        /// Question to answer
        question: String,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Answer several questions concurrently with the local pipeline
    Batch {
        #[command(flatten)]
        questions: QuestionArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Use the managed knowledge base instead of the local index
    Kb {
        #[command(subcommand)]
        command: KbCommands,
    },
    /// Check the model endpoint and the index location
    Health {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
}

#[derive(Subcommand)]
enum KbCommands {
    /// Answer a single question
    Ask {
        /// Question to answer
        question: String,
    },
    /// Answer several questions concurrently
    Batch {
        #[command(flatten)]
        questions: QuestionArgs,
    },
    /// Show the passages retrieved for a query without generating an answer
    Retrieve {
        /// Retrieval query
        query: String,
        /// Number of passages to return
        #[arg(long)]
        max_results: Option<u32>,
    },
}

#[derive(Args)]
struct QuestionArgs {
    /// Questions to answer
    questions: Vec<String>,
    /// File with one question per line
    #[arg(long, short = 'f')]
    file: Option<PathBuf>,
    /// Maximum number of questions in flight
    #[arg(long)]
    workers: Option<usize>,
    /// Deadline for the whole batch in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl QuestionArgs {
    fn collect(&self) -> anyhow::Result<Vec<String>> {
        let mut questions = self.questions.clone();
        if let Some(file) = &self.file {
            questions.extend(read_questions(file)?);
        }
        if questions.is_empty() {
            anyhow::bail!("No questions given; pass them as arguments or with --file");
        }
        Ok(questions)
    }

    fn workers(&self, config: &Config) -> usize {
        self.workers.unwrap_or(config.retrieval.max_workers)
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

fn load_config(cli_dir: Option<&PathBuf>, pipeline: Option<&PipelineArgs>) -> Result<Config> {
    let mut config = load_with_env(cli_dir.map(PathBuf::as_path))?;
    if let Some(pipeline) = pipeline {
        pipeline.apply_to(&mut config);
    }
    config.validate()?;
    Ok(config)
}

/// Settings for the managed pipeline; local model and index settings are not checked
fn load_managed_config(cli_dir: Option<&PathBuf>) -> Result<Config> {
    let config = load_with_env(cli_dir.map(PathBuf::as_path))?;
    config.validate_managed()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_dir = cli.config_dir.as_ref();

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&load_config(config_dir, None)?);
            } else {
                let dir = match config_dir {
                    Some(dir) => dir.clone(),
                    None => Config::default_config_dir()?,
                };
                run_interactive_config(&dir)?;
            }
        }
        Commands::Build { pipeline } => {
            let config = load_config(config_dir, Some(&pipeline))?;
            build_index(&config, pipeline.force_rebuild).await?;
        }
        Commands::Ask { question, pipeline } => {
            let config = load_config(config_dir, Some(&pipeline))?;
            ask_question(&config, &question, pipeline.force_rebuild, cli.json).await?;
        }
        Commands::Batch {
            questions,
            pipeline,
        } => {
            let config = load_config(config_dir, Some(&pipeline))?;
            ask_questions(
                &config,
                &questions.collect()?,
                questions.workers(&config),
                questions.timeout(),
                pipeline.force_rebuild,
                cli.json,
            )
            .await?;
        }
        Commands::Kb { command } => {
            let config = load_managed_config(config_dir)?;
            match command {
                KbCommands::Ask { question } => kb_ask(&config, &question, cli.json).await?,
                KbCommands::Batch { questions } => {
                    kb_ask_batch(
                        &config,
                        &questions.collect()?,
                        questions.workers(&config),
                        questions.timeout(),
                        cli.json,
                    )
                    .await?;
                }
                KbCommands::Retrieve { query, max_results } => {
                    kb_retrieve(&config, &query, max_results, cli.json).await?;
                }
            }
        }
        Commands::Health { pipeline } => {
            let config = load_config(config_dir, Some(&pipeline))?;
            health(&config).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn cli_parsing() {
        let cli = Cli::try_parse_from(["battery-qa", "build"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert!(matches!(parsed.command, Commands::Build { .. }));
            assert!(!parsed.json);
        }
    }

    #[test]
    fn ask_command_with_overrides() {
        let cli = Cli::try_parse_from([
            "battery-qa",
            "ask",
            "What is the energy density of NCM cells?",
            "-k",
            "5",
            "--data-path",
            "data/pdfs",
            "--force-rebuild",
            "--json",
        ]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert!(parsed.json);
            if let Commands::Ask { question, pipeline } = parsed.command {
                assert_eq!(question, "What is the energy density of NCM cells?");
                assert_eq!(pipeline.top_k, Some(5));
                assert_eq!(pipeline.data_path, Some(PathBuf::from("data/pdfs")));
                assert!(pipeline.force_rebuild);
                assert_eq!(pipeline.chunk_size, None);
            }
        }
    }

    #[test]
    fn batch_command_with_questions_and_workers() {
        let cli = Cli::try_parse_from([
            "battery-qa",
            "batch",
            "What is LFP?",
            "What is NCM?",
            "--workers",
            "4",
            "--timeout-secs",
            "120",
        ]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Batch { questions, .. } = parsed.command {
                assert_eq!(questions.questions.len(), 2);
                assert_eq!(questions.workers, Some(4));
                assert_eq!(questions.timeout(), Some(Duration::from_secs(120)));
                assert!(questions.file.is_none());
            }
        }
    }

    #[test]
    fn batch_without_questions_is_rejected_at_run_time() {
        let args = QuestionArgs {
            questions: Vec::new(),
            file: None,
            workers: None,
            timeout_secs: None,
        };
        assert!(args.collect().is_err());
        assert_eq!(args.workers(&Config::default()), 4);
    }

    #[test]
    fn kb_retrieve_command() {
        let cli = Cli::try_parse_from([
            "battery-qa",
            "kb",
            "retrieve",
            "solid-state electrolytes",
            "--max-results",
            "8",
        ]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Kb {
                command: KbCommands::Retrieve { query, max_results },
            } = parsed.command
            {
                assert_eq!(query, "solid-state electrolytes");
                assert_eq!(max_results, Some(8));
            }
        }
    }

    #[test]
    fn global_config_dir_after_subcommand() {
        let cli = Cli::try_parse_from(["battery-qa", "health", "--config-dir", "/tmp/qa"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert_eq!(parsed.config_dir, Some(PathBuf::from("/tmp/qa")));
        }
    }

    #[test]
    fn config_show_flag() {
        let cli = Cli::try_parse_from(["battery-qa", "config", "--show"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Config { show } = parsed.command {
                assert!(show);
            }
        }
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["battery-qa", "invalid"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["battery-qa", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
