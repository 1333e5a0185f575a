
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, Select};

use super::{Config, ModelConfig};
use crate::model::ModelClient;

#[inline]
pub fn run_interactive_config(config_dir: &Path) -> Result<()> {
    eprintln!("{}", style("🔋 Battery QA Configuration Setup").bold().cyan());
    eprintln!();

    let mut config = load_existing_config(config_dir)?;

    eprintln!("{}", style("Model Endpoint").bold().yellow());
    eprintln!("Configure the model-serving endpoint used for embeddings and answers.");
    eprintln!();

    configure_model(&mut config.model)?;

    eprintln!();
    eprintln!("{}", style("Corpus and Index").bold().yellow());
    configure_paths(&mut config)?;

    eprintln!();
    eprintln!("{}", style("Testing configuration...").yellow());

    match ModelClient::new(&config.model).and_then(|client| client.ping()) {
        Ok(()) => eprintln!("{}", style("✓ Model endpoint reachable!").green()),
        Err(e) => {
            eprintln!(
                "{}",
                style(format!("⚠ Warning: Could not reach model endpoint: {e}")).yellow()
            );
            eprintln!("You can continue, but make sure the endpoint is running before indexing.");
        }
    }

    eprintln!();
    if Confirm::new()
        .with_prompt("Save configuration?")
        .default(true)
        .interact()?
    {
        config.save().context("Failed to save configuration")?;
        eprintln!("{}", style("✓ Configuration saved successfully!").green());
        eprintln!(
            "Configuration saved to: {}",
            style(config.config_file_path().display()).cyan()
        );
    } else {
        eprintln!("Configuration not saved.");
    }

    Ok(())
}

#[inline]
pub fn show_config(config: &Config) {
    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Model Endpoint:").bold().yellow());
    match config.model_url() {
        Ok(url) => eprintln!("  URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  URL: {} ({})", style("Invalid").red(), e),
    }
    eprintln!(
        "  Embedding model: {}",
        style(&config.model.embedding_model).cyan()
    );
    eprintln!(
        "  Generation model: {}",
        style(&config.model.generation_model).cyan()
    );
    eprintln!(
        "  Timeout: {}s, attempts: {}",
        style(config.model.timeout_seconds).cyan(),
        style(config.model.retry_attempts).cyan()
    );

    eprintln!();
    eprintln!("{}", style("Corpus and Index:").bold().yellow());
    eprintln!(
        "  Data path: {}",
        style(config.corpus.data_path.display()).cyan()
    );
    eprintln!("  Index path: {}", style(config.index.path.display()).cyan());
    eprintln!(
        "  Chunking: {} chars, {} overlap",
        style(config.chunking.chunk_size).cyan(),
        style(config.chunking.chunk_overlap).cyan()
    );
    eprintln!(
        "  Build batch size: {}",
        style(config.index.batch_size).cyan()
    );

    eprintln!();
    eprintln!("{}", style("Retrieval:").bold().yellow());
    eprintln!("  Top k: {}", style(config.retrieval.top_k).cyan());
    eprintln!("  Workers: {}", style(config.retrieval.max_workers).cyan());

    eprintln!();
    eprintln!("{}", style("Knowledge Base:").bold().yellow());
    let kb = &config.knowledge_base;
    eprintln!("  Region: {}", style(&kb.region).cyan());
    eprintln!(
        "  Knowledge base: {}",
        style(display_or_unset(&kb.knowledge_base_id)).cyan()
    );
    eprintln!(
        "  Data source: {}",
        style(display_or_unset(&kb.data_source_id)).cyan()
    );
    eprintln!("  S3 bucket: {}", style(display_or_unset(&kb.s3_bucket)).cyan());
    eprintln!("  Timeout: {}s", style(kb.timeout_seconds).cyan());
    eprintln!(
        "  API key: {}",
        style(if kb.api_key.is_some() { "set" } else { "unset" }).cyan()
    );

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );
}

fn display_or_unset(value: &str) -> &str {
    if value.trim().is_empty() {
        "(unset)"
    } else {
        value
    }
}

fn load_existing_config(config_dir: &Path) -> Result<Config> {
    if config_dir.join("config.toml").exists() {
        eprintln!("{}", style("Found existing configuration.").green());
    } else {
        eprintln!(
            "{}",
            style("No existing configuration found. Using defaults.").yellow()
        );
    }
    Config::load(config_dir)
}

fn configure_model(model: &mut ModelConfig) -> Result<()> {
    let protocols = &["http", "https"];
    let default_index = protocols
        .iter()
        .position(|&p| p == model.protocol)
        .unwrap_or(0);

    let protocol_index = Select::new()
        .with_prompt("Endpoint protocol")
        .default(default_index)
        .items(protocols)
        .interact()?;

    let protocol = protocols[protocol_index].to_string();

    let host: String = Input::new()
        .with_prompt("Endpoint host")
        .default(model.host.clone())
        .validate_with(|input: &String| -> Result<(), String> {
            let candidate = ModelConfig {
                protocol: protocol.clone(),
                host: input.clone(),
                ..ModelConfig::default()
            };
            candidate.base_url().map(|_| ()).map_err(|e| e.to_string())
        })
        .interact_text()?;

    let port: u16 = Input::new()
        .with_prompt("Endpoint port")
        .default(model.port)
        .validate_with(|input: &u16| -> Result<(), &str> {
            if *input == 0 {
                Err("Port must be greater than 0")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let embedding_model: String = Input::new()
        .with_prompt("Embedding model")
        .default(model.embedding_model.clone())
        .validate_with(non_empty)
        .interact_text()?;

    let generation_model: String = Input::new()
        .with_prompt("Generation model")
        .default(model.generation_model.clone())
        .validate_with(non_empty)
        .interact_text()?;

    model.set_protocol(protocol)?;
    model.set_host(host)?;
    model.set_port(port)?;
    model.set_embedding_model(embedding_model)?;
    model.set_generation_model(generation_model)?;

    Ok(())
}

fn configure_paths(config: &mut Config) -> Result<()> {
    let data_path: String = Input::new()
        .with_prompt("PDF file or directory")
        .default(config.corpus.data_path.display().to_string())
        .validate_with(non_empty)
        .interact_text()?;

    let index_path: String = Input::new()
        .with_prompt("Vector index directory")
        .default(config.index.path.display().to_string())
        .validate_with(non_empty)
        .interact_text()?;

    config.corpus.data_path = PathBuf::from(data_path);
    config.index.path = PathBuf::from(index_path);
    Ok(())
}

fn non_empty(input: &String) -> Result<(), &'static str> {
    if input.trim().is_empty() {
        Err("Value cannot be empty")
    } else {
        Ok(())
    }
}
