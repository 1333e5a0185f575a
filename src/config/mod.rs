// Configuration management module
// TOML settings, environment overlays and the interactive setup flow

pub mod interactive;
pub mod settings;


pub use interactive::{run_interactive_config, show_config};
pub use settings::{
    Config, ConfigError, CorpusConfig, IndexConfig, KnowledgeBaseConfig, ModelConfig,
    RetrievalConfig,
};

/// Load the configuration from `config_dir` (or the default directory), then
/// overlay the process environment.
#[inline]
pub fn load_with_env(config_dir: Option<&std::path::Path>) -> anyhow::Result<Config> {
    let dir = match config_dir {
        Some(dir) => dir.to_path_buf(),
        None => Config::default_config_dir()?,
    };

    let mut config = Config::load(&dir)?;
    config.apply_env_overrides(|name| std::env::var(name).ok())?;
    Ok(config)
}
