// Configuration loader
// Loads the session config from a TOML file, with TUNESMITH__* environment overrides

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::settings::{Config, ConfigError};

/// Environment prefix for overrides, e.g. `TUNESMITH__MODEL__HF_MODEL_CKPT`
pub const ENV_PREFIX: &str = "TUNESMITH";

/// Default config location: ~/.tunesmith/config.toml
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".tunesmith/config.toml"))
}

/// Load and validate configuration from `path` (or the default location)
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    if !path.exists() {
        bail!(
            "No configuration found at {}\n\n\
            Create one with at least:\n\n\
            \x1b[36m[model]\n\
            hf_model_ckpt = \"NousResearch/Llama-2-7b-hf\"\x1b[0m\n\n\
            Individual values can be overridden with environment variables, e.g.\n\
            export TUNESMITH__TRAINING__TRAINING_ARGS__LEARNING_RATE=1e-4",
            path.display()
        );
    }

    load_config_with_env(&path, None)
        .with_context(|| format!("Failed to load {}", path.display()))
}

/// Load from `path`, reading overrides from `env` instead of the process
/// environment when given
pub fn load_config_with_env(
    path: &Path,
    env: Option<config::Map<String, String>>,
) -> Result<Config, ConfigError> {
    let environment = config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .source(env);

    let config: Config = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Toml))
        .add_source(environment)
        .build()?
        .try_deserialize()?;

    config.validate()?;

    tracing::debug!(
        path = %path.display(),
        checkpoint = %config.model.hf_model_ckpt,
        accelerate = config.accelerate,
        "Loaded configuration"
    );

    Ok(config)
}

/// Write the effective configuration as TOML (experiment snapshot).
/// The deploy section carries credentials and is left out.
pub fn write_config_snapshot(config: &Config, path: &Path) -> Result<()> {
    let mut snapshot = config.clone();
    snapshot.deploy = None;

    let contents = toml::to_string_pretty(&snapshot).context("Failed to serialize config")?;
    fs::write(path, contents)
        .with_context(|| format!("Failed to write config snapshot: {}", path.display()))?;
    Ok(())
}
