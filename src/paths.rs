// Experiment directory layout
//
// Every config gets its own experiment directory under `save_dir`, named by a
// hash of the config, so re-running the same config lands in the same place.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Hex characters of the config hash used as the directory name
const EXPERIMENT_ID_LEN: usize = 12;

/// Fixed output locations for one experiment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavePaths {
    pub root: PathBuf,
    /// Effective config snapshot
    pub config: PathBuf,
    /// Formatted training data handed to the trainer
    pub dataset: PathBuf,
    /// Adapter weights, tokenizer files and trainer logs
    pub weights: PathBuf,
    /// Merged model output
    pub merged: PathBuf,
}

impl SavePaths {
    fn under(root: PathBuf) -> Self {
        Self {
            config: root.join("config"),
            dataset: root.join("dataset"),
            weights: root.join("weights"),
            merged: root.join("merged"),
            root,
        }
    }

    /// Trainer logging directory inside the weights path
    pub fn logs(&self) -> PathBuf {
        self.weights.join("logs")
    }

    /// Run manifest file
    pub fn manifest(&self) -> PathBuf {
        self.root.join("run.json")
    }
}

/// Derives and creates the save paths for a config
#[derive(Debug, Clone)]
pub struct DirectoryHelper {
    experiment_id: String,
    pub save_paths: SavePaths,
}

impl DirectoryHelper {
    /// Compute paths for `config`. Nothing is created on disk yet.
    pub fn new(config: &Config) -> Result<Self> {
        let experiment_id = experiment_id(config)?;
        let save_paths = SavePaths::under(config.save_dir.join(&experiment_id));

        Ok(Self {
            experiment_id,
            save_paths,
        })
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Create every directory of the layout
    pub fn create_dirs(&self) -> Result<()> {
        let paths = &self.save_paths;
        for dir in [&paths.config, &paths.dataset, &paths.weights, &paths.merged] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// True if the experiment already has saved adapter weights
    pub fn has_weights(&self) -> bool {
        dir_has_entries(&self.save_paths.weights)
    }
}

/// Stable id for a config: leading hex digits of sha256 over its JSON form.
/// The deploy section does not influence training, so it is left out.
pub fn experiment_id(config: &Config) -> Result<String> {
    let mut hashed = config.clone();
    hashed.deploy = None;

    let bytes = serde_json::to_vec(&hashed).context("Failed to serialize config for hashing")?;
    let digest = format!("{:x}", Sha256::digest(&bytes));
    Ok(digest[..EXPERIMENT_ID_LEN].to_string())
}

fn dir_has_entries(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_same_config_same_directory() {
        let a = DirectoryHelper::new(&Config::new("model-a")).unwrap();
        let b = DirectoryHelper::new(&Config::new("model-a")).unwrap();
        assert_eq!(a.save_paths, b.save_paths);
        assert_eq!(a.experiment_id().len(), EXPERIMENT_ID_LEN);
    }

    #[test]
    fn test_different_config_different_directory() {
        let a = DirectoryHelper::new(&Config::new("model-a")).unwrap();
        let mut config = Config::new("model-a");
        config.lora.r = 32;
        let b = DirectoryHelper::new(&config).unwrap();
        assert_ne!(a.experiment_id(), b.experiment_id());
    }

    #[test]
    fn test_layout_and_creation() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new("model-a");
        config.save_dir = temp_dir.path().to_path_buf();

        let helper = DirectoryHelper::new(&config).unwrap();
        let paths = &helper.save_paths;
        assert!(paths.root.starts_with(temp_dir.path()));
        assert_eq!(paths.weights, paths.root.join("weights"));
        assert_eq!(paths.logs(), paths.weights.join("logs"));

        assert!(!helper.has_weights());
        helper.create_dirs().unwrap();
        assert!(paths.weights.is_dir());
        assert!(paths.merged.is_dir());
        assert!(!helper.has_weights());

        fs::write(paths.weights.join("adapter_config.json"), "{}").unwrap();
        assert!(helper.has_weights());
    }
}
