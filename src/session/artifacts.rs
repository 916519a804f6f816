// Saved adapter/tokenizer files
//
// Layout follows the PEFT convention:
// - adapter_config.json + adapter_model.safetensors (or adapter_model.bin)
// - tokenizer_config.json + tokenizer.json (or tokenizer.model)

use anyhow::Context;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::SessionError;

pub const ADAPTER_CONFIG: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS: [&str; 2] = ["adapter_model.safetensors", "adapter_model.bin"];
pub const TOKENIZER_CONFIG: &str = "tokenizer_config.json";
pub const TOKENIZER_FILES: [&str; 2] = ["tokenizer.json", "tokenizer.model"];

/// What a weights directory contains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterArtifacts {
    pub dir: PathBuf,
    pub adapter_config: bool,
    pub adapter_weights: Option<PathBuf>,
    pub tokenizer_config: bool,
    pub tokenizer_file: Option<PathBuf>,
}

impl AdapterArtifacts {
    /// Look at `dir` without touching anything
    pub fn inspect(dir: &Path) -> Self {
        let first_existing = |names: &[&str]| {
            names
                .iter()
                .map(|name| dir.join(name))
                .find(|path| path.is_file())
        };

        Self {
            dir: dir.to_path_buf(),
            adapter_config: dir.join(ADAPTER_CONFIG).is_file(),
            adapter_weights: first_existing(&ADAPTER_WEIGHTS),
            tokenizer_config: dir.join(TOKENIZER_CONFIG).is_file(),
            tokenizer_file: first_existing(&TOKENIZER_FILES),
        }
    }

    /// Remove any adapter and tokenizer files left in `dir`, so the next
    /// inspection only sees what a new save writes. Other files are kept.
    pub fn clear(dir: &Path) -> anyhow::Result<()> {
        let names = [ADAPTER_CONFIG, TOKENIZER_CONFIG]
            .into_iter()
            .chain(ADAPTER_WEIGHTS)
            .chain(TOKENIZER_FILES);

        for name in names {
            let path = dir.join(name);
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed stale artifact"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to remove stale artifact: {}", path.display())
                    })
                }
            }
        }
        Ok(())
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter_config && self.adapter_weights.is_some()
    }

    pub fn has_tokenizer(&self) -> bool {
        self.tokenizer_config && self.tokenizer_file.is_some()
    }

    fn missing_adapter(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if !self.adapter_config {
            missing.push(ADAPTER_CONFIG.to_string());
        }
        if self.adapter_weights.is_none() {
            missing.push(ADAPTER_WEIGHTS.join(" or "));
        }
        missing
    }

    fn missing_tokenizer(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if !self.tokenizer_config {
            missing.push(TOKENIZER_CONFIG.to_string());
        }
        if self.tokenizer_file.is_none() {
            missing.push(TOKENIZER_FILES.join(" or "));
        }
        missing
    }

    /// Every missing file (or alternative group) in the directory
    pub fn missing(&self) -> Vec<String> {
        let mut missing = self.missing_adapter();
        missing.extend(self.missing_tokenizer());
        missing
    }

    /// Fail unless the adapter can be reloaded from here
    pub fn require_adapter(&self) -> Result<(), SessionError> {
        let missing = self.missing_adapter();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SessionError::MissingArtifacts {
                path: self.dir.clone(),
                missing,
            })
        }
    }

    /// Fail unless both adapter and tokenizer were saved
    pub fn require_complete(&self) -> Result<(), SessionError> {
        let missing = self.missing();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SessionError::MissingArtifacts {
                path: self.dir.clone(),
                missing,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let artifacts = AdapterArtifacts::inspect(temp_dir.path());
        assert!(!artifacts.has_adapter());
        assert!(!artifacts.has_tokenizer());
        assert_eq!(artifacts.missing().len(), 4);
        assert!(matches!(
            artifacts.require_adapter(),
            Err(SessionError::MissingArtifacts { .. })
        ));
    }

    #[test]
    fn test_nonexistent_directory() {
        let artifacts = AdapterArtifacts::inspect(Path::new("/nonexistent/weights"));
        assert!(artifacts.require_complete().is_err());
    }

    #[test]
    fn test_bin_weights_accepted() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(ADAPTER_CONFIG), "{}").unwrap();
        fs::write(temp_dir.path().join("adapter_model.bin"), b"\0").unwrap();

        let artifacts = AdapterArtifacts::inspect(temp_dir.path());
        assert!(artifacts.has_adapter());
        assert!(artifacts.require_adapter().is_ok());
        assert_eq!(
            artifacts.require_complete().unwrap_err().to_string(),
            format!(
                "missing artifacts in {}: tokenizer_config.json, tokenizer.json or tokenizer.model",
                temp_dir.path().display()
            )
        );
    }

    #[test]
    fn test_clear_removes_only_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        for name in [ADAPTER_CONFIG, ADAPTER_WEIGHTS[1], TOKENIZER_CONFIG, TOKENIZER_FILES[0]] {
            fs::write(temp_dir.path().join(name), "x").unwrap();
        }
        fs::create_dir(temp_dir.path().join("logs")).unwrap();
        fs::write(temp_dir.path().join("trainer_state.json"), "{}").unwrap();

        AdapterArtifacts::clear(temp_dir.path()).unwrap();

        let artifacts = AdapterArtifacts::inspect(temp_dir.path());
        assert_eq!(artifacts.missing().len(), 4);
        assert!(temp_dir.path().join("logs").is_dir());
        assert!(temp_dir.path().join("trainer_state.json").is_file());

        // Nothing left to remove is fine
        AdapterArtifacts::clear(temp_dir.path()).unwrap();
    }

    #[test]
    fn test_complete_directory() {
        let temp_dir = TempDir::new().unwrap();
        for name in [ADAPTER_CONFIG, ADAPTER_WEIGHTS[0], TOKENIZER_CONFIG, TOKENIZER_FILES[0]] {
            fs::write(temp_dir.path().join(name), "x").unwrap();
        }

        let artifacts = AdapterArtifacts::inspect(temp_dir.path());
        assert!(artifacts.require_complete().is_ok());
        assert_eq!(
            artifacts.adapter_weights,
            Some(temp_dir.path().join("adapter_model.safetensors"))
        );
    }
}
