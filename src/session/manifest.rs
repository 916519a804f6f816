// Run manifest
//
// `run.json` in the experiment directory: which phases finished and when,
// plus what the trainer and merge step reported.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

use super::state::SessionPhase;
use crate::backend::{Precision, TrainSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: SessionPhase,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub session_id: Uuid,
    pub experiment_id: String,
    pub checkpoint: String,
    pub accelerate: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub phases: Vec<PhaseRecord>,
    #[serde(default)]
    pub dataset_examples: Option<usize>,
    #[serde(default)]
    pub train_summary: Option<TrainSummary>,
    #[serde(default)]
    pub merge_precision: Option<Precision>,
}

impl RunManifest {
    pub fn new(
        session_id: Uuid,
        experiment_id: impl Into<String>,
        checkpoint: impl Into<String>,
        accelerate: bool,
    ) -> Self {
        Self {
            session_id,
            experiment_id: experiment_id.into(),
            checkpoint: checkpoint.into(),
            accelerate,
            started_at: Utc::now(),
            phases: Vec::new(),
            dataset_examples: None,
            train_summary: None,
            merge_precision: None,
        }
    }

    pub fn record(&mut self, phase: SessionPhase) {
        self.phases.push(PhaseRecord {
            phase,
            completed_at: Utc::now(),
        });
    }

    pub fn completed(&self, phase: SessionPhase) -> bool {
        self.phases.iter().any(|record| record.phase == phase)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize run manifest")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write run manifest: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read run manifest: {}", path.display()))?;
        serde_json::from_str(&json).context("Failed to parse run manifest JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_persist() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("exp/run.json");

        let mut manifest = RunManifest::new(Uuid::new_v4(), "abc123", "meta-llama/Llama-2-7b-hf", false);
        manifest.record(SessionPhase::Loaded);
        manifest.merge_precision = Some(Precision::Bf16);
        manifest.save(&path).unwrap();

        let loaded = RunManifest::load(&path).unwrap();
        assert_eq!(loaded, manifest);
        assert!(loaded.completed(SessionPhase::Loaded));
        assert!(!loaded.completed(SessionPhase::Merged));

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"merge_precision\": \"bfloat16\""));
    }
}
