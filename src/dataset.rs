// Training dataset
//
// Examples arrive already formatted: each one carries the full prompt text
// in `formatted_prompt`, which is the field the SFT trainer reads.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Field the trainer reads prompt text from
pub const TEXT_FIELD: &str = "formatted_prompt";

/// One formatted training example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedExample {
    pub formatted_prompt: String,
}

impl FormattedExample {
    pub fn new(formatted_prompt: impl Into<String>) -> Self {
        Self {
            formatted_prompt: formatted_prompt.into(),
        }
    }
}

/// In-memory training dataset
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingDataset {
    examples: Vec<FormattedExample>,
}

impl TrainingDataset {
    pub fn new(examples: Vec<FormattedExample>) -> Self {
        Self { examples }
    }

    /// Read a JSONL file with one `{"formatted_prompt": ...}` object per line.
    /// Blank lines are skipped; extra fields are ignored.
    pub fn from_jsonl(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open dataset: {}", path.display()))?;

        let mut examples = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let example: FormattedExample = serde_json::from_str(&line).with_context(|| {
                format!(
                    "Line {} of {} is not a `{}` record",
                    index + 1,
                    path.display(),
                    TEXT_FIELD
                )
            })?;
            examples.push(example);
        }

        tracing::debug!(path = %path.display(), examples = examples.len(), "Loaded dataset");
        Ok(Self { examples })
    }

    /// Write as JSONL, creating parent directories
    pub fn write_jsonl(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let file = File::create(path)
            .with_context(|| format!("Failed to create dataset file: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for example in &self.examples {
            serde_json::to_writer(&mut writer, example)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[FormattedExample] {
        &self.examples
    }
}

impl FromIterator<FormattedExample> for TrainingDataset {
    fn from_iter<I: IntoIterator<Item = FormattedExample>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/train.jsonl");

        let dataset: TrainingDataset = ["### Q: hi\n### A: hello", "### Q: 2+2\n### A: 4"]
            .into_iter()
            .map(FormattedExample::new)
            .collect();
        dataset.write_jsonl(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"formatted_prompt\""));

        let loaded = TrainingDataset::from_jsonl(&path).unwrap();
        assert_eq!(loaded, dataset);
    }

    #[test]
    fn test_blank_lines_and_extra_fields() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("train.jsonl");
        fs::write(
            &path,
            "{\"formatted_prompt\": \"a\", \"source\": \"x\"}\n\n{\"formatted_prompt\": \"b\"}\n",
        )
        .unwrap();

        let dataset = TrainingDataset::from_jsonl(&path).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.examples()[1].formatted_prompt, "b");
    }

    #[test]
    fn test_missing_text_field_reports_line() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("train.jsonl");
        fs::write(&path, "{\"formatted_prompt\": \"a\"}\n{\"text\": \"b\"}\n").unwrap();

        let err = TrainingDataset::from_jsonl(&path).unwrap_err();
        assert!(err.to_string().contains("Line 2"));
    }
}
