// Configuration structs
//
// Mirrors the fine-tuning session schema: model checkpoint + quantization,
// LoRA hyperparameters, trainer arguments, worker process and deployment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::deploy::DeployConfig;

/// Configuration validation failure
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Root session configuration. Built once at startup, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for experiment outputs
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,

    /// Hand model/optimizer preparation to the multi-device backend
    #[serde(default)]
    pub accelerate: bool,

    pub model: ModelSettings,

    #[serde(default)]
    pub lora: LoraSettings,

    #[serde(default)]
    pub training: TrainingSettings,

    #[serde(default)]
    pub backend: WorkerSettings,

    #[serde(default)]
    pub deploy: Option<DeployConfig>,
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("experiments")
}

/// Base model checkpoint and placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// HuggingFace checkpoint id or local path (e.g., "NousResearch/Llama-2-7b-hf")
    pub hf_model_ckpt: String,

    /// Device placement policy passed through to the loader
    #[serde(default = "default_device_map")]
    pub device_map: String,

    #[serde(default)]
    pub bitsandbytes: QuantizationSettings,
}

fn default_device_map() -> String {
    "auto".to_string()
}

/// bitsandbytes quantization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationSettings {
    #[serde(default = "default_true")]
    pub load_in_4bit: bool,
    #[serde(default)]
    pub load_in_8bit: bool,
    #[serde(default = "default_compute_dtype")]
    pub bnb_4bit_compute_dtype: String,
    #[serde(default = "default_quant_type")]
    pub bnb_4bit_quant_type: String,
    #[serde(default = "default_true")]
    pub bnb_4bit_use_double_quant: bool,
    #[serde(default = "default_int8_threshold")]
    pub llm_int8_threshold: f64,
}

impl Default for QuantizationSettings {
    fn default() -> Self {
        Self {
            load_in_4bit: true,
            load_in_8bit: false,
            bnb_4bit_compute_dtype: default_compute_dtype(),
            bnb_4bit_quant_type: default_quant_type(),
            bnb_4bit_use_double_quant: true,
            llm_int8_threshold: default_int8_threshold(),
        }
    }
}

impl QuantizationSettings {
    /// True when any quantized load mode is requested
    pub fn is_enabled(&self) -> bool {
        self.load_in_4bit || self.load_in_8bit
    }
}

fn default_true() -> bool {
    true
}

fn default_compute_dtype() -> String {
    "bfloat16".to_string()
}

fn default_quant_type() -> String {
    "nf4".to_string()
}

fn default_int8_threshold() -> f64 {
    6.0
}

/// LoRA adapter hyperparameters (PEFT `LoraConfig` field names)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraSettings {
    /// Rank of the low-rank decomposition
    #[serde(default = "default_rank")]
    pub r: usize,
    #[serde(default = "default_alpha")]
    pub lora_alpha: f64,
    #[serde(default = "default_dropout")]
    pub lora_dropout: f64,
    #[serde(default = "default_bias")]
    pub bias: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    /// Modules to wrap; `None` lets the backend pick per architecture
    #[serde(default)]
    pub target_modules: Option<Vec<String>>,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,
}

impl Default for LoraSettings {
    fn default() -> Self {
        Self {
            r: default_rank(),
            lora_alpha: default_alpha(),
            lora_dropout: default_dropout(),
            bias: default_bias(),
            task_type: default_task_type(),
            target_modules: None,
            fan_in_fan_out: false,
            modules_to_save: None,
        }
    }
}

fn default_rank() -> usize {
    8
}

fn default_alpha() -> f64 {
    16.0
}

fn default_dropout() -> f64 {
    0.1
}

fn default_bias() -> String {
    "none".to_string()
}

fn default_task_type() -> String {
    "CAUSAL_LM".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingSettings {
    #[serde(default)]
    pub training_args: TrainingArgs,
    #[serde(default)]
    pub sft_args: SftArgs,
}

/// Trainer arguments forwarded verbatim to the supervised fine-tuning loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArgs {
    #[serde(default = "default_epochs")]
    pub num_train_epochs: u32,
    #[serde(default = "default_batch_size")]
    pub per_device_train_batch_size: usize,
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,
    #[serde(default = "default_true")]
    pub gradient_checkpointing: bool,
    #[serde(default = "default_optim")]
    pub optim: String,
    #[serde(default = "default_logging_steps")]
    pub logging_steps: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_true")]
    pub bf16: bool,
    #[serde(default)]
    pub fp16: bool,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    #[serde(default = "default_warmup_ratio")]
    pub warmup_ratio: f64,
    #[serde(default = "default_scheduler_type")]
    pub lr_scheduler_type: String,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            num_train_epochs: default_epochs(),
            per_device_train_batch_size: default_batch_size(),
            gradient_accumulation_steps: default_grad_accum(),
            gradient_checkpointing: true,
            optim: default_optim(),
            logging_steps: default_logging_steps(),
            learning_rate: default_learning_rate(),
            bf16: true,
            fp16: false,
            max_grad_norm: default_max_grad_norm(),
            warmup_ratio: default_warmup_ratio(),
            lr_scheduler_type: default_scheduler_type(),
        }
    }
}

fn default_epochs() -> u32 {
    5
}

fn default_batch_size() -> usize {
    4
}

fn default_grad_accum() -> usize {
    4
}

fn default_optim() -> String {
    "paged_adamw_32bit".to_string()
}

fn default_logging_steps() -> usize {
    1
}

fn default_learning_rate() -> f64 {
    2e-4
}

fn default_max_grad_norm() -> f64 {
    0.3
}

fn default_warmup_ratio() -> f64 {
    0.03
}

fn default_scheduler_type() -> String {
    "constant".to_string()
}

/// Extra arguments for the SFT trainer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SftArgs {
    #[serde(default)]
    pub max_seq_length: Option<usize>,
    #[serde(default)]
    pub neftune_noise_alpha: Option<f64>,
}

/// How to launch the external training worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    /// Environment variables for the worker process.
    /// A list rather than a map so names keep their case.
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_worker_args(),
            env: Vec::new(),
        }
    }
}

fn default_program() -> String {
    "python3".to_string()
}

fn default_worker_args() -> Vec<String> {
    vec!["-m".to_string(), "tunesmith_worker".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl Config {
    /// Minimal config for a checkpoint, everything else defaulted
    pub fn new(hf_model_ckpt: impl Into<String>) -> Self {
        Self {
            save_dir: default_save_dir(),
            accelerate: false,
            model: ModelSettings {
                hf_model_ckpt: hf_model_ckpt.into(),
                device_map: default_device_map(),
                bitsandbytes: QuantizationSettings::default(),
            },
            lora: LoraSettings::default(),
            training: TrainingSettings::default(),
            backend: WorkerSettings::default(),
            deploy: None,
        }
    }

    /// Check cross-field consistency. Run once, right after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.hf_model_ckpt.trim().is_empty() {
            return Err(ConfigError::invalid("model.hf_model_ckpt", "must not be empty"));
        }

        let quant = &self.model.bitsandbytes;
        if quant.load_in_4bit && quant.load_in_8bit {
            return Err(ConfigError::invalid(
                "model.bitsandbytes",
                "load_in_4bit and load_in_8bit are mutually exclusive",
            ));
        }

        if self.lora.r == 0 {
            return Err(ConfigError::invalid("lora.r", "rank must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.lora.lora_dropout) {
            return Err(ConfigError::invalid(
                "lora.lora_dropout",
                format!("{} is outside [0, 1)", self.lora.lora_dropout),
            ));
        }

        let args = &self.training.training_args;
        if args.num_train_epochs == 0 {
            return Err(ConfigError::invalid(
                "training.training_args.num_train_epochs",
                "must be at least 1",
            ));
        }
        if args.per_device_train_batch_size == 0 {
            return Err(ConfigError::invalid(
                "training.training_args.per_device_train_batch_size",
                "must be at least 1",
            ));
        }
        if !(args.learning_rate > 0.0) {
            return Err(ConfigError::invalid(
                "training.training_args.learning_rate",
                format!("{} is not positive", args.learning_rate),
            ));
        }

        if self.backend.program.trim().is_empty() {
            return Err(ConfigError::invalid("backend.program", "must not be empty"));
        }

        if self.accelerate && quant.is_enabled() {
            tracing::warn!(
                "Quantization settings are ignored when accelerate is enabled; \
                 the base model loads unquantized"
            );
        }
        if args.fp16 && args.bf16 {
            tracing::warn!("Both fp16 and bf16 are set; fp16 takes priority when merging");
        }

        if let Some(deploy) = &self.deploy {
            deploy.validate().map_err(|e| ConfigError::invalid("deploy", e.to_string()))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::new("NousResearch/Llama-2-7b-hf");
        assert!(config.validate().is_ok());
        assert_eq!(config.model.device_map, "auto");
        assert!(config.model.bitsandbytes.is_enabled());
        assert_eq!(config.lora.task_type, "CAUSAL_LM");
    }

    #[test]
    fn test_empty_checkpoint_rejected() {
        let config = Config::new("  ");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("model.hf_model_ckpt"));
    }

    #[test]
    fn test_conflicting_quantization_rejected() {
        let mut config = Config::new("model");
        config.model.bitsandbytes.load_in_8bit = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "model.bitsandbytes", .. })
        ));
    }

    #[test]
    fn test_dropout_out_of_range() {
        let mut config = Config::new("model");
        config.lora.lora_dropout = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = Config::new("model");
        config.training.training_args.per_device_train_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_both_precisions_still_valid() {
        let mut config = Config::new("model");
        config.training.training_args.fp16 = true;
        config.training.training_args.bf16 = true;
        assert!(config.validate().is_ok());
    }
}
