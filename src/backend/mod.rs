// Training backend interface
//
// The external fine-tuning stack (quantized loading, PEFT adapters, SFT
// trainer, multi-device preparation) sits behind `TrainingBackend`. The
// orchestrator only ever holds opaque handles returned by it.

pub mod protocol;
pub mod worker;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::config::{LoraSettings, QuantizationSettings, SftArgs, TrainingArgs};

pub use worker::{WorkerBackend, WorkerError};

/// Backend-assigned id of a live object (model, tokenizer, optimizer...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Plain base model, possibly quantized
    Base,
    /// Base model with LoRA modules layered on
    Adapted,
    /// Adapter folded into the base weights
    Merged,
}

/// A model living in the backend. Not `Clone`: exactly one owner at a time.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelHandle {
    pub id: HandleId,
    pub kind: ModelKind,
    pub total_params: u64,
    pub trainable_params: u64,
    /// Names of injected adapter modules, empty when there are none
    #[serde(default)]
    pub adapter_modules: Vec<String>,
}

impl ModelHandle {
    /// True if any adapter structure remains on the model
    pub fn has_adapter(&self) -> bool {
        self.kind == ModelKind::Adapted || !self.adapter_modules.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingSide {
    Left,
    Right,
}

/// A tokenizer living in the backend
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenizerHandle {
    pub id: HandleId,
    #[serde(default)]
    pub pad_token: Option<String>,
    #[serde(default)]
    pub eos_token: Option<String>,
    pub padding_side: PaddingSide,
}

/// Optimizer and the parameter set it updates
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerHandle {
    pub id: HandleId,
    /// Model whose parameters the optimizer was built over
    pub model: HandleId,
    pub param_count: u64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerHandle {
    pub id: HandleId,
    pub optimizer: HandleId,
}

/// Optimizer plus its learning-rate scheduler
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerBinding {
    pub optimizer: OptimizerHandle,
    pub scheduler: SchedulerHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// bitsandbytes 8-bit Adam
    Adam8bit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSpec {
    pub kind: OptimizerKind,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Constant learning rate
    ConstantLr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSpec {
    pub kind: SchedulerKind,
}

/// Numeric precision for reloading the trained adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "float16")]
    Fp16,
    #[serde(rename = "bfloat16")]
    Bf16,
    #[serde(rename = "float32")]
    Fp32,
}

impl Precision {
    /// fp16 wins over bf16; neither means full precision
    pub fn select(fp16: bool, bf16: bool) -> Self {
        if fp16 {
            Precision::Fp16
        } else if bf16 {
            Precision::Bf16
        } else {
            Precision::Fp32
        }
    }

    /// torch dtype name
    pub fn dtype_name(&self) -> &'static str {
        match self {
            Precision::Fp16 => "float16",
            Precision::Bf16 => "bfloat16",
            Precision::Fp32 => "float32",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dtype_name())
    }
}

/// Base model load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadModelRequest {
    pub checkpoint: String,
    /// `None` loads unquantized
    pub quantization: Option<QuantizationSettings>,
    pub device_map: String,
    pub use_cache: bool,
    pub pretraining_tp: Option<u32>,
}

/// Tokenizer load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTokenizerRequest {
    /// Checkpoint id or directory
    pub source: String,
    /// Use the EOS token as the padding token
    pub pad_with_eos: bool,
    pub padding_side: Option<PaddingSide>,
    pub device_map: Option<String>,
}

/// Reload base model + saved adapter from a directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadAdapterRequest {
    pub path: PathBuf,
    pub precision: Precision,
    pub device_map: String,
}

/// Output of the multi-device preparation step
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct DistributedPrepared {
    pub model: ModelHandle,
    #[serde(default)]
    pub optimizer: Option<OptimizerBinding>,
}

/// Everything the SFT trainer needs for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainJob {
    pub model: HandleId,
    pub tokenizer: HandleId,
    pub dataset_path: PathBuf,
    pub dataset_text_field: String,
    pub packing: bool,
    pub peft_config: LoraSettings,
    pub output_dir: PathBuf,
    pub logging_dir: PathBuf,
    pub report_to: String,
    #[serde(flatten)]
    pub training_args: TrainingArgs,
    #[serde(flatten)]
    pub sft_args: SftArgs,
}

/// What the trainer reports back. Logged, not returned to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainSummary {
    #[serde(default)]
    pub global_step: u64,
    #[serde(default)]
    pub training_loss: Option<f64>,
    #[serde(default)]
    pub runtime_secs: Option<f64>,
}

/// Worker identity returned by `ping`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub version: String,
    #[serde(default)]
    pub devices: Vec<String>,
}

/// The external fine-tuning stack. Every call blocks until the backend is
/// done; errors are returned as-is.
#[async_trait]
pub trait TrainingBackend: Send {
    /// Check the backend is alive
    async fn ping(&mut self) -> Result<BackendInfo>;

    /// Set up the multi-device backend
    async fn init_accelerator(&mut self, micro_batch_size: usize) -> Result<()>;

    async fn load_model(&mut self, request: &LoadModelRequest) -> Result<ModelHandle>;

    async fn load_tokenizer(&mut self, request: &LoadTokenizerRequest) -> Result<TokenizerHandle>;

    /// Cast norms/enable input grads for training on a quantized model
    async fn prepare_for_kbit_training(
        &mut self,
        model: ModelHandle,
        gradient_checkpointing: bool,
    ) -> Result<ModelHandle>;

    /// Wrap the model with LoRA modules, freezing the base weights
    async fn inject_adapter(&mut self, model: ModelHandle, lora: &LoraSettings)
        -> Result<ModelHandle>;

    /// Build an optimizer over the model's trainable parameters
    async fn create_optimizer(
        &mut self,
        model: &ModelHandle,
        spec: &OptimizerSpec,
    ) -> Result<OptimizerHandle>;

    async fn create_scheduler(
        &mut self,
        optimizer: &OptimizerHandle,
        spec: &SchedulerSpec,
    ) -> Result<SchedulerHandle>;

    /// Hand the model (and optionally optimizer/scheduler construction) to the
    /// multi-device backend
    async fn prepare_distributed(
        &mut self,
        model: ModelHandle,
        optimizer: Option<&OptimizerSpec>,
        scheduler: Option<&SchedulerSpec>,
    ) -> Result<DistributedPrepared>;

    /// Run the supervised fine-tuning loop to completion
    async fn train(&mut self, job: &TrainJob) -> Result<TrainSummary>;

    async fn save_model(&mut self, model: &ModelHandle, path: &std::path::Path) -> Result<()>;

    async fn save_tokenizer(
        &mut self,
        tokenizer: &TokenizerHandle,
        path: &std::path::Path,
    ) -> Result<()>;

    async fn release_model(&mut self, model: ModelHandle) -> Result<()>;

    async fn release_tokenizer(&mut self, tokenizer: TokenizerHandle) -> Result<()>;

    async fn release_optimizer(&mut self, binding: OptimizerBinding) -> Result<()>;

    /// Return cached device memory to the allocator
    async fn empty_device_cache(&mut self) -> Result<()>;

    async fn load_adapter_model(&mut self, request: &LoadAdapterRequest) -> Result<ModelHandle>;

    /// Fold adapter weights into the base weights and drop the adapter wrapper
    async fn merge_and_unload(&mut self, model: ModelHandle) -> Result<ModelHandle>;

    /// Stop the backend. Handles are invalid afterwards.
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_priority() {
        assert_eq!(Precision::select(true, false), Precision::Fp16);
        assert_eq!(Precision::select(false, true), Precision::Bf16);
        assert_eq!(Precision::select(false, false), Precision::Fp32);
        assert_eq!(Precision::select(true, true), Precision::Fp16);
    }

    #[test]
    fn test_precision_serializes_as_dtype() {
        assert_eq!(serde_json::to_string(&Precision::Bf16).unwrap(), "\"bfloat16\"");
        assert_eq!(Precision::Fp32.to_string(), "float32");
    }

    #[test]
    fn test_has_adapter() {
        let mut model = ModelHandle {
            id: HandleId(1),
            kind: ModelKind::Merged,
            total_params: 100,
            trainable_params: 0,
            adapter_modules: vec![],
        };
        assert!(!model.has_adapter());

        model.adapter_modules.push("q_proj.lora_A".to_string());
        assert!(model.has_adapter());

        model.adapter_modules.clear();
        model.kind = ModelKind::Adapted;
        assert!(model.has_adapter());
    }

    #[test]
    fn test_train_job_flattens_arguments() {
        let job = TrainJob {
            model: HandleId(3),
            tokenizer: HandleId(4),
            dataset_path: PathBuf::from("/exp/dataset/train.jsonl"),
            dataset_text_field: "formatted_prompt".to_string(),
            packing: true,
            peft_config: LoraSettings::default(),
            output_dir: PathBuf::from("/exp/weights"),
            logging_dir: PathBuf::from("/exp/weights/logs"),
            report_to: "none".to_string(),
            training_args: TrainingArgs::default(),
            sft_args: SftArgs {
                max_seq_length: Some(512),
                neftune_noise_alpha: None,
            },
        };

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["learning_rate"], 2e-4);
        assert_eq!(value["max_seq_length"], 512);
        assert_eq!(value["model"], 3);
        assert_eq!(value["peft_config"]["r"], 8);
    }
}
