// Training session orchestrator
//
// Sequences the fine-tuning workflow against a `TrainingBackend`:
// load base model -> inject LoRA -> train -> reload + merge.
// Phases must run in that order; anything else is rejected before the
// backend is touched.

use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::artifacts::AdapterArtifacts;
use super::manifest::RunManifest;
use super::state::{SessionPhase, SessionState};
use crate::backend::{
    LoadAdapterRequest, LoadModelRequest, LoadTokenizerRequest, ModelHandle, OptimizerBinding,
    OptimizerKind, OptimizerSpec, PaddingSide, Precision, SchedulerKind, SchedulerSpec,
    TokenizerHandle, TrainJob, TrainSummary, TrainingBackend,
};
use crate::config::{write_config_snapshot, Config};
use crate::dataset::{TrainingDataset, TEXT_FIELD};
use crate::errors::SessionError;
use crate::paths::DirectoryHelper;
use crate::reporter::{Reporter, StatusGuard};

/// File name of the dataset copy handed to the trainer
const DATASET_FILE: &str = "train.jsonl";

/// Owns one fine-tuning session and the handles live in its current phase
pub struct ModelLoader<B: TrainingBackend> {
    config: Config,
    backend: B,
    reporter: Arc<dyn Reporter>,
    directory_helper: DirectoryHelper,
    weights_path: PathBuf,
    session_id: Uuid,
    manifest: RunManifest,
    state: SessionState,
}

impl<B: TrainingBackend> ModelLoader<B> {
    pub fn new(
        config: Config,
        backend: B,
        reporter: Arc<dyn Reporter>,
        directory_helper: DirectoryHelper,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let weights_path = directory_helper.save_paths.weights.clone();
        let manifest = RunManifest::new(
            session_id,
            directory_helper.experiment_id(),
            config.model.hf_model_ckpt.clone(),
            config.accelerate,
        );

        info!(
            session = %session_id,
            checkpoint = %config.model.hf_model_ckpt,
            weights = %weights_path.display(),
            accelerate = config.accelerate,
            "Created training session"
        );

        Self {
            config,
            backend,
            reporter,
            directory_helper,
            weights_path,
            session_id,
            manifest,
            state: SessionState::Unloaded,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Current model, if the phase has one
    pub fn model(&self) -> Option<&ModelHandle> {
        self.state.model()
    }

    pub fn tokenizer(&self) -> Option<&TokenizerHandle> {
        self.state.tokenizer()
    }

    pub fn optimizer(&self) -> Option<&OptimizerBinding> {
        self.state.optimizer()
    }

    /// Where adapter weights are written by `train` and read by the merge
    pub fn weights_path(&self) -> &Path {
        &self.weights_path
    }

    pub fn directory_helper(&self) -> &DirectoryHelper {
        &self.directory_helper
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn expect_phase(
        &self,
        operation: &'static str,
        expected: SessionPhase,
    ) -> Result<(), SessionError> {
        let actual = self.state.phase();
        if actual == expected {
            Ok(())
        } else {
            Err(SessionError::OutOfOrder {
                operation,
                expected,
                actual,
            })
        }
    }

    /// Move the state out, leaving `Failed` until the transition completes
    fn take_state(&mut self) -> SessionState {
        mem::replace(&mut self.state, SessionState::Failed)
    }

    /// Put a state back after a failed phase match
    fn reject(
        &mut self,
        state: SessionState,
        operation: &'static str,
        expected: SessionPhase,
    ) -> SessionError {
        let actual = state.phase();
        self.state = state;
        SessionError::OutOfOrder {
            operation,
            expected,
            actual,
        }
    }

    fn record_phase(&mut self, phase: SessionPhase) -> Result<(), SessionError> {
        self.manifest.record(phase);
        self.manifest
            .save(&self.directory_helper.save_paths.manifest())
            .map_err(SessionError::Storage)
    }

    fn base_model_request(&self) -> LoadModelRequest {
        let model = &self.config.model;
        LoadModelRequest {
            checkpoint: model.hf_model_ckpt.clone(),
            // Multi-device training loads unquantized
            quantization: if self.config.accelerate {
                None
            } else {
                Some(model.bitsandbytes.clone())
            },
            device_map: model.device_map.clone(),
            use_cache: false,
            pretraining_tp: Some(1),
        }
    }

    /// Release every given handle, carrying on past failures.
    /// Returns the first failure.
    async fn release_handles(
        &mut self,
        model: Option<ModelHandle>,
        tokenizer: Option<TokenizerHandle>,
        optimizer: Option<OptimizerBinding>,
    ) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Some(binding) = optimizer {
            if let Err(e) = self.backend.release_optimizer(binding).await {
                warn!(session = %self.session_id, error = %e, "Failed to release optimizer");
                errors.push(e);
            }
        }
        if let Some(model) = model {
            if let Err(e) = self.backend.release_model(model).await {
                warn!(session = %self.session_id, error = %e, "Failed to release model");
                errors.push(e);
            }
        }
        if let Some(tokenizer) = tokenizer {
            if let Err(e) = self.backend.release_tokenizer(tokenizer).await {
                warn!(session = %self.session_id, error = %e, "Failed to release tokenizer");
                errors.push(e);
            }
        }

        errors.into_iter().next().map_or(Ok(()), Err)
    }

    /// Free handles held by an interrupted transition. Release failures are
    /// only logged; the error that interrupted the transition wins.
    async fn discard(
        &mut self,
        model: Option<ModelHandle>,
        tokenizer: Option<TokenizerHandle>,
        optimizer: Option<OptimizerBinding>,
    ) {
        let _ = self.release_handles(model, tokenizer, optimizer).await;
    }

    /// Load the base model under the quantization config, plus its tokenizer
    /// padded with EOS on the right.
    pub async fn load_model_and_tokenizer(&mut self) -> Result<(), SessionError> {
        self.expect_phase("load the base model", SessionPhase::Unloaded)?;
        let checkpoint = self.config.model.hf_model_ckpt.clone();
        let request = self.base_model_request();
        self.state = SessionState::Failed;

        self.reporter.print(&format!("Loading {}...", checkpoint));

        if self.config.accelerate {
            let micro_batch = self.config.training.training_args.per_device_train_batch_size;
            self.backend.init_accelerator(micro_batch).await?;
        }

        let model = self.backend.load_model(&request).await?;
        let tokenizer = match self
            .backend
            .load_tokenizer(&LoadTokenizerRequest {
                source: checkpoint.clone(),
                pad_with_eos: true,
                padding_side: Some(PaddingSide::Right),
                device_map: None,
            })
            .await
        {
            Ok(tokenizer) => tokenizer,
            Err(e) => {
                self.discard(Some(model), None, None).await;
                return Err(e.into());
            }
        };

        info!(
            session = %self.session_id,
            model = %model.id,
            total_params = model.total_params,
            quantized = request.quantization.is_some(),
            "Base model loaded"
        );
        self.reporter.print(&format!("{} Loaded 😄", checkpoint));

        self.state = SessionState::Loaded { model, tokenizer };
        self.record_phase(SessionPhase::Loaded)
    }

    /// Wrap the loaded model with LoRA modules and set up its optimizer.
    ///
    /// Single device: k-bit preparation with gradient checkpointing, then one
    /// 8-bit Adam optimizer and one constant LR scheduler over the adapter
    /// parameters. Multi-device: the backend's prepare step builds both.
    pub async fn inject_lora(&mut self) -> Result<(), SessionError> {
        let (model, tokenizer) = match self.take_state() {
            SessionState::Loaded { model, tokenizer } => (model, tokenizer),
            other => return Err(self.reject(other, "inject LoRA modules", SessionPhase::Loaded)),
        };

        self.reporter.print("Injecting Lora Modules");

        let (model, optimizer) = match self.attach_adapter(model).await {
            Ok(attached) => attached,
            Err(e) => {
                self.discard(None, Some(tokenizer), None).await;
                return Err(e);
            }
        };

        if let Some(binding) = &optimizer {
            if let Err(e) = check_binding(&model, binding) {
                self.discard(Some(model), Some(tokenizer), optimizer).await;
                return Err(e);
            }
        }
        if !model.has_adapter() {
            warn!(
                session = %self.session_id,
                model = %model.id,
                "Backend reported no adapter modules after injection"
            );
        }

        info!(
            session = %self.session_id,
            model = %model.id,
            trainable_params = model.trainable_params,
            total_params = model.total_params,
            trainable_pct = percent(model.trainable_params, model.total_params),
            "LoRA modules injected"
        );
        self.reporter.print("LoRA Modules Injected!");

        self.state = SessionState::Injected {
            model,
            tokenizer,
            optimizer,
        };
        self.record_phase(SessionPhase::Injected)
    }

    /// Adapter injection plus optimizer construction for either path.
    /// On failure the model has either moved into the backend or been released.
    async fn attach_adapter(
        &mut self,
        model: ModelHandle,
    ) -> Result<(ModelHandle, Option<OptimizerBinding>), SessionError> {
        let optimizer_spec = OptimizerSpec {
            kind: OptimizerKind::Adam8bit,
            learning_rate: self.config.training.training_args.learning_rate,
        };
        let scheduler_spec = SchedulerSpec {
            kind: SchedulerKind::ConstantLr,
        };

        if self.config.accelerate {
            let model = self.backend.inject_adapter(model, &self.config.lora).await?;
            let prepared = self
                .backend
                .prepare_distributed(model, Some(&optimizer_spec), Some(&scheduler_spec))
                .await?;
            return Ok((prepared.model, prepared.optimizer));
        }

        let model = self.backend.prepare_for_kbit_training(model, true).await?;
        let model = self.backend.inject_adapter(model, &self.config.lora).await?;

        let optimizer = match self.backend.create_optimizer(&model, &optimizer_spec).await {
            Ok(optimizer) => optimizer,
            Err(e) => {
                self.discard(Some(model), None, None).await;
                return Err(e.into());
            }
        };
        match self.backend.create_scheduler(&optimizer, &scheduler_spec).await {
            Ok(scheduler) => Ok((model, Some(OptimizerBinding { optimizer, scheduler }))),
            Err(e) => {
                // An optimizer without a scheduler has no release call of its own
                warn!(session = %self.session_id, optimizer = %optimizer.id, "Scheduler creation failed");
                self.discard(Some(model), None, None).await;
                Err(e.into())
            }
        }
    }

    /// Run supervised fine-tuning over `dataset`, then persist adapter and
    /// tokenizer to the weights path.
    pub async fn train(&mut self, dataset: &TrainingDataset) -> Result<(), SessionError> {
        self.expect_phase("train", SessionPhase::Injected)?;
        if dataset.is_empty() {
            return Err(SessionError::EmptyDataset);
        }

        let paths = self.directory_helper.save_paths.clone();
        let dataset_path = paths.dataset.join(DATASET_FILE);
        // The experiment directory is reused across runs of the same config;
        // files from an earlier run must not pass for this run's output
        self.directory_helper
            .create_dirs()
            .and_then(|_| AdapterArtifacts::clear(&self.weights_path))
            .and_then(|_| write_config_snapshot(&self.config, &paths.config.join("config.toml")))
            .and_then(|_| dataset.write_jsonl(&dataset_path))
            .map_err(SessionError::Storage)?;

        let (model, tokenizer, optimizer) = match self.take_state() {
            SessionState::Injected {
                model,
                tokenizer,
                optimizer,
            } => (model, tokenizer, optimizer),
            other => return Err(self.reject(other, "train", SessionPhase::Injected)),
        };

        let job = TrainJob {
            model: model.id,
            tokenizer: tokenizer.id,
            dataset_path,
            dataset_text_field: TEXT_FIELD.to_string(),
            packing: true,
            peft_config: self.config.lora.clone(),
            output_dir: self.weights_path.clone(),
            logging_dir: paths.logs(),
            report_to: "none".to_string(),
            training_args: self.config.training.training_args.clone(),
            sft_args: self.config.training.sft_args.clone(),
        };

        info!(
            session = %self.session_id,
            examples = dataset.len(),
            epochs = job.training_args.num_train_epochs,
            output_dir = %job.output_dir.display(),
            "Starting supervised fine-tuning"
        );

        let summary = match self.train_and_save(&job, &model, &tokenizer).await {
            Ok(summary) => summary,
            Err(e) => {
                self.discard(Some(model), Some(tokenizer), optimizer).await;
                return Err(e);
            }
        };

        info!(
            session = %self.session_id,
            global_step = summary.global_step,
            training_loss = ?summary.training_loss,
            "Training finished"
        );
        self.reporter
            .print(&format!("Run saved at {}", self.weights_path.display()));

        self.manifest.dataset_examples = Some(dataset.len());
        self.manifest.train_summary = Some(summary);
        self.state = SessionState::Trained {
            model,
            tokenizer,
            optimizer,
        };
        self.record_phase(SessionPhase::Trained)
    }

    async fn train_and_save(
        &mut self,
        job: &TrainJob,
        model: &ModelHandle,
        tokenizer: &TokenizerHandle,
    ) -> Result<TrainSummary, SessionError> {
        let summary = {
            let _status = StatusGuard::new(self.reporter.as_ref(), "Training...");
            self.backend.train(job).await?
        };
        self.reporter.print("Training Complete");

        self.backend.save_model(model, &self.weights_path).await?;
        self.backend.save_tokenizer(tokenizer, &self.weights_path).await?;
        AdapterArtifacts::inspect(&self.weights_path).require_complete()?;

        Ok(summary)
    }

    /// Release the training model, reload base + saved adapter from the
    /// weights path and fold the adapter into the base weights.
    pub async fn load_and_merge_from_saved(&mut self) -> Result<(), SessionError> {
        self.expect_phase("merge adapter weights", SessionPhase::Trained)?;
        AdapterArtifacts::inspect(&self.weights_path).require_adapter()?;

        let (model, tokenizer, optimizer) = match self.take_state() {
            SessionState::Trained {
                model,
                tokenizer,
                optimizer,
            } => (model, tokenizer, optimizer),
            other => return Err(self.reject(other, "merge adapter weights", SessionPhase::Trained)),
        };

        // Free device memory before the reload, or peak usage doubles
        self.release_handles(Some(model), Some(tokenizer), optimizer)
            .await?;
        self.backend.empty_device_cache().await?;
        debug!(session = %self.session_id, "Released training handles");

        self.reporter.print("Merging Adapter Weights...");

        let args = &self.config.training.training_args;
        let precision = Precision::select(args.fp16, args.bf16);
        let device_map = self.config.model.device_map.clone();

        let model = self
            .backend
            .load_adapter_model(&LoadAdapterRequest {
                path: self.weights_path.clone(),
                precision,
                device_map: device_map.clone(),
            })
            .await?;

        let model = if self.config.accelerate {
            self.backend.prepare_distributed(model, None, None).await?.model
        } else {
            model
        };

        let adapter_params = model.total_params;
        let merged = self.backend.merge_and_unload(model).await?;
        if merged.has_adapter() {
            let modules = merged.adapter_modules.clone();
            self.discard(Some(merged), None, None).await;
            return Err(SessionError::ResidualAdapter { modules });
        }
        self.reporter.print("Done Merging");

        let tokenizer = match self
            .backend
            .load_tokenizer(&LoadTokenizerRequest {
                source: self.weights_path.display().to_string(),
                pad_with_eos: false,
                padding_side: None,
                device_map: Some(device_map),
            })
            .await
        {
            Ok(tokenizer) => tokenizer,
            Err(e) => {
                self.discard(Some(merged), None, None).await;
                return Err(e.into());
            }
        };

        info!(
            session = %self.session_id,
            model = %merged.id,
            precision = %precision,
            params_before = adapter_params,
            params_after = merged.total_params,
            "Adapter merged into base model"
        );

        self.manifest.merge_precision = Some(precision);
        self.state = SessionState::Merged {
            model: merged,
            tokenizer,
        };
        self.record_phase(SessionPhase::Merged)
    }

    /// Persist the merged model and tokenizer to the merged output path
    pub async fn save_merged(&mut self) -> Result<PathBuf, SessionError> {
        self.expect_phase("save the merged model", SessionPhase::Merged)?;
        let merged_path = self.directory_helper.save_paths.merged.clone();
        std::fs::create_dir_all(&merged_path)
            .map_err(|e| SessionError::Storage(e.into()))?;

        if let SessionState::Merged { model, tokenizer } = &self.state {
            self.backend.save_model(model, &merged_path).await?;
            self.backend.save_tokenizer(tokenizer, &merged_path).await?;
        }

        info!(session = %self.session_id, path = %merged_path.display(), "Merged model saved");
        self.reporter
            .print(&format!("Merged model saved at {}", merged_path.display()));

        Ok(merged_path)
    }

    /// Every phase in order, ending with the merged model on disk
    pub async fn run(&mut self, dataset: &TrainingDataset) -> Result<PathBuf, SessionError> {
        self.load_model_and_tokenizer().await?;
        self.inject_lora().await?;
        self.train(dataset).await?;
        self.load_and_merge_from_saved().await?;
        self.save_merged().await
    }

    /// Release whatever is still live and stop the backend.
    ///
    /// The backend is stopped even when a release fails; the first failure
    /// is returned afterwards.
    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        let (model, tokenizer, optimizer) =
            match mem::replace(&mut self.state, SessionState::Closed) {
                SessionState::Loaded { model, tokenizer }
                | SessionState::Merged { model, tokenizer } => (Some(model), Some(tokenizer), None),
                SessionState::Injected {
                    model,
                    tokenizer,
                    optimizer,
                }
                | SessionState::Trained {
                    model,
                    tokenizer,
                    optimizer,
                } => (Some(model), Some(tokenizer), optimizer),
                SessionState::Closed => return Ok(()),
                SessionState::Unloaded | SessionState::Failed => (None, None, None),
            };

        let released = self.release_handles(model, tokenizer, optimizer).await;
        let stopped = self.backend.shutdown().await;
        debug!(session = %self.session_id, "Session closed");

        released?;
        stopped?;
        Ok(())
    }
}

/// The optimizer must cover exactly the adapter model's trainable parameters,
/// and the scheduler must drive that optimizer
fn check_binding(model: &ModelHandle, binding: &OptimizerBinding) -> Result<(), SessionError> {
    let optimizer = &binding.optimizer;
    if optimizer.model != model.id || optimizer.param_count != model.trainable_params {
        return Err(SessionError::OptimizerMismatch {
            model: model.id.0,
            trainable_params: model.trainable_params,
            optimizer_model: optimizer.model.0,
            optimizer_params: optimizer.param_count,
        });
    }
    if binding.scheduler.optimizer != optimizer.id {
        return Err(SessionError::SchedulerMismatch {
            optimizer: optimizer.id.0,
            scheduler_optimizer: binding.scheduler.optimizer.0,
        });
    }
    Ok(())
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HandleId, ModelKind, OptimizerHandle, SchedulerHandle};

    fn adapted(id: u64, trainable: u64) -> ModelHandle {
        ModelHandle {
            id: HandleId(id),
            kind: ModelKind::Adapted,
            total_params: 1_000,
            trainable_params: trainable,
            adapter_modules: vec!["q_proj".to_string()],
        }
    }

    fn binding(model: u64, params: u64, scheduler_optimizer: u64) -> OptimizerBinding {
        OptimizerBinding {
            optimizer: OptimizerHandle {
                id: HandleId(10),
                model: HandleId(model),
                param_count: params,
            },
            scheduler: SchedulerHandle {
                id: HandleId(11),
                optimizer: HandleId(scheduler_optimizer),
            },
        }
    }

    #[test]
    fn test_binding_matches() {
        assert!(check_binding(&adapted(1, 40), &binding(1, 40, 10)).is_ok());
    }

    #[test]
    fn test_binding_wrong_model() {
        assert!(matches!(
            check_binding(&adapted(1, 40), &binding(2, 40, 10)),
            Err(SessionError::OptimizerMismatch { optimizer_model: 2, .. })
        ));
    }

    #[test]
    fn test_binding_wrong_param_count() {
        assert!(matches!(
            check_binding(&adapted(1, 40), &binding(1, 1_000, 10)),
            Err(SessionError::OptimizerMismatch { .. })
        ));
    }

    #[test]
    fn test_binding_wrong_scheduler() {
        assert!(matches!(
            check_binding(&adapted(1, 40), &binding(1, 40, 99)),
            Err(SessionError::SchedulerMismatch { .. })
        ));
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(25, 100), 25.0);
    }
}
