// Training worker subprocess
//
// Drives the external fine-tuning stack through one long-lived child process.
// Model and tokenizer objects stay inside the worker between calls; we only
// see their handles.

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{decode_reply, encode_request, Request};
use super::{
    BackendInfo, DistributedPrepared, LoadAdapterRequest, LoadModelRequest, LoadTokenizerRequest,
    ModelHandle, OptimizerBinding, OptimizerHandle, OptimizerSpec, SchedulerHandle, SchedulerSpec,
    TokenizerHandle, TrainJob, TrainSummary, TrainingBackend,
};
use crate::config::{LoraSettings, WorkerSettings};

/// How long to wait for the worker to exit after `shutdown`
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Failures talking to the worker process
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to start worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("worker pipe error: {0}")]
    Io(#[from] io::Error),

    #[error("worker exited while `{op}` was pending")]
    Closed { op: &'static str },

    #[error("failed to encode `{op}` request: {source}")]
    Encode {
        op: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed reply to `{op}`: {source} (line: {line})")]
    Malformed {
        op: &'static str,
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("reply id mismatch for `{op}`: expected {expected}, got {got}")]
    IdMismatch {
        op: &'static str,
        expected: u64,
        got: u64,
    },

    #[error("{op} failed in worker: {message}")]
    Remote { op: &'static str, message: String },
}

/// `TrainingBackend` over a JSON-lines worker process
pub struct WorkerBackend {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    stderr_task: Option<JoinHandle<()>>,
}

impl WorkerBackend {
    /// Start the worker described by `settings`
    pub fn spawn(settings: &WorkerSettings) -> Result<Self, WorkerError> {
        let mut command = Command::new(&settings.program);
        command
            .args(&settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in &settings.env {
            command.env(&var.name, &var.value);
        }

        let mut child = command.spawn().map_err(|source| WorkerError::Spawn {
            program: settings.program.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or(WorkerError::Closed { op: "spawn" })?;
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "tunesmith::worker", "{}", line);
                }
            })
        });

        info!(
            program = %settings.program,
            args = ?settings.args,
            pid = ?child.id(),
            "Training worker started"
        );

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
            stderr_task,
        })
    }

    /// Send one request and wait for its reply
    async fn call<T: DeserializeOwned>(&mut self, request: Request<'_>) -> Result<T, WorkerError> {
        let op = request.op();
        let id = self.next_id;
        self.next_id += 1;

        let line = encode_request(id, &request)
            .map_err(|source| WorkerError::Encode { op, source })?;

        let stdin = self.stdin.as_mut().ok_or(WorkerError::Closed { op })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        debug!(id, op, "Sent worker request");

        let reply_line = self
            .stdout
            .next_line()
            .await?
            .ok_or(WorkerError::Closed { op })?;

        let reply = decode_reply(&reply_line).map_err(|source| WorkerError::Malformed {
            op,
            line: reply_line.clone(),
            source,
        })?;

        if reply.id != id {
            return Err(WorkerError::IdMismatch {
                op,
                expected: id,
                got: reply.id,
            });
        }

        if !reply.ok {
            return Err(WorkerError::Remote {
                op,
                message: reply.error.unwrap_or_else(|| "unknown error".to_string()),
            });
        }

        serde_json::from_value(reply.result).map_err(|source| WorkerError::Malformed {
            op,
            line: reply_line,
            source,
        })
    }
}

#[async_trait]
impl TrainingBackend for WorkerBackend {
    async fn ping(&mut self) -> Result<BackendInfo> {
        Ok(self.call(Request::Ping).await?)
    }

    async fn init_accelerator(&mut self, micro_batch_size: usize) -> Result<()> {
        Ok(self.call(Request::InitAccelerator { micro_batch_size }).await?)
    }

    async fn load_model(&mut self, request: &LoadModelRequest) -> Result<ModelHandle> {
        Ok(self.call(Request::LoadModel(request)).await?)
    }

    async fn load_tokenizer(&mut self, request: &LoadTokenizerRequest) -> Result<TokenizerHandle> {
        Ok(self.call(Request::LoadTokenizer(request)).await?)
    }

    async fn prepare_for_kbit_training(
        &mut self,
        model: ModelHandle,
        gradient_checkpointing: bool,
    ) -> Result<ModelHandle> {
        Ok(self
            .call(Request::PrepareForKbitTraining {
                model: model.id,
                gradient_checkpointing,
            })
            .await?)
    }

    async fn inject_adapter(
        &mut self,
        model: ModelHandle,
        lora: &LoraSettings,
    ) -> Result<ModelHandle> {
        Ok(self
            .call(Request::InjectAdapter {
                model: model.id,
                lora,
            })
            .await?)
    }

    async fn create_optimizer(
        &mut self,
        model: &ModelHandle,
        spec: &OptimizerSpec,
    ) -> Result<OptimizerHandle> {
        Ok(self
            .call(Request::CreateOptimizer {
                model: model.id,
                optimizer: spec,
            })
            .await?)
    }

    async fn create_scheduler(
        &mut self,
        optimizer: &OptimizerHandle,
        spec: &SchedulerSpec,
    ) -> Result<SchedulerHandle> {
        Ok(self
            .call(Request::CreateScheduler {
                optimizer: optimizer.id,
                scheduler: spec,
            })
            .await?)
    }

    async fn prepare_distributed(
        &mut self,
        model: ModelHandle,
        optimizer: Option<&OptimizerSpec>,
        scheduler: Option<&SchedulerSpec>,
    ) -> Result<DistributedPrepared> {
        Ok(self
            .call(Request::PrepareDistributed {
                model: model.id,
                optimizer,
                scheduler,
            })
            .await?)
    }

    async fn train(&mut self, job: &TrainJob) -> Result<TrainSummary> {
        Ok(self.call(Request::Train(job)).await?)
    }

    async fn save_model(&mut self, model: &ModelHandle, path: &Path) -> Result<()> {
        Ok(self
            .call(Request::SaveModel {
                model: model.id,
                path,
            })
            .await?)
    }

    async fn save_tokenizer(&mut self, tokenizer: &TokenizerHandle, path: &Path) -> Result<()> {
        Ok(self
            .call(Request::SaveTokenizer {
                tokenizer: tokenizer.id,
                path,
            })
            .await?)
    }

    async fn release_model(&mut self, model: ModelHandle) -> Result<()> {
        Ok(self.call(Request::ReleaseModel { model: model.id }).await?)
    }

    async fn release_tokenizer(&mut self, tokenizer: TokenizerHandle) -> Result<()> {
        Ok(self
            .call(Request::ReleaseTokenizer {
                tokenizer: tokenizer.id,
            })
            .await?)
    }

    async fn release_optimizer(&mut self, binding: OptimizerBinding) -> Result<()> {
        Ok(self
            .call(Request::ReleaseOptimizer {
                optimizer: binding.optimizer.id,
                scheduler: binding.scheduler.id,
            })
            .await?)
    }

    async fn empty_device_cache(&mut self) -> Result<()> {
        Ok(self.call(Request::EmptyDeviceCache).await?)
    }

    async fn load_adapter_model(&mut self, request: &LoadAdapterRequest) -> Result<ModelHandle> {
        Ok(self.call(Request::LoadAdapterModel(request)).await?)
    }

    async fn merge_and_unload(&mut self, model: ModelHandle) -> Result<ModelHandle> {
        Ok(self.call(Request::MergeAndUnload { model: model.id }).await?)
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.stdin.is_some() {
            if let Err(e) = self.call::<()>(Request::Shutdown).await {
                warn!(error = %e, "Worker did not acknowledge shutdown");
            }
        }
        // Closing stdin signals EOF to workers that ignore the shutdown op
        self.stdin = None;

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(status = ?status, "Training worker exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for training worker"),
            Err(_) => {
                warn!("Training worker did not exit in time, killing it");
                self.child.kill().await?;
            }
        }

        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }

        Ok(())
    }
}
