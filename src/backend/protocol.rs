// Worker wire protocol
//
// Newline-delimited JSON. Each request is one object with an `id` and an
// `op` tag plus the op's parameters; the worker answers with exactly one
// reply line carrying the same id.
//
//   -> {"id": 7, "op": "merge_and_unload", "model": 3}
//   <- {"id": 7, "ok": true, "result": {"id": 9, "kind": "merged", ...}}
//   <- {"id": 7, "ok": false, "error": "CUDA out of memory"}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use super::{
    HandleId, LoadAdapterRequest, LoadModelRequest, LoadTokenizerRequest, OptimizerSpec,
    SchedulerSpec, TrainJob,
};
use crate::config::LoraSettings;

/// One operation sent to the worker
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request<'a> {
    Ping,
    InitAccelerator {
        micro_batch_size: usize,
    },
    LoadModel(&'a LoadModelRequest),
    LoadTokenizer(&'a LoadTokenizerRequest),
    PrepareForKbitTraining {
        model: HandleId,
        gradient_checkpointing: bool,
    },
    InjectAdapter {
        model: HandleId,
        lora: &'a LoraSettings,
    },
    CreateOptimizer {
        model: HandleId,
        optimizer: &'a OptimizerSpec,
    },
    CreateScheduler {
        optimizer: HandleId,
        scheduler: &'a SchedulerSpec,
    },
    PrepareDistributed {
        model: HandleId,
        optimizer: Option<&'a OptimizerSpec>,
        scheduler: Option<&'a SchedulerSpec>,
    },
    Train(&'a TrainJob),
    SaveModel {
        model: HandleId,
        path: &'a Path,
    },
    SaveTokenizer {
        tokenizer: HandleId,
        path: &'a Path,
    },
    ReleaseModel {
        model: HandleId,
    },
    ReleaseTokenizer {
        tokenizer: HandleId,
    },
    ReleaseOptimizer {
        optimizer: HandleId,
        scheduler: HandleId,
    },
    EmptyDeviceCache,
    LoadAdapterModel(&'a LoadAdapterRequest),
    MergeAndUnload {
        model: HandleId,
    },
    Shutdown,
}

impl Request<'_> {
    /// Wire name of the op
    pub fn op(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::InitAccelerator { .. } => "init_accelerator",
            Request::LoadModel(_) => "load_model",
            Request::LoadTokenizer(_) => "load_tokenizer",
            Request::PrepareForKbitTraining { .. } => "prepare_for_kbit_training",
            Request::InjectAdapter { .. } => "inject_adapter",
            Request::CreateOptimizer { .. } => "create_optimizer",
            Request::CreateScheduler { .. } => "create_scheduler",
            Request::PrepareDistributed { .. } => "prepare_distributed",
            Request::Train(_) => "train",
            Request::SaveModel { .. } => "save_model",
            Request::SaveTokenizer { .. } => "save_tokenizer",
            Request::ReleaseModel { .. } => "release_model",
            Request::ReleaseTokenizer { .. } => "release_tokenizer",
            Request::ReleaseOptimizer { .. } => "release_optimizer",
            Request::EmptyDeviceCache => "empty_device_cache",
            Request::LoadAdapterModel(_) => "load_adapter_model",
            Request::MergeAndUnload { .. } => "merge_and_unload",
            Request::Shutdown => "shutdown",
        }
    }
}

/// Serialize a request as one line (trailing newline included)
pub fn encode_request(id: u64, request: &Request<'_>) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(request)?;
    if let Value::Object(fields) = &mut value {
        fields.insert("id".to_string(), Value::from(id));
    }

    let mut line = serde_json::to_string(&value)?;
    line.push('\n');
    Ok(line)
}

/// One reply line from the worker
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reply {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
}

pub fn decode_reply(line: &str) -> Result<Reply, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ModelHandle, ModelKind, Precision};
    use std::path::PathBuf;

    #[test]
    fn test_encode_struct_variant() {
        let line = encode_request(7, &Request::MergeAndUnload { model: HandleId(3) }).unwrap();
        assert!(line.ends_with('\n'));

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["op"], "merge_and_unload");
        assert_eq!(value["model"], 3);
    }

    #[test]
    fn test_encode_unit_variant() {
        let line = encode_request(1, &Request::EmptyDeviceCache).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["op"], "empty_device_cache");
        assert_eq!(value["id"], 1);
    }

    #[test]
    fn test_encode_newtype_variant_inlines_fields() {
        let request = LoadAdapterRequest {
            path: PathBuf::from("/exp/weights"),
            precision: Precision::Bf16,
            device_map: "auto".to_string(),
        };
        let line = encode_request(2, &Request::LoadAdapterModel(&request)).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["op"], "load_adapter_model");
        assert_eq!(value["path"], "/exp/weights");
        assert_eq!(value["precision"], "bfloat16");
    }

    #[test]
    fn test_op_names_match_tags() {
        let requests = [
            Request::Ping,
            Request::InitAccelerator { micro_batch_size: 4 },
            Request::ReleaseOptimizer {
                optimizer: HandleId(1),
                scheduler: HandleId(2),
            },
            Request::Shutdown,
        ];
        for request in &requests {
            let value = serde_json::to_value(request).unwrap();
            assert_eq!(value["op"], request.op());
        }
    }

    #[test]
    fn test_decode_success_reply() {
        let reply = decode_reply(
            r#"{"id": 4, "ok": true, "result": {"id": 9, "kind": "merged", "total_params": 10, "trainable_params": 0}}"#,
        )
        .unwrap();
        assert!(reply.ok);
        let model: ModelHandle = serde_json::from_value(reply.result).unwrap();
        assert_eq!(model.kind, ModelKind::Merged);
        assert!(model.adapter_modules.is_empty());
    }

    #[test]
    fn test_decode_error_reply() {
        let reply = decode_reply("{\"id\": 5, \"ok\": false, \"error\": \"boom\"}\n").unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.result, Value::Null);
        assert_eq!(reply.error.as_deref(), Some("boom"));
    }
}
