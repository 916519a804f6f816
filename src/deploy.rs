// Deployment script invocation
//
// Replaces the interactive deployment prompts with a validated `[deploy]`
// config section, then hands everything to the inference deployment script
// as positional arguments.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Errors raised while preparing or running a deployment
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("`{field}` is required when deploying with {server}")]
    MissingField {
        server: ServingBackend,
        field: &'static str,
    },

    #[error("deployment script not found: {0}")]
    ScriptNotFound(PathBuf),

    #[error("deployment script exited with {}", describe_exit(.code))]
    ScriptFailed { code: Option<i32> },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

/// String that never shows up in logs or debug output
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<empty>)")
        } else {
            f.write_str("Secret(***)")
        }
    }
}

/// Serving stack the deployment script should target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServingBackend {
    /// Ray Serve, optionally from a local model folder
    Ray,
    /// Text Generation Inference on AWS SageMaker
    TgiSagemaker,
    /// Text Generation Inference container
    Tgi,
    /// vLLM server
    Vllm,
}

impl ServingBackend {
    /// Selector string passed to the script
    pub fn as_str(&self) -> &'static str {
        match self {
            ServingBackend::Ray => "ray",
            ServingBackend::TgiSagemaker => "tgi_sagemaker",
            ServingBackend::Tgi => "tgi",
            ServingBackend::Vllm => "vllm",
        }
    }
}

impl fmt::Display for ServingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// AWS fields needed for SageMaker deployments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsCredentials {
    /// SageMaker execution role ARN
    pub role: String,
    pub access_key_id: Secret,
    pub secret_access_key: Secret,
    #[serde(default)]
    pub session_token: Option<Secret>,
}

/// `[deploy]` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_script_path")]
    pub script_path: PathBuf,
    pub server: ServingBackend,
    #[serde(default)]
    pub huggingface_repo: Option<String>,
    #[serde(default)]
    pub huggingface_token: Option<Secret>,
    pub model_type: String,
    pub task: String,
    /// Local folder with model files (Ray only)
    #[serde(default)]
    pub local_model_path: Option<PathBuf>,
    #[serde(default)]
    pub aws: Option<AwsCredentials>,
}

fn default_script_path() -> PathBuf {
    PathBuf::from("./script_inference.sh")
}

impl DeployConfig {
    /// Check that the fields the chosen server needs are present
    pub fn validate(&self) -> Result<(), DeployError> {
        let missing = |field| DeployError::MissingField {
            server: self.server,
            field,
        };

        if self.model_type.trim().is_empty() {
            return Err(missing("model_type"));
        }
        if self.task.trim().is_empty() {
            return Err(missing("task"));
        }

        let has_repo = self
            .huggingface_repo
            .as_deref()
            .is_some_and(|r| !r.trim().is_empty());
        let has_token = self.huggingface_token.as_ref().is_some_and(|t| !t.is_empty());

        let uses_local_model = self.server == ServingBackend::Ray && self.local_model_path.is_some();
        if !uses_local_model {
            if !has_repo {
                return Err(missing("huggingface_repo"));
            }
            if !has_token {
                return Err(missing("huggingface_token"));
            }
        }

        if self.server == ServingBackend::TgiSagemaker {
            let aws = self.aws.as_ref().ok_or_else(|| missing("aws"))?;
            if aws.role.trim().is_empty() {
                return Err(missing("aws.role"));
            }
            if aws.access_key_id.is_empty() {
                return Err(missing("aws.access_key_id"));
            }
            if aws.secret_access_key.is_empty() {
                return Err(missing("aws.secret_access_key"));
            }
        }

        Ok(())
    }

    /// Positional arguments in the order the script reads them:
    /// repo, token, model type, task, server, local path, AWS role,
    /// access key id, secret access key, session token.
    /// Absent values become empty strings.
    pub fn positional_args(&self) -> Vec<String> {
        let secret = |s: Option<&Secret>| s.map(|s| s.expose().to_string()).unwrap_or_default();
        let aws = self.aws.as_ref();

        vec![
            self.huggingface_repo.clone().unwrap_or_default(),
            secret(self.huggingface_token.as_ref()),
            self.model_type.clone(),
            self.task.clone(),
            self.server.as_str().to_string(),
            self.local_model_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            aws.map(|a| a.role.clone()).unwrap_or_default(),
            secret(aws.map(|a| &a.access_key_id)),
            secret(aws.map(|a| &a.secret_access_key)),
            secret(aws.and_then(|a| a.session_token.as_ref())),
        ]
    }
}

/// Validate, make the script executable and run it to completion
pub async fn run_deployment(config: &DeployConfig) -> Result<ExitStatus, DeployError> {
    config.validate()?;

    if !config.script_path.exists() {
        return Err(DeployError::ScriptNotFound(config.script_path.clone()));
    }
    make_executable(&config.script_path)?;

    info!(
        server = %config.server,
        script = %config.script_path.display(),
        model_type = %config.model_type,
        task = %config.task,
        "Invoking deployment script"
    );

    let status = Command::new(&config.script_path)
        .args(config.positional_args())
        .status()
        .await?;

    if !status.success() {
        return Err(DeployError::ScriptFailed {
            code: status.code(),
        });
    }

    debug!(status = ?status, "Deployment script finished");
    Ok(status)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    std::fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_deploy(server: ServingBackend) -> DeployConfig {
        DeployConfig {
            script_path: default_script_path(),
            server,
            huggingface_repo: Some("acme/llama-ft".to_string()),
            huggingface_token: Some(Secret::new("hf_abc")),
            model_type: "llama".to_string(),
            task: "text-generation".to_string(),
            local_model_path: None,
            aws: None,
        }
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("hf_very_secret");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert!(!format!("{:?}", hub_deploy(ServingBackend::Tgi)).contains("hf_abc"));
    }

    #[test]
    fn test_positional_args_order() {
        let args = hub_deploy(ServingBackend::Vllm).positional_args();
        assert_eq!(
            args,
            vec!["acme/llama-ft", "hf_abc", "llama", "text-generation", "vllm", "", "", "", "", ""]
        );
    }

    #[test]
    fn test_ray_with_local_path_needs_no_token() {
        let config = DeployConfig {
            huggingface_repo: None,
            huggingface_token: None,
            local_model_path: Some(PathBuf::from("/models/merged")),
            ..hub_deploy(ServingBackend::Ray)
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.positional_args()[5], "/models/merged");
        assert_eq!(config.positional_args()[0], "");
    }

    #[test]
    fn test_hub_server_requires_token() {
        let config = DeployConfig {
            huggingface_token: None,
            ..hub_deploy(ServingBackend::Tgi)
        };
        assert!(matches!(
            config.validate(),
            Err(DeployError::MissingField { field: "huggingface_token", .. })
        ));
    }

    #[test]
    fn test_sagemaker_requires_aws() {
        let mut config = hub_deploy(ServingBackend::TgiSagemaker);
        assert!(matches!(
            config.validate(),
            Err(DeployError::MissingField { field: "aws", .. })
        ));

        config.aws = Some(AwsCredentials {
            role: "arn:aws:iam::123:role/sm".to_string(),
            access_key_id: Secret::new("AKIA"),
            secret_access_key: Secret::new("shh"),
            session_token: None,
        });
        assert!(config.validate().is_ok());

        let args = config.positional_args();
        assert_eq!(args[4], "tgi_sagemaker");
        assert_eq!(args[6], "arn:aws:iam::123:role/sm");
        assert_eq!(args[7], "AKIA");
        assert_eq!(args[8], "shh");
        assert_eq!(args[9], "");
    }

    #[test]
    fn test_server_deserializes_snake_case() {
        let server: ServingBackend = serde_json::from_str("\"tgi_sagemaker\"").unwrap();
        assert_eq!(server, ServingBackend::TgiSagemaker);
    }

    #[tokio::test]
    async fn test_missing_script_is_reported() {
        let config = DeployConfig {
            script_path: PathBuf::from("/nonexistent/script_inference.sh"),
            ..hub_deploy(ServingBackend::Vllm)
        };
        let err = run_deployment(&config).await.unwrap_err();
        assert!(matches!(err, DeployError::ScriptNotFound(_)));
    }
}
