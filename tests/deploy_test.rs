// Integration tests for deployment script invocation

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use tunesmith::deploy::{run_deployment, AwsCredentials, DeployConfig, DeployError, Secret, ServingBackend};

/// Script that records its arguments one per line, then exits with `code`
fn write_script(dir: &Path, code: i32) -> (PathBuf, PathBuf) {
    let script = dir.join("script_inference.sh");
    let args_file = dir.join("args.txt");
    fs::write(
        &script,
        format!(
            "#!/bin/sh\nfor arg in \"$@\"; do printf '%s\\n' \"$arg\" >> '{}'; done\nexit {}\n",
            args_file.display(),
            code
        ),
    )
    .unwrap();
    (script, args_file)
}

fn sagemaker_config(script_path: PathBuf) -> DeployConfig {
    DeployConfig {
        script_path,
        server: ServingBackend::TgiSagemaker,
        huggingface_repo: Some("acme/llama-2-7b-sql".to_string()),
        huggingface_token: Some(Secret::new("hf_abc")),
        model_type: "llama".to_string(),
        task: "text-generation".to_string(),
        local_model_path: None,
        aws: Some(AwsCredentials {
            role: "arn:aws:iam::123:role/sm".to_string(),
            access_key_id: Secret::new("AKIA"),
            secret_access_key: Secret::new("s3cret"),
            session_token: None,
        }),
    }
}

#[tokio::test]
async fn test_script_receives_positional_arguments() {
    let temp_dir = TempDir::new().unwrap();
    let (script, args_file) = write_script(temp_dir.path(), 0);

    let status = run_deployment(&sagemaker_config(script)).await.unwrap();
    assert!(status.success());

    let args: Vec<String> = fs::read_to_string(&args_file)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(
        args,
        vec![
            "acme/llama-2-7b-sql",
            "hf_abc",
            "llama",
            "text-generation",
            "tgi_sagemaker",
            "",
            "arn:aws:iam::123:role/sm",
            "AKIA",
            "s3cret",
            "",
        ]
    );
}

#[tokio::test]
async fn test_ray_local_model_needs_no_hub_credentials() {
    let temp_dir = TempDir::new().unwrap();
    let (script, args_file) = write_script(temp_dir.path(), 0);

    let config = DeployConfig {
        script_path: script,
        server: ServingBackend::Ray,
        huggingface_repo: None,
        huggingface_token: None,
        model_type: "llama".to_string(),
        task: "text-generation".to_string(),
        local_model_path: Some(temp_dir.path().join("merged")),
        aws: None,
    };
    run_deployment(&config).await.unwrap();

    let args = fs::read_to_string(&args_file).unwrap();
    let args: Vec<&str> = args.lines().collect();
    assert_eq!(args[4], "ray");
    assert_eq!(args[5], temp_dir.path().join("merged").display().to_string());
}

#[tokio::test]
async fn test_failing_script_reports_exit_code() {
    let temp_dir = TempDir::new().unwrap();
    let (script, _) = write_script(temp_dir.path(), 3);

    let err = run_deployment(&sagemaker_config(script)).await.unwrap_err();
    assert!(matches!(err, DeployError::ScriptFailed { code: Some(3) }));
    assert_eq!(err.to_string(), "deployment script exited with status 3");
}

#[tokio::test]
async fn test_missing_script() {
    let temp_dir = TempDir::new().unwrap();
    let err = run_deployment(&sagemaker_config(temp_dir.path().join("nope.sh")))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::ScriptNotFound(_)));
}

#[tokio::test]
async fn test_invalid_config_never_runs_script() {
    let temp_dir = TempDir::new().unwrap();
    let (script, args_file) = write_script(temp_dir.path(), 0);

    let mut config = sagemaker_config(script);
    config.aws = None;

    let err = run_deployment(&config).await.unwrap_err();
    assert!(matches!(err, DeployError::MissingField { field: "aws", .. }));
    assert!(!args_file.exists());
}
