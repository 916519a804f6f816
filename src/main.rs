// Tunesmith - LoRA fine-tuning session orchestrator
// Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tunesmith::backend::{TrainingBackend, WorkerBackend};
use tunesmith::config::{load_config, Config};
use tunesmith::dataset::TrainingDataset;
use tunesmith::deploy::{run_deployment, ServingBackend};
use tunesmith::errors::{describe_session_error, worker_unavailable_error, wrap_error_with_suggestion};
use tunesmith::paths::DirectoryHelper;
use tunesmith::reporter::ConsoleReporter;
use tunesmith::session::{AdapterArtifacts, ModelLoader, RunManifest};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "tunesmith")]
#[command(about = "LoRA fine-tuning session orchestrator", version)]
struct Args {
    /// Config file (default: ~/.tunesmith/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Load, inject, train and merge, then save the merged model
    Run {
        /// JSONL file of {"formatted_prompt": ...} records
        #[arg(long)]
        dataset: PathBuf,

        /// Run the [deploy] section once the merged model is saved
        #[arg(long)]
        deploy: bool,
    },
    /// Validate the config and show the experiment it maps to
    Check,
    /// Show the experiment directories and what they contain
    Paths,
    /// Start the training worker and check it responds
    Doctor,
    /// Run the deployment script from the [deploy] section
    Deploy,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Run { dataset, deploy } => run_session(config, &dataset, deploy).await,
        Command::Check => run_check(&config),
        Command::Paths => run_paths(&config),
        Command::Doctor => run_doctor(&config).await,
        Command::Deploy => run_deploy(&config).await,
    }
}

/// Initialize tracing for the console
///
/// Default: INFO level, overridable with RUST_LOG. TUNESMITH_DEBUG=1 turns
/// on debug output for this crate.
fn init_tracing() {
    let show_debug = std::env::var("TUNESMITH_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if show_debug {
            tracing_subscriber::EnvFilter::new("info,tunesmith=debug")
        } else {
            tracing_subscriber::EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Bridge log crate → tracing (for dependencies using log crate)
    tracing_log::LogTracer::init().ok();
}

fn spawn_worker(config: &Config) -> Result<WorkerBackend> {
    WorkerBackend::spawn(&config.backend).map_err(|e| {
        anyhow::anyhow!(worker_unavailable_error(&config.backend.program, &e.to_string()))
    })
}

/// Full pipeline: every phase in order, then optional deployment
async fn run_session(config: Config, dataset_path: &Path, deploy: bool) -> Result<()> {
    let dataset = TrainingDataset::from_jsonl(dataset_path)?;
    let directory_helper = DirectoryHelper::new(&config)?;
    let deploy_config = if deploy {
        let mut deploy_config = config
            .deploy
            .clone()
            .context("--deploy was given but the config has no [deploy] section")?;
        // Ray can serve straight from the merged folder
        if deploy_config.server == ServingBackend::Ray && deploy_config.local_model_path.is_none() {
            deploy_config.local_model_path = Some(directory_helper.save_paths.merged.clone());
        }
        // Fail before hours of training, not after
        deploy_config.validate()?;
        Some(deploy_config)
    } else {
        None
    };

    println!(
        "\x1b[1;36mExperiment {}\x1b[0m ({} examples)",
        directory_helper.experiment_id(),
        dataset.len()
    );

    let backend = spawn_worker(&config)?;
    let reporter = Arc::new(ConsoleReporter::new());
    let mut loader = ModelLoader::new(config, backend, reporter, directory_helper);

    let outcome = loader.run(&dataset).await;

    if let Err(e) = loader.shutdown().await {
        tracing::warn!(error = %e, "Worker did not shut down cleanly");
    }

    let merged_path = outcome.map_err(|e| anyhow::anyhow!(describe_session_error(&e)))?;
    println!("\n\x1b[1;32m✓ Merged model ready at {}\x1b[0m", merged_path.display());

    if let Some(deploy_config) = deploy_config {
        run_deployment(&deploy_config).await?;
        println!("\x1b[1;32m✓ Deployment script finished\x1b[0m");
    }

    Ok(())
}

fn run_check(config: &Config) -> Result<()> {
    let directory_helper = DirectoryHelper::new(config)?;
    let args = &config.training.training_args;

    println!("\x1b[1;32m✓ Configuration is valid\x1b[0m\n");
    println!("  Checkpoint:   {}", config.model.hf_model_ckpt);
    println!("  Experiment:   {}", directory_helper.experiment_id());
    println!("  Accelerate:   {}", config.accelerate);
    println!(
        "  Quantization: {}",
        if config.accelerate || !config.model.bitsandbytes.is_enabled() {
            "none"
        } else if config.model.bitsandbytes.load_in_4bit {
            "4-bit"
        } else {
            "8-bit"
        }
    );
    println!(
        "  LoRA:         r={} alpha={} dropout={}",
        config.lora.r, config.lora.lora_alpha, config.lora.lora_dropout
    );
    println!(
        "  Training:     {} epochs, batch {}, lr {}",
        args.num_train_epochs, args.per_device_train_batch_size, args.learning_rate
    );
    println!(
        "  Worker:       {} {}",
        config.backend.program,
        config.backend.args.join(" ")
    );

    match &config.deploy {
        Some(deploy) => {
            deploy.validate()?;
            println!("  Deploy:       {} via {}", deploy.server, deploy.script_path.display());
        }
        None => println!("  Deploy:       not configured"),
    }

    Ok(())
}

fn run_paths(config: &Config) -> Result<()> {
    let directory_helper = DirectoryHelper::new(config)?;
    let paths = &directory_helper.save_paths;

    println!("Experiment {}", directory_helper.experiment_id());
    println!("  root:    {}", paths.root.display());
    println!("  config:  {}", paths.config.display());
    println!("  dataset: {}", paths.dataset.display());
    println!("  weights: {}", paths.weights.display());
    println!("  merged:  {}", paths.merged.display());

    if directory_helper.has_weights() {
        let artifacts = AdapterArtifacts::inspect(&paths.weights);
        let missing = artifacts.missing();
        if missing.is_empty() {
            println!("\n\x1b[1;32m✓ Adapter and tokenizer saved\x1b[0m");
        } else {
            println!("\n\x1b[1;33m⚠️  Incomplete weights, missing: {}\x1b[0m", missing.join(", "));
        }
    } else {
        println!("\nNo weights saved yet");
    }

    let manifest_path = paths.manifest();
    if manifest_path.exists() {
        let manifest = RunManifest::load(&manifest_path)?;
        println!("\nLast session {} (started {})", manifest.session_id, manifest.started_at);
        for record in &manifest.phases {
            println!("  {:<9} {}", record.phase, record.completed_at);
        }
    }

    Ok(())
}

async fn run_doctor(config: &Config) -> Result<()> {
    println!("Starting worker: {} {}", config.backend.program, config.backend.args.join(" "));
    let mut backend = spawn_worker(config)?;

    let info = backend.ping().await.map_err(|e| {
        anyhow::anyhow!(wrap_error_with_suggestion(
            format!("{:#}", e),
            "check the worker package is installed for this interpreter"
        ))
    });

    backend
        .shutdown()
        .await
        .context("Worker did not shut down cleanly")?;
    let info = info?;

    println!("\x1b[1;32m✓ Worker {} is responding\x1b[0m", info.version);
    if info.devices.is_empty() {
        println!("  Devices: none reported");
    } else {
        println!("  Devices: {}", info.devices.join(", "));
    }

    Ok(())
}

async fn run_deploy(config: &Config) -> Result<()> {
    let deploy = config
        .deploy
        .as_ref()
        .context("The config has no [deploy] section")?;

    println!("Deploying with {} via {}", deploy.server, deploy.script_path.display());
    run_deployment(deploy).await?;
    println!("\x1b[1;32m✓ Deployment script finished\x1b[0m");
    Ok(())
}
