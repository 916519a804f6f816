// Tunesmith - LoRA fine-tuning session orchestrator
// Library exports

pub mod backend; // Training backend interface and worker subprocess
pub mod config;
pub mod dataset;
pub mod deploy; // Inference deployment script launcher
pub mod errors;
pub mod paths; // Experiment directory layout
pub mod reporter;
pub mod session;
