// Configuration module
// Public interface for configuration loading

mod loader;
mod settings;

pub use loader::{
    default_config_path, load_config, load_config_with_env, write_config_snapshot, ENV_PREFIX,
};
pub use settings::{
    Config, ConfigError, EnvVar, LoraSettings, ModelSettings, QuantizationSettings, SftArgs,
    TrainingArgs, TrainingSettings, WorkerSettings,
};
