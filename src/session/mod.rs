// Fine-tuning session
// Phase state machine, saved-artifact checks and the run manifest

pub mod artifacts;
mod loader;
pub mod manifest;
mod state;

pub use artifacts::AdapterArtifacts;
pub use loader::ModelLoader;
pub use manifest::{PhaseRecord, RunManifest};
pub use state::SessionPhase;
