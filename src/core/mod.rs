pub mod batch;
pub mod job;
pub mod resources;
pub mod submission;
pub mod task;

pub use batch::{Batch, Context};
pub use job::{Job, JobState};
pub use resources::{ResourceSpec, Resources, SlurmResources};
pub use submission::{RunError, Submission};
pub use task::Task;

use std::path::PathBuf;

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("dflow"))
}

pub fn get_data_dir() -> anyhow::Result<PathBuf> {
    dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get data directory"))
        .map(|p| p.join("dflow"))
}
