//! The staged plugin pipeline: fetch → prep → build → post → verify → sign
//! → publish → upload, plus `init-cache`, over a per-(component,
//! distribution) and per-template matrix.
//!
//! Plugins form a static registry; the configured plugin directories
//! contribute on-disk assets (scripts, keys, chroot configurations) copied
//! into executors at run time.

mod error;
mod job;
mod manager;
mod params;
mod pipeline;
mod steplog;

pub mod build;
pub mod chroot;
pub mod fetch;
pub mod installer;
pub mod publish;
pub mod registry;
pub mod sign;
pub mod source;
pub mod template;
pub mod upload;

pub use error::{extract_lines_before, AdditionalInfo, PluginError};
pub use installer::installer_jobs;
pub use job::{
    check_dependencies, Dependency, InstanceArgs, Job, JobContext, JobReference, PluginFactory,
    RunOptions,
};
pub use manager::PluginManager;
pub use params::{
    base_environment, commands_from, component_placeholders, default_copy_in, dist_parameters,
    files_from, modules_from, source_parameters, DistParameters, FileEntry,
};
pub use pipeline::Pipeline;
pub use steplog::StepLog;

use buildconfig::Config;

/// Creates the per-step log file for a job.
pub(crate) fn step_log(config: &Config, name: &str) -> Result<StepLog, PluginError> {
    StepLog::create(&config.artifacts().logs_dir(), name)
        .map_err(|e| PluginError::Plugin(e.to_string()))
}
