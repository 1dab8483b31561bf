//! Upload stage: rsync the published repository layout to the configured
//! remote mirror host.

use buildconfig::{Config, Distribution, Stage};
use executor::RunSpec;
use tracing::info;

use crate::publish::debian_suite;
use crate::{
    step_log, InstanceArgs, Job, JobContext, JobReference, PluginError, PluginFactory, RunOptions,
};

pub struct UploadPlugin;

impl PluginFactory for UploadPlugin {
    fn name(&self) -> &'static str {
        "upload"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::Upload]
    }

    fn instances<'a>(
        &self,
        args: &InstanceArgs<'a>,
    ) -> Result<Vec<Box<dyn Job + 'a>>, PluginError> {
        let mut jobs: Vec<Box<dyn Job>> = Vec::new();
        for dist in &args.distributions {
            if !(dist.is_rpm() || dist.is_deb() || dist.is_ubuntu() || dist.is_archlinux()) {
                continue;
            }
            jobs.push(Box::new(UploadJob {
                config: args.config,
                dist,
            }));
        }
        Ok(jobs)
    }
}

pub struct UploadJob<'a> {
    config: &'a Config,
    dist: &'a Distribution,
}

impl Job for UploadJob<'_> {
    fn name(&self) -> String {
        format!("upload:{}", self.dist.distribution())
    }

    fn reference(&self) -> JobReference {
        JobReference {
            stage: Stage::Upload,
            component: None,
            dist: Some(self.dist.distribution().to_string()),
            template: None,
            build: None,
        }
    }

    fn run(&mut self, _ctx: &JobContext, options: &RunOptions) -> Result<(), PluginError> {
        let (config, dist) = (self.config, self.dist);
        let mut executor = config.executor_for("upload", Some(dist), None)?;
        if executor.description() != "local" {
            return Err(PluginError::Upload(
                "This plugin only supports local executor.".to_string(),
            ));
        }

        let Some(remote_path) = config.repository_upload_remote_host(dist.family) else {
            info!("{dist}: No remote location defined. Skipping.");
            return Ok(());
        };

        let repository = options
            .repository_publish
            .clone()
            .or_else(|| config.repository_publish("components"))
            .unwrap_or_else(|| "current-testing".to_string());

        let mut log = step_log(config, &format!("upload-{}", dist.distribution()))?;
        info!("Log file: {}", log.path().display());

        let local_path = config
            .artifacts()
            .repository_publish_dir(&dist.family.to_string())
            .join(config.release_name());

        // Directories relative to the release root; the same layout is
        // reproduced on the remote host.
        let mut directories_to_upload = Vec::new();
        if dist.is_rpm() || dist.is_archlinux() {
            directories_to_upload.push(format!(
                "{repository}/{}/{}",
                dist.package_set, dist.name
            ));
        } else if dist.is_deb() || dist.is_ubuntu() {
            let suite = debian_suite(dist, &repository);
            directories_to_upload.push(format!("{}/pool", dist.package_set));
            directories_to_upload.push(format!("{}/dists/{suite}", dist.package_set));
        }

        if directories_to_upload.is_empty() {
            return Err(PluginError::Upload(format!(
                "{dist}: Cannot determine directories to upload."
            )));
        }

        for relative_dir in directories_to_upload {
            let spec = RunSpec {
                cmd: vec![format!(
                    "rsync --partial --progress --hard-links -air --mkpath -- \
                     {}/ {remote_path}/{relative_dir}/",
                    local_path.join(&relative_dir).display()
                )],
                ..Default::default()
            };
            executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
                PluginError::Upload(format!("{dist}: Failed to upload to remote host: {e}"))
            })?;
        }
        Ok(())
    }
}
