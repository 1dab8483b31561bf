//! Debian sign: `debsign --no-re-sign` over the build-stage `.changes`.

use buildconfig::{Component, Config, Distribution, Stage};
use executor::RunSpec;
use tracing::info;

use crate::build::provision_local_repository;
use crate::sign::{export_keyring, require_local};
use crate::source::{dist_stage_dir, reset_dir};
use crate::{
    dist_parameters, step_log, Dependency, InstanceArgs, Job, JobContext, JobReference,
    PluginError, PluginFactory, RunOptions,
};

pub struct DebSignPlugin;

impl PluginFactory for DebSignPlugin {
    fn name(&self) -> &'static str {
        "sign_deb"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::Sign]
    }

    fn instances<'a>(
        &self,
        args: &InstanceArgs<'a>,
    ) -> Result<Vec<Box<dyn Job + 'a>>, PluginError> {
        let mut jobs: Vec<Box<dyn Job>> = Vec::new();
        for component in &args.components {
            for dist in &args.distributions {
                if !dist.is_deb() && !dist.is_ubuntu() {
                    continue;
                }
                jobs.push(Box::new(DebSignJob {
                    config: args.config,
                    component,
                    dist,
                }));
            }
        }
        Ok(jobs)
    }
}

pub struct DebSignJob<'a> {
    config: &'a Config,
    component: &'a Component,
    dist: &'a Distribution,
}

impl Job for DebSignJob<'_> {
    fn name(&self) -> String {
        format!("sign:{}:{}", self.component.name, self.dist.distribution())
    }

    fn reference(&self) -> JobReference {
        JobReference::dist_component(Stage::Sign, self.component, self.dist)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::Plugin("sign".to_string()),
            Dependency::Job(JobReference::dist_component(
                Stage::Build,
                self.component,
                self.dist,
            )),
        ]
    }

    fn run(&mut self, _ctx: &JobContext, _options: &RunOptions) -> Result<(), PluginError> {
        let (config, component, dist) = (self.config, self.component, self.dist);
        let mut executor = config.executor_for("sign", Some(dist), Some(component))?;
        require_local(executor.as_ref())?;

        let params = dist_parameters(executor.as_ref(), component, dist, config)?;
        if !component.has_packages || params.build.is_empty() {
            return Ok(());
        }

        let Some(sign_key) = config.sign_key(dist) else {
            info!("{component}:{dist}: No signing key found.");
            return Ok(());
        };

        let mut log = step_log(
            config,
            &format!("sign-{}-{}", component.name, dist.distribution()),
        )?;
        info!("Log file: {}", log.path().display());

        let build_artifacts_dir = dist_stage_dir(config, component, dist, "build")?;
        let artifacts_dir = dist_stage_dir(config, component, dist, "sign")?;
        reset_dir(&artifacts_dir)?;
        export_keyring(
            executor.as_mut(),
            config,
            &sign_key,
            &artifacts_dir.join("keyring"),
            &mut log,
        )?;

        for directory in &params.build {
            let directory_bn = artifacts::mangle_path(directory);
            let build_info = artifacts::read_info(&build_artifacts_dir, "build", &directory_bn)
                .map_err(|e| PluginError::Sign(e.to_string()))?;
            let Some(changes) = &build_info.changes else {
                info!("{component}:{dist}:{directory}: Nothing to sign.");
                continue;
            };

            info!("{component}:{dist}:{directory}: Signing from '{changes}' info.");
            let spec = RunSpec {
                cmd: vec![format!(
                    "debsign -k{sign_key} -p{} --no-re-sign {}",
                    config.gpg_client(),
                    build_artifacts_dir.join(changes).display()
                )],
                ..Default::default()
            };
            executor.run(&spec, &mut |line| log.line(line)).map_err(|_| {
                PluginError::Sign(format!(
                    "{component}:{dist}:{directory}: Failed to sign Debian packages."
                ))
            })?;

            // Builder-local repository carries the signed source and
            // packages.
            let repository_dir = config.artifacts().repository_dir(dist.distribution());
            let mut repo_files: Vec<std::path::PathBuf> = build_info
                .packages
                .iter()
                .map(|deb| build_artifacts_dir.join(deb))
                .collect();
            for name in [
                build_info.dsc.as_ref(),
                build_info.orig.as_ref(),
                build_info.debian.as_ref(),
                build_info.changes.as_ref(),
                build_info.buildinfo.as_ref(),
            ]
            .into_iter()
            .flatten()
            {
                repo_files.push(build_artifacts_dir.join(name));
            }
            provision_local_repository(
                &format!("{component}:{dist}:{directory}"),
                &repository_dir,
                &format!("{}-{}", component.name, component.version()?),
                &repo_files,
            )
            .map_err(|e| {
                PluginError::Sign(format!(
                    "{component}:{dist}:{directory}: Failed to re-provision local repository. {e}"
                ))
            })?;
        }
        Ok(())
    }
}
