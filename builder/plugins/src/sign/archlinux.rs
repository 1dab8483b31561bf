//! Arch Linux sign: detached `.sig` files for each built package.

use buildconfig::{Component, Config, Distribution, Stage};
use executor::RunSpec;
use tracing::info;

use crate::sign::{export_keyring, require_local};
use crate::source::{dist_stage_dir, reset_dir};
use crate::{
    dist_parameters, step_log, Dependency, InstanceArgs, Job, JobContext, JobReference,
    PluginError, PluginFactory, RunOptions,
};

pub struct ArchlinuxSignPlugin;

impl PluginFactory for ArchlinuxSignPlugin {
    fn name(&self) -> &'static str {
        "sign_archlinux"
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
                if !dist.is_archlinux() {
                    continue;
                }
                jobs.push(Box::new(ArchlinuxSignJob {
                    config: args.config,
                    component,
                    dist,
                }));
            }
        }
        Ok(jobs)
    }
}

pub struct ArchlinuxSignJob<'a> {
    config: &'a Config,
    component: &'a Component,
    dist: &'a Distribution,
}

impl Job for ArchlinuxSignJob<'_> {
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

        for build in &params.build {
            let build_bn = artifacts::mangle_path(build);
            let build_info = artifacts::read_info(&build_artifacts_dir, "build", &build_bn)
                .map_err(|e| PluginError::Sign(e.to_string()))?;
            if build_info.packages.is_empty() {
                info!("{component}:{dist}:{build}: Nothing to sign.");
                continue;
            }

            for pkg in &build_info.packages {
                let pkg_path = build_artifacts_dir.join("pkgs").join(pkg);
                info!("{component}:{dist}:{build}: Signing '{pkg}'.");
                let spec = RunSpec {
                    cmd: vec![format!(
                        "{} --batch --no-tty --yes --detach-sign -u {sign_key} {}",
                        config.gpg_client(),
                        pkg_path.display()
                    )],
                    ..Default::default()
                };
                executor.run(&spec, &mut |line| log.line(line)).map_err(|_| {
                    PluginError::Sign(format!(
                        "{component}:{dist}:{build}: Failed to sign PKGs."
                    ))
                })?;
            }
        }
        Ok(())
    }
}
