//! RPM sign: import the signing key into a throwaway RPM DB and sign SRPM,
//! binary RPMs and the buildinfo file. The signing helper refuses to
//! re-sign already-signed packages, so the stage is idempotent.

use std::path::PathBuf;

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

pub struct RpmSignPlugin;

impl PluginFactory for RpmSignPlugin {
    fn name(&self) -> &'static str {
        "sign_rpm"
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
                if !dist.is_rpm() {
                    continue;
                }
                jobs.push(Box::new(RpmSignJob {
                    config: args.config,
                    component,
                    dist,
                }));
            }
        }
        Ok(jobs)
    }
}

pub struct RpmSignJob<'a> {
    config: &'a Config,
    component: &'a Component,
    dist: &'a Distribution,
}

impl Job for RpmSignJob<'_> {
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

        let prep_artifacts_dir = dist_stage_dir(config, component, dist, "prep")?;
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

        // Throwaway RPM DB holding just the signing key, used by sign and
        // later by publish signature checks.
        let db_path = artifacts_dir.join("rpmdb");
        let key_asc = artifacts_dir.join(format!("{sign_key}.asc"));
        let spec = RunSpec {
            cmd: vec![
                format!("mkdir -p {}", db_path.display()),
                format!(
                    "{} --armor --export {sign_key} > {}",
                    config.gpg_client(),
                    key_asc.display()
                ),
                format!(
                    "rpmkeys --dbpath={} --import {}",
                    db_path.display(),
                    key_asc.display()
                ),
            ],
            ..Default::default()
        };
        executor.run(&spec, &mut |line| log.line(line)).map_err(|_| {
            PluginError::Sign(format!("{component}:{dist}: Failed to create RPM dbpath."))
        })?;

        for build in &params.build {
            let build_bn = artifacts::mangle_path(build);
            let build_info = artifacts::read_info(&build_artifacts_dir, "build", &build_bn)
                .map_err(|e| PluginError::Sign(e.to_string()))?;
            if build_info.is_empty_build() {
                info!("{component}:{dist}:{build}: Nothing to sign.");
                continue;
            }

            let mut packages_list: Vec<PathBuf> = build_info
                .rpms
                .iter()
                .map(|rpm| build_artifacts_dir.join("rpm").join(rpm))
                .collect();
            if let Some(srpm) = &build_info.srpm {
                packages_list.push(prep_artifacts_dir.join(srpm));
            }

            for rpm in &packages_list {
                info!(
                    "{component}:{dist}:{build}: Signing '{}'.",
                    rpm.file_name().unwrap_or_default().to_string_lossy()
                );
                let spec = RunSpec {
                    cmd: vec![format!(
                        "{}/sign_rpm/scripts/sign-rpm --sign-key {sign_key} \
                         --db-path {} --rpm {}",
                        executor.plugins_dir().display(),
                        db_path.display(),
                        rpm.display()
                    )],
                    ..Default::default()
                };
                executor.run(&spec, &mut |line| log.line(line)).map_err(|_| {
                    PluginError::Sign(format!("{component}:{dist}:{build}: Failed to sign RPMs."))
                })?;
            }

            if let Some(buildinfo) = &build_info.buildinfo {
                let buildinfo_file = build_artifacts_dir.join("rpm").join(buildinfo);
                info!("{component}:{dist}:{build}: Signing '{buildinfo}'.");
                let spec = RunSpec {
                    cmd: vec![format!(
                        "{}/sign_rpm/scripts/update-rpmbuildinfo {} {} {sign_key}",
                        executor.plugins_dir().display(),
                        buildinfo_file.display(),
                        config.gpg_client()
                    )],
                    ..Default::default()
                };
                executor.run(&spec, &mut |line| log.line(line)).map_err(|_| {
                    PluginError::Sign(format!(
                        "{component}:{dist}:{build}: Failed to sign buildinfo file."
                    ))
                })?;
            }

            // The builder-local repository must carry the signed content.
            let repository_dir = config.artifacts().repository_dir(dist.distribution());
            let mut repo_files = packages_list.clone();
            if let Some(buildinfo) = &build_info.buildinfo {
                repo_files.push(build_artifacts_dir.join("rpm").join(buildinfo));
            }
            provision_local_repository(
                &format!("{component}:{dist}:{build}"),
                &repository_dir,
                &format!("{}_{}", component.name, component.version()?),
                &repo_files,
            )
            .map_err(|e| PluginError::Sign(e.to_string()))?;
        }

        Ok(())
    }
}
