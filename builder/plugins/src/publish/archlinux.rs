//! Arch Linux publish: hardlink signed packages and their detached `.sig`
//! files, then `repo-add` the database and sign it.

use std::path::PathBuf;

use buildconfig::{Component, Config, Distribution, Stage};
use executor::{Executor, RunSpec};
use tracing::info;

use crate::publish::{
    can_be_published_in_stable, min_age_failure_msg, require_local, validate_component_repository,
};
use crate::source::dist_stage_dir;
use crate::{
    dist_parameters, step_log, Dependency, InstanceArgs, Job, JobContext, JobReference,
    PluginError, PluginFactory, RunOptions, StepLog,
};

pub struct ArchlinuxPublishPlugin;

impl PluginFactory for ArchlinuxPublishPlugin {
    fn name(&self) -> &'static str {
        "publish_archlinux"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::Publish]
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
                jobs.push(Box::new(ArchlinuxPublishJob {
                    config: args.config,
                    component,
                    dist,
                }));
            }
        }
        Ok(jobs)
    }
}

pub struct ArchlinuxPublishJob<'a> {
    config: &'a Config,
    component: &'a Component,
    dist: &'a Distribution,
}

impl ArchlinuxPublishJob<'_> {
    fn target_dir(&self, repository: &str) -> PathBuf {
        self.config
            .artifacts()
            .repository_publish_dir("archlinux")
            .join(self.config.release_name())
            .join(repository)
            .join(self.dist.package_set.to_string())
            .join(&self.dist.name)
    }

    /// Regenerates `qubes.db.tar.gz` from the directory content and signs
    /// the database.
    fn update_database(
        &self,
        executor: &mut dyn Executor,
        log: &mut StepLog,
        sign_key: &str,
        repository: &str,
    ) -> Result<(), PluginError> {
        let (component, dist) = (self.component, self.dist);
        info!("{component}:{dist}: Updating metadata.");
        let target_dir = self.target_dir(repository);
        let db = target_dir.join("qubes.db.tar.gz");
        let spec = RunSpec {
            cmd: vec![
                format!("cd {}", target_dir.display()),
                format!("repo-add -s -k {sign_key} {} *.pkg.tar.zst || repo-add -s -k {sign_key} {}",
                    db.display(), db.display()),
            ],
            ..Default::default()
        };
        executor.run(&spec, &mut |line| log.line(line)).map_err(|_| {
            PluginError::Publish(format!("{component}:{dist}: Failed to 'repo-add'"))
        })
    }
}

impl Job for ArchlinuxPublishJob<'_> {
    fn name(&self) -> String {
        format!(
            "publish:{}:{}",
            self.component.name,
            self.dist.distribution()
        )
    }

    fn reference(&self) -> JobReference {
        JobReference::dist_component(Stage::Publish, self.component, self.dist)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::Plugin("publish".to_string()),
            Dependency::Plugin("sign_archlinux".to_string()),
            Dependency::Job(JobReference::dist_component(
                Stage::Sign,
                self.component,
                self.dist,
            )),
        ]
    }

    fn run(&mut self, _ctx: &JobContext, options: &RunOptions) -> Result<(), PluginError> {
        let (config, component, dist) = (self.config, self.component, self.dist);
        let mut executor = config.executor_for("publish", Some(dist), Some(component))?;
        require_local(executor.as_ref())?;

        let params = dist_parameters(executor.as_ref(), component, dist, config)?;
        if !component.has_packages || params.build.is_empty() {
            return Ok(());
        }

        let Some(sign_key) = config.sign_key(dist) else {
            info!("{component}:{dist}: No signing key found.");
            return Ok(());
        };

        let repository = options
            .repository_publish
            .clone()
            .or_else(|| config.repository_publish("components"))
            .ok_or_else(|| {
                PluginError::Publish("Cannot determine repository for publish".to_string())
            })?;
        validate_component_repository(&repository, &format!("{component}:{dist}"))?;

        let mut log = step_log(
            config,
            &format!("publish-{}-{}", component.name, dist.distribution()),
        )?;
        info!("Log file: {}", log.path().display());

        let build_artifacts_dir = dist_stage_dir(config, component, dist, "build")?;
        let publish_artifacts_dir = dist_stage_dir(config, component, dist, "publish")?;
        let mangled = params.mangled_builds();

        if options.unpublish {
            for (build, build_bn) in params.build.iter().zip(&mangled) {
                let mut publish_info =
                    artifacts::read_info(&publish_artifacts_dir, "publish", build_bn)
                        .map_err(|e| PluginError::Publish(e.to_string()))?;
                if !publish_info.is_published_in(&repository) {
                    info!("{component}:{dist}: Not published to '{repository}'.");
                    continue;
                }
                info!("{component}:{dist}:{build}: Unpublishing PKGs from '{repository}'.");
                let target_dir = self.target_dir(&repository);
                for pkg in &publish_info.packages {
                    for name in [pkg.clone(), format!("{pkg}.sig")] {
                        let path = target_dir.join(&name);
                        if path.exists() {
                            std::fs::remove_file(&path)
                                .map_err(|e| PluginError::Publish(e.to_string()))?;
                        }
                    }
                }
                self.update_database(executor.as_mut(), &mut log, &sign_key, &repository)?;

                if publish_info.drop_publish(&repository) {
                    info!(
                        "{component}:{dist}:{build_bn}: Not published anywhere else, \
                         deleting publish info."
                    );
                    artifacts::delete_info(&publish_artifacts_dir, "publish", build_bn)
                        .map_err(|e| PluginError::Publish(e.to_string()))?;
                } else {
                    artifacts::save_info(&publish_artifacts_dir, "publish", build_bn, &publish_info)
                        .map_err(|e| PluginError::Publish(e.to_string()))?;
                }
            }
            return Ok(());
        }

        let all_published = mangled.iter().all(|bn| {
            artifacts::read_info(&publish_artifacts_dir, "publish", bn)
                .map(|record| record.is_published_in(&repository))
                .unwrap_or(false)
        });
        if all_published {
            info!("{component}:{dist}: Already published to '{repository}'.");
            return Ok(());
        }

        if repository == "current" {
            for bn in &mangled {
                if !can_be_published_in_stable(
                    config,
                    &publish_artifacts_dir,
                    bn,
                    options.ignore_min_age,
                )? {
                    return Err(PluginError::Publish(min_age_failure_msg(
                        &format!("{component}:{dist}"),
                        config.min_age_days(),
                    )));
                }
            }
        }

        std::fs::create_dir_all(&publish_artifacts_dir)
            .map_err(|e| PluginError::Publish(e.to_string()))?;
        let timestamp = artifacts::publish_timestamp(chrono::Utc::now());

        for (build, build_bn) in params.build.iter().zip(&mangled) {
            let build_info = artifacts::read_info(&build_artifacts_dir, "build", build_bn)
                .map_err(|e| PluginError::Publish(e.to_string()))?;
            if build_info.packages.is_empty() {
                info!("{component}:{dist}:{build}: Nothing to publish.");
                continue;
            }
            let publish_info = artifacts::read_info(&publish_artifacts_dir, "publish", build_bn)
                .map_err(|e| PluginError::Publish(e.to_string()))?;

            let mut info = build_info.clone();
            if !publish_info.repository_publish.is_empty() {
                if publish_info.source_hash != build_info.source_hash {
                    for entry in publish_info.repository_publish.clone() {
                        let target_dir = self.target_dir(&entry.name);
                        for pkg in &publish_info.packages {
                            for name in [pkg.clone(), format!("{pkg}.sig")] {
                                let path = target_dir.join(&name);
                                if path.exists() {
                                    std::fs::remove_file(&path)
                                        .map_err(|e| PluginError::Publish(e.to_string()))?;
                                }
                            }
                        }
                        self.update_database(executor.as_mut(), &mut log, &sign_key, &entry.name)?;
                    }
                } else {
                    info = publish_info;
                }
            }

            info!("{component}:{dist}:{build}: Publishing PKGs to '{repository}'.");
            let target_dir = self.target_dir(&repository);
            for pkg in &build_info.packages {
                let pkg_path = build_artifacts_dir.join("pkgs").join(pkg);
                let sig_path = build_artifacts_dir.join("pkgs").join(format!("{pkg}.sig"));
                fileutil::force_hardlink(&pkg_path, &target_dir.join(pkg)).map_err(|_| {
                    PluginError::Publish(format!(
                        "{component}:{dist}:{build}: Failed to publish packages."
                    ))
                })?;
                if sig_path.exists() {
                    fileutil::force_hardlink(&sig_path, &target_dir.join(format!("{pkg}.sig")))
                        .map_err(|e| PluginError::Publish(e.to_string()))?;
                }
            }
            self.update_database(executor.as_mut(), &mut log, &sign_key, &repository)?;

            info.record_publish(&repository, &timestamp);
            artifacts::save_info(&publish_artifacts_dir, "publish", build_bn, &info)
                .map_err(|e| PluginError::Publish(e.to_string()))?;
        }
        Ok(())
    }
}
