//! RPM publish: hardlink signed packages into the publish tree, regenerate
//! repository metadata with comps, and detach-sign `repomd.xml`.

use std::path::{Path, PathBuf};

use buildconfig::{Component, Config, Distribution, Stage};
use executor::{Executor, RunSpec};
use tracing::{error, info};

use crate::publish::{
    can_be_published_in_stable, min_age_failure_msg, require_local, validate_component_repository,
};
use crate::source::dist_stage_dir;
use crate::{
    dist_parameters, step_log, Dependency, InstanceArgs, Job, JobContext, JobReference,
    PluginError, PluginFactory, RunOptions, StepLog,
};

pub struct RpmPublishPlugin;

impl PluginFactory for RpmPublishPlugin {
    fn name(&self) -> &'static str {
        "publish_rpm"
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
                if !dist.is_rpm() {
                    continue;
                }
                jobs.push(Box::new(RpmPublishJob {
                    config: args.config,
                    component,
                    dist,
                }));
            }
        }
        Ok(jobs)
    }
}

pub struct RpmPublishJob<'a> {
    config: &'a Config,
    component: &'a Component,
    dist: &'a Distribution,
}

impl RpmPublishJob<'_> {
    /// Per-repo target directory inside the publish tree.
    fn target_dir(&self, repository: &str) -> PathBuf {
        let dist = self.dist;
        self.config
            .artifacts()
            .repository_publish_dir("rpm")
            .join(self.config.release_name())
            .join(repository)
            .join(dist.package_set.to_string())
            .join(&dist.name)
    }

    fn createrepo(
        &self,
        executor: &mut dyn Executor,
        log: &mut StepLog,
        build: &str,
        target_dir: &Path,
    ) -> Result<(), PluginError> {
        let (component, dist) = (self.component, self.dist);
        info!("{component}:{dist}:{build}: Updating metadata.");
        fileutil::remove_path(&target_dir.join("repodata"))
            .map_err(|e| PluginError::Publish(e.to_string()))?;
        let spec = RunSpec {
            cmd: vec![
                format!("cd {}", target_dir.display()),
                "createrepo_c -g comps.xml .".to_string(),
            ],
            ..Default::default()
        };
        executor.run(&spec, &mut |line| log.line(line)).map_err(|_| {
            PluginError::Publish(format!("{component}:{dist}:{build}: Failed to 'createrepo_c'"))
        })
    }

    fn sign_metadata(
        &self,
        executor: &mut dyn Executor,
        log: &mut StepLog,
        build: &str,
        sign_key: &str,
        target_dir: &Path,
    ) -> Result<(), PluginError> {
        let (component, dist) = (self.component, self.dist);
        info!("{component}:{dist}:{build}: Signing metadata.");
        let repomd = target_dir.join("repodata/repomd.xml");
        let repomd = repomd.display();
        let spec = RunSpec {
            cmd: vec![format!(
                "{} --batch --no-tty --yes --detach-sign --armor -u {sign_key} {repomd} > {repomd}.asc",
                self.config.gpg_client()
            )],
            ..Default::default()
        };
        executor.run(&spec, &mut |line| log.line(line)).map_err(|_| {
            PluginError::Publish(format!("{component}:{dist}:{build}: Failed to sign metadata"))
        })
    }

    fn create_metalink(
        &self,
        executor: &mut dyn Executor,
        log: &mut StepLog,
        repository: &str,
    ) {
        let repository_dir = self.target_dir(repository);
        let repomd = repository_dir.join("repodata/repomd.xml");
        if !repomd.exists() {
            error!(
                "{}:{}: Cannot find repomd '{}'.",
                self.component,
                self.dist,
                repomd.display()
            );
            return;
        }
        info!("Creating metalink for {}.", repomd.display());
        let spec = RunSpec {
            cmd: vec![format!(
                "mkmetalink -b {} -- {}/publish_rpm/mirrors.list {} > {}.metalink",
                repository_dir.display(),
                executor.plugins_dir().display(),
                repomd.display(),
                repomd.display()
            )],
            ..Default::default()
        };
        if executor.run(&spec, &mut |line| log.line(line)).is_err() {
            error!(
                "{}:{}: Failed to create metalink for '{}'.",
                self.component,
                self.dist,
                repomd.display()
            );
        }
    }

    /// Packages referenced by a build record: binary RPMs plus the SRPM.
    fn packages_list(&self, build_info: &artifacts::InfoRecord) -> Result<Vec<PathBuf>, PluginError> {
        let (config, component, dist) = (self.config, self.component, self.dist);
        let prep_dir = dist_stage_dir(config, component, dist, "prep")?;
        let build_dir = dist_stage_dir(config, component, dist, "build")?;
        let mut list: Vec<PathBuf> = build_info
            .rpms
            .iter()
            .map(|rpm| build_dir.join("rpm").join(rpm))
            .collect();
        if let Some(srpm) = &build_info.srpm {
            list.push(prep_dir.join(srpm));
        }
        Ok(list)
    }

    fn publish(
        &self,
        executor: &mut dyn Executor,
        log: &mut StepLog,
        build: &str,
        build_info: &artifacts::InfoRecord,
        sign_key: &str,
        db_path: &Path,
        repository: &str,
    ) -> Result<(), PluginError> {
        let (component, dist) = (self.component, self.dist);
        if build_info.is_empty_build() {
            info!("{component}:{dist}:{build}: Nothing to publish.");
            return Ok(());
        }
        info!("{component}:{dist}:{build}: Publishing RPMs to '{repository}'.");

        let packages_list = self.packages_list(build_info)?;

        // Signature presence is verified against the throwaway RPM DB
        // before anything lands in the publish tree.
        info!("{component}:{dist}:{build}: Verifying signatures.");
        for rpm in &packages_list {
            let spec = RunSpec {
                cmd: vec![format!(
                    "{}/sign_rpm/scripts/sign-rpm --sign-key {sign_key} --db-path {} \
                     --rpm {} --check-only",
                    executor.plugins_dir().display(),
                    db_path.display(),
                    rpm.display()
                )],
                ..Default::default()
            };
            executor.run(&spec, &mut |line| log.line(line)).map_err(|_| {
                PluginError::Publish(format!(
                    "{component}:{dist}:{build}: Failed to check signatures."
                ))
            })?;
        }

        let target_dir = self.target_dir(repository);
        for rpm in &packages_list {
            let name = rpm.file_name().unwrap_or_default();
            fileutil::force_hardlink(rpm, &target_dir.join("rpm").join(name)).map_err(|_| {
                PluginError::Publish(format!(
                    "{component}:{dist}:{build}: Failed to publish packages."
                ))
            })?;
        }

        self.createrepo(executor, log, build, &target_dir)?;
        self.sign_metadata(executor, log, build, sign_key, &target_dir)
    }

    fn unpublish(
        &self,
        executor: &mut dyn Executor,
        log: &mut StepLog,
        build: &str,
        build_info: &artifacts::InfoRecord,
        sign_key: &str,
        repository: &str,
    ) -> Result<(), PluginError> {
        let (component, dist) = (self.component, self.dist);
        if build_info.is_empty_build() {
            info!("{component}:{dist}:{build}: Nothing to unpublish.");
            return Ok(());
        }
        info!("{component}:{dist}:{build}: Unpublishing RPMs from '{repository}'.");

        let target_dir = self.target_dir(repository);
        for rpm in self.packages_list(build_info)? {
            let name = rpm.file_name().unwrap_or_default().to_owned();
            let target = target_dir.join("rpm").join(name);
            if target.exists() {
                std::fs::remove_file(&target).map_err(|_| {
                    PluginError::Publish(format!(
                        "{component}:{dist}:{build}: Failed to unpublish packages."
                    ))
                })?;
            }
        }

        self.createrepo(executor, log, build, &target_dir)?;
        self.sign_metadata(executor, log, build, sign_key, &target_dir)
    }
}

impl Job for RpmPublishJob<'_> {
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
            Dependency::Plugin("sign_rpm".to_string()),
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

        let sign_artifacts_dir = dist_stage_dir(config, component, dist, "sign")?;
        let build_artifacts_dir = dist_stage_dir(config, component, dist, "build")?;
        let publish_artifacts_dir = dist_stage_dir(config, component, dist, "publish")?;
        let db_path = sign_artifacts_dir.join("rpmdb");
        if !db_path.exists() {
            return Err(PluginError::Publish(format!(
                "{component}: {dist}: Failed to find RPM DB path."
            )));
        }

        // Publish repository skeleton (comps included) is created
        // unconditionally; it is idempotent.
        let comps = executor
            .plugins_dir()
            .join(format!("publish_rpm/comps/comps-{}.xml", dist.package_set));
        let skeleton_cmd = RunSpec {
            cmd: vec![format!(
                "{}/publish_rpm/scripts/create-skeleton {} {} {} {} {}",
                executor.plugins_dir().display(),
                config.release_name(),
                dist.package_set,
                dist.name,
                config.artifacts().repository_publish_dir("rpm").display(),
                comps.display()
            )],
            ..Default::default()
        };
        executor
            .run(&skeleton_cmd, &mut |line| log.line(line))
            .map_err(|_| {
                PluginError::Publish(format!(
                    "{component}:{dist}: Failed to create repository skeleton."
                ))
            })?;

        let mangled = params.mangled_builds();

        if options.unpublish {
            let all_published = mangled.iter().all(|bn| {
                artifacts::read_info(&publish_artifacts_dir, "publish", bn)
                    .map(|record| record.is_published_in(&repository))
                    .unwrap_or(false)
            });
            if !all_published {
                info!("{component}:{dist}: Not published to '{repository}'.");
                return Ok(());
            }

            for (build, build_bn) in params.build.iter().zip(&mangled) {
                let build_info =
                    artifacts::read_info(&build_artifacts_dir, "build", build_bn)
                        .map_err(|e| PluginError::Publish(e.to_string()))?;
                let mut publish_info =
                    artifacts::read_info(&publish_artifacts_dir, "publish", build_bn)
                        .map_err(|e| PluginError::Publish(e.to_string()))?;

                self.unpublish(
                    executor.as_mut(),
                    &mut log,
                    build,
                    &build_info,
                    &sign_key,
                    &repository,
                )?;
                self.create_metalink(executor.as_mut(), &mut log, &repository);

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

        // Re-publishing into the same repository is a no-op.
        let all_published = mangled.iter().all(|bn| {
            artifacts::read_info(&publish_artifacts_dir, "publish", bn)
                .map(|record| record.is_published_in(&repository))
                .unwrap_or(false)
        });
        if all_published {
            info!("{component}:{dist}: Already published to '{repository}'.");
            self.create_metalink(executor.as_mut(), &mut log, &repository);
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
            if build_info.source_hash.is_none() {
                return Err(PluginError::Publish(format!(
                    "{component}:{dist}:{build}: Cannot find build info."
                )));
            }
            let publish_info = artifacts::read_info(&publish_artifacts_dir, "publish", build_bn)
                .map_err(|e| PluginError::Publish(e.to_string()))?;

            // A publish record from an older build of the same
            // version-release must be withdrawn everywhere first.
            let mut info = build_info.clone();
            if !publish_info.repository_publish.is_empty() {
                if publish_info.source_hash != build_info.source_hash {
                    for entry in &publish_info.repository_publish {
                        self.unpublish(
                            executor.as_mut(),
                            &mut log,
                            build,
                            &build_info,
                            &sign_key,
                            &entry.name,
                        )?;
                    }
                } else {
                    info = publish_info;
                }
            }

            self.publish(
                executor.as_mut(),
                &mut log,
                build,
                &build_info,
                &sign_key,
                &db_path,
                &repository,
            )?;
            self.create_metalink(executor.as_mut(), &mut log, &repository);

            info.record_publish(&repository, &timestamp);
            artifacts::save_info(&publish_artifacts_dir, "publish", build_bn, &info)
                .map_err(|e| PluginError::Publish(e.to_string()))?;
        }
        Ok(())
    }
}
