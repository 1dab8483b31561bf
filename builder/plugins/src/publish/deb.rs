//! Debian publish: `reprepro include` of the signed `.changes` into the
//! per-release repository tree; the suite encodes the publish repository.

use std::path::PathBuf;

use buildconfig::{Component, Config, Distribution, Stage};
use executor::{Executor, RunSpec};
use tracing::info;

use crate::publish::{
    can_be_published_in_stable, debian_suite, min_age_failure_msg, require_local,
    validate_component_repository,
};
use crate::source::dist_stage_dir;
use crate::{
    dist_parameters, step_log, Dependency, InstanceArgs, Job, JobContext, JobReference,
    PluginError, PluginFactory, RunOptions, StepLog,
};

pub struct DebPublishPlugin;

impl PluginFactory for DebPublishPlugin {
    fn name(&self) -> &'static str {
        "publish_deb"
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
                if !dist.is_deb() && !dist.is_ubuntu() {
                    continue;
                }
                jobs.push(Box::new(DebPublishJob {
                    config: args.config,
                    component,
                    dist,
                }));
            }
        }
        Ok(jobs)
    }
}

pub struct DebPublishJob<'a> {
    config: &'a Config,
    component: &'a Component,
    dist: &'a Distribution,
}

impl DebPublishJob<'_> {
    /// Base of the reprepro-managed tree for this package set.
    fn target_dir(&self) -> PathBuf {
        self.config
            .artifacts()
            .repository_publish_dir("deb")
            .join(self.config.release_name())
            .join(self.dist.package_set.to_string())
    }

    fn reprepro(
        &self,
        executor: &mut dyn Executor,
        log: &mut StepLog,
        action: &str,
    ) -> Result<(), PluginError> {
        let spec = RunSpec {
            cmd: vec![format!(
                "reprepro --ignore=surprisingbinary --ignore=surprisingarch -b {} {action}",
                self.target_dir().display()
            )],
            ..Default::default()
        };
        executor
            .run(&spec, &mut |line| log.line(line))
            .map_err(|e| PluginError::Publish(e.to_string()))
    }
}

impl Job for DebPublishJob<'_> {
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
            Dependency::Plugin("sign_deb".to_string()),
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
            info!("{component}:{dist}: Nothing to be done.");
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
        let sign_artifacts_dir = dist_stage_dir(config, component, dist, "sign")?;
        let publish_artifacts_dir = dist_stage_dir(config, component, dist, "publish")?;
        let keyring_dir = sign_artifacts_dir.join("keyring");
        if !sign_artifacts_dir.exists() {
            return Err(PluginError::Publish(
                "Cannot find keyring from sign stage.".to_string(),
            ));
        }

        // reprepro conf tree carrying the per-suite distributions file and
        // the SignWith key.
        let skeleton = RunSpec {
            cmd: vec![format!(
                "{}/publish_deb/scripts/create-skeleton {} {} {sign_key}",
                executor.plugins_dir().display(),
                config.release_name(),
                config.artifacts().repository_publish_dir("deb").display()
            )],
            ..Default::default()
        };
        executor
            .run(&skeleton, &mut |line| log.line(line))
            .map_err(|_| {
                PluginError::Publish(format!(
                    "{component}:{dist}: Failed to create repository skeleton."
                ))
            })?;

        let mangled = params.mangled_builds();
        let suite = debian_suite(dist, &repository);

        if options.unpublish {
            for (directory, directory_bn) in params.build.iter().zip(&mangled) {
                let mut publish_info =
                    artifacts::read_info(&publish_artifacts_dir, "publish", directory_bn)
                        .map_err(|e| PluginError::Publish(e.to_string()))?;
                if !publish_info.is_published_in(&repository) {
                    info!("{component}:{dist}: Not published to '{repository}'.");
                    continue;
                }
                let source_name = publish_info
                    .package_release_name
                    .as_deref()
                    .and_then(|n| n.split('_').next())
                    .unwrap_or(&component.name)
                    .to_string();
                info!(
                    "{component}:{dist}:{directory}: Unpublishing from '{repository}'."
                );
                self.reprepro(
                    executor.as_mut(),
                    &mut log,
                    &format!("removesrc {suite} {source_name}"),
                )?;

                if publish_info.drop_publish(&repository) {
                    info!(
                        "{component}:{dist}:{directory_bn}: Not published anywhere else, \
                         deleting publish info."
                    );
                    artifacts::delete_info(&publish_artifacts_dir, "publish", directory_bn)
                        .map_err(|e| PluginError::Publish(e.to_string()))?;
                } else {
                    artifacts::save_info(
                        &publish_artifacts_dir,
                        "publish",
                        directory_bn,
                        &publish_info,
                    )
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

        for (directory, directory_bn) in params.build.iter().zip(&mangled) {
            let build_info = artifacts::read_info(&build_artifacts_dir, "build", directory_bn)
                .map_err(|e| PluginError::Publish(e.to_string()))?;
            let Some(changes) = &build_info.changes else {
                info!("{component}:{dist}:{directory}: Nothing to publish.");
                continue;
            };
            let publish_info =
                artifacts::read_info(&publish_artifacts_dir, "publish", directory_bn)
                    .map_err(|e| PluginError::Publish(e.to_string()))?;

            // Same version-release but different source: withdraw the old
            // packages from every repository they sit in, then re-include.
            let mut info = build_info.clone();
            if !publish_info.repository_publish.is_empty() {
                if publish_info.source_hash != build_info.source_hash {
                    let source_name = publish_info
                        .package_release_name
                        .as_deref()
                        .and_then(|n| n.split('_').next())
                        .unwrap_or(&component.name)
                        .to_string();
                    for entry in publish_info.repository_publish.clone() {
                        let old_suite = debian_suite(dist, &entry.name);
                        self.reprepro(
                            executor.as_mut(),
                            &mut log,
                            &format!("removesrc {old_suite} {source_name}"),
                        )?;
                    }
                } else {
                    info = publish_info;
                }
            }

            // Verify the detached signatures against the scratch keyring
            // before inclusion.
            info!("{component}:{dist}:{directory}: Verifying signatures.");
            let mut verify_cmd = Vec::new();
            for file in [Some(changes), build_info.dsc.as_ref(), build_info.buildinfo.as_ref()]
                .into_iter()
                .flatten()
            {
                verify_cmd.push(format!(
                    "gpg2 -q --homedir {} --verify {}",
                    keyring_dir.display(),
                    build_artifacts_dir.join(file).display()
                ));
            }
            let spec = RunSpec {
                cmd: verify_cmd,
                ..Default::default()
            };
            executor.run(&spec, &mut |line| log.line(line)).map_err(|_| {
                PluginError::Publish(format!(
                    "{component}:{dist}:{directory}: Failed to check signatures."
                ))
            })?;

            info!("{component}:{dist}:{directory}: Publishing packages.");
            self.reprepro(
                executor.as_mut(),
                &mut log,
                &format!(
                    "include {suite} {}",
                    build_artifacts_dir.join(changes).display()
                ),
            )
            .map_err(|_| {
                PluginError::Publish(format!(
                    "{component}:{dist}:{directory}: Failed to publish packages."
                ))
            })?;

            info.record_publish(&repository, &timestamp);
            artifacts::save_info(&publish_artifacts_dir, "publish", directory_bn, &info)
                .map_err(|e| PluginError::Publish(e.to_string()))?;
        }
        Ok(())
    }
}
