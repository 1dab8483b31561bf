//! Windows build: MSBuild over a Visual Studio solution in the Git working
//! tree. The manifest's `bin`/`inc`/`lib` lists are opaque data; only their
//! shape is validated.

use std::path::PathBuf;

use buildconfig::{Component, Config, Distribution, Stage};
use executor::RunSpec;
use serde_yaml::Value;
use tracing::info;

use crate::build::{clean_local_repository, provision_local_repository};
use crate::source::{dist_stage_dir, log_skip, reset_dir, source_hash_unchanged};
use crate::{
    base_environment, default_copy_in, dist_parameters, step_log, Dependency, InstanceArgs, Job,
    JobContext, JobReference, PluginError, PluginFactory, RunOptions,
};

const ARTIFACT_KINDS: [&str; 3] = ["bin", "inc", "lib"];

pub struct WindowsBuildPlugin;

impl PluginFactory for WindowsBuildPlugin {
    fn name(&self) -> &'static str {
        "build_windows"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::Build]
    }

    fn instances<'a>(
        &self,
        args: &InstanceArgs<'a>,
    ) -> Result<Vec<Box<dyn Job + 'a>>, PluginError> {
        let mut jobs: Vec<Box<dyn Job>> = Vec::new();
        for component in &args.components {
            for dist in &args.distributions {
                if !dist.is_windows() {
                    continue;
                }
                jobs.push(Box::new(WindowsBuildJob {
                    config: args.config,
                    component,
                    dist,
                }));
            }
        }
        Ok(jobs)
    }
}

pub struct WindowsBuildJob<'a> {
    config: &'a Config,
    component: &'a Component,
    dist: &'a Distribution,
}

impl Job for WindowsBuildJob<'_> {
    fn name(&self) -> String {
        format!("build:{}:{}", self.component.name, self.dist.distribution())
    }

    fn reference(&self) -> JobReference {
        JobReference::dist_component(Stage::Build, self.component, self.dist)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::Plugin("build".to_string()),
            Dependency::Job(JobReference::dist_component(
                Stage::Prep,
                self.component,
                self.dist,
            )),
        ]
    }

    fn run(&mut self, ctx: &JobContext, _options: &RunOptions) -> Result<(), PluginError> {
        let (config, component, dist) = (self.config, self.component, self.dist);
        let mut executor = config.executor_for("build", Some(dist), Some(component))?;

        let params = dist_parameters(executor.as_ref(), component, dist, config)?;
        if !component.has_packages || params.build.is_empty() {
            info!("{component}:{dist}: Nothing to be done.");
            return Ok(());
        }
        if source_hash_unchanged(config, component, dist, "build", &[component.name.clone()])? {
            log_skip(component, dist, "built");
            return Ok(());
        }

        let mut log = step_log(
            config,
            &format!("build-{}-{}", component.name, dist.distribution()),
        )?;
        info!("Log file: {}", log.path().display());

        let artifacts_dir = dist_stage_dir(config, component, dist, "build")?;
        reset_dir(&artifacts_dir)?;
        for kind in ARTIFACT_KINDS {
            std::fs::create_dir_all(artifacts_dir.join(kind))
                .map_err(|e| PluginError::Build(e.to_string(), None))?;
        }
        let distfiles_dir = config.artifacts().component_distfiles_dir(&component.name);

        let repository_dir = config.artifacts().repository_dir(dist.distribution());
        clean_local_repository(
            &repository_dir,
            component,
            dist,
            &format!("{}_", component.name),
        )?;

        let mut collected: Vec<PathBuf> = Vec::new();
        for target in &params.build {
            if target != "dummy" && !target.ends_with(".sln") {
                return Err(PluginError::Build(
                    "Plugin build_windows can only build Visual Studio .sln targets".to_string(),
                    None,
                ));
            }

            let mut copy_in: Vec<_> = default_copy_in(
                executor.as_ref(),
                ctx.manager,
                config,
                "build_windows",
                &self.dependencies(),
            );
            copy_in.push((repository_dir.clone(), executor.repository_dir()));
            copy_in.push((component.source_dir.clone(), executor.build_dir()));
            copy_in.push((distfiles_dir.clone(), executor.distfiles_dir()));

            // Declared outputs per kind; shape-checked, never interpreted.
            let mut copy_out = Vec::new();
            for kind in ARTIFACT_KINDS {
                for file in string_list(params.raw().get(kind)) {
                    if file.contains("..") {
                        return Err(PluginError::Build(
                            format!("{component}:{dist}:{target}: Invalid output path."),
                            None,
                        ));
                    }
                    let source = executor.build_dir().join(&component.name).join(&file);
                    collected.push(artifacts_dir.join(kind).join(
                        PathBuf::from(&file).file_name().unwrap_or_default(),
                    ));
                    copy_out.push((source, artifacts_dir.join(kind)));
                }
            }

            let cmd = if target == "dummy" {
                vec!["exit 0".to_string()]
            } else {
                let mut build_cmd = vec![format!(
                    "powershell -noninteractive -executionpolicy bypass \
                     {}/build_windows/scripts/build-sln.ps1 -solution {} -repo {}",
                    executor.plugins_dir().display(),
                    executor.build_dir().join(&component.name).join(target).display(),
                    executor.repository_dir().join(dist.distribution()).display()
                )];
                if config.debug() {
                    build_cmd.push("-log".to_string());
                }
                if config.verbose() {
                    build_cmd.push("-noisy".to_string());
                }
                vec![build_cmd.join(" ")]
            };

            let spec = RunSpec {
                cmd,
                copy_in,
                copy_out,
                env: base_environment(config),
                ..Default::default()
            };
            executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
                PluginError::Build(
                    format!("{component}:{dist}:{target}: Failed to build solution: {e}."),
                    None,
                )
            })?;
        }

        provision_local_repository(
            &format!("{component}:{dist}"),
            &repository_dir,
            &format!("{}_{}", component.name, component.version()?),
            &collected,
        )?;

        let mut info = artifacts::InfoRecord {
            source_hash: Some(component.source_hash()?.to_string()),
            ..Default::default()
        };
        info.files = collected
            .iter()
            .filter_map(|p| p.strip_prefix(&artifacts_dir).ok())
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        artifacts::save_info(&artifacts_dir, "build", &component.name, &info)
            .map_err(|e| PluginError::Build(e.to_string(), None))?;
        Ok(())
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
