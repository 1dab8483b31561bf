//! Arch Linux prep: resolve PKGBUILD package names and predict the
//! `.pkg.tar.zst` file names later stages collect.

use buildconfig::{is_filename_valid, Component, Config, Distribution, Stage};
use executor::RunSpec;
use fileutil::SafeTempDir;
use tracing::info;

use crate::source::{
    dist_stage_dir, fetch_info, log_skip, read_lines, reset_dir, source_hash_unchanged,
};
use crate::{
    base_environment, default_copy_in, dist_parameters, step_log, Dependency, InstanceArgs, Job,
    JobContext, JobReference, PluginError, PluginFactory, RunOptions,
};

pub struct ArchlinuxSourcePlugin;

impl PluginFactory for ArchlinuxSourcePlugin {
    fn name(&self) -> &'static str {
        "source_archlinux"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::Prep]
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
                jobs.push(Box::new(ArchlinuxSourceJob {
                    config: args.config,
                    component,
                    dist,
                }));
            }
        }
        Ok(jobs)
    }
}

pub struct ArchlinuxSourceJob<'a> {
    config: &'a Config,
    component: &'a Component,
    dist: &'a Distribution,
}

impl Job for ArchlinuxSourceJob<'_> {
    fn name(&self) -> String {
        format!("prep:{}:{}", self.component.name, self.dist.distribution())
    }

    fn reference(&self) -> JobReference {
        JobReference::dist_component(Stage::Prep, self.component, self.dist)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::Plugin("fetch".to_string()),
            Dependency::Plugin("source".to_string()),
        ]
    }

    fn run(&mut self, ctx: &JobContext, _options: &RunOptions) -> Result<(), PluginError> {
        let (config, component, dist) = (self.config, self.component, self.dist);
        let mut executor = config.executor_for("prep", Some(dist), Some(component))?;

        let params = dist_parameters(executor.as_ref(), component, dist, config)?;
        if !component.has_packages || params.build.is_empty() {
            info!("{component}:{dist}: Nothing to be done.");
            return Ok(());
        }
        if source_hash_unchanged(config, component, dist, "prep", &params.mangled_builds())? {
            log_skip(component, dist, "prepared");
            return Ok(());
        }

        let mut log = step_log(
            config,
            &format!("prep-{}-{}", component.name, dist.distribution()),
        )?;
        info!("Log file: {}", log.path().display());

        let artifacts_dir = dist_stage_dir(config, component, dist, "prep")?;
        reset_dir(&artifacts_dir)?;
        let fetch_record = fetch_info(config, component)?;
        let source_dir = executor.builder_dir().join(&component.name);
        let verrel = component.verrel()?;

        for build in &params.build {
            let build_bn = artifacts::mangle_path(build);
            let temp_dir = SafeTempDir::new().map_err(|e| PluginError::Source(e.to_string()))?;

            let copy_in: Vec<_> = vec![(component.source_dir.clone(), executor.builder_dir())]
                .into_iter()
                .chain(default_copy_in(
                    executor.as_ref(),
                    ctx.manager,
                    config,
                    "source_archlinux",
                    &self.dependencies(),
                ))
                .collect();
            let spec = RunSpec {
                cmd: vec![format!(
                    "{}/source_archlinux/scripts/get-source-info {} {}",
                    executor.plugins_dir().display(),
                    source_dir.display(),
                    source_dir.join(build).display()
                )],
                copy_in,
                copy_out: vec![(
                    source_dir.join(format!("{build_bn}_packages.list")),
                    temp_dir.path().to_path_buf(),
                )],
                env: base_environment(config),
                ..Default::default()
            };
            executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
                PluginError::Source(format!(
                    "{component}:{dist}:{build}: Failed to get source information: {e}."
                ))
            })?;

            let mut packages_list = Vec::new();
            for line in
                read_lines(&temp_dir.path().join(format!("{build_bn}_packages.list")))?
            {
                if !is_filename_valid(&line, None) {
                    return Err(PluginError::Source(format!(
                        "{component}:{dist}:{build}: Invalid package name."
                    )));
                }
                packages_list.push(format!(
                    "{line}-{verrel}-{}.pkg.tar.zst",
                    dist.architecture
                ));
            }

            let mut info = fetch_record.clone();
            info.packages = packages_list;
            info.source_hash = Some(component.source_hash()?.to_string());
            artifacts::save_info(&artifacts_dir, "prep", &build_bn, &info)
                .map_err(|e| PluginError::Source(e.to_string()))?;
        }
        Ok(())
    }
}
