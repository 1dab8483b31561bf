//! Windows prep: no source repackaging — the build stage consumes the Git
//! working tree directly, so prep only records provenance.

use buildconfig::{Component, Config, Distribution, Stage};
use tracing::info;

use crate::source::{dist_stage_dir, fetch_info, log_skip, reset_dir, source_hash_unchanged};
use crate::{
    dist_parameters, Dependency, InstanceArgs, Job, JobContext, JobReference, PluginError,
    PluginFactory, RunOptions,
};

pub struct WindowsSourcePlugin;

impl PluginFactory for WindowsSourcePlugin {
    fn name(&self) -> &'static str {
        "source_windows"
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
                if !dist.is_windows() {
                    continue;
                }
                jobs.push(Box::new(WindowsSourceJob {
                    config: args.config,
                    component,
                    dist,
                }));
            }
        }
        Ok(jobs)
    }
}

pub struct WindowsSourceJob<'a> {
    config: &'a Config,
    component: &'a Component,
    dist: &'a Distribution,
}

impl Job for WindowsSourceJob<'_> {
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

    fn run(&mut self, _ctx: &JobContext, _options: &RunOptions) -> Result<(), PluginError> {
        let (config, component, dist) = (self.config, self.component, self.dist);
        let executor = config.executor_for("prep", Some(dist), Some(component))?;

        let params = dist_parameters(executor.as_ref(), component, dist, config)?;
        if !component.has_packages || params.build.is_empty() {
            info!("{component}:{dist}: Nothing to be done.");
            return Ok(());
        }
        if source_hash_unchanged(config, component, dist, "prep", &params.mangled_builds())? {
            log_skip(component, dist, "prepared");
            return Ok(());
        }

        let artifacts_dir = dist_stage_dir(config, component, dist, "prep")?;
        reset_dir(&artifacts_dir)?;

        let mut info = fetch_info(config, component)?;
        info.source_hash = Some(component.source_hash()?.to_string());
        // One record per build target so later stages find their inputs.
        for build in params.mangled_builds() {
            artifacts::save_info(&artifacts_dir, "prep", &build, &info)
                .map_err(|e| PluginError::Source(e.to_string()))?;
        }
        artifacts::save_info(&artifacts_dir, "prep", &component.name, &info)
            .map_err(|e| PluginError::Source(e.to_string()))?;
        Ok(())
    }
}
