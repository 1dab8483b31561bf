use std::collections::HashSet;

use buildconfig::{Component, Config, Distribution, Stage, Template};
use itertools::Itertools;
use tracing::info;

use crate::{
    check_dependencies, registry, InstanceArgs, JobContext, JobReference, PluginError,
    PluginManager, RunOptions,
};

/// One pipeline run: a sequence of stages over a fixed
/// component×distribution and template matrix.
///
/// Stages run to completion one after the other; within a stage, jobs run
/// sequentially in priority order. Completed job references satisfy the job
/// dependencies of later stages — there is no implicit back-execution.
pub struct Pipeline<'a> {
    config: &'a Config,
    manager: &'a PluginManager,
    completed: HashSet<JobReference>,
    devel_incremented: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, manager: &'a PluginManager) -> Self {
        Self {
            config,
            manager,
            completed: HashSet::new(),
            devel_incremented: false,
        }
    }

    pub fn run_stages(
        &mut self,
        stages: &[Stage],
        components: &[&'a Component],
        distributions: &[&'a Distribution],
        templates: &[&'a Template],
        options: &RunOptions,
    ) -> Result<(), PluginError> {
        info!("Running stages: {}", stages.iter().join(", "));
        for stage in stages {
            self.run_stage(*stage, components, distributions, templates, options)?;
            if *stage == Stage::Publish && self.config.automatic_upload_on_publish() {
                self.run_stage(Stage::Upload, components, distributions, templates, options)?;
            }
        }
        Ok(())
    }

    /// Runs the configured stage list, `fetch` first so that configuration
    /// fetched from source is available to later stages.
    pub fn run_all(
        &mut self,
        components: &[&'a Component],
        distributions: &[&'a Distribution],
        templates: &[&'a Template],
        options: &RunOptions,
    ) -> Result<(), PluginError> {
        let mut stages = self.config.stages();
        if self.config.automatic_upload_on_publish() {
            stages.retain(|s| *s != Stage::Upload);
        }
        if let Some(index) = stages.iter().position(|s| *s == Stage::Fetch) {
            stages.remove(index);
            self.run_stages(
                &[Stage::Fetch],
                components,
                distributions,
                templates,
                options,
            )?;
        }
        self.run_stages(&stages, components, distributions, templates, options)
    }

    pub fn run_stage(
        &mut self,
        stage: Stage,
        components: &[&'a Component],
        distributions: &[&'a Distribution],
        templates: &[&'a Template],
        options: &RunOptions,
    ) -> Result<(), PluginError> {
        // The devel counter moves exactly once per pipeline run, before any
        // prep step consumes it.
        if stage == Stage::Prep && self.config.increment_devel_versions() && !self.devel_incremented
        {
            for component in components {
                component.increment_devel_versions()?;
            }
            self.devel_incremented = true;
        }

        let args = InstanceArgs {
            stage,
            config: self.config,
            components: components.to_vec(),
            distributions: distributions.to_vec(),
            templates: templates.to_vec(),
        };

        let mut jobs = Vec::new();
        for factory in registry::builtin_plugins() {
            if factory.stages().contains(&stage) {
                jobs.extend(factory.instances(&args)?);
            }
        }
        jobs.sort_by_key(|job| job.priority());

        let ctx = JobContext {
            config: self.config,
            manager: self.manager,
        };
        for job in &mut jobs {
            info!("Running '{}'.", job.name());
            check_dependencies(job.as_ref(), &ctx, &self.completed)?;
            job.run(&ctx, options)?;
            self.completed.insert(job.reference());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_matrix_runs_every_stage_without_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let conf_path = dir.path().join("builder.yml");
        std::fs::write(
            &conf_path,
            format!(
                "artifacts-dir: {}\ndistributions: []\n",
                dir.path().join("artifacts").display()
            ),
        )
        .unwrap();
        let config = Config::from_file(&conf_path, &[]).unwrap();
        let manager = PluginManager::empty();

        let mut pipeline = Pipeline::new(&config, &manager);
        pipeline
            .run_all(&[], &[], &[], &RunOptions::default())
            .unwrap();
    }
}
