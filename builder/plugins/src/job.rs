use std::collections::HashSet;

use buildconfig::{Component, Config, Distribution, Stage, Template};
use tracing::info;

use crate::{PluginError, PluginManager};

/// Identifies one job of the stage×component×distribution/template matrix.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct JobReference {
    pub stage: Stage,
    pub component: Option<String>,
    pub dist: Option<String>,
    pub template: Option<String>,
    /// Mangled build-target name for per-target jobs; empty for whole-tuple
    /// jobs.
    pub build: Option<String>,
}

impl JobReference {
    pub fn dist_component(stage: Stage, component: &Component, dist: &Distribution) -> Self {
        Self {
            stage,
            component: Some(component.name.clone()),
            dist: Some(dist.distribution().to_string()),
            template: None,
            build: None,
        }
    }

    pub fn component_only(stage: Stage, component: &Component) -> Self {
        Self {
            stage,
            component: Some(component.name.clone()),
            dist: None,
            template: None,
            build: None,
        }
    }

    pub fn template(stage: Stage, template: &Template) -> Self {
        Self {
            stage,
            component: None,
            dist: None,
            template: Some(template.name.clone()),
            build: None,
        }
    }
}

/// A declared prerequisite of a job.
#[derive(Clone, Debug)]
pub enum Dependency {
    /// A sibling plugin entity that must exist.
    Plugin(String),
    /// A source component that must be present in config and fetched.
    Component(String),
    /// A job of an earlier stage for the same tuple; satisfied by the
    /// current run or by an existing artifact record, never by implicit
    /// back-execution.
    Job(JobReference),
}

/// Options a CLI verb passes down to the jobs it triggers.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub repository_publish: Option<String>,
    pub ignore_min_age: bool,
    pub unpublish: bool,
    /// Externally supplied template build timestamp (`YYYYMMDDHHMM`).
    pub template_timestamp: Option<String>,
}

pub struct JobContext<'a> {
    pub config: &'a Config,
    pub manager: &'a PluginManager,
}

/// One runnable unit produced by a plugin factory for a stage.
pub trait Job {
    /// Display name, e.g. `build:core-qrexec:host-fc32`.
    fn name(&self) -> String;

    fn reference(&self) -> JobReference;

    /// Lower runs first within a stage.
    fn priority(&self) -> i32 {
        10
    }

    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    fn run(&mut self, ctx: &JobContext, options: &RunOptions) -> Result<(), PluginError>;
}

/// The factory side of a plugin: declares its stages and emits jobs for the
/// requested matrix.
pub trait PluginFactory: Sync {
    fn name(&self) -> &'static str;

    fn stages(&self) -> &'static [Stage];

    fn instances<'a>(
        &self,
        args: &InstanceArgs<'a>,
    ) -> Result<Vec<Box<dyn Job + 'a>>, PluginError>;
}

pub struct InstanceArgs<'a> {
    pub stage: Stage,
    pub config: &'a Config,
    pub components: Vec<&'a Component>,
    pub distributions: Vec<&'a Distribution>,
    pub templates: Vec<&'a Template>,
}

/// Validates a job's declared dependencies against the plugin entities, the
/// configuration, and the jobs already completed in this run.
pub fn check_dependencies(
    job: &dyn Job,
    ctx: &JobContext,
    completed: &HashSet<JobReference>,
) -> Result<(), PluginError> {
    for dependency in job.dependencies() {
        match dependency {
            Dependency::Plugin(name) => {
                if !ctx.manager.has_entity(&name) && !crate::registry::is_builtin(&name) {
                    return Err(PluginError::Plugin(format!("Cannot find plugin '{name}'.")));
                }
            }
            Dependency::Component(name) => {
                let component = ctx.config.component(&name).ok_or_else(|| {
                    PluginError::Plugin(format!(
                        "Cannot find component '{name}' in configuration file."
                    ))
                })?;
                if !component.source_dir.exists() {
                    return Err(PluginError::Plugin(format!(
                        "Cannot find source component '{name}' in artifacts. \
                         Is package fetch stage done for '{name}'?"
                    )));
                }
                info!(
                    "dependency '{name}' (commit hash: {})",
                    component.head_commit_hash().unwrap_or_else(|_| "?".to_string())
                );
            }
            Dependency::Job(reference) => {
                if completed.contains(&reference) {
                    continue;
                }
                // A per-target reference is also satisfied by the completed
                // whole-tuple job of the same stage.
                let tuple = JobReference {
                    build: None,
                    ..reference.clone()
                };
                if completed.contains(&tuple) {
                    continue;
                }
                if !job_artifact_exists(ctx.config, &reference) {
                    return Err(PluginError::Plugin(format!(
                        "{}: Missing '{}' stage artifacts!",
                        job.name(),
                        reference.stage
                    )));
                }
            }
        }
    }
    Ok(())
}

/// An unsatisfied job dependency may still hold from a previous invocation:
/// look for the referenced stage's artifact info record on disk.
fn job_artifact_exists(config: &Config, reference: &JobReference) -> bool {
    let stage = reference.stage.to_string();
    if let Some(template) = &reference.template {
        return config
            .artifacts()
            .templates_dir()
            .join(artifacts::info_filename(&stage, template))
            .exists();
    }
    let Some(component_name) = &reference.component else {
        return false;
    };
    let Some(component) = config.component(component_name) else {
        return false;
    };
    let Ok(verrel) = component.verrel() else {
        return false;
    };
    let dir = match &reference.dist {
        Some(dist) => config
            .artifacts()
            .dist_artifacts_dir(component_name, &verrel, dist, &stage),
        None => config
            .artifacts()
            .component_artifacts_dir(component_name, &verrel, &stage),
    };
    match &reference.build {
        Some(build) => dir.join(artifacts::info_filename(&stage, build)).exists(),
        None => dir.exists(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildconfig::Stage;

    struct FakeJob {
        dependencies: Vec<Dependency>,
    }

    impl Job for FakeJob {
        fn name(&self) -> String {
            "fake".to_string()
        }

        fn reference(&self) -> JobReference {
            JobReference {
                stage: Stage::Build,
                component: Some("x".to_string()),
                dist: Some("host-fc32".to_string()),
                template: None,
                build: None,
            }
        }

        fn dependencies(&self) -> Vec<Dependency> {
            self.dependencies.clone()
        }

        fn run(&mut self, _ctx: &JobContext, _options: &RunOptions) -> Result<(), PluginError> {
            Ok(())
        }
    }

    fn test_config(dir: &std::path::Path) -> Config {
        let path = dir.join("builder.yml");
        std::fs::write(&path, "distributions: [host-fc32]\n").unwrap();
        Config::from_file(&path, &[]).unwrap()
    }

    #[test]
    fn builtin_plugin_dependencies_are_satisfied() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let manager = PluginManager::empty();
        let ctx = JobContext {
            config: &config,
            manager: &manager,
        };
        let job = FakeJob {
            dependencies: vec![Dependency::Plugin("fetch".to_string())],
        };
        check_dependencies(&job, &ctx, &HashSet::new()).unwrap();

        let missing = FakeJob {
            dependencies: vec![Dependency::Plugin("no_such_plugin".to_string())],
        };
        assert!(check_dependencies(&missing, &ctx, &HashSet::new()).is_err());
    }

    #[test]
    fn job_dependency_satisfied_by_completed_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let manager = PluginManager::empty();
        let ctx = JobContext {
            config: &config,
            manager: &manager,
        };

        let prep = JobReference {
            stage: Stage::Prep,
            component: Some("x".to_string()),
            dist: Some("host-fc32".to_string()),
            template: None,
            build: None,
        };
        let job = FakeJob {
            dependencies: vec![Dependency::Job(prep.clone())],
        };

        // Not completed and no artifact record on disk: refused, never
        // back-executed.
        assert!(check_dependencies(&job, &ctx, &HashSet::new()).is_err());

        let mut completed = HashSet::new();
        completed.insert(prep);
        check_dependencies(&job, &ctx, &completed).unwrap();
    }

    #[test]
    fn per_target_dependency_matches_whole_tuple_job() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let manager = PluginManager::empty();
        let ctx = JobContext {
            config: &config,
            manager: &manager,
        };

        let tuple = JobReference {
            stage: Stage::Build,
            component: Some("x".to_string()),
            dist: Some("host-fc32".to_string()),
            template: None,
            build: None,
        };
        let per_target = JobReference {
            build: Some("vmm-xen.spec".to_string()),
            ..tuple.clone()
        };
        let job = FakeJob {
            dependencies: vec![Dependency::Job(per_target)],
        };

        let mut completed = HashSet::new();
        completed.insert(tuple);
        check_dependencies(&job, &ctx, &completed).unwrap();
    }
}
