//! Debian build: pbuilder over the prep-stage source package, with the
//! builder-local repository wired in as an extra trusted source.

use std::path::PathBuf;

use buildconfig::{Component, Config, Distribution, Stage};
use executor::RunSpec;
use serde_yaml::Value;
use tracing::info;

use crate::build::{clean_local_repository, provision_local_repository, value_string};
use crate::source::{dist_stage_dir, log_skip, reset_dir, source_hash_unchanged};
use crate::{
    base_environment, default_copy_in, dist_parameters, extract_lines_before, step_log,
    Dependency, InstanceArgs, Job, JobContext, JobReference, PluginError, PluginFactory,
    RunOptions,
};

pub struct DebBuildPlugin;

impl PluginFactory for DebBuildPlugin {
    fn name(&self) -> &'static str {
        "build_deb"
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
                if !dist.is_deb() && !dist.is_ubuntu() {
                    continue;
                }
                jobs.push(Box::new(DebBuildJob {
                    config: args.config,
                    component,
                    dist,
                }));
            }
        }
        Ok(jobs)
    }
}

pub struct DebBuildJob<'a> {
    config: &'a Config,
    component: &'a Component,
    dist: &'a Distribution,
}

impl Job for DebBuildJob<'_> {
    fn name(&self) -> String {
        format!("build:{}:{}", self.component.name, self.dist.distribution())
    }

    fn reference(&self) -> JobReference {
        JobReference::dist_component(Stage::Build, self.component, self.dist)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::Plugin("chroot_deb".to_string()),
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
            info!("{component}: nothing to be done for {dist}");
            return Ok(());
        }
        if source_hash_unchanged(config, component, dist, "build", &params.mangled_builds())? {
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
        let prep_artifacts_dir = dist_stage_dir(config, component, dist, "prep")?;

        let repository_dir = config.artifacts().repository_dir(dist.distribution());
        clean_local_repository(
            &repository_dir,
            component,
            dist,
            &format!("{}-", component.name),
        )?;

        let use_qubes_repo = config.use_qubes_repo();
        let mut env = base_environment(config);
        env.insert("DIST".to_string(), dist.name.clone());
        env.insert("LC_ALL".to_string(), "C".to_string());
        env.insert("DEBFULLNAME".to_string(), "Builder".to_string());
        env.insert("DEBEMAIL".to_string(), "user@localhost".to_string());

        for directory in &params.build {
            let directory_bn = artifacts::mangle_path(directory);

            let mut source_info = artifacts::read_info(&prep_artifacts_dir, "prep", &directory_bn)
                .map_err(|e| PluginError::Build(e.to_string(), None))?;
            let Some(dsc) = source_info.dsc.clone() else {
                return Err(PluginError::Build(
                    format!(
                        "{component}:{dist}:{directory}: Failed to read source info."
                    ),
                    None,
                ));
            };
            let changes = dsc.replace(".dsc", &format!("_{}.changes", dist.architecture));
            let buildinfo = dsc.replace(".dsc", &format!("_{}.buildinfo", dist.architecture));
            source_info.changes = Some(changes.clone());
            source_info.buildinfo = Some(buildinfo.clone());

            let mut copy_in: Vec<_> = default_copy_in(
                executor.as_ref(),
                ctx.manager,
                config,
                "build_deb",
                &self.dependencies(),
            );
            if let Some(entity) = ctx.manager.entity_dir("build_deb") {
                copy_in.push((entity.join("pbuilder"), executor.builder_dir()));
            }
            copy_in.push((repository_dir.clone(), executor.repository_dir()));
            copy_in.push((prep_artifacts_dir.join(&dsc), executor.build_dir()));
            if let Some(orig) = &source_info.orig {
                copy_in.push((prep_artifacts_dir.join(orig), executor.build_dir()));
            }
            if let Some(debian) = &source_info.debian {
                copy_in.push((prep_artifacts_dir.join(debian), executor.build_dir()));
            }

            // Prepared pbuilder chroot cache, when init-cache has run.
            let chroot_cache = config
                .artifacts()
                .chroot_cache_dir(&dist.name)
                .join("pbuilder");
            let base_tgz_cached = chroot_cache.join("base.tgz").exists();
            if base_tgz_cached {
                copy_in.push((chroot_cache.clone(), executor.builder_dir()));
            }

            let results_dir = executor.builder_dir().join("pbuilder/results");
            let mut copy_out = vec![
                (results_dir.join(&changes), artifacts_dir.clone()),
                (results_dir.join(&buildinfo), artifacts_dir.clone()),
            ];
            copy_out.extend(
                source_info
                    .packages
                    .iter()
                    .map(|deb| (results_dir.join(deb), artifacts_dir.clone())),
            );

            // The builder-local repository is always available as a trusted
            // source so earlier components of this run can satisfy
            // dependencies.
            let mut extra_sources =
                format!("deb [trusted=yes] file:///tmp/qubes-deb {} main", dist.name);
            let mut cmd = vec![format!(
                "{}/build_deb/scripts/create-local-repo {} {} {}",
                executor.plugins_dir().display(),
                executor.repository_dir().display(),
                dist.fullname,
                dist.name
            )];
            if let Some(version) = use_qubes_repo.get("version").map(value_string) {
                extra_sources = format!(
                    "{extra_sources}|deb [arch=amd64] http://deb.qubes-os.org/r{version}/vm {} main",
                    dist.name
                );
                cmd.push(format!(
                    "gpg --dearmor < {}/build_deb/keys/qubes-debian-r{version}.asc \
                     > {}/pbuilder/qubes-keyring.gpg",
                    executor.plugins_dir().display(),
                    executor.builder_dir().display()
                ));
                if use_qubes_repo
                    .get("testing")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    extra_sources = format!(
                        "{extra_sources}|deb [arch=amd64] http://deb.qubes-os.org/r{version}/vm \
                         {}-testing main",
                        dist.name
                    );
                }
            }

            if !base_tgz_cached {
                cmd.push(format!(
                    "sudo -E pbuilder create --distribution {} \
                     --configfile {}/pbuilder/pbuilderrc --othermirror \"{extra_sources}\"",
                    dist.name,
                    executor.builder_dir().display()
                ));
            }
            cmd.push(format!(
                "sudo -E pbuilder build --override-config --distribution {} \
                 --configfile {}/pbuilder/pbuilderrc --othermirror \"{extra_sources}\" {}",
                dist.name,
                executor.builder_dir().display(),
                executor.build_dir().join(&dsc).display()
            ));

            let spec = RunSpec {
                cmd,
                copy_in,
                copy_out,
                env: env.clone(),
                no_fail_copy_out_allowed_patterns: vec![".deb".to_string()],
                ..Default::default()
            };
            let result = executor.run(&spec, &mut |line| log.line(line));
            if let Err(e) = result {
                let additional = extract_lines_before(log.path(), "dpkg-buildpackage: error:");
                return Err(PluginError::Build(
                    format!("{component}:{dist}:{directory}: Failed to build packages: {e}."),
                    additional.map(Box::new),
                ));
            }

            let packages_list: Vec<String> = source_info
                .packages
                .iter()
                .filter(|deb| artifacts_dir.join(deb).exists())
                .cloned()
                .collect();

            // Keep the originally copied-in source next to the results to
            // cross check what the .changes file references.
            let mut repo_files: Vec<PathBuf> = Vec::new();
            for name in [Some(&dsc), source_info.orig.as_ref(), source_info.debian.as_ref()]
                .into_iter()
                .flatten()
            {
                let target = artifacts_dir.join(name);
                std::fs::copy(prep_artifacts_dir.join(name), &target)
                    .map_err(|e| PluginError::Build(e.to_string(), None))?;
                repo_files.push(target);
            }
            repo_files.extend(packages_list.iter().map(|deb| artifacts_dir.join(deb)));
            repo_files.push(artifacts_dir.join(&changes));
            repo_files.push(artifacts_dir.join(&buildinfo));

            provision_local_repository(
                &format!("{component}:{dist}:{directory}"),
                &repository_dir,
                &format!("{}-{}", component.name, component.version()?),
                &repo_files,
            )?;

            let mut info = source_info;
            info.packages = packages_list;
            info.source_hash = Some(component.source_hash()?.to_string());
            artifacts::save_info(&artifacts_dir, "build", &directory_bn, &info)
                .map_err(|e| PluginError::Build(e.to_string(), None))?;
        }
        Ok(())
    }
}
