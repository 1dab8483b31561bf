//! Arch Linux build: makepkg inside an arch-chroot seeded from the cached
//! root archive, against the builder-local repository.

use std::path::PathBuf;

use buildconfig::{Component, Config, Distribution, Stage};
use executor::RunSpec;
use serde_yaml::Value;
use tracing::info;

use crate::build::{clean_local_repository, provision_local_repository, value_string};
use crate::source::{dist_stage_dir, log_skip, reset_dir, source_hash_unchanged};
use crate::{
    base_environment, default_copy_in, dist_parameters, step_log, Dependency, InstanceArgs, Job,
    JobContext, JobReference, PluginError, PluginFactory, RunOptions,
};

pub struct ArchlinuxBuildPlugin;

impl PluginFactory for ArchlinuxBuildPlugin {
    fn name(&self) -> &'static str {
        "build_archlinux"
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
                if !dist.is_archlinux() {
                    continue;
                }
                jobs.push(Box::new(ArchlinuxBuildJob {
                    config: args.config,
                    component,
                    dist,
                }));
            }
        }
        Ok(jobs)
    }
}

pub struct ArchlinuxBuildJob<'a> {
    config: &'a Config,
    component: &'a Component,
    dist: &'a Distribution,
}

impl Job for ArchlinuxBuildJob<'_> {
    fn name(&self) -> String {
        format!("build:{}:{}", self.component.name, self.dist.distribution())
    }

    fn reference(&self) -> JobReference {
        JobReference::dist_component(Stage::Build, self.component, self.dist)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::Plugin("chroot_archlinux".to_string()),
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
        if executor.description() == "local" {
            return Err(PluginError::Build(
                "This plugin does not yet support local executor.".to_string(),
                None,
            ));
        }

        let params = dist_parameters(executor.as_ref(), component, dist, config)?;
        if !component.has_packages || params.build.is_empty() {
            info!("{component}:{dist}: Nothing to be done.");
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
        let pkgs_dir = artifacts_dir.join("pkgs");
        std::fs::create_dir_all(&pkgs_dir).map_err(|e| PluginError::Build(e.to_string(), None))?;
        let prep_artifacts_dir = dist_stage_dir(config, component, dist, "prep")?;
        let distfiles_dir = config.artifacts().component_distfiles_dir(&component.name);
        let source_dir = executor.builder_dir().join(&component.name);

        let repository_dir = config.artifacts().repository_dir(dist.distribution());
        clean_local_repository(
            &repository_dir,
            component,
            dist,
            &format!("{}-", component.name),
        )?;

        let use_qubes_repo = config.use_qubes_repo();
        let env = base_environment(config);

        for build in &params.build {
            let build_bn = artifacts::mangle_path(build);

            let source_info = artifacts::read_info(&prep_artifacts_dir, "prep", &build_bn)
                .map_err(|e| PluginError::Build(e.to_string(), None))?;
            if source_info.packages.is_empty() {
                return Err(PluginError::Build(
                    format!("Cannot find PKGs for '{build}'. Missing 'prep' stage call?"),
                    None,
                ));
            }

            let mut copy_in: Vec<_> = vec![
                (component.source_dir.clone(), executor.builder_dir()),
                (distfiles_dir.clone(), executor.distfiles_dir()),
                (repository_dir.clone(), executor.repository_dir()),
            ];
            copy_in.extend(default_copy_in(
                executor.as_ref(),
                ctx.manager,
                config,
                "build_archlinux",
                &self.dependencies(),
            ));

            let copy_out: Vec<_> = source_info
                .packages
                .iter()
                .map(|pkg| (source_dir.join(pkg), pkgs_dir.clone()))
                .collect();

            // Pacman and makepkg configuration for the qubes repository.
            let mut cmd = vec![format!(
                "sudo cp {0}/chroot_archlinux/conf/makepkg-x86_64.conf \
                 /usr/local/share/devtools/makepkg.conf.d/qubes-x86_64.conf",
                executor.plugins_dir().display()
            )];
            let mut pacman_cmd = format!(
                "{0}/chroot_archlinux/scripts/generate-pacman \
                 {0}/chroot_archlinux/conf/pacman.conf.j2 \
                 /usr/local/share/devtools/pacman.conf.d/qubes-x86_64.conf",
                executor.plugins_dir().display()
            );
            if let Some(version) = use_qubes_repo.get("version").map(value_string) {
                pacman_cmd.push_str(&format!(" --use-qubes-repo-version {version}"));
                if use_qubes_repo
                    .get("testing")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    pacman_cmd.push_str(" --use-qubes-repo-testing");
                }
            }
            cmd.push(pacman_cmd);

            let chroot_dir = config.artifacts().chroot_cache_dir(&dist.name);
            let chroot_archive = chroot_dir.join("root.tar.gz");
            if chroot_archive.exists() {
                info!("{component}:{dist}: Chroot cache exists. Will use it.");
                copy_in.push((chroot_archive.clone(), executor.cache_dir()));
                cmd.push(format!(
                    "sudo mkdir -p {}/qubes-x86_64",
                    executor.cache_dir().display()
                ));
                cmd.push(format!("cd {}/qubes-x86_64", executor.cache_dir().display()));
                cmd.push(format!(
                    "sudo tar xf {}",
                    executor.cache_dir().join("root.tar.gz").display()
                ));
                // The keyring never survives the archive round-trip.
                cmd.push("sudo rm -rf /etc/pacman.d/gnupg/private-keys-v1.d".to_string());
                cmd.push("sudo pacman-key --init".to_string());
                cmd.push("sudo pacman-key --populate".to_string());
            } else {
                info!("{component}:{dist}: Chroot cache does not exists. Will create it.");
                cmd.push(format!(
                    "sudo mkarchroot {}/qubes-x86_64/root base-devel",
                    executor.cache_dir().display()
                ));
            }

            cmd.push(format!(
                "{}/build_archlinux/scripts/update-local-repo {} {}",
                executor.plugins_dir().display(),
                executor.repository_dir().display(),
                dist.name
            ));
            cmd.push(format!("cd {}", source_dir.display()));
            cmd.push(format!(
                "sudo makechrootpkg -r {}/qubes-x86_64 -- --syncdeps --noconfirm --skipinteg",
                executor.cache_dir().display()
            ));

            let spec = RunSpec {
                cmd,
                copy_in,
                copy_out,
                env: env.clone(),
                ..Default::default()
            };
            executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
                PluginError::Build(
                    format!("{component}:{dist}:{build}: Failed to build PKGs: {e}."),
                    None,
                )
            })?;

            let packages_list: Vec<String> = source_info
                .packages
                .iter()
                .filter(|pkg| pkgs_dir.join(pkg).exists())
                .cloned()
                .collect();

            let repo_files: Vec<PathBuf> = packages_list
                .iter()
                .map(|pkg| pkgs_dir.join(pkg))
                .collect();
            provision_local_repository(
                &format!("{component}:{dist}:{build}"),
                &repository_dir,
                &format!("{}-{}", component.name, component.version()?),
                &repo_files,
            )?;

            let mut info = artifacts::InfoRecord {
                packages: packages_list,
                source_hash: Some(component.source_hash()?.to_string()),
                ..Default::default()
            };
            info.files = info.packages.iter().map(|p| format!("pkgs/{p}")).collect();
            artifacts::save_info(&artifacts_dir, "build", &build_bn, &info)
                .map_err(|e| PluginError::Build(e.to_string(), None))?;
        }
        Ok(())
    }
}
