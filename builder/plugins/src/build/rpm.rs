//! RPM build: `mock --rebuild` of the prep-stage SRPM against the
//! builder-local repository and the prepared chroot cache, plus
//! `.buildinfo` generation.

use std::path::PathBuf;

use buildconfig::{Component, Config, Distribution, Stage};
use executor::RunSpec;
use regex::Regex;
use serde_yaml::Value;
use tracing::info;

use crate::build::{clean_local_repository, provision_local_repository, value_string};
use crate::source::{dist_stage_dir, log_skip, reset_dir, source_hash_unchanged};
use crate::{
    base_environment, default_copy_in, dist_parameters, extract_lines_before, step_log,
    Dependency, InstanceArgs, Job, JobContext, JobReference, PluginError, PluginFactory,
    RunOptions,
};

pub struct RpmBuildPlugin;

impl PluginFactory for RpmBuildPlugin {
    fn name(&self) -> &'static str {
        "build_rpm"
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
                if !dist.is_rpm() {
                    continue;
                }
                jobs.push(Box::new(RpmBuildJob {
                    config: args.config,
                    component,
                    dist,
                }));
            }
        }
        Ok(jobs)
    }
}

pub struct RpmBuildJob<'a> {
    config: &'a Config,
    component: &'a Component,
    dist: &'a Distribution,
}

impl Job for RpmBuildJob<'_> {
    fn name(&self) -> String {
        format!("build:{}:{}", self.component.name, self.dist.distribution())
    }

    fn reference(&self) -> JobReference {
        JobReference::dist_component(Stage::Build, self.component, self.dist)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        let mut deps = vec![
            Dependency::Plugin("chroot_rpm".to_string()),
            Dependency::Plugin("build".to_string()),
        ];
        deps.push(Dependency::Job(JobReference::dist_component(
            Stage::Prep,
            self.component,
            self.dist,
        )));
        deps
    }

    fn run(&mut self, ctx: &JobContext, _options: &RunOptions) -> Result<(), PluginError> {
        let (config, component, dist) = (self.config, self.component, self.dist);
        let mut executor = config.executor_for("build", Some(dist), Some(component))?;

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
        std::fs::create_dir_all(artifacts_dir.join("rpm"))
            .map_err(|e| PluginError::Build(e.to_string(), None))?;
        let prep_artifacts_dir = dist_stage_dir(config, component, dist, "prep")?;

        let repository_dir = config.artifacts().repository_dir(dist.distribution());
        clean_local_repository(
            &repository_dir,
            component,
            dist,
            &format!("{}_", component.name),
        )?;

        let use_qubes_repo = config.use_qubes_repo();
        let mut env = base_environment(config);
        env.insert("DIST".to_string(), dist.name.clone());
        let legacy_package_set = use_qubes_repo
            .get("version")
            .map(value_string)
            .as_deref()
            == Some("4.1");
        env.insert(
            "PACKAGE_SET".to_string(),
            if legacy_package_set {
                dist.package_set.to_string().replace("host", "dom0")
            } else {
                dist.package_set.to_string()
            },
        );
        if let Some(version) = use_qubes_repo.get("version") {
            env.insert("USE_QUBES_REPO_VERSION".to_string(), value_string(version));
            let testing = use_qubes_repo
                .get("testing")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            env.insert(
                "USE_QUBES_REPO_TESTING".to_string(),
                if testing { "1" } else { "0" }.to_string(),
            );
        }

        for build in &params.build {
            let build_bn = artifacts::mangle_path(build);

            let source_info = artifacts::read_info(&prep_artifacts_dir, "prep", &build_bn)
                .map_err(|e| PluginError::Build(e.to_string(), None))?;
            let Some(srpm) = source_info.srpm.clone() else {
                return Err(PluginError::Build(
                    format!("Cannot find SRPM for '{build}'. Missing 'prep' stage call?"),
                    None,
                ));
            };
            let buildinfo_file =
                srpm.replace(".src.rpm", &format!(".{}.buildinfo", dist.architecture));

            let mut copy_in: Vec<_> = default_copy_in(
                executor.as_ref(),
                ctx.manager,
                config,
                "build_rpm",
                &self.dependencies(),
            );
            copy_in.push((repository_dir.clone(), executor.repository_dir()));
            copy_in.push((prep_artifacts_dir.join(&srpm), executor.build_dir()));

            let mut copy_out: Vec<_> = source_info
                .rpms
                .iter()
                .map(|rpm| {
                    (
                        executor.build_dir().join("rpm").join(rpm),
                        artifacts_dir.join("rpm"),
                    )
                })
                .collect();
            copy_out.push((
                executor.build_dir().join(&buildinfo_file),
                artifacts_dir.join("rpm"),
            ));

            // Createrepo the local builder repository and make the build
            // directory reachable by the mock group.
            let mut cmd = vec![
                format!("cd {}", executor.repository_dir().display()),
                "createrepo_c .".to_string(),
                format!(
                    "sudo chown -R {}:mock {}",
                    executor.user(),
                    executor.build_dir().display()
                ),
            ];

            let mock_conf = format!(
                "{}-{}-{}.cfg",
                dist.fullname, dist.version, dist.architecture
            );
            let chroot_cache_topdir = config
                .artifacts()
                .chroot_cache_dir(&dist.name)
                .join("mock");
            let chroot_cache = chroot_cache_topdir.join(mock_conf.trim_end_matches(".cfg"));
            if chroot_cache.exists() {
                copy_in.push((chroot_cache_topdir.clone(), executor.cache_dir()));
                cmd.push(format!(
                    "sudo chown -R root:mock {}",
                    executor.cache_dir().join("mock").display()
                ));
            }

            let mut dist_tag = if config.increment_devel_versions() {
                format!("{}.{}", component.devel()?, dist.tag)
            } else {
                dist.tag.clone()
            };
            // The SRPM name is authoritative when mock already embedded a
            // different tag, e.g. 'fc32.qubes'.
            let dist_tag_re =
                Regex::new(&format!(r"^.*\.({}.*)\.src\.rpm$", regex::escape(&dist.tag)))
                    .map_err(|e| PluginError::Build(e.to_string(), None))?;
            if let Some(captures) = dist_tag_re.captures(&srpm) {
                if captures[1] != dist_tag {
                    dist_tag = captures[1].to_string();
                }
            }

            // On Fedora /usr/bin/mock is a consolehelper wrapper which
            // strips environment variables.
            let mut mock_cmd = vec![
                "sudo --preserve-env=DIST,PACKAGE_SET,USE_QUBES_REPO_VERSION".to_string(),
                "/usr/libexec/mock/mock --no-cleanup-after --verbose".to_string(),
                format!("--rebuild {}", executor.build_dir().join(&srpm).display()),
                format!(
                    "--root {}/chroot_rpm/mock/{mock_conf}",
                    executor.plugins_dir().display()
                ),
                format!("--resultdir={}", executor.build_dir().display()),
            ];
            if executor.description().starts_with("qubes") {
                mock_cmd.push("--isolation=nspawn".to_string());
            } else {
                info!(
                    "{component}:{dist}:{build}: Mock isolation set to 'simple', build has \
                     full network access. Use 'qubes' executor for network-isolated build."
                );
                mock_cmd.push("--isolation=simple".to_string());
            }
            if use_qubes_repo.get("version").is_some() {
                mock_cmd.push("--enablerepo=qubes-current".to_string());
                if use_qubes_repo
                    .get("testing")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    mock_cmd.push("--enablerepo=qubes-current-testing".to_string());
                }
            }
            if chroot_cache.exists() {
                mock_cmd.push("--plugin-option=root_cache:age_check=False".to_string());
                mock_cmd.push("--no-clean".to_string());
            }
            if config.increment_devel_versions() {
                mock_cmd.push(format!("--define 'dist .{dist_tag}'"));
            }

            env.insert("BIND_MOUNT_ENABLE".to_string(), "True".to_string());
            let buildinfo_cmd = vec![
                "sudo --preserve-env=DIST,PACKAGE_SET,USE_QUBES_REPO_VERSION,BIND_MOUNT_ENABLE"
                    .to_string(),
                "/usr/libexec/mock/mock".to_string(),
                format!(
                    "--root {}/chroot_rpm/mock/{mock_conf}",
                    executor.plugins_dir().display()
                ),
                format!(
                    "--chroot /plugins/build_rpm/scripts/rpmbuildinfo \
                     /builddir/build/SRPMS/{srpm} > {}",
                    executor.build_dir().join(&buildinfo_file).display()
                ),
            ];
            cmd.push(mock_cmd.join(" "));
            cmd.push(buildinfo_cmd.join(" "));
            // Keep only packages matching the distribution tag and
            // architecture, moved into a separate rpm/ directory.
            cmd.push(format!(
                "{0}/build_rpm/scripts/filter-packages-by-dist-arch {1} {1}/rpm {dist_tag} {2}",
                executor.plugins_dir().display(),
                executor.build_dir().display(),
                dist.architecture
            ));

            let spec = RunSpec {
                cmd,
                copy_in,
                copy_out,
                env: env.clone(),
                files_with_placeholders: vec![PathBuf::from(format!(
                    "@PLUGINS_DIR@/chroot_rpm/mock/{mock_conf}"
                ))],
                no_fail_copy_out_allowed_patterns: vec![
                    "-debugsource".to_string(),
                    "-debuginfo".to_string(),
                ],
                ..Default::default()
            };
            let result = executor.run(&spec, &mut |line| log.line(line));
            if let Err(e) = result {
                let additional =
                    extract_lines_before(log.path(), "EXCEPTION:.*/usr/bin/rpmbuild -bb");
                return Err(PluginError::Build(
                    format!("{component}:{dist}:{build}: Failed to build RPMs: {e}."),
                    additional.map(Box::new),
                ));
            }

            // The SRPM travels along with the binary RPMs.
            fileutil::force_hardlink(
                &prep_artifacts_dir.join(&srpm),
                &artifacts_dir.join("rpm").join(&srpm),
            )
            .map_err(|e| PluginError::Build(e.to_string(), None))?;

            // Keep the actually built subset of the predicted package list;
            // debuginfo may legitimately be missing.
            let packages_list: Vec<String> = source_info
                .rpms
                .iter()
                .filter(|rpm| artifacts_dir.join("rpm").join(rpm).exists())
                .cloned()
                .collect();

            let mut info = artifacts::InfoRecord {
                srpm: Some(srpm.clone()),
                rpms: packages_list.clone(),
                buildinfo: Some(buildinfo_file.clone()),
                source_hash: Some(component.source_hash()?.to_string()),
                ..Default::default()
            };
            info.files = source_info
                .rpms
                .iter()
                .chain([&buildinfo_file, &srpm])
                .map(|f| format!("rpm/{f}"))
                .collect();

            let mut repo_files: Vec<PathBuf> = vec![prep_artifacts_dir.join(&srpm)];
            repo_files.extend(
                packages_list
                    .iter()
                    .map(|rpm| artifacts_dir.join("rpm").join(rpm)),
            );
            repo_files.push(artifacts_dir.join("rpm").join(&buildinfo_file));
            provision_local_repository(
                &format!("{component}:{dist}:{build}"),
                &repository_dir,
                &format!("{}_{}", component.name, component.version()?),
                &repo_files,
            )?;

            artifacts::save_info(&artifacts_dir, "build", &build_bn, &info)
                .map_err(|e| PluginError::Build(e.to_string(), None))?;
        }
        Ok(())
    }
}
