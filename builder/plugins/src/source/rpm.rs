//! RPM prep: enumerate the SRPM and expected binary RPM names from the
//! spec, rewrite module sources, and produce the SRPM with
//! `mock --buildsrpm`.

use buildconfig::{is_filename_valid, Component, Config, Distribution, Stage};
use executor::RunSpec;
use tracing::info;

use crate::source::{
    dist_stage_dir, fetch_info, log_skip, read_lines, reset_dir, source_hash_unchanged,
};
use crate::{
    base_environment, default_copy_in, dist_parameters, files_from, source_parameters,
    step_log, Dependency, InstanceArgs, Job, JobContext, JobReference, PluginError,
    PluginFactory, RunOptions,
};

pub struct RpmSourcePlugin;

impl PluginFactory for RpmSourcePlugin {
    fn name(&self) -> &'static str {
        "source_rpm"
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
                if !dist.is_rpm() {
                    continue;
                }
                jobs.push(Box::new(RpmSourceJob {
                    config: args.config,
                    component,
                    dist,
                }));
            }
        }
        Ok(jobs)
    }
}

pub struct RpmSourceJob<'a> {
    config: &'a Config,
    component: &'a Component,
    dist: &'a Distribution,
}

impl Job for RpmSourceJob<'_> {
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
        let distfiles_dir = config.artifacts().component_distfiles_dir(&component.name);
        let fetch_record = fetch_info(config, component)?;
        let source_params = source_parameters(executor.as_ref(), component, Some(dist), config)?;
        let source_dir = executor.builder_dir().join(&component.name);

        let mut env = base_environment(config);
        // Needed to render the mock root configuration. "host" is aliased
        // as "dom0" for legacy component content.
        env.insert("DIST".to_string(), dist.name.clone());
        env.insert(
            "PACKAGE_SET".to_string(),
            dist.package_set.to_string().replace("host", "dom0"),
        );

        for build in &params.build {
            let build_bn = artifacts::mangle_path(build);

            // Enumerate %{name}-%{version}-%{release} and %Source0.
            let copy_in: Vec<_> = vec![(component.source_dir.clone(), executor.builder_dir())]
                .into_iter()
                .chain(default_copy_in(
                    executor.as_ref(),
                    ctx.manager,
                    config,
                    "source_rpm",
                    &self.dependencies(),
                ))
                .collect();
            let spec = RunSpec {
                cmd: vec![format!(
                    "{}/source_rpm/scripts/get-source-info {} {} {}",
                    executor.plugins_dir().display(),
                    source_dir.display(),
                    source_dir.join(build).display(),
                    dist.tag
                )],
                copy_in: copy_in.clone(),
                copy_out: vec![
                    (
                        source_dir.join(format!("{build_bn}_package_release_name")),
                        artifacts_dir.clone(),
                    ),
                    (
                        source_dir.join(format!("{build_bn}_packages.list")),
                        artifacts_dir.clone(),
                    ),
                ],
                env: env.clone(),
                ..Default::default()
            };
            executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
                PluginError::Source(format!(
                    "{component}:{dist}:{build}: Failed to get source information: {e}."
                ))
            })?;

            let release_data =
                read_lines(&artifacts_dir.join(format!("{build_bn}_package_release_name")))?;
            if release_data.len() < 2 {
                return Err(PluginError::Source(format!(
                    "{component}:{dist}:{build}: Invalid data."
                )));
            }
            let source_rpm = format!("{}.src.rpm", release_data[0]);
            // %Source0 may be a URL.
            let source_orig = release_data[1]
                .rsplit('/')
                .next()
                .unwrap_or(&release_data[1])
                .to_string();
            if !is_filename_valid(&source_rpm, None) || !is_filename_valid(&source_orig, None) {
                return Err(PluginError::Source(format!(
                    "{component}:{dist}:{build}: Invalid source names."
                )));
            }

            let mut packages_list = Vec::new();
            for line in read_lines(&artifacts_dir.join(format!("{build_bn}_packages.list")))? {
                if !is_filename_valid(&line, None) {
                    return Err(PluginError::Source(format!(
                        "{component}:{dist}:{build}: Invalid package name."
                    )));
                }
                packages_list.push(line);
            }

            // Create the source RPM.
            let mut cmd = Vec::new();
            let files = files_from(&source_params);
            if files.is_empty() {
                // Without a Source0 override, 'source' comes from the spec
                // query and means "archive the working tree".
                if source_orig != "source" {
                    cmd.push(format!(
                        "{}/fetch/scripts/create-archive {} {source_orig}",
                        executor.plugins_dir().display(),
                        source_dir.display()
                    ));
                }
            } else {
                for file in &files {
                    let (_, distfile_name) = file.distfile_names();
                    cmd.push(format!(
                        "mv {}/{}/{distfile_name} {}",
                        executor.distfiles_dir().display(),
                        component.name,
                        source_dir.display()
                    ));
                    if let Some(signature) = &file.signature {
                        let signature_name = signature.rsplit('/').next().unwrap_or(signature);
                        cmd.push(format!(
                            "mv {}/{}/{signature_name} {}",
                            executor.distfiles_dir().display(),
                            component.name,
                            source_dir.display()
                        ));
                    }
                }
            }

            for module in &fetch_record.modules {
                let Some(archive) = &module.archive else { continue };
                cmd.push(format!(
                    "mv {}/{}/{archive} {}",
                    executor.distfiles_dir().display(),
                    component.name,
                    source_dir.display()
                ));
                cmd.push(format!(
                    "sed -i 's/@{}@/{archive}/g' {}.in",
                    module.name,
                    source_dir.join(build).display()
                ));
            }

            // The spec mock consumes is generated from its .in next to it.
            cmd.push(format!(
                "{}/source_rpm/scripts/generate-spec {} {}.in {}",
                executor.plugins_dir().display(),
                source_dir.display(),
                source_dir.join(build).display(),
                source_dir.join(build).display()
            ));
            cmd.push(format!("mkdir -p {}", executor.build_dir().display()));
            cmd.push(format!(
                "sudo chown -R {}:mock {}",
                executor.user(),
                executor.build_dir().display()
            ));

            let mock_conf = format!(
                "{}-{}-{}.cfg",
                dist.fullname, dist.version, dist.architecture
            );
            let mut mock_cmd = vec![
                "sudo --preserve-env=DIST,PACKAGE_SET,USE_QUBES_REPO_VERSION".to_string(),
                "/usr/libexec/mock/mock".to_string(),
                "--buildsrpm".to_string(),
                format!("--spec {}", source_dir.join(build).display()),
                format!(
                    "--root {}/source_rpm/mock/{mock_conf}",
                    executor.plugins_dir().display()
                ),
                format!("--sources={}", source_dir.display()),
                format!("--resultdir={}", executor.build_dir().display()),
                "--disablerepo=builder-local".to_string(),
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
            if config.verbose() {
                mock_cmd.push("--verbose".to_string());
            }
            cmd.push(mock_cmd.join(" "));

            let copy_in: Vec<_> = vec![
                (distfiles_dir.clone(), executor.distfiles_dir()),
                (component.source_dir.clone(), executor.builder_dir()),
            ]
            .into_iter()
            .chain(default_copy_in(
                executor.as_ref(),
                ctx.manager,
                config,
                "source_rpm",
                &self.dependencies(),
            ))
            .collect();
            let spec = RunSpec {
                cmd,
                copy_in,
                copy_out: vec![(executor.build_dir().join(&source_rpm), artifacts_dir.clone())],
                env: env.clone(),
                ..Default::default()
            };
            executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
                PluginError::Source(format!(
                    "{component}:{dist}:{build}: Failed to generate SRPM: {e}."
                ))
            })?;

            let mut info = fetch_record.clone();
            info.srpm = Some(source_rpm);
            info.rpms = packages_list;
            info.source_hash = Some(component.source_hash()?.to_string());
            artifacts::save_info(&artifacts_dir, "prep", &build_bn, &info)
                .map_err(|e| PluginError::Source(e.to_string()))?;

            for stray in [
                format!("{build_bn}_package_release_name"),
                format!("{build_bn}_packages.list"),
            ] {
                std::fs::remove_file(artifacts_dir.join(&stray)).map_err(|e| {
                    PluginError::Source(format!(
                        "{component}:{dist}:{build}: Failed to clean artifacts: {e}."
                    ))
                })?;
            }
        }
        Ok(())
    }
}
