//! Debian prep: update the changelog for the target distribution, create
//! the `.orig.tar.*`, and emit `.dsc` plus `.debian.tar.xz` through
//! `dpkg-source -b`.

use buildconfig::{is_filename_valid, Component, Config, Distribution, Stage};
use executor::RunSpec;
use fileutil::SafeTempDir;
use tracing::info;

use crate::source::{
    dist_stage_dir, fetch_info, log_skip, read_lines, reset_dir, source_hash_unchanged,
};
use crate::{
    base_environment, commands_from, default_copy_in, dist_parameters, extract_lines_before,
    files_from, source_parameters, step_log, Dependency, InstanceArgs, Job, JobContext,
    JobReference, PluginError, PluginFactory, RunOptions,
};

pub struct DebSourcePlugin;

impl PluginFactory for DebSourcePlugin {
    fn name(&self) -> &'static str {
        "source_deb"
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
                if !dist.is_deb() && !dist.is_ubuntu() {
                    continue;
                }
                jobs.push(Box::new(DebSourceJob {
                    config: args.config,
                    component,
                    dist,
                }));
            }
        }
        Ok(jobs)
    }
}

pub struct DebSourceJob<'a> {
    config: &'a Config,
    component: &'a Component,
    dist: &'a Distribution,
}

impl Job for DebSourceJob<'_> {
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
            info!("{component}: nothing to be done for {dist}");
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
        let devel = component.devel()?.to_string();

        let mut env = base_environment(config);
        env.insert("DIST".to_string(), dist.name.clone());
        env.insert("LC_ALL".to_string(), "C".to_string());
        env.insert("DEBFULLNAME".to_string(), "Builder".to_string());
        env.insert("DEBEMAIL".to_string(), "user@localhost".to_string());

        for directory in &params.build {
            let directory_bn = artifacts::mangle_path(directory);
            let temp_dir = SafeTempDir::new().map_err(|e| PluginError::Source(e.to_string()))?;
            let info_filename = artifacts::info_filename("prep", &directory_bn);

            let changelog_cmd = format!(
                "{}/source_deb/scripts/modify-changelog-for-build {} {directory} {} {} {devel}",
                executor.plugins_dir().display(),
                source_dir.display(),
                dist.name,
                dist.tag
            );

            // Package release name and source format.
            let copy_in: Vec<_> = vec![(component.source_dir.clone(), executor.builder_dir())]
                .into_iter()
                .chain(default_copy_in(
                    executor.as_ref(),
                    ctx.manager,
                    config,
                    "source_deb",
                    &self.dependencies(),
                ))
                .collect();
            let spec = RunSpec {
                cmd: vec![
                    changelog_cmd.clone(),
                    format!(
                        "{}/source_deb/scripts/get-source-info {} {directory}",
                        executor.plugins_dir().display(),
                        source_dir.display()
                    ),
                ],
                copy_in: copy_in.clone(),
                copy_out: vec![(
                    source_dir.join(format!("{directory_bn}_package_release_name")),
                    temp_dir.path().to_path_buf(),
                )],
                env: env.clone(),
                ..Default::default()
            };
            executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
                PluginError::Source(format!(
                    "{component}:{dist}:{directory}: Failed to get source information: {e}."
                ))
            })?;

            let data = read_lines(
                &temp_dir
                    .path()
                    .join(format!("{directory_bn}_package_release_name")),
            )?;
            if data.len() != 3 {
                return Err(PluginError::Source(format!(
                    "{component}:{dist}:{directory}: Invalid data."
                )));
            }
            let package_release_name = data[0].clone();
            let package_release_name_full = data[1].clone();
            let package_type = data[2].clone();
            if !is_filename_valid(&package_release_name, Some(&info_filename))
                || !is_filename_valid(&package_release_name_full, Some(&info_filename))
            {
                return Err(PluginError::Source(format!(
                    "{component}:{dist}:{directory}: Invalid source names."
                )));
            }
            if package_type != "native" && package_type != "quilt" {
                return Err(PluginError::Source(format!(
                    "{component}:{dist}:{directory}: Invalid source type."
                )));
            }

            let source_dsc = format!("{package_release_name_full}.dsc");
            let source_debian = if package_type == "native" {
                format!("{package_release_name_full}.tar.xz")
            } else {
                format!("{package_release_name_full}.debian.tar.xz")
            };
            let files = files_from(&source_params);
            let ext = if let Some(first) = files.first() {
                let (_, name) = first.distfile_names();
                let ext = name.rsplit('.').next().map(|e| format!(".{e}")).unwrap_or_default();
                if !matches!(ext.as_str(), ".gz" | ".bz2" | ".xz" | ".lzma2") {
                    return Err(PluginError::Source(format!(
                        "{component}:{dist}:{directory}: Invalid extension '{ext}'."
                    )));
                }
                ext
            } else {
                ".gz".to_string()
            };
            let source_orig = format!("{package_release_name}.orig.tar{ext}");

            // Create the Debian source: orig, debian and dsc.
            let mut copy_in: Vec<_> = vec![
                (component.source_dir.clone(), executor.builder_dir()),
                (distfiles_dir.clone(), executor.distfiles_dir()),
            ];
            copy_in.extend(default_copy_in(
                executor.as_ref(),
                ctx.manager,
                config,
                "source_deb",
                &self.dependencies(),
            ));

            let mut copy_out = vec![
                (executor.builder_dir().join(&source_dsc), artifacts_dir.clone()),
                (
                    executor.builder_dir().join(&source_debian),
                    artifacts_dir.clone(),
                ),
                (
                    executor
                        .builder_dir()
                        .join(format!("{directory_bn}_packages.list")),
                    temp_dir.path().to_path_buf(),
                ),
            ];
            if package_type == "quilt" {
                copy_out.push((
                    executor.builder_dir().join(&source_orig),
                    artifacts_dir.clone(),
                ));
            }

            let mut cmd = commands_from(&source_params);
            if package_type == "quilt" {
                let create_archive = source_params
                    .get("create-archive")
                    .and_then(serde_yaml::Value::as_bool)
                    .unwrap_or(files.is_empty());
                if create_archive {
                    cmd.push(format!(
                        "{}/fetch/scripts/create-archive {} {source_orig}",
                        executor.plugins_dir().display(),
                        source_dir.display()
                    ));
                    cmd.push(format!(
                        "mv {}/{source_orig} {}",
                        source_dir.display(),
                        executor.builder_dir().display()
                    ));
                }
                for file in &files {
                    let (_, distfile_name) = file.distfile_names();
                    cmd.push(format!(
                        "mv {}/{}/{distfile_name} {}/{source_orig}",
                        executor.distfiles_dir().display(),
                        component.name,
                        executor.builder_dir().display()
                    ));
                }
            }

            // Changelog again, after create-archive.
            cmd.push(changelog_cmd.clone());

            if package_type == "quilt" {
                cmd.push(format!("mkdir -p {}", executor.build_dir().display()));
                cmd.push(format!("cd {}", executor.build_dir().display()));
                cmd.push(format!("cp -a {} .", source_dir.join(directory).display()));
            } else {
                // The build directory must match the archive prefix, e.g.
                // 'qubes-utils-4.1.16+deb11u1' rather than 'build'.
                let build_dir = executor
                    .builder_dir()
                    .join(package_release_name_full.replace('_', "-"));
                cmd.push(format!("mkdir -p {}", build_dir.display()));
                cmd.push(format!("cd {}", build_dir.display()));
                cmd.push(format!("cp -a {}/* .", source_dir.display()));
            }
            // Asymmetry between dpkg-source extract and build; align
            // permissions the way Dpkg::Source::Functions::fixperms does.
            cmd.push("chmod -R -- u+rwX,g+rX-w,o+rX-w .".to_string());
            cmd.push("chmod +x debian/rules".to_string());
            cmd.push("dpkg-source -b .".to_string());
            cmd.push(format!(
                "{}/source_deb/scripts/debian-get-packages-list {} >{}/{directory_bn}_packages.list",
                executor.plugins_dir().display(),
                executor.builder_dir().join(&source_dsc).display(),
                executor.builder_dir().display()
            ));

            let spec = RunSpec {
                cmd,
                copy_in,
                copy_out,
                env: env.clone(),
                ..Default::default()
            };
            let result = executor.run(&spec, &mut |line| log.line(line));
            if let Err(e) = result {
                let info = extract_lines_before(log.path(), "dpkg-source: error:");
                return Err(PluginError::Build(
                    format!("{component}:{dist}:{directory}: Failed to generate source: {e}"),
                    info.map(Box::new),
                ));
            }

            let mut packages_list = Vec::new();
            for line in read_lines(
                &temp_dir
                    .path()
                    .join(format!("{directory_bn}_packages.list")),
            )? {
                let valid = is_filename_valid(&line, None)
                    && [".deb", ".ddeb", ".udeb"].iter().any(|ext| line.ends_with(ext));
                if !valid {
                    return Err(PluginError::Source(format!(
                        "{component}:{dist}:{directory}: Invalid package name."
                    )));
                }
                packages_list.push(line);
            }

            let mut info = fetch_record.clone();
            info.package_release_name = Some(package_release_name);
            info.package_release_name_full = Some(package_release_name_full);
            info.package_type = Some(package_type.clone());
            info.dsc = Some(source_dsc);
            info.debian = Some(source_debian);
            info.packages = packages_list;
            info.source_hash = Some(component.source_hash()?.to_string());
            if package_type == "quilt" {
                info.orig = Some(source_orig);
            }
            artifacts::save_info(&artifacts_dir, "prep", &directory_bn, &info)
                .map_err(|e| PluginError::Source(e.to_string()))?;
        }
        Ok(())
    }
}
