//! Installer ISO: lorax/mkisofs inside a mock chroot, fed by the kickstart
//! from the `iso` configuration section, then detached ISO signature and
//! mirror upload.

use std::path::PathBuf;

use buildconfig::{Config, Distribution, Stage};
use executor::RunSpec;
use serde_yaml::Value;
use tracing::info;

use crate::{
    base_environment, default_copy_in, step_log, Dependency, InstanceArgs, Job, JobContext,
    JobReference, PluginError, PluginFactory, RunOptions,
};

pub struct InstallerPlugin;

impl PluginFactory for InstallerPlugin {
    fn name(&self) -> &'static str {
        "installer"
    }

    fn stages(&self) -> &'static [Stage] {
        &[
            Stage::InitCache,
            Stage::Prep,
            Stage::Build,
            Stage::Sign,
            Stage::Upload,
        ]
    }

    fn instances<'a>(
        &self,
        _args: &InstanceArgs<'a>,
    ) -> Result<Vec<Box<dyn Job + 'a>>, PluginError> {
        // Installer jobs are only scheduled through the `installer` CLI
        // group, never as part of a package run.
        Ok(Vec::new())
    }
}

/// Emits the installer jobs for the `installer` CLI group.
pub fn installer_jobs<'a>(
    config: &'a Config,
    stage: Stage,
) -> Result<Vec<Box<dyn Job + 'a>>, PluginError> {
    let mut jobs: Vec<Box<dyn Job>> = Vec::new();
    for dist in config.distributions() {
        if !dist.is_rpm() || dist.package_set != buildconfig::PackageSet::Host {
            continue;
        }
        jobs.push(Box::new(InstallerJob {
            config,
            dist,
            stage,
        }));
    }
    Ok(jobs)
}

pub struct InstallerJob<'a> {
    config: &'a Config,
    dist: &'a Distribution,
    stage: Stage,
}

impl InstallerJob<'_> {
    fn iso_name(&self) -> String {
        let version = self.iso_version();
        match self
            .config
            .iso_option("flavor")
            .as_ref()
            .and_then(Value::as_str)
        {
            Some(flavor) => format!("Qubes-{version}-{flavor}-{}", self.dist.architecture),
            None => format!("Qubes-{version}-{}", self.dist.architecture),
        }
    }

    fn iso_version(&self) -> String {
        match self.config.iso_option("version").as_ref().and_then(Value::as_str) {
            Some(version) => version.to_string(),
            None => chrono::Utc::now().format("%Y%m%d").to_string(),
        }
    }

    fn kickstart(&self) -> String {
        self.config
            .iso_option("kickstart")
            .as_ref()
            .and_then(Value::as_str)
            .unwrap_or("conf/qubes-kickstart.cfg")
            .to_string()
    }

    fn mock_conf(&self) -> String {
        format!(
            "{}-{}-{}.cfg",
            self.dist.fullname, self.dist.version, self.dist.architecture
        )
    }

    fn environment(&self) -> std::collections::BTreeMap<String, String> {
        let mut env = base_environment(self.config);
        env.insert("DIST".to_string(), self.dist.name.clone());
        env.insert("INSTALLER_KICKSTART".to_string(), self.kickstart());
        env.insert("COMPS_FILE".to_string(),
            self.config
                .iso_option("comps")
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or("meta-packages/comps/comps-dom0.xml")
                .to_string());
        env.insert("ISO_VERSION".to_string(), self.iso_version());
        env.insert("ISO_NAME".to_string(), self.iso_name());
        if self
            .config
            .iso_option("use-kernel-latest")
            .as_ref()
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            env.insert("ISO_USE_KERNEL_LATEST".to_string(), "1".to_string());
        }
        if self
            .config
            .iso_option("is-final")
            .as_ref()
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            env.insert("ISO_IS_FINAL".to_string(), "1".to_string());
        }
        env
    }

    fn mock_isolation(&self, executor: &dyn executor::Executor) -> &'static str {
        if executor.description().starts_with("qubes") {
            "--isolation=nspawn"
        } else {
            "--isolation=simple"
        }
    }
}

impl Job for InstallerJob<'_> {
    fn name(&self) -> String {
        format!("installer:{}:{}", self.stage, self.dist.distribution())
    }

    fn reference(&self) -> JobReference {
        JobReference {
            stage: self.stage,
            component: None,
            dist: Some(self.dist.distribution().to_string()),
            template: None,
            build: None,
        }
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::Plugin("installer".to_string())]
    }

    fn run(&mut self, ctx: &JobContext, _options: &RunOptions) -> Result<(), PluginError> {
        let (config, dist) = (self.config, self.dist);
        let mut executor = config.executor_for(&self.stage.to_string(), Some(dist), None)?;
        let mut log = step_log(
            config,
            &format!("installer-{}-{}", self.stage, dist.distribution()),
        )?;
        info!("Log file: {}", log.path().display());

        let mock_conf = self.mock_conf();
        let mock_chroot_name = mock_conf.trim_end_matches(".cfg").to_string();
        let cache_dir = config.artifacts().installer_dir().join("cache");
        let chroot_cache = cache_dir.join("chroot/mock").join(&mock_chroot_name);
        let iso_dir = config.artifacts().iso_dir();
        let iso = iso_dir.join(format!("{}.iso", self.iso_name()));
        let env = self.environment();

        match self.stage {
            Stage::InitCache => {
                fileutil::remove_path(&chroot_cache)
                    .map_err(|e| PluginError::Installer(e.to_string()))?;
                std::fs::create_dir_all(chroot_cache.parent().unwrap())
                    .map_err(|e| PluginError::Installer(e.to_string()))?;

                let mock_cmd = format!(
                    "sudo --preserve-env=DIST /usr/libexec/mock/mock \
                     --root {}/installer/mock/{mock_conf} --init {}",
                    executor.plugins_dir().display(),
                    self.mock_isolation(executor.as_ref())
                );
                let spec = RunSpec {
                    cmd: vec![mock_cmd],
                    copy_in: default_copy_in(
                        executor.as_ref(),
                        ctx.manager,
                        config,
                        "installer",
                        &self.dependencies(),
                    ),
                    copy_out: vec![(
                        executor.cache_dir().join(format!("mock/{mock_chroot_name}")),
                        cache_dir.join("chroot/mock"),
                    )],
                    env,
                    files_with_placeholders: vec![PathBuf::from(format!(
                        "@PLUGINS_DIR@/installer/mock/{mock_conf}"
                    ))],
                    ..Default::default()
                };
                executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
                    PluginError::Installer(format!("{dist}: Failed to generate chroot: {e}."))
                })
            }
            Stage::Prep => {
                std::fs::create_dir_all(&cache_dir)
                    .map_err(|e| PluginError::Installer(e.to_string()))?;
                let mut copy_in = default_copy_in(
                    executor.as_ref(),
                    ctx.manager,
                    config,
                    "installer",
                    &self.dependencies(),
                );
                let mut cmd = Vec::new();
                if chroot_cache.exists() {
                    copy_in.push((chroot_cache.parent().unwrap().to_path_buf(), executor.cache_dir()));
                    cmd.push(format!(
                        "sudo chown -R root:mock {}",
                        executor.cache_dir().join("mock").display()
                    ));
                }
                cmd.push(format!(
                    "sudo --preserve-env=DIST,INSTALLER_KICKSTART,COMPS_FILE,ISO_VERSION,ISO_NAME \
                     /usr/libexec/mock/mock --root {}/installer/mock/{mock_conf} {} \
                     --chroot 'make -C {}/installer iso-prepare iso-parse-kickstart iso-parse-tmpl'",
                    executor.plugins_dir().display(),
                    self.mock_isolation(executor.as_ref()),
                    executor.plugins_dir().display()
                ));
                cmd.push(format!(
                    "make -C {}/installer iso-prepare iso-packages-anaconda iso-packages-lorax",
                    executor.plugins_dir().display()
                ));
                let spec = RunSpec {
                    cmd,
                    copy_in,
                    copy_out: vec![(
                        executor.plugins_dir().join("installer/work"),
                        cache_dir.join(self.iso_name()),
                    )],
                    env,
                    files_with_placeholders: vec![PathBuf::from(format!(
                        "@PLUGINS_DIR@/installer/mock/{mock_conf}"
                    ))],
                    ..Default::default()
                };
                executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
                    PluginError::Installer(format!("{dist}: Failed to prepare ISO: {e}."))
                })
            }
            Stage::Build => {
                std::fs::create_dir_all(&iso_dir)
                    .map_err(|e| PluginError::Installer(e.to_string()))?;
                let repository_dir = config.artifacts().repository_dir(dist.distribution());

                let mut copy_in = default_copy_in(
                    executor.as_ref(),
                    ctx.manager,
                    config,
                    "installer",
                    &self.dependencies(),
                );
                let work_dir = cache_dir.join(self.iso_name()).join("work");
                if work_dir.exists() {
                    copy_in.push((work_dir, executor.plugins_dir().join("installer")));
                }
                if repository_dir.exists() {
                    copy_in.push((repository_dir, executor.repository_dir()));
                }
                let mut cmd = Vec::new();
                if chroot_cache.exists() {
                    copy_in.push((chroot_cache.parent().unwrap().to_path_buf(), executor.cache_dir()));
                    cmd.push(format!(
                        "sudo chown -R root:mock {}",
                        executor.cache_dir().join("mock").display()
                    ));
                }
                cmd.push(format!("mkdir -p {}", executor.repository_dir().display()));
                cmd.push(format!("cd {}", executor.repository_dir().display()));
                cmd.push("createrepo_c .".to_string());
                cmd.push(format!(
                    "sudo --preserve-env=DIST,INSTALLER_KICKSTART,COMPS_FILE,ISO_VERSION,ISO_NAME \
                     /usr/libexec/mock/mock --root {}/installer/mock/{mock_conf} \
                     --disablerepo='*' {} \
                     --chroot 'make -C {}/installer iso-prepare iso-parse-kickstart \
                     iso-installer-lorax iso-installer-mkisofs'",
                    executor.plugins_dir().display(),
                    self.mock_isolation(executor.as_ref()),
                    executor.plugins_dir().display()
                ));

                let spec = RunSpec {
                    cmd,
                    copy_in,
                    copy_out: vec![(
                        executor.plugins_dir().join(format!(
                            "installer/work/{}/{}/iso/{}.iso",
                            self.iso_version(),
                            dist.architecture,
                            self.iso_name()
                        )),
                        iso_dir.clone(),
                    )],
                    env,
                    files_with_placeholders: vec![PathBuf::from(format!(
                        "@PLUGINS_DIR@/installer/mock/{mock_conf}"
                    ))],
                    dig_holes: true,
                    ..Default::default()
                };
                executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
                    PluginError::Installer(format!("{dist}: Failed to create ISO: {e}."))
                })?;

                let info = artifacts::InfoRecord {
                    iso: Some(format!("{}.iso", self.iso_name())),
                    kickstart: Some(self.kickstart()),
                    timestamp: Some(chrono::Utc::now().format("%Y%m%d%H%M").to_string()),
                    ..Default::default()
                };
                artifacts::save_info(
                    &config.artifacts().installer_dir(),
                    "build",
                    &self.iso_name(),
                    &info,
                )
                .map_err(|e| PluginError::Installer(e.to_string()))
            }
            Stage::Sign => {
                if !iso.exists() {
                    return Err(PluginError::Installer(format!(
                        "{}: Cannot find ISO '{}'.",
                        self.iso_name(),
                        iso.display()
                    )));
                }
                let Some(sign_key) = config
                    .get("sign-key")
                    .and_then(Value::as_mapping)
                    .and_then(|m| m.get("iso"))
                    .and_then(Value::as_str)
                else {
                    info!("{dist}: No signing key found.");
                    return Ok(());
                };
                info!("{}: Signing '{}.iso'.", self.iso_name(), self.iso_name());
                let spec = RunSpec {
                    cmd: vec![format!(
                        "{}/installer/scripts/release-iso {} {} {sign_key}",
                        executor.plugins_dir().display(),
                        iso.display(),
                        config.gpg_client()
                    )],
                    ..Default::default()
                };
                executor.run(&spec, &mut |line| log.line(line)).map_err(|_| {
                    PluginError::Installer(format!(
                        "{}: Failed to sign ISO '{}'.",
                        self.iso_name(),
                        iso.display()
                    ))
                })
            }
            Stage::Upload => {
                if !iso.exists() {
                    return Err(PluginError::Installer(format!(
                        "{}: Cannot find ISO '{}'.",
                        self.iso_name(),
                        iso.display()
                    )));
                }
                let Some(remote_path) =
                    config.repository_upload_remote_host(buildconfig::Family::Rpm)
                else {
                    info!("{dist}: No remote location defined. Skipping.");
                    return Ok(());
                };
                let spec = RunSpec {
                    cmd: vec![format!(
                        "rsync --partial --progress --hard-links -air --mkpath -- \
                         {}/ {remote_path}/iso/",
                        iso_dir.display()
                    )],
                    ..Default::default()
                };
                executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
                    PluginError::Installer(format!(
                        "{dist}: Failed to upload to remote host: {e}"
                    ))
                })
            }
            _ => Ok(()),
        }
    }
}
