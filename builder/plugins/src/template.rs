//! Template builder: root image → qubeized image → template RPM, then the
//! usual sign/publish/upload lifecycle against the template repositories.

use std::path::{Path, PathBuf};
use std::time::Duration;

use buildconfig::{Config, Stage, Template};
use executor::{Executor, RunSpec};
use fileutil::SafeTempDir;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::info;

use crate::publish::TEMPLATE_REPOSITORIES;
use crate::{
    base_environment, default_copy_in, step_log, Dependency, InstanceArgs, Job, JobContext,
    JobReference, PluginError, PluginFactory, RunOptions, StepLog,
};

pub const TEMPLATE_VERSION: &str = "4.1.0";

lazy_static! {
    static ref TIMESTAMP_RE: Regex = Regex::new(r"^[0-9]{12}$").unwrap();
}

pub struct TemplateBuilderPlugin;

impl PluginFactory for TemplateBuilderPlugin {
    fn name(&self) -> &'static str {
        "template"
    }

    fn stages(&self) -> &'static [Stage] {
        &[
            Stage::Prep,
            Stage::Build,
            Stage::Sign,
            Stage::Publish,
            Stage::Upload,
        ]
    }

    fn instances<'a>(
        &self,
        args: &InstanceArgs<'a>,
    ) -> Result<Vec<Box<dyn Job + 'a>>, PluginError> {
        Ok(args
            .templates
            .iter()
            .map(|template| {
                Box::new(TemplateJob {
                    config: args.config,
                    template,
                    stage: args.stage,
                }) as Box<dyn Job>
            })
            .collect())
    }
}

pub struct TemplateJob<'a> {
    config: &'a Config,
    template: &'a Template,
    stage: Stage,
}

impl TemplateJob<'_> {
    fn template_rpm_name(&self, timestamp: &str) -> String {
        format!(
            "qubes-template-{}-{TEMPLATE_VERSION}-{timestamp}.noarch.rpm",
            self.template.name
        )
    }

    /// Build timestamp, lazily read back from the stamp file written at
    /// prep/build time.
    fn template_timestamp(&self) -> Result<String, PluginError> {
        if let Some(timestamp) = self.template.timestamp() {
            return Ok(timestamp.to_string());
        }
        let stamp_path = self
            .config
            .artifacts()
            .template_timestamp_path(&self.template.name);
        if !stamp_path.exists() {
            return Err(PluginError::Template(format!(
                "{}: Cannot find build timestamp.",
                self.template
            )));
        }
        let data = std::fs::read_to_string(&stamp_path)
            .map_err(|e| PluginError::Template(e.to_string()))?;
        let line = data.lines().next().unwrap_or_default().trim().to_string();
        if !TIMESTAMP_RE.is_match(&line) {
            return Err(PluginError::Template(format!(
                "{}: Failed to parse build timestamp format.",
                self.template
            )));
        }
        Ok(self.template.set_timestamp(line).to_string())
    }

    fn environment(
        &self,
        executor: &dyn Executor,
    ) -> std::collections::BTreeMap<String, String> {
        let (config, template) = (self.config, self.template);
        let dist = &template.distribution;
        let mut env = base_environment(config);
        env.insert("DIST".to_string(), dist.name.clone());
        env.insert("DIST_CODENAME".to_string(), dist.name.clone());
        env.insert("DIST_NAME".to_string(), dist.fullname.clone());
        env.insert("DIST_VER".to_string(), dist.version.clone());
        env.insert("TEMPLATE_NAME".to_string(), template.name.clone());
        env.insert("TEMPLATE_VERSION".to_string(), TEMPLATE_VERSION.to_string());
        env.insert("TEMPLATE_FLAVOR".to_string(), template.flavor.clone());
        env.insert("TEMPLATE_OPTIONS".to_string(), template.options.join(" "));
        env.insert(
            "INSTALL_DIR".to_string(),
            format!("{}/mnt", executor.builder_dir().display()),
        );
        env.insert(
            "ARTIFACTS_DIR".to_string(),
            executor.build_dir().display().to_string(),
        );
        env.insert(
            "PLUGINS_DIR".to_string(),
            executor.plugins_dir().display().to_string(),
        );
        env.insert(
            "PACKAGES_DIR".to_string(),
            executor.repository_dir().display().to_string(),
        );
        env.insert(
            "CACHE_DIR".to_string(),
            format!("{}/cache_{}", executor.cache_dir().display(), dist.name),
        );
        env.insert("TEMPLATE_ROOT_SIZE".to_string(), config.template_root_size());
        if config.template_root_with_partitions() {
            env.insert("TEMPLATE_ROOT_WITH_PARTITIONS".to_string(), "1".to_string());
        }
        if let Some(version) = config.use_qubes_repo().get("version") {
            env.insert(
                "USE_QUBES_REPO_VERSION".to_string(),
                crate::build::value_string(version),
            );
            let testing = config
                .use_qubes_repo()
                .get("testing")
                .and_then(serde_yaml::Value::as_bool)
                .unwrap_or(false);
            env.insert(
                "USE_QUBES_REPO_TESTING".to_string(),
                if testing { "1" } else { "0" }.to_string(),
            );
        }
        env
    }

    fn require_local(&self, executor: &dyn Executor, stage: Stage) -> Result<(), PluginError> {
        if executor.description() != "local" {
            return Err(PluginError::Template(format!(
                "This plugin only supports local executor for '{stage}' stage."
            )));
        }
        Ok(())
    }

    fn target_dir(&self, repository: &str) -> PathBuf {
        self.config
            .artifacts()
            .repository_publish_dir("rpm")
            .join(self.config.release_name())
            .join(repository)
    }

    fn createrepo_and_sign(
        &self,
        executor: &mut dyn Executor,
        log: &mut StepLog,
        sign_key: &str,
        target_dir: &Path,
    ) -> Result<(), PluginError> {
        let template = self.template;
        info!("{template}: Updating metadata.");
        fileutil::remove_path(&target_dir.join("repodata"))
            .map_err(|e| PluginError::Template(e.to_string()))?;
        let repomd = target_dir.join("repodata/repomd.xml");
        let repomd = repomd.display();
        let spec = RunSpec {
            cmd: vec![
                format!("cd {}", target_dir.display()),
                "createrepo_c .".to_string(),
                format!(
                    "{} --batch --no-tty --yes --detach-sign --armor -u {sign_key} \
                     {repomd} > {repomd}.asc",
                    self.config.gpg_client()
                ),
            ],
            ..Default::default()
        };
        executor
            .run(&spec, &mut |line| log.line(line))
            .map_err(|_| PluginError::Template(format!("{template}: Failed to 'createrepo_c'")))
    }

    fn prep(&self, ctx: &JobContext, options: &RunOptions) -> Result<(), PluginError> {
        let (config, template) = (self.config, self.template);
        let mut executor = config.executor_for("prep", Some(&template.distribution), None)?;
        let mut log = step_log(config, &format!("template-prep-{}", template.name))?;
        info!("Log file: {}", log.path().display());

        let timestamp = match &options.template_timestamp {
            Some(timestamp) if TIMESTAMP_RE.is_match(timestamp) => timestamp.clone(),
            Some(other) => {
                return Err(PluginError::Template(format!(
                    "{template}: Failed to parse build timestamp format '{other}'."
                )))
            }
            None => chrono::Utc::now().format("%Y%m%d%H%M").to_string(),
        };
        let templates_dir = config.artifacts().templates_dir();
        std::fs::create_dir_all(&templates_dir)
            .map_err(|e| PluginError::Template(e.to_string()))?;
        std::fs::write(
            config.artifacts().template_timestamp_path(&template.name),
            &timestamp,
        )
        .map_err(|e| PluginError::Template(e.to_string()))?;
        self.template.set_timestamp(timestamp.clone());

        let qubeized_image = templates_dir.join("qubeized_images").join(&template.name);
        std::fs::create_dir_all(&qubeized_image)
            .map_err(|e| PluginError::Template(e.to_string()))?;
        let repository_dir = config
            .artifacts()
            .repository_dir(template.distribution.distribution());
        std::fs::create_dir_all(&repository_dir)
            .map_err(|e| PluginError::Template(e.to_string()))?;

        let mut env = self.environment(executor.as_ref());
        env.insert("TEMPLATE_TIMESTAMP".to_string(), timestamp);

        let mut copy_in = default_copy_in(
            executor.as_ref(),
            ctx.manager,
            config,
            "template",
            &self.dependencies(),
        );
        copy_in.push((repository_dir, executor.repository_dir()));

        let spec = RunSpec {
            cmd: vec![format!(
                "make -C {}/template prepare build-rootimg",
                executor.plugins_dir().display()
            )],
            copy_in,
            copy_out: vec![
                (
                    executor
                        .build_dir()
                        .join("qubeized_images")
                        .join(&template.name)
                        .join("root.img"),
                    qubeized_image,
                ),
                (
                    executor.build_dir().join("appmenus"),
                    templates_dir.join(&template.name),
                ),
                (
                    executor.build_dir().join("template.conf"),
                    templates_dir.join(&template.name),
                ),
            ],
            env,
            files_with_placeholders: vec![PathBuf::from(
                "@PLUGINS_DIR@/template_rpm/04_install_qubes.sh",
            )],
            dig_holes: true,
            timeout: Some(Duration::from_secs(template.timeout)),
            ..Default::default()
        };
        executor
            .run(&spec, &mut |line| log.line(line))
            .map_err(|_| PluginError::Template(format!("{template}: Failed to prepare template.")))
    }

    fn build(&self, ctx: &JobContext, _options: &RunOptions) -> Result<(), PluginError> {
        let (config, template) = (self.config, self.template);
        let mut executor = config.executor_for("build", Some(&template.distribution), None)?;
        let mut log = step_log(config, &format!("template-build-{}", template.name))?;
        info!("Log file: {}", log.path().display());

        let timestamp = self.template_timestamp()?;
        let templates_dir = config.artifacts().templates_dir();
        let rpm_fn = self.template_rpm_name(&timestamp);
        let repository_dir = config
            .artifacts()
            .repository_dir(template.distribution.distribution());
        std::fs::create_dir_all(&repository_dir)
            .map_err(|e| PluginError::Template(e.to_string()))?;

        let mut env = self.environment(executor.as_ref());
        env.insert("TEMPLATE_TIMESTAMP".to_string(), timestamp.clone());

        let mut copy_in = default_copy_in(
            executor.as_ref(),
            ctx.manager,
            config,
            "template",
            &self.dependencies(),
        );
        copy_in.push((repository_dir, executor.repository_dir()));
        copy_in.push((
            templates_dir
                .join("qubeized_images")
                .join(&template.name)
                .join("root.img"),
            executor
                .build_dir()
                .join("qubeized_images")
                .join(&template.name),
        ));
        copy_in.push((
            templates_dir.join(&template.name).join("template.conf"),
            executor.build_dir(),
        ));
        copy_in.push((
            templates_dir.join(&template.name).join("appmenus"),
            executor.build_dir(),
        ));

        let spec = RunSpec {
            cmd: vec![format!(
                "make -C {}/template prepare build-rpm",
                executor.plugins_dir().display()
            )],
            copy_in,
            copy_out: vec![(
                executor
                    .build_dir()
                    .join(format!("rpmbuild/RPMS/noarch/{rpm_fn}")),
                templates_dir.join("rpm"),
            )],
            env,
            files_with_placeholders: vec![PathBuf::from(
                "@PLUGINS_DIR@/template_rpm/04_install_qubes.sh",
            )],
            timeout: Some(Duration::from_secs(template.timeout)),
            ..Default::default()
        };
        executor
            .run(&spec, &mut |line| log.line(line))
            .map_err(|_| PluginError::Template(format!("{template}: Failed to build template.")))?;

        let info = artifacts::InfoRecord {
            rpms: vec![rpm_fn],
            timestamp: Some(timestamp),
            ..Default::default()
        };
        artifacts::save_info(&templates_dir, "build", &template.name, &info)
            .map_err(|e| PluginError::Template(e.to_string()))
    }

    fn sign(&self, _ctx: &JobContext, _options: &RunOptions) -> Result<(), PluginError> {
        let (config, template) = (self.config, self.template);
        let mut executor = config.executor_for("sign", Some(&template.distribution), None)?;
        self.require_local(executor.as_ref(), Stage::Sign)?;
        let mut log = step_log(config, &format!("template-sign-{}", template.name))?;
        info!("Log file: {}", log.path().display());

        let Some(sign_key) = config.template_sign_key() else {
            info!("{template}: No signing key found.");
            return Ok(());
        };

        let templates_dir = config.artifacts().templates_dir();
        let db_path = templates_dir.join("rpmdb");
        fileutil::remove_path(&db_path).map_err(|e| PluginError::Template(e.to_string()))?;

        let temp_dir = SafeTempDir::new().map_err(|e| PluginError::Template(e.to_string()))?;
        let sign_key_asc = temp_dir.path().join(format!("{sign_key}.asc"));
        let spec = RunSpec {
            cmd: vec![
                format!("mkdir -p {}", db_path.display()),
                format!(
                    "{} --armor --export {sign_key} > {}",
                    config.gpg_client(),
                    sign_key_asc.display()
                ),
                format!(
                    "rpmkeys --dbpath={} --import {}",
                    db_path.display(),
                    sign_key_asc.display()
                ),
            ],
            ..Default::default()
        };
        executor
            .run(&spec, &mut |line| log.line(line))
            .map_err(|_| PluginError::Template(format!("{template}: Failed to create RPM dbpath.")))?;

        let timestamp = self.template_timestamp()?;
        let rpm = templates_dir.join("rpm").join(self.template_rpm_name(&timestamp));
        if !rpm.exists() {
            return Err(PluginError::Template(format!(
                "{template}: Cannot find template RPM '{}'.",
                rpm.display()
            )));
        }

        info!(
            "{template}: Signing '{}'.",
            rpm.file_name().unwrap_or_default().to_string_lossy()
        );
        let spec = RunSpec {
            cmd: vec![format!(
                "{}/sign_rpm/scripts/sign-rpm --sign-key {sign_key} --db-path {} --rpm {}",
                executor.plugins_dir().display(),
                db_path.display(),
                rpm.display()
            )],
            ..Default::default()
        };
        executor.run(&spec, &mut |line| log.line(line)).map_err(|_| {
            PluginError::Template(format!(
                "{template}: Failed to sign template RPM '{}'.",
                rpm.display()
            ))
        })
    }

    fn publish(&self, _ctx: &JobContext, options: &RunOptions) -> Result<(), PluginError> {
        let (config, template) = (self.config, self.template);
        let mut executor = config.executor_for("publish", Some(&template.distribution), None)?;
        self.require_local(executor.as_ref(), Stage::Publish)?;
        let mut log = step_log(config, &format!("template-publish-{}", template.name))?;
        info!("Log file: {}", log.path().display());

        let Some(sign_key) = config.template_sign_key() else {
            info!("{template}: No signing key found.");
            return Ok(());
        };
        let repository = options
            .repository_publish
            .clone()
            .or_else(|| config.repository_publish("templates"))
            .ok_or_else(|| {
                PluginError::Template("Cannot determine repository for publish".to_string())
            })?;
        if !TEMPLATE_REPOSITORIES.contains(&repository.as_str()) {
            return Err(PluginError::Template(format!(
                "{template}: Refusing to publish templates into '{repository}'."
            )));
        }

        let templates_dir = config.artifacts().templates_dir();
        let timestamp = self.template_timestamp()?;
        let rpm = templates_dir.join("rpm").join(self.template_rpm_name(&timestamp));

        if options.unpublish {
            let mut publish_info =
                artifacts::read_info(&templates_dir, "publish", &template.name)
                    .map_err(|e| PluginError::Template(e.to_string()))?;
            if !publish_info.is_published_in(&repository) {
                info!("{template}: Not published to '{repository}'.");
                return Ok(());
            }
            let target_dir = self.target_dir(&repository);
            let target = target_dir.join("rpm").join(rpm.file_name().unwrap_or_default());
            if target.exists() {
                std::fs::remove_file(&target)
                    .map_err(|e| PluginError::Template(e.to_string()))?;
            }
            self.createrepo_and_sign(executor.as_mut(), &mut log, &sign_key, &target_dir)?;

            if publish_info.drop_publish(&repository) {
                info!("{template}: Not published anywhere else, deleting publish info.");
                artifacts::delete_info(&templates_dir, "publish", &template.name)
                    .map_err(|e| PluginError::Template(e.to_string()))?;
            } else {
                artifacts::save_info(&templates_dir, "publish", &template.name, &publish_info)
                    .map_err(|e| PluginError::Template(e.to_string()))?;
            }
            return Ok(());
        }

        let publish_info = artifacts::read_info(&templates_dir, "publish", &template.name)
            .map_err(|e| PluginError::Template(e.to_string()))?;
        if publish_info.is_published_in(&repository) {
            info!("{template}: Already published to '{repository}'.");
            return Ok(());
        }

        // Stable template repositories only accept templates aged in their
        // testing counterpart.
        if matches!(repository.as_str(), "templates-itl" | "templates-community")
            && !self.can_be_published_in_stable(&repository, options.ignore_min_age)?
        {
            return Err(PluginError::Template(format!(
                "{template}: Refusing to publish to '{repository}' as template is not \
                 uploaded to '{repository}-testing' for at least {} days.",
                config.min_age_days()
            )));
        }

        let db_path = templates_dir.join("rpmdb");
        if !db_path.exists() {
            return Err(PluginError::Template(format!(
                "{template}: Failed to find RPM DB path."
            )));
        }

        let comps = executor.plugins_dir().join(format!(
            "publish_rpm/comps/comps-{}.xml",
            template.distribution.package_set
        ));
        let skeleton = RunSpec {
            cmd: vec![format!(
                "{}/publish_rpm/scripts/create-skeleton {} {} {} {} {}",
                executor.plugins_dir().display(),
                config.release_name(),
                template.distribution.package_set,
                template.distribution.name,
                config.artifacts().repository_publish_dir("rpm").display(),
                comps.display()
            )],
            ..Default::default()
        };
        executor
            .run(&skeleton, &mut |line| log.line(line))
            .map_err(|_| {
                PluginError::Template(format!(
                    "{template}: Failed to create repository skeleton."
                ))
            })?;

        // Check the signature, then hardlink into the repository tree.
        let check = RunSpec {
            cmd: vec![format!(
                "{}/sign_rpm/scripts/sign-rpm --sign-key {sign_key} --db-path {} \
                 --rpm {} --check-only",
                executor.plugins_dir().display(),
                db_path.display(),
                rpm.display()
            )],
            ..Default::default()
        };
        executor
            .run(&check, &mut |line| log.line(line))
            .map_err(|_| {
                PluginError::Template(format!("{template}: Failed to check signatures."))
            })?;

        info!("{template}: Publishing template to '{repository}'.");
        let target_dir = self.target_dir(&repository);
        fileutil::force_hardlink(
            &rpm,
            &target_dir.join("rpm").join(rpm.file_name().unwrap_or_default()),
        )
        .map_err(|_| PluginError::Template(format!("{template}: Failed to publish template.")))?;
        self.createrepo_and_sign(executor.as_mut(), &mut log, &sign_key, &target_dir)?;

        let build_info = artifacts::read_info(&templates_dir, "build", &template.name)
            .map_err(|e| PluginError::Template(e.to_string()))?;
        let mut info = if publish_info.timestamp.as_deref() == Some(timestamp.as_str()) {
            publish_info
        } else {
            build_info
        };
        info.record_publish(
            &repository,
            &artifacts::publish_timestamp(chrono::Utc::now()),
        );
        artifacts::save_info(&templates_dir, "publish", &template.name, &info)
            .map_err(|e| PluginError::Template(e.to_string()))?;
        Ok(())
    }

    /// Template variant of the minimum-age gate, against the matching
    /// `-testing` repository entry.
    fn can_be_published_in_stable(
        &self,
        repository: &str,
        ignore_min_age: bool,
    ) -> Result<bool, PluginError> {
        let (config, template) = (self.config, self.template);
        let templates_dir = config.artifacts().templates_dir();
        let record = artifacts::read_info(&templates_dir, "publish", &template.name)
            .map_err(|e| PluginError::Template(e.to_string()))?;
        let testing = format!("{repository}-testing");
        if !record.is_published_in(&testing) {
            return Ok(false);
        }
        if ignore_min_age {
            return Ok(true);
        }
        let mtime = artifacts::info_mtime(&templates_dir, "publish", &template.name)
            .map_err(|e| PluginError::Template(e.to_string()))?;
        let published = chrono::DateTime::<chrono::Utc>::from(mtime);
        let age = chrono::Utc::now().signed_duration_since(published);
        Ok(age >= chrono::Duration::days(config.min_age_days()))
    }

    fn upload(&self, _ctx: &JobContext, options: &RunOptions) -> Result<(), PluginError> {
        let (config, template) = (self.config, self.template);
        let mut executor = config.executor_for("upload", Some(&template.distribution), None)?;
        self.require_local(executor.as_ref(), Stage::Upload)?;
        let mut log = step_log(config, &format!("template-upload-{}", template.name))?;
        info!("Log file: {}", log.path().display());

        let Some(remote_path) = config.repository_upload_remote_host(buildconfig::Family::Rpm)
        else {
            info!("{}: No remote location defined. Skipping.", template.distribution);
            return Ok(());
        };
        let repository = options
            .repository_publish
            .clone()
            .or_else(|| config.repository_publish("templates"))
            .ok_or_else(|| {
                PluginError::Template("Cannot determine repository for publish".to_string())
            })?;

        let local_path = config
            .artifacts()
            .repository_publish_dir("rpm")
            .join(config.release_name());
        let spec = RunSpec {
            cmd: vec![format!(
                "rsync --partial --progress --hard-links -air --mkpath -- \
                 {}/ {remote_path}/{repository}/",
                local_path.join(&repository).display()
            )],
            ..Default::default()
        };
        executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
            PluginError::Template(format!(
                "{}: Failed to upload to remote host: {e}",
                template.distribution
            ))
        })
    }
}

impl Job for TemplateJob<'_> {
    fn name(&self) -> String {
        format!("{}:{}", self.stage, self.template.name)
    }

    fn reference(&self) -> JobReference {
        JobReference::template(self.stage, self.template)
    }

    fn priority(&self) -> i32 {
        20
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::Plugin("template".to_string()),
            Dependency::Plugin("source_rpm".to_string()),
            Dependency::Plugin("source_deb".to_string()),
        ]
    }

    fn run(&mut self, ctx: &JobContext, options: &RunOptions) -> Result<(), PluginError> {
        match self.stage {
            Stage::Prep => self.prep(ctx, options),
            Stage::Build => self.build(ctx, options),
            Stage::Sign => self.sign(ctx, options),
            Stage::Publish => self.publish(ctx, options),
            Stage::Upload => self.upload(ctx, options),
            _ => Ok(()),
        }
    }
}
