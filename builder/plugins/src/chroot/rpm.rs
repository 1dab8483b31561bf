use std::path::PathBuf;

use buildconfig::{Config, Distribution, Stage};
use executor::RunSpec;
use tracing::info;

use crate::{
    base_environment, default_copy_in, step_log, Dependency, InstanceArgs, Job, JobContext,
    JobReference, PluginError, PluginFactory, RunOptions,
};

/// Prepares the mock root cache for an RPM distribution.
pub struct RpmChrootPlugin;

impl PluginFactory for RpmChrootPlugin {
    fn name(&self) -> &'static str {
        "chroot_rpm"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::InitCache]
    }

    fn instances<'a>(
        &self,
        args: &InstanceArgs<'a>,
    ) -> Result<Vec<Box<dyn Job + 'a>>, PluginError> {
        let mut jobs: Vec<Box<dyn Job>> = Vec::new();
        for dist in &args.distributions {
            if !dist.is_rpm() {
                continue;
            }
            jobs.push(Box::new(RpmChrootJob {
                config: args.config,
                dist,
            }));
        }
        Ok(jobs)
    }
}

pub struct RpmChrootJob<'a> {
    config: &'a Config,
    dist: &'a Distribution,
}

impl Job for RpmChrootJob<'_> {
    fn name(&self) -> String {
        format!("init-cache:{}", self.dist.distribution())
    }

    fn reference(&self) -> JobReference {
        JobReference {
            stage: Stage::InitCache,
            component: None,
            dist: Some(self.dist.distribution().to_string()),
            template: None,
            build: None,
        }
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::Plugin("source_rpm".to_string())]
    }

    fn run(&mut self, ctx: &JobContext, _options: &RunOptions) -> Result<(), PluginError> {
        let (config, dist) = (self.config, self.dist);
        let mut executor = config.executor_for("init-cache", Some(dist), None)?;
        let mut log = step_log(config, &format!("init-cache-{}", dist.distribution()))?;
        info!("Log file: {}", log.path().display());

        let mock_conf = format!(
            "{}-{}-{}.cfg",
            dist.fullname, dist.version, dist.architecture
        );
        let mock_chroot_name = mock_conf.trim_end_matches(".cfg").to_string();

        let chroot_dir = config.artifacts().chroot_cache_dir(&dist.name).join("mock");
        std::fs::create_dir_all(&chroot_dir)
            .map_err(|e| PluginError::Chroot(e.to_string()))?;
        fileutil::remove_path(&chroot_dir.join(&mock_chroot_name))
            .map_err(|e| PluginError::Chroot(e.to_string()))?;

        let mut env = base_environment(config);
        env.insert("DIST".to_string(), dist.name.clone());
        env.insert("PACKAGE_SET".to_string(), dist.package_set.to_string());

        let mut mock_cmd = vec![
            "sudo --preserve-env=DIST,PACKAGE_SET,USE_QUBES_REPO_VERSION".to_string(),
            "/usr/libexec/mock/mock".to_string(),
            format!(
                "--root {}/source_rpm/mock/{mock_conf}",
                executor.plugins_dir().display()
            ),
            "--disablerepo=builder-local".to_string(),
            "--init".to_string(),
        ];
        if executor.description().starts_with("qubes") {
            mock_cmd.push("--isolation=nspawn".to_string());
        } else {
            info!(
                "{dist}: Mock isolation set to 'simple', build has full network access. \
                 Use 'qubes' executor for network-isolated build."
            );
            mock_cmd.push("--isolation=simple".to_string());
        }
        if config.verbose() {
            mock_cmd.push("--verbose".to_string());
        }

        let spec = RunSpec {
            cmd: vec![mock_cmd.join(" ")],
            copy_in: default_copy_in(
                executor.as_ref(),
                ctx.manager,
                config,
                "chroot_rpm",
                &self.dependencies(),
            ),
            copy_out: vec![(
                executor.builder_dir().join("mock").join(&mock_chroot_name),
                chroot_dir.clone(),
            )],
            env,
            files_with_placeholders: vec![PathBuf::from(format!(
                "@PLUGINS_DIR@/source_rpm/mock/{mock_conf}"
            ))],
            ..Default::default()
        };
        executor
            .run(&spec, &mut |line| log.line(line))
            .map_err(|e| PluginError::Chroot(format!("{dist}: Failed to generate chroot: {e}.")))
    }
}
