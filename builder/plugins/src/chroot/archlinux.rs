use buildconfig::{Config, Distribution, Stage};
use executor::RunSpec;
use tracing::info;

use crate::{
    base_environment, default_copy_in, step_log, Dependency, InstanceArgs, Job, JobContext,
    JobReference, PluginError, PluginFactory, RunOptions,
};

/// Prepares the Arch Linux bootstrap root archive (`root.tar.gz`).
pub struct ArchlinuxChrootPlugin;

impl PluginFactory for ArchlinuxChrootPlugin {
    fn name(&self) -> &'static str {
        "chroot_archlinux"
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
            if !dist.is_archlinux() {
                continue;
            }
            jobs.push(Box::new(ArchlinuxChrootJob {
                config: args.config,
                dist,
            }));
        }
        Ok(jobs)
    }
}

pub struct ArchlinuxChrootJob<'a> {
    config: &'a Config,
    dist: &'a Distribution,
}

impl Job for ArchlinuxChrootJob<'_> {
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
        vec![Dependency::Plugin("source_archlinux".to_string())]
    }

    fn run(&mut self, ctx: &JobContext, _options: &RunOptions) -> Result<(), PluginError> {
        let (config, dist) = (self.config, self.dist);
        let mut executor = config.executor_for("init-cache", Some(dist), None)?;
        let mut log = step_log(config, &format!("init-cache-{}", dist.distribution()))?;
        info!("Log file: {}", log.path().display());

        let chroot_dir = config.artifacts().chroot_cache_dir(&dist.name);
        std::fs::create_dir_all(&chroot_dir).map_err(|e| PluginError::Chroot(e.to_string()))?;
        let chroot_archive = "root.tar.gz";
        fileutil::remove_path(&chroot_dir.join(chroot_archive))
            .map_err(|e| PluginError::Chroot(e.to_string()))?;

        let mut env = base_environment(config);
        env.insert("DIST".to_string(), dist.name.clone());
        env.insert("PACKAGE_SET".to_string(), dist.package_set.to_string());

        let cache_root = executor.cache_dir().join("root");
        let cmd = vec![
            format!(
                "{}/chroot_archlinux/scripts/prepare-chroot-base {} {}",
                executor.plugins_dir().display(),
                cache_root.display(),
                dist.name
            ),
            format!("cd {}", executor.cache_dir().display()),
            format!("sudo tar cvf {chroot_archive} root"),
        ];

        let spec = RunSpec {
            cmd,
            copy_in: default_copy_in(
                executor.as_ref(),
                ctx.manager,
                config,
                "chroot_archlinux",
                &self.dependencies(),
            ),
            copy_out: vec![(executor.cache_dir().join(chroot_archive), chroot_dir.clone())],
            env,
            ..Default::default()
        };
        executor
            .run(&spec, &mut |line| log.line(line))
            .map_err(|e| PluginError::Chroot(format!("{dist}: Failed to generate chroot: {e}.")))
    }
}
