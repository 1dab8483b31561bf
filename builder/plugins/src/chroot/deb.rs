use std::path::PathBuf;

use buildconfig::{Config, Distribution, Stage};
use executor::RunSpec;
use serde_yaml::Value;
use tracing::info;

use crate::{
    base_environment, default_copy_in, step_log, Dependency, InstanceArgs, Job, JobContext,
    JobReference, PluginError, PluginFactory, RunOptions,
};

/// Prepares the pbuilder `base.tgz` for a Debian distribution.
pub struct DebChrootPlugin;

impl PluginFactory for DebChrootPlugin {
    fn name(&self) -> &'static str {
        "chroot_deb"
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
            if !dist.is_deb() && !dist.is_ubuntu() {
                continue;
            }
            jobs.push(Box::new(DebChrootJob {
                config: args.config,
                dist,
            }));
        }
        Ok(jobs)
    }
}

pub struct DebChrootJob<'a> {
    config: &'a Config,
    dist: &'a Distribution,
}

impl Job for DebChrootJob<'_> {
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
        vec![Dependency::Plugin("source_deb".to_string())]
    }

    fn run(&mut self, ctx: &JobContext, _options: &RunOptions) -> Result<(), PluginError> {
        let (config, dist) = (self.config, self.dist);
        let mut executor = config.executor_for("init-cache", Some(dist), None)?;
        let mut log = step_log(config, &format!("init-cache-{}", dist.distribution()))?;
        info!("Log file: {}", log.path().display());

        let chroot_dir = config
            .artifacts()
            .chroot_cache_dir(&dist.name)
            .join("pbuilder");
        fileutil::remove_path(&chroot_dir).map_err(|e| PluginError::Chroot(e.to_string()))?;
        std::fs::create_dir_all(&chroot_dir).map_err(|e| PluginError::Chroot(e.to_string()))?;

        let mut env = base_environment(config);
        env.insert("DIST".to_string(), dist.name.clone());
        env.insert("LC_ALL".to_string(), "C".to_string());

        // The builder-local repository line cannot resolve while the base
        // image is being created.
        let mut cmd = vec![
            format!(
                "sed -i '/qubes-deb/d' {}/chroot_deb/pbuilder/pbuilderrc",
                executor.plugins_dir().display()
            ),
            format!("mkdir -p {}/aptcache", executor.cache_dir().display()),
        ];
        // The first configured mirror for the distribution wins.
        let mirror = config
            .get("mirrors")
            .and_then(Value::as_mapping)
            .and_then(|m| {
                m.get(dist.distribution())
                    .or_else(|| m.get(dist.fullname.as_str()))
            })
            .and_then(Value::as_sequence)
            .and_then(|seq| seq.first())
            .and_then(Value::as_str);
        if let Some(mirror) = mirror {
            cmd.push(format!(
                "sed -i 's@MIRRORSITE=https://deb.debian.org/debian@MIRRORSITE={mirror}@' \
                 {}/chroot_deb/pbuilder/pbuilderrc",
                executor.plugins_dir().display()
            ));
        }
        cmd.push(format!(
            "sudo -E pbuilder create --distribution {} --configfile \
             {}/chroot_deb/pbuilder/pbuilderrc",
            dist.name,
            executor.plugins_dir().display()
        ));

        let spec = RunSpec {
            cmd,
            copy_in: default_copy_in(
                executor.as_ref(),
                ctx.manager,
                config,
                "chroot_deb",
                &self.dependencies(),
            ),
            copy_out: vec![(
                executor.builder_dir().join("pbuilder/base.tgz"),
                chroot_dir.clone(),
            )],
            env,
            files_with_placeholders: vec![PathBuf::from(
                "@PLUGINS_DIR@/chroot_deb/pbuilder/pbuilderrc",
            )],
            ..Default::default()
        };
        executor
            .run(&spec, &mut |line| log.line(line))
            .map_err(|e| PluginError::Chroot(format!("{dist}: Failed to generate chroot: {e}.")))
    }
}
