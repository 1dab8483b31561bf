//! Fetch stage: clone or update component sources, verify the tip
//! according to the component's verification mode, download and verify
//! declared distfiles, and snapshot submodule archives.

use std::path::Path;
use std::time::Duration;

use buildconfig::{Component, Config, Stage, VerificationMode};
use executor::RunSpec;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::info;

use crate::{
    base_environment, default_copy_in, files_from, modules_from, source_parameters, step_log,
    Dependency, InstanceArgs, Job, JobContext, JobReference, PluginError, PluginFactory,
    RunOptions,
};

lazy_static! {
    static ref GIT_HASH_RE: Regex = Regex::new(r"^[0-9a-f]{7,40}$").unwrap();
    static ref SHORT_HASH_RE: Regex = Regex::new(r"^[0-9a-f]{7,}$").unwrap();
}

pub struct FetchPlugin;

impl PluginFactory for FetchPlugin {
    fn name(&self) -> &'static str {
        "fetch"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::Fetch]
    }

    fn instances<'a>(
        &self,
        args: &InstanceArgs<'a>,
    ) -> Result<Vec<Box<dyn Job + 'a>>, PluginError> {
        Ok(args
            .components
            .iter()
            .map(|component| {
                Box::new(FetchJob {
                    config: args.config,
                    component,
                }) as Box<dyn Job>
            })
            .collect())
    }
}

pub struct FetchJob<'a> {
    config: &'a Config,
    component: &'a Component,
}

impl Job for FetchJob<'_> {
    fn name(&self) -> String {
        format!("fetch:{}", self.component.name)
    }

    fn reference(&self) -> JobReference {
        JobReference::component_only(Stage::Fetch, self.component)
    }

    fn priority(&self) -> i32 {
        0
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::Plugin("fetch".to_string())]
    }

    fn run(&mut self, ctx: &JobContext, _options: &RunOptions) -> Result<(), PluginError> {
        let config = self.config;
        let component = self.component;
        let mut executor = config.executor_for("fetch", None, Some(component))?;
        let mut log = step_log(config, &format!("fetch-{}", component.name))?;
        info!("Log file: {}", log.path().display());

        let sources_dir = config.artifacts().sources_dir();
        std::fs::create_dir_all(&sources_dir).map_err(|e| PluginError::Fetch(e.to_string()))?;
        let local_source_dir = config.artifacts().source_dir(&component.name);
        // Sandbox-side checkout location.
        let source_dir = executor.builder_dir().join(&component.name);

        let reuse_existing = !config
            .get("force-fetch")
            .and_then(serde_yaml::Value::as_bool)
            .unwrap_or(false);

        let mut copy_in = default_copy_in(
            executor.as_ref(),
            ctx.manager,
            config,
            "fetch",
            &self.dependencies(),
        );
        if local_source_dir.exists() {
            if !reuse_existing {
                fileutil::remove_path(&local_source_dir)
                    .map_err(|e| PluginError::Fetch(e.to_string()))?;
            } else {
                info!("{component}: source already fetched. Updating.");
                copy_in.push((local_source_dir.clone(), executor.builder_dir()));
            }
        }

        if !config.skip_git_fetch() {
            let mut get_sources_cmd = vec![
                format!(
                    "{}/fetch/scripts/get-and-verify-source",
                    executor.plugins_dir().display()
                ),
                format!("--component {}", component.name),
                format!("--git-branch {}", component.branch),
                format!("--git-url {}", component.url),
                format!("--keyring-dir-git {}/keyring", executor.builder_dir().display()),
                format!("--keys-dir {}/fetch/keys", executor.plugins_dir().display()),
            ];
            for maintainer in &component.maintainers {
                get_sources_cmd.push(format!("--maintainer {maintainer}"));
            }
            match component.verification_mode {
                VerificationMode::Insecure => {
                    get_sources_cmd.push("--insecure-skip-checking".to_string())
                }
                VerificationMode::SignedCommit => {
                    get_sources_cmd.push("--less-secure-signed-commits-sufficient".to_string())
                }
                VerificationMode::SignedTag => get_sources_cmd.push(format!(
                    "--minimum-distinct-maintainers {}",
                    component.min_distinct_maintainers
                )),
            }
            if local_source_dir.exists() && reuse_existing {
                get_sources_cmd.push("--do-merge".to_string());
                if component.fetch_versions_only {
                    get_sources_cmd.push("--fetch-versions-only".to_string());
                }
            }

            let spec = RunSpec {
                cmd: vec![
                    format!("cd {}", executor.builder_dir().display()),
                    get_sources_cmd.join(" "),
                ],
                copy_in: copy_in.clone(),
                copy_out: vec![(source_dir.clone(), sources_dir.clone())],
                env: base_environment(config),
                timeout: Some(Duration::from_secs(component.timeout)),
                ..Default::default()
            };
            executor
                .run(&spec, &mut |line| log.line(line))
                .map_err(|e| fetch_err(component, e))?;
        }

        // The manifest is only guaranteed to exist now.
        let params = source_parameters(executor.as_ref(), component, None, config)?;

        let distfiles_dir = config.artifacts().component_distfiles_dir(&component.name);
        std::fs::create_dir_all(&distfiles_dir).map_err(|e| PluginError::Fetch(e.to_string()))?;

        for file in files_from(&params) {
            let (file_name, distfile_name) = file.distfile_names();
            if distfiles_dir.join(&distfile_name).exists() {
                if reuse_existing {
                    info!("{component}: file {distfile_name} already downloaded. Skipping.");
                    continue;
                }
                std::fs::remove_file(distfiles_dir.join(&distfile_name))
                    .map_err(|e| PluginError::Fetch(e.to_string()))?;
            }

            let mut download_cmd = vec![
                format!(
                    "{}/fetch/scripts/download-and-verify-file",
                    executor.plugins_dir().display()
                ),
                format!("--output-dir {}", source_dir.display()),
                format!("--file-name {file_name}"),
                format!("--file-url {}", file.url),
            ];
            let mut copy_out = vec![(source_dir.join(&distfile_name), distfiles_dir.clone())];
            if let Some(sha256) = &file.sha256 {
                download_cmd.push(format!(
                    "--checksum-cmd sha256sum --checksum-file {}",
                    source_dir.join(sha256).display()
                ));
            } else if let Some(sha512) = &file.sha512 {
                download_cmd.push(format!(
                    "--checksum-cmd sha512sum --checksum-file {}",
                    source_dir.join(sha512).display()
                ));
            }
            if let Some(signature) = &file.signature {
                download_cmd.push(format!("--signature-url {signature}"));
                let signature_name = signature.rsplit('/').next().unwrap_or(signature);
                copy_out.push((source_dir.join(signature_name), distfiles_dir.clone()));
            }
            for pubkey in &file.pubkeys {
                download_cmd.push(format!("--pubkey-file {pubkey}"));
            }
            if file.uncompress {
                download_cmd.push("--uncompress".to_string());
            }

            let spec = RunSpec {
                cmd: vec![format!("cd {}", source_dir.display()), download_cmd.join(" ")],
                copy_in: vec![
                    (local_source_dir.clone(), executor.builder_dir()),
                ]
                .into_iter()
                .chain(copy_in.clone())
                .collect(),
                copy_out,
                env: base_environment(config),
                timeout: Some(Duration::from_secs(component.timeout)),
                ..Default::default()
            };
            executor
                .run(&spec, &mut |line| log.line(line))
                .map_err(|e| fetch_err(component, e))?;
        }

        // From here on the fetched checkout defines version and verrel.
        let verrel = component.verrel()?;
        let artifacts_dir =
            config
                .artifacts()
                .component_artifacts_dir(&component.name, &verrel, "fetch");
        fileutil::remove_path(&artifacts_dir).map_err(|e| PluginError::Fetch(e.to_string()))?;
        std::fs::create_dir_all(&artifacts_dir).map_err(|e| PluginError::Fetch(e.to_string()))?;

        let mut info = artifacts::InfoRecord {
            source_hash: Some(component.source_hash()?.to_string()),
            ..Default::default()
        };

        // Head commit hash and v* tags, collected inside the executor so
        // the host never needs git credentials or hooks.
        let spec = RunSpec {
            cmd: vec![
                format!("rm -f {0}/hash {0}/vtags", source_dir.display()),
                format!("cd {}", executor.builder_dir().display()),
                format!(
                    "git -C {0} rev-parse 'HEAD^{{}}' >> {0}/hash",
                    source_dir.display()
                ),
                format!(
                    "git -C {0} tag --points-at HEAD --list 'v*' >> {0}/vtags",
                    source_dir.display()
                ),
            ],
            copy_in: vec![(local_source_dir.clone(), executor.builder_dir())],
            copy_out: vec![
                (source_dir.join("hash"), artifacts_dir.clone()),
                (source_dir.join("vtags"), artifacts_dir.clone()),
            ],
            env: base_environment(config),
            ..Default::default()
        };
        executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
            PluginError::Fetch(format!(
                "{component}: Failed to get source hash information: {e}."
            ))
        })?;

        let hash = read_lines(&artifacts_dir.join("hash"))?;
        let head = hash.first().map(String::as_str).unwrap_or_default();
        if !GIT_HASH_RE.is_match(head) {
            return Err(PluginError::Fetch(format!(
                "{component}: Invalid git hash detected."
            )));
        }
        info.git_commit_hash = Some(head.to_string());
        for tag in read_lines(&artifacts_dir.join("vtags"))? {
            if !tag.starts_with('v') {
                return Err(PluginError::Fetch(format!(
                    "{component}: Invalid git version tag detected."
                )));
            }
            info.git_version_tags.push(tag);
        }

        let modules = modules_from(&params);
        if !modules.is_empty() {
            self.snapshot_modules(
                ctx,
                executor.as_mut(),
                &mut log,
                &modules,
                &source_dir,
                &local_source_dir,
                &artifacts_dir,
                &distfiles_dir,
                &mut info,
            )?;
        }

        artifacts::save_info(&artifacts_dir, "fetch", "source", &info)
            .map_err(|e| PluginError::Fetch(e.to_string()))?;
        for stray in ["hash", "vtags", "modules"] {
            let path = artifacts_dir.join(stray);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| {
                    PluginError::Fetch(format!("{component}: Failed to clean artifacts: {e}."))
                })?;
            }
        }
        Ok(())
    }
}

impl FetchJob<'_> {
    #[allow(clippy::too_many_arguments)]
    fn snapshot_modules(
        &self,
        ctx: &JobContext,
        executor: &mut dyn executor::Executor,
        log: &mut crate::StepLog,
        modules: &[String],
        source_dir: &Path,
        local_source_dir: &Path,
        artifacts_dir: &Path,
        distfiles_dir: &Path,
        info: &mut artifacts::InfoRecord,
    ) -> Result<(), PluginError> {
        let component = self.component;
        let config = self.config;

        let mut cmd = vec![
            format!("rm -f {}/modules", source_dir.display()),
            format!("cd {}", executor.builder_dir().display()),
        ];
        for module in modules {
            cmd.push(format!(
                "git -C {0}/{module} rev-parse --short HEAD >> {0}/modules",
                source_dir.display()
            ));
        }
        let spec = RunSpec {
            cmd,
            copy_in: vec![(local_source_dir.to_path_buf(), executor.builder_dir())],
            copy_out: vec![(source_dir.join("modules"), artifacts_dir.to_path_buf())],
            env: base_environment(config),
            ..Default::default()
        };
        executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
            PluginError::Fetch(format!(
                "{component}: Failed to get source module information: {e}."
            ))
        })?;

        let hashes = read_lines(&artifacts_dir.join("modules"))?;
        if hashes.len() != modules.len() {
            return Err(PluginError::Fetch(format!("{component}: Invalid modules data.")));
        }
        for hash in &hashes {
            if !SHORT_HASH_RE.is_match(hash) {
                return Err(PluginError::Fetch(format!(
                    "{component}: Invalid module hash detected."
                )));
            }
        }

        let mut cmd = Vec::new();
        let mut copy_out = Vec::new();
        for (module, hash) in modules.iter().zip(&hashes) {
            let archive = format!("{module}-{hash}.tar.gz");
            cmd.push(format!(
                "{}/fetch/scripts/create-archive {}/{module} {archive} {module}/",
                executor.plugins_dir().display(),
                source_dir.display()
            ));
            copy_out.push((
                source_dir.join(module).join(&archive),
                distfiles_dir.to_path_buf(),
            ));
            info.modules.push(artifacts::ModuleInfo {
                name: module.clone(),
                hash: hash.clone(),
                archive: Some(archive),
            });
        }
        let spec = RunSpec {
            cmd,
            copy_in: vec![
                (distfiles_dir.to_path_buf(), executor.builder_dir()),
                (local_source_dir.to_path_buf(), executor.builder_dir()),
            ]
            .into_iter()
            .chain(default_copy_in(
                executor,
                ctx.manager,
                config,
                "fetch",
                &[],
            ))
            .collect(),
            copy_out,
            env: base_environment(config),
            ..Default::default()
        };
        executor.run(&spec, &mut |line| log.line(line)).map_err(|e| {
            PluginError::Fetch(format!(
                "{component}: Failed to generate module archives: {e}."
            ))
        })
    }
}

fn fetch_err(component: &Component, error: executor::ExecutorError) -> PluginError {
    PluginError::Fetch(format!("{component}: {error}"))
}

fn read_lines(path: &std::path::Path) -> Result<Vec<String>, PluginError> {
    let text =
        std::fs::read_to_string(path).map_err(|e| PluginError::Fetch(e.to_string()))?;
    Ok(text.lines().map(str::to_string).collect())
}
