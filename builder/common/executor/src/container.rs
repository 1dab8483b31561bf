use std::path::Path;
use std::process::Command;

use anyhow::Context;
use tracing::{debug, info};

use crate::{env_assignments, Executor, ExecutorError, ExecutorOptions, LogSink, RunSpec};

/// Runs build steps inside a privileged OCI container driven through the
/// configured client binary (`podman` or `docker`).
pub struct ContainerExecutor {
    client: String,
    image: String,
    options: ExecutorOptions,
}

impl ContainerExecutor {
    pub fn new(client: &str, options: ExecutorOptions) -> Result<Self, ExecutorError> {
        let image = options
            .image
            .clone()
            .ok_or_else(|| ExecutorError::failed("No container image configured."))?;
        Ok(Self {
            client: client.to_string(),
            image,
            options,
        })
    }

    fn client_output(&self, args: &[&str]) -> Result<String, ExecutorError> {
        let output = Command::new(&self.client)
            .args(args)
            .output()
            .with_context(|| format!("Cannot run {}", self.client))
            .map_err(ExecutorError::Other)?;
        if !output.status.success() {
            return Err(ExecutorError::failed(format!(
                "{} {} failed: {}",
                self.client,
                args.first().unwrap_or(&""),
                processes::sanitize_line(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn client_check(&self, args: &[&str]) -> Result<(), ExecutorError> {
        self.client_output(args).map(|_| ())
    }

    fn ensure_image(&self) -> Result<(), ExecutorError> {
        let inspect = Command::new(&self.client)
            .args(["image", "inspect", &self.image])
            .output()
            .map_err(|e| ExecutorError::failed(e.to_string()))?;
        if inspect.status.success() {
            return Ok(());
        }
        info!("Pulling image '{}'.", self.image);
        self.client_check(&["pull", &self.image])
            .map_err(|_| ExecutorError::failed(format!("Cannot find {}.", self.image)))
    }

    fn copy_in(&self, container: &str, source: &Path, dest_dir: &Path) -> Result<(), ExecutorError> {
        debug!(
            "copy-in (cmd): {} cp {} {container}:{}",
            self.client,
            source.display(),
            dest_dir.display()
        );
        self.client_check(&[
            "cp",
            &source.to_string_lossy(),
            &format!("{container}:{}", dest_dir.display()),
        ])
    }

    fn copy_out(&self, container: &str, source: &Path, dest_dir: &Path) -> Result<(), ExecutorError> {
        std::fs::create_dir_all(dest_dir).map_err(|e| ExecutorError::failed(e.to_string()))?;
        debug!(
            "copy-out (cmd): {} cp {container}:{} {}",
            self.client,
            source.display(),
            dest_dir.display()
        );
        self.client_check(&[
            "cp",
            &format!("{container}:{}", source.display()),
            &dest_dir.to_string_lossy(),
        ])
    }

    fn remove(&self, container: &str) {
        let _ = Command::new(&self.client)
            .args(["rm", "-f", container])
            .output();
    }

    fn run_inner(
        &self,
        container: &str,
        spec: &RunSpec,
        log: LogSink,
    ) -> Result<(), ExecutorError> {
        for (source, dest_dir) in &spec.copy_in {
            self.copy_in(container, source, dest_dir)?;
        }

        self.client_check(&["start", container])?;

        let mut logs = Command::new(&self.client);
        logs.args(["logs", "-f", container]);
        processes::run_streamed(&mut logs, spec.timeout, |line| log(line))
            .map_err(ExecutorError::Other)?;

        let status = self.client_output(&["wait", container])?;
        if status != "0" {
            return Err(ExecutorError::in_sandbox(
                format!("Failed to run '{:?}' (status={status}).", spec.cmd),
                container,
            ));
        }

        for (source, dest_dir) in &spec.copy_out {
            if let Err(e) = self.copy_out(container, source, dest_dir) {
                let name = source
                    .file_name()
                    .unwrap_or_default()
                    .to_string_lossy()
                    .into_owned();
                if spec
                    .no_fail_copy_out_allowed_patterns
                    .iter()
                    .any(|p| name.contains(p))
                {
                    debug!("File not found inside container: {}.", source.display());
                    continue;
                }
                return Err(e);
            }
            if spec.dig_holes {
                let target = dest_dir.join(source.file_name().unwrap_or_default());
                if target.is_file() {
                    fileutil::dig_holes(&target)
                        .map_err(|e| ExecutorError::failed(e.to_string()))?;
                }
            }
        }
        Ok(())
    }
}

impl Executor for ContainerExecutor {
    fn description(&self) -> String {
        format!("{}:{}", self.client, self.image)
    }

    fn run(&mut self, spec: &RunSpec, log: LogSink) -> Result<(), ExecutorError> {
        self.ensure_image()?;

        // Placeholder files are rewritten by a sed preamble since files only
        // exist inside the container once it runs.
        let mut script_lines = sed_placeholder_lines(self, spec)?;
        script_lines.extend(spec.cmd.iter().cloned());
        let script = script_lines.join(" && ");

        let mut create_args: Vec<String> =
            vec!["create".into(), "--privileged".into()];
        for assignment in env_assignments(&spec.env)? {
            create_args.push("-e".into());
            create_args.push(assignment);
        }
        create_args.push(self.image.clone());
        create_args.extend(["bash".into(), "-c".into(), script.clone()]);
        let create_args: Vec<&str> = create_args.iter().map(String::as_str).collect();
        let container = self.client_output(&create_args)?;

        info!("Executing '{script}' in {container}...");

        let result = self.run_inner(&container, spec, log);
        match &result {
            Ok(()) => {
                if self.options.clean() {
                    self.remove(&container);
                }
            }
            Err(_) => {
                if self.options.clean_on_error() {
                    self.remove(&container);
                }
            }
        }
        result.map_err(|e| match e {
            ExecutorError::Failed {
                message,
                name: None,
            } => ExecutorError::in_sandbox(message, &container),
            other => other,
        })
    }
}

/// `sed -i` lines replacing every well-known placeholder inside the
/// declared files. `@` never occurs in the builder tree paths, so the
/// token boundaries are unambiguous.
fn sed_placeholder_lines(
    executor: &dyn Executor,
    spec: &RunSpec,
) -> Result<Vec<String>, ExecutorError> {
    if spec.files_with_placeholders.is_empty() {
        return Ok(Vec::new());
    }
    let mut lines = Vec::new();
    for (token, value) in executor.placeholders() {
        if value.contains('@') {
            return Err(ExecutorError::failed(format!(
                "'@' not permitted in builder directory (got {value:?})"
            )));
        }
        let escaped = value
            .replace('\\', "\\\\")
            .replace('&', "\\&")
            .replace('#', "\\#");
        let files: Vec<String> = spec
            .files_with_placeholders
            .iter()
            .map(|f| {
                shell_escape::escape(executor.replace_placeholders(&f.to_string_lossy()).into())
                    .into_owned()
            })
            .collect();
        lines.push(format!(
            "sed -i -- s#{token}#{escaped}#g {}",
            files.join(" ")
        ));
    }
    Ok(lines)
}
