use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Command;

use qrexec::{create_dispvm, encode_for_vmexec, kill_vm, start_vm, ServiceCall};
use scopeguard::ScopeGuard;
use tracing::{debug, info};

use crate::{env_assignments, Executor, ExecutorError, ExecutorOptions, LogSink, RunSpec};

const QVM_RUN_VM: &str = "/usr/bin/qvm-run-vm";
const QFILE_AGENT: &str = "/usr/lib/qubes/qfile-agent";
const COPY_IN_SERVICE: &str = "qubesbuilder.FileCopyIn";
const COPY_OUT_SERVICE: &str = "qubesbuilder.FileCopyOut";

/// Runs build steps inside a fresh disposable VM reached over qrexec.
///
/// The VM is created from the configured dispvm template, used for exactly
/// one `run`, and killed (never shut down gracefully) on every exit path.
pub struct QubesExecutor {
    dispvm_template: String,
    rpc_services_dir: PathBuf,
    options: ExecutorOptions,
    host_name: String,
}

impl QubesExecutor {
    pub fn new(options: ExecutorOptions) -> Self {
        let template = match options.dispvm.as_deref() {
            None | Some("@dispvm") => "dom0".to_string(),
            Some(template) => template.to_string(),
        };
        let host_name = std::fs::read_to_string("/proc/sys/kernel/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        Self {
            dispvm_template: template,
            rpc_services_dir: options
                .rpc_services_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("rpc")),
            options,
            host_name,
        }
    }

    fn sandbox_err(&self, dispvm: &str, error: anyhow::Error) -> ExecutorError {
        ExecutorError::in_sandbox(error.to_string(), dispvm)
    }

    fn copy_in(&self, dispvm: &str, source: &Path, dest_dir: &Path) -> Result<(), ExecutorError> {
        let source = source
            .canonicalize()
            .map_err(|e| ExecutorError::failed(format!("{}: {e}", source.display())))?;
        let dest = dest_dir.join(source.file_name().unwrap_or_default());
        let service = format!("{COPY_IN_SERVICE}+{}", encode_for_vmexec(&dest.to_string_lossy()));
        ServiceCall::new("copy-in", dispvm, &service)
            .args([QFILE_AGENT.to_string(), source.to_string_lossy().into_owned()])
            .run()
            .map(|_| ())
            .map_err(|e| self.sandbox_err(dispvm, e))
    }

    fn copy_out(
        &self,
        dispvm: &str,
        source: &Path,
        dest_dir: &Path,
        dig_holes: bool,
    ) -> Result<(), ExecutorError> {
        let dest_path = dest_dir.join(source.file_name().unwrap_or_default());
        fileutil::remove_path(&dest_path).map_err(|e| ExecutorError::failed(e.to_string()))?;
        std::fs::create_dir_all(dest_dir).map_err(|e| ExecutorError::failed(e.to_string()))?;

        let unpacker = if Path::new("/usr/bin/qfile-unpacker").exists() {
            "/usr/bin/qfile-unpacker"
        } else {
            "/usr/lib/qubes/qfile-unpacker"
        };
        let service = format!(
            "{COPY_OUT_SERVICE}+{}",
            encode_for_vmexec(&source.to_string_lossy())
        );
        ServiceCall::new("copy-out", dispvm, &service)
            .args([
                unpacker.to_string(),
                nix::unistd::Uid::current().to_string(),
                dest_dir.to_string_lossy().into_owned(),
            ])
            .run()
            .map_err(|e| self.sandbox_err(dispvm, e))?;

        if dig_holes && dest_path.is_file() {
            debug!("copy-out (detect zeroes and replace with holes)");
            fileutil::dig_holes(&dest_path)
                .map_err(|e| self.sandbox_err(dispvm, e))?;
        }
        Ok(())
    }

    /// Installs the two trusted file-copy RPC services into the dispvm and
    /// prepares the /builder tree.
    fn prepare_dispvm(&self, dispvm: &str) -> Result<(), ExecutorError> {
        ServiceCall::new("copy builder rpc services", dispvm, "qubes.Filecopy")
            .options(["--filter-escape-chars-stderr"])
            .args([
                QFILE_AGENT.to_string(),
                self.rpc_services_dir
                    .join(COPY_IN_SERVICE)
                    .to_string_lossy()
                    .into_owned(),
                self.rpc_services_dir
                    .join(COPY_OUT_SERVICE)
                    .to_string_lossy()
                    .into_owned(),
            ])
            .run()
            .map_err(|e| self.sandbox_err(dispvm, e))?;

        let incoming = format!("/home/{}/QubesIncoming/{}", self.user(), self.host_name);
        let builder_dir = self.builder_dir().display().to_string();
        let prep: Vec<Vec<String>> = vec![
            vec![
                "sudo".into(), "mkdir".into(), "-p".into(), "--".into(),
                builder_dir.clone(),
                format!("{builder_dir}/build"),
                format!("{builder_dir}/plugins"),
                format!("{builder_dir}/distfiles"),
                "/usr/local/etc/qubes-rpc".into(),
            ],
            vec![
                "sudo".into(), "mv".into(), "-f".into(), "--".into(),
                format!("{incoming}/{COPY_IN_SERVICE}"),
                format!("{incoming}/{COPY_OUT_SERVICE}"),
                "/usr/local/etc/qubes-rpc/".into(),
            ],
            vec![
                "sudo".into(), "chmod".into(), "+x".into(), "--".into(),
                format!("/usr/local/etc/qubes-rpc/{COPY_IN_SERVICE}"),
                format!("/usr/local/etc/qubes-rpc/{COPY_OUT_SERVICE}"),
            ],
            vec![
                "sudo".into(), "bash".into(), "-c".into(),
                "if [ -x /usr/sbin/restorecon ]; then restorecon -R /usr/local/etc/qubes-rpc/; fi;".into(),
            ],
            vec![
                "sudo".into(), "chown".into(), "-R".into(), "--".into(),
                format!("{}:{}", self.user(), self.group()),
                builder_dir,
            ],
        ];
        let script = prep.iter().map(|cmd| quote_list(cmd)).collect::<Vec<_>>().join(" && ");
        self.vm_run(dispvm, &script, None, &mut |_| {})
    }

    /// Runs a shell line inside the dispvm via qvm-run-vm, streaming output.
    fn vm_run(
        &self,
        dispvm: &str,
        script: &str,
        timeout: Option<std::time::Duration>,
        log: LogSink,
    ) -> Result<(), ExecutorError> {
        let mut cmd = Command::new(QVM_RUN_VM);
        cmd.arg("--").arg(dispvm).arg(script);
        debug!("{QVM_RUN_VM} -- {dispvm} {script}");
        let status = processes::run_streamed(&mut cmd, timeout, |line| log(line))
            .map_err(ExecutorError::Other)?;
        if !status.success() {
            return Err(ExecutorError::in_sandbox(
                format!("Failed to run '{script}' (status={}).", status.code().unwrap_or(-1)),
                dispvm,
            ));
        }
        Ok(())
    }

    fn substitute_placeholders(&self, dispvm: &str, spec: &RunSpec) -> Result<(), ExecutorError> {
        if spec.files_with_placeholders.is_empty() {
            return Ok(());
        }
        let files: Vec<String> = spec
            .files_with_placeholders
            .iter()
            .map(|f| self.replace_placeholders(&f.to_string_lossy()))
            .collect();
        let mut sed_args: Vec<String> = vec!["sed".into(), "-i".into()];
        for (token, value) in self.placeholders() {
            if value.contains('@') {
                return Err(ExecutorError::failed(format!(
                    "'@' not permitted in builder directory (got {value:?})"
                )));
            }
            let escaped = value
                .replace('\\', "\\\\")
                .replace('&', "\\&")
                .replace('#', "\\#");
            sed_args.push("-e".into());
            sed_args.push(format!("s#{token}#{escaped}#g"));
        }
        sed_args.push("--".into());
        sed_args.extend(files);
        self.vm_run(dispvm, &quote_list(&sed_args), None, &mut |_| {})
    }

    fn run_inner(&self, dispvm: &str, spec: &RunSpec, log: LogSink) -> Result<(), ExecutorError> {
        self.prepare_dispvm(dispvm)?;

        // Deterministic ingress order keeps later copies winning regardless
        // of the caller-supplied ordering.
        let mut copy_in = spec.copy_in.clone();
        copy_in.sort_by(|a, b| a.1.cmp(&b.1));
        copy_in.dedup();
        for (source, dest_dir) in &copy_in {
            self.copy_in(dispvm, source, dest_dir)?;
        }

        self.substitute_placeholders(dispvm, spec)?;

        let mut command: Vec<String> = vec!["env".into(), "--".into()];
        command.extend(env_assignments(&spec.env)?);
        command.extend(["bash".into(), "-c".into(), spec.cmd.join(" && ")]);

        info!("Using executor qubes:{dispvm}.");
        self.vm_run(dispvm, &quote_list(&command), spec.timeout, log)?;

        let mut copy_out = spec.copy_out.clone();
        copy_out.sort_by(|a, b| a.1.cmp(&b.1));
        copy_out.dedup();
        for (source, dest_dir) in &copy_out {
            if let Err(e) = self.copy_out(dispvm, source, dest_dir, spec.dig_holes) {
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
                    debug!("File not found inside dispvm: {}.", source.display());
                    continue;
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Executor for QubesExecutor {
    fn description(&self) -> String {
        format!("qubes:{}", self.dispvm_template)
    }

    fn run(&mut self, spec: &RunSpec, log: LogSink) -> Result<(), ExecutorError> {
        let dispvm =
            create_dispvm(&self.dispvm_template).map_err(ExecutorError::Other)?;

        // Kill the dispvm if anything unwinds; the ordinary paths below
        // defuse this and apply the configured clean policy instead.
        let guard = scopeguard::guard(dispvm.clone(), |vm| kill_vm(&vm));

        let result = start_vm(&dispvm)
            .map_err(|e| self.sandbox_err(&dispvm, e))
            .and_then(|_| self.run_inner(&dispvm, spec, log));

        match &result {
            Ok(()) => {
                if self.options.clean() {
                    kill_vm(&dispvm);
                }
            }
            Err(_) => {
                if self.options.clean_on_error() {
                    kill_vm(&dispvm);
                }
            }
        }
        let _ = ScopeGuard::into_inner(guard);
        result
    }
}

fn quote_list(args: &[String]) -> String {
    args.iter()
        .map(|a| shell_escape::escape(Cow::from(a.as_str())).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
