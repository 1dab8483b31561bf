//! Sandboxed command runners.
//!
//! An executor runs one sealed build step inside an isolation environment —
//! the host itself, an OCI container, or a disposable VM — with file
//! ingress/egress, environment handoff and guaranteed teardown. A command's
//! lines are joined with `&&` and executed under a shell; stdout and stderr
//! are streamed line-by-line to the caller's log sink.

mod container;
mod local;
mod qubes;
mod spec;

pub use container::ContainerExecutor;
pub use local::LocalExecutor;
pub use qubes::QubesExecutor;
pub use spec::{new_executor, ExecutorOptions, ExecutorSpec};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Root of the sandbox-side working tree.
pub const BUILDER_DIR: &str = "/builder";

/// Sandbox failure. Carries the VM or container name when one was involved.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{message}")]
    Failed {
        message: String,
        name: Option<String>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            name: None,
        }
    }

    pub fn in_sandbox(message: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            name: Some(name.into()),
        }
    }

    pub fn sandbox_name(&self) -> Option<&str> {
        match self {
            Self::Failed { name, .. } => name.as_deref(),
            Self::Other(_) => None,
        }
    }
}

/// One `run` invocation: commands plus everything that moves across the
/// sandbox boundary.
#[derive(Default)]
pub struct RunSpec {
    /// Command lines, joined with `&&` and run under `bash -c`.
    pub cmd: Vec<String>,
    /// (host path, sandbox directory) pairs staged before the command.
    pub copy_in: Vec<(PathBuf, PathBuf)>,
    /// (sandbox path, host directory) pairs retrieved after exit 0.
    pub copy_out: Vec<(PathBuf, PathBuf)>,
    pub env: BTreeMap<String, String>,
    /// Files already inside the sandbox whose placeholder tokens are
    /// substituted before the command runs. The paths themselves may
    /// contain placeholders.
    pub files_with_placeholders: Vec<PathBuf>,
    /// Copy-out failures are tolerated when the file name contains one of
    /// these patterns (optional artifacts such as `-debuginfo` packages).
    pub no_fail_copy_out_allowed_patterns: Vec<String>,
    /// Punch zero ranges into holes on copied-out files (sparse images).
    pub dig_holes: bool,
    pub timeout: Option<Duration>,
}

/// Line sink for streamed sandbox output.
pub type LogSink<'a> = &'a mut (dyn FnMut(&str) + Send);

pub trait Executor {
    /// Short description for log messages, e.g. `qubes:disp1234`.
    fn description(&self) -> String;

    fn user(&self) -> String {
        "user".to_string()
    }

    fn group(&self) -> String {
        "user".to_string()
    }

    fn builder_dir(&self) -> PathBuf {
        PathBuf::from(BUILDER_DIR)
    }

    fn build_dir(&self) -> PathBuf {
        self.builder_dir().join("build")
    }

    fn plugins_dir(&self) -> PathBuf {
        self.builder_dir().join("plugins")
    }

    fn sources_dir(&self) -> PathBuf {
        self.builder_dir().join("sources")
    }

    fn distfiles_dir(&self) -> PathBuf {
        self.builder_dir().join("distfiles")
    }

    fn repository_dir(&self) -> PathBuf {
        self.builder_dir().join("repository")
    }

    fn cache_dir(&self) -> PathBuf {
        self.builder_dir().join("cache")
    }

    fn dependencies_dir(&self) -> PathBuf {
        self.builder_dir().join("dependencies")
    }

    /// Well-known placeholder tokens and the sandbox paths they stand for.
    fn placeholders(&self) -> Vec<(String, String)> {
        vec![
            ("@BUILDER_DIR@".to_string(), path_str(&self.builder_dir())),
            ("@BUILD_DIR@".to_string(), path_str(&self.build_dir())),
            ("@PLUGINS_DIR@".to_string(), path_str(&self.plugins_dir())),
            ("@DISTFILES_DIR@".to_string(), path_str(&self.distfiles_dir())),
            (
                "@DEPENDENCIES_DIR@".to_string(),
                path_str(&self.dependencies_dir()),
            ),
        ]
    }

    fn replace_placeholders(&self, s: &str) -> String {
        let mut result = s.to_string();
        for (token, value) in self.placeholders() {
            result = result.replace(&token, &value);
        }
        result
    }

    /// Runs the spec to completion. Copy-ins, placeholder substitution, the
    /// command itself, then copy-outs; any non-zero exit raises. The sandbox
    /// is destroyed on all exit paths according to the clean options.
    fn run(&mut self, spec: &RunSpec, log: LogSink) -> Result<(), ExecutorError>;
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Formats the env prefix used when handing environment over a shell
/// boundary; variable names must not contain `=`.
pub(crate) fn env_assignments(
    env: &BTreeMap<String, String>,
) -> Result<Vec<String>, ExecutorError> {
    let mut assignments = Vec::new();
    for (key, value) in env {
        if key.contains('=') {
            return Err(ExecutorError::failed(
                "Environment variable name cannot contain '='",
            ));
        }
        assignments.push(format!("{key}={value}"));
    }
    Ok(assignments)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeExecutor;

    impl Executor for FakeExecutor {
        fn description(&self) -> String {
            "fake".to_string()
        }

        fn run(&mut self, _spec: &RunSpec, _log: LogSink) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    #[test]
    fn placeholders_map_to_builder_tree() {
        let executor = FakeExecutor;
        let replaced =
            executor.replace_placeholders("@PLUGINS_DIR@/chroot_rpm/mock/fedora-32.cfg");
        assert_eq!(replaced, "/builder/plugins/chroot_rpm/mock/fedora-32.cfg");

        let untouched = executor.replace_placeholders("no tokens here @UNKNOWN@");
        assert_eq!(untouched, "no tokens here @UNKNOWN@");
    }

    #[test]
    fn env_names_may_not_contain_equals() {
        let mut env = BTreeMap::new();
        env.insert("A=B".to_string(), "x".to_string());
        assert!(env_assignments(&env).is_err());
    }
}
