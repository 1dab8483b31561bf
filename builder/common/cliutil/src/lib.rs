//! Provides functions common to all Rust-based CLI programs.

mod logging;

pub use crate::logging::*;

use std::{
    ffi::OsStr,
    fmt::Debug,
    process::{ExitCode, Termination},
};

use itertools::Itertools;

/// Exit code used when a run was cancelled with Ctrl+C after cleanup.
pub const EXIT_CODE_INTERRUPTED: u8 = 1;

/// Wraps a CLI main function to provide the common startup/cleanup logic.
///
/// Installs the SIGINT/SIGTERM flag polled by [`processes`], sets up logging
/// and maps the top-level [`Result`] to the process exit code. A run aborted
/// by SIGINT is reported as an interruption, not a failure, but still exits
/// non-zero.
pub fn cli_main<F, T, E>(main: F, config: LoggingConfig) -> ExitCode
where
    F: FnOnce() -> Result<T, E>,
    T: Termination,
    E: Debug + AsRef<dyn std::error::Error + Send + Sync>,
{
    let flag = processes::interrupt_flag();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        let _ = signal_hook::flag::register(signal, flag.clone());
    }

    let _log_guard = config.setup().unwrap();
    log_current_command_line();

    handle_top_level_result(main())
}

/// Logs the command line of the current process.
pub fn log_current_command_line() {
    let escaped_command = std::env::args()
        .map(|s| shell_escape::escape(s.into()))
        .join(" ");
    tracing::debug!("COMMAND: {}", escaped_command);
}

/// Handles the top-level [`Result`] and returns [`ExitCode`] to be returned.
pub fn handle_top_level_result<T, E>(result: Result<T, E>) -> ExitCode
where
    T: Termination,
    E: Debug + AsRef<dyn std::error::Error + Send + Sync>,
{
    match result {
        Err(error) => {
            let chain = error.as_ref();
            if is_interrupted(chain) {
                eprintln!("{}: Interrupted.", get_current_process_name());
                return ExitCode::from(EXIT_CODE_INTERRUPTED);
            }
            eprintln!("FATAL: {}: {:?}", get_current_process_name(), error);
            ExitCode::FAILURE
        }
        Ok(value) => value.report(),
    }
}

fn is_interrupted(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(e) = current {
        if e.is::<processes::Interrupted>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// Returns the current process name, or `__unknown__` if it failed to get one.
pub fn get_current_process_name() -> String {
    let current_exe = std::env::current_exe().unwrap_or_default();
    current_exe
        .file_name()
        .unwrap_or(OsStr::new("__unknown__"))
        .to_string_lossy()
        .into_owned()
}
