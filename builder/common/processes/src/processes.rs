mod line;

pub use line::{sanitize_line, LineAssembler, MAX_LINE_LENGTH};

use std::{
    io::Read,
    os::unix::process::ExitStatusExt,
    process::{Child, Command, ExitCode, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use nix::sys::signal::Signal;
use tracing::instrument;

lazy_static! {
    static ref INTERRUPTED: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
}

/// The flag set by the SIGINT/SIGTERM handlers installed at program startup.
///
/// Child-process loops poll this flag and tear their sandboxes down before
/// the process exits.
pub fn interrupt_flag() -> Arc<AtomicBool> {
    INTERRUPTED.clone()
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Error returned when a run was aborted by SIGINT rather than by the child
/// failing on its own.
#[derive(Debug)]
pub struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interrupted.")
    }
}

impl std::error::Error for Interrupted {}

/// Runs a child process to completion without output capture.
#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run(cmd: &mut Command) -> Result<ExitStatus> {
    let child = cmd.spawn().with_context(|| format!("Spawning {:?}", cmd.get_program()))?;
    supervise(child, None, |_line| {})
}

pub fn run_and_check(cmd: &mut Command) -> Result<()> {
    let status = run(cmd)?;
    if !status.success() {
        bail!("Command {cmd:?} failed with {status}");
    }
    Ok(())
}

/// Runs a child process, streaming sanitized stdout+stderr lines to
/// `on_line` while waiting, so a full pipe can never deadlock the child.
///
/// An exceeded `timeout` terminates the child and reports failure, exactly
/// like a non-zero exit would.
#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run_streamed<F>(cmd: &mut Command, timeout: Option<Duration>, on_line: F) -> Result<ExitStatus>
where
    F: FnMut(&str) + Send,
{
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Spawning {:?}", cmd.get_program()))?;
    supervise(child, timeout, on_line)
}

fn supervise<F>(mut child: Child, timeout: Option<Duration>, on_line: F) -> Result<ExitStatus>
where
    F: FnMut(&str) + Send,
{
    let deadline = timeout.map(|t| Instant::now() + t);
    let callback = Mutex::new(on_line);

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let status = std::thread::scope(|scope| -> Result<ExitStatus> {
        if let Some(stream) = stdout {
            scope.spawn(|| drain(stream, &callback));
        }
        if let Some(stream) = stderr {
            scope.spawn(|| drain(stream, &callback));
        }

        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if interrupted() {
                terminate(&mut child)?;
                bail!(Interrupted);
            }
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                terminate(&mut child)?;
                bail!("Command timed out after {:?}.", timeout.unwrap());
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    })?;

    Ok(status)
}

/// Reads a stream in 4 KiB chunks and delivers sanitized lines.
fn drain<R: Read, F: FnMut(&str)>(mut stream: R, callback: &Mutex<F>) {
    let mut assembler = LineAssembler::default();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in assembler.push(&chunk[..n]) {
                    (callback.lock().unwrap())(&line);
                }
            }
        }
    }
    if let Some(line) = assembler.finish() {
        (callback.lock().unwrap())(&line);
    }
}

/// SIGTERM first, then SIGKILL after a short grace period.
fn terminate(child: &mut Child) -> Result<()> {
    let pid = nix::unistd::Pid::from_raw(child.id().try_into()?);
    let _ = nix::sys::signal::kill(pid, Signal::SIGTERM);
    for _ in 0..50 {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    let _ = child.kill();
    let _ = child.wait();
    Ok(())
}

/// Converts [`ExitStatus`] to [`ExitCode`] following the POSIX shell
/// convention.
///
/// It panics if [`ExitStatus`] does not represent a status of an exiting
/// process (e.g. process being stopped or continued). This won't happen as
/// long as you get [`ExitStatus`] from [`std::process`] methods.
pub fn status_to_exit_code(status: &ExitStatus) -> ExitCode {
    if let Some(code) = status.code() {
        ExitCode::from(code as u8)
    } else if let Some(signal) = status.signal() {
        ExitCode::from(128 + signal as u8)
    } else {
        panic!("ExitStatus does not represent process exit: {:?}", status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_process() -> Result<()> {
        run_and_check(&mut Command::new("true"))?;
        Ok(())
    }

    #[test]
    fn runs_failed_process() -> Result<()> {
        run(&mut Command::new("false"))?;
        assert!(run_and_check(&mut Command::new("false")).is_err());
        Ok(())
    }

    #[test]
    fn streams_lines() -> Result<()> {
        let mut lines = Vec::new();
        let status = run_streamed(
            Command::new("sh").arg("-c").arg("echo one; echo two 1>&2"),
            None,
            |line| lines.push(line.to_string()),
        )?;
        assert!(status.success());
        lines.sort();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        Ok(())
    }

    #[test]
    fn timeout_is_a_failure() {
        let result = run_streamed(
            Command::new("sleep").arg("5"),
            Some(Duration::from_millis(200)),
            |_| {},
        );
        assert!(result.is_err());
    }
}
