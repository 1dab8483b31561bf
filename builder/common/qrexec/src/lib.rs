//! Client-side plumbing for qrexec service calls, including the admin API
//! used to manage disposable VMs.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use processes::sanitize_line;
use regex::Regex;
use tracing::debug;

const QREXEC_CLIENT_VM: &str = "/usr/lib/qubes/qrexec-client-vm";

lazy_static! {
    static ref DISPVM_NAME_RE: Regex = Regex::new(r"\Adisp(0|[1-9][0-9]{0,8})\z").unwrap();
}

/// Encodes a path for use as a qrexec service argument.
///
/// Bytes outside `[A-Za-z0-9_.]` become `-HH`; `-` itself doubles to `--`,
/// e.g. `/a/b-c.d` encodes to `-2Fa-2Fb--c.d`.
pub fn encode_for_vmexec(input: &str) -> String {
    let mut encoded = String::new();
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' => encoded.push(byte as char),
            b'-' => encoded.push_str("--"),
            _ => encoded.push_str(&format!("-{:02X}", byte)),
        }
    }
    encoded
}

/// One qrexec service invocation against a VM.
pub struct ServiceCall<'a> {
    /// Human-readable description used in error messages ("start vm", ...).
    pub what: &'a str,
    pub vm: &'a str,
    pub service: &'a str,
    pub args: Vec<String>,
    pub options: Vec<String>,
    pub stdin: Vec<u8>,
    pub ignore_errors: bool,
}

impl<'a> ServiceCall<'a> {
    pub fn new(what: &'a str, vm: &'a str, service: &'a str) -> Self {
        Self {
            what,
            vm,
            service,
            args: Vec::new(),
            options: Vec::new(),
            stdin: Vec::new(),
            ignore_errors: false,
        }
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn options<I: IntoIterator<Item = S>, S: Into<String>>(mut self, options: I) -> Self {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn ignore_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    /// Runs the call and returns its stdout. Replies of `admin.*` services
    /// carry a `0\0` prefix on success; any other prefix is a failure whose
    /// payload is the error message.
    pub fn run(&self) -> Result<Vec<u8>> {
        let mut cmd = Command::new(QREXEC_CLIENT_VM);
        cmd.args(&self.options)
            .arg("--")
            .arg(self.vm)
            .arg(self.service)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("qrexec call ({}): {:?}", self.what, cmd);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to {}: cannot spawn qrexec client", self.what))?;

        // Admin services expect stdin to be closed before replying.
        {
            let mut stdin = child.stdin.take().unwrap();
            if !self.stdin.is_empty() {
                let _ = stdin.write_all(&self.stdin);
            }
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to {}", self.what))?;

        if !output.status.success() && !self.ignore_errors {
            let content = sanitize_line(strip_newline(&output.stderr));
            bail!("Failed to {}: {}", self.what, content);
        }

        if self.service.starts_with("admin.") {
            return self.parse_admin_reply(&output.stdout);
        }
        Ok(output.stdout)
    }

    fn parse_admin_reply(&self, stdout: &[u8]) -> Result<Vec<u8>> {
        if stdout.starts_with(b"0\x00") {
            return Ok(stdout[2..].to_vec());
        }
        let payload: Vec<u8> = stdout
            .iter()
            .skip(2)
            .map(|&b| if b == 0 { b'\n' } else { b })
            .collect();
        let message = sanitize_line(&payload);
        if self.ignore_errors {
            debug!("Failed to {}: qrexec call failed: {}", self.what, message);
            return Ok(Vec::new());
        }
        bail!("Failed to {}: qrexec call failed: {}", self.what, message);
    }
}

fn strip_newline(data: &[u8]) -> &[u8] {
    data.strip_suffix(b"\n").unwrap_or(data)
}

/// Creates a disposable VM from the given template and returns its name.
pub fn create_dispvm(template: &str) -> Result<String> {
    let stdout = ServiceCall::new("create disposable qube", template, "admin.vm.CreateDisposable")
        .run()?;
    let name = String::from_utf8(stdout).context("Failed to obtain disposable qube name")?;
    if !DISPVM_NAME_RE.is_match(&name) {
        bail!("Failed to create disposable qube.");
    }
    Ok(name)
}

pub fn start_vm(vm: &str) -> Result<()> {
    ServiceCall::new("start vm", vm, "admin.vm.Start").run()?;
    Ok(())
}

/// Kills a VM; failures are ignored so that teardown never masks the
/// original error.
pub fn kill_vm(vm: &str) {
    let _ = ServiceCall::new("kill vm", vm, "admin.vm.Kill")
        .ignore_errors()
        .run();
}

pub fn remove_vm(vm: &str) -> Result<()> {
    ServiceCall::new("remove vm", vm, "admin.vm.Remove").run()?;
    Ok(())
}

/// Returns the VM's power state as reported by `admin.vm.CurrentState`.
pub fn vm_state(vm: &str) -> Result<String> {
    let response = ServiceCall::new("query vm state", vm, "admin.vm.CurrentState").run()?;
    let response = String::from_utf8(response).context("Invalid admin.vm.CurrentState reply")?;
    for state in response.split_whitespace() {
        if let Some(value) = state.strip_prefix("power_state=") {
            return Ok(value.to_string());
        }
    }
    bail!("Invalid response from admin.vm.CurrentState for '{}'", vm);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encodes_path_for_vmexec() {
        assert_eq!(encode_for_vmexec("/a/b-c.d"), "-2Fa-2Fb--c.d");
        assert_eq!(encode_for_vmexec("plain_name.txt"), "plain_name.txt");
        assert_eq!(encode_for_vmexec("sp ace"), "sp-20ace");
    }

    #[test]
    fn dispvm_names_are_validated() {
        assert!(DISPVM_NAME_RE.is_match("disp0"));
        assert!(DISPVM_NAME_RE.is_match("disp123456789"));
        assert!(!DISPVM_NAME_RE.is_match("disp01"));
        assert!(!DISPVM_NAME_RE.is_match("work"));
        assert!(!DISPVM_NAME_RE.is_match("disp1234567890"));
    }
}
