//! Thin wrapper around external tool invocation.
//!
//! Every third-party tool the builder shells out to (`sfdisk`, `mkfs.fat`,
//! `mkfs.ext4`, `bsdtar`, `mcopy`, `dd`, `chroot`, the target package
//! manager, `unshare`, `newuidmap`/`newgidmap`) goes through [`Cmd`] so
//! failures carry the full command line and a caller-supplied hint.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

/// Check if a command exists on the host system.
pub fn exists(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Builder for a single external tool invocation.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    stdin: Option<Vec<u8>>,
    current_dir: Option<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
    quiet: bool,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdin: None,
            current_dir: None,
            error_msg: None,
            allow_fail: false,
            quiet: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.as_os_str().to_os_string());
        self
    }

    /// Feed the given bytes to the tool's stdin (e.g. an sfdisk script).
    pub fn stdin_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// A non-zero exit becomes `Ok(status)` instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Discard the tool's stdout/stderr instead of inheriting them.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Hint appended to the error when the tool fails.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    fn render(&self) -> String {
        let mut line = self.program.clone();
        for a in &self.args {
            line.push(' ');
            line.push_str(&a.to_string_lossy());
        }
        line
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run the tool, inheriting stdio, and check its exit status.
    pub fn run(self) -> Result<ExitStatus> {
        debug!("running: {}", self.render());
        let mut cmd = self.command();
        if self.quiet {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        if self.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        if let Some(bytes) = &self.stdin {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin
                .write_all(bytes)
                .with_context(|| format!("failed to write stdin of '{}'", self.program))?;
        }

        let status = child
            .wait()
            .with_context(|| format!("failed to wait for '{}'", self.program))?;

        if !status.success() && !self.allow_fail {
            let hint = self
                .error_msg
                .as_deref()
                .map(|m| format!("\n{}", m))
                .unwrap_or_default();
            bail!("'{}' failed with {}{}", self.render(), status, hint);
        }
        Ok(status)
    }

    /// Run the tool and capture stdout as a string, checking the exit status.
    pub fn read(self) -> Result<String> {
        debug!("running (capture): {}", self.render());
        let mut cmd = self.command();
        cmd.stdout(Stdio::piped());
        if self.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.program))?;
        if let Some(bytes) = &self.stdin {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin
                .write_all(bytes)
                .with_context(|| format!("failed to write stdin of '{}'", self.program))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for '{}'", self.program))?;

        if !output.status.success() && !self.allow_fail {
            let hint = self
                .error_msg
                .as_deref()
                .map(|m| format!("\n{}", m))
                .unwrap_or_default();
            bail!("'{}' failed with {}{}", self.render(), output.status, hint);
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exists() {
        assert!(exists("ls"));
        assert!(!exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_run_success() {
        Cmd::new("true").run().unwrap();
    }

    #[test]
    fn test_run_failure() {
        let err = Cmd::new("false").error_msg("hint text").run().unwrap_err();
        assert!(err.to_string().contains("hint text"));
    }

    #[test]
    fn test_allow_fail() {
        let status = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_read_with_stdin() {
        let out = Cmd::new("cat").stdin_bytes("hello").read().unwrap();
        assert_eq!(out, "hello");
    }
}
