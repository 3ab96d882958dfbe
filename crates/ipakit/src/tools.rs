//! External tool invocation.
//!
//! The pipeline shells out to `codesign`, `security`, `actool` and
//! `xcrun altool`. All of them go through [`ToolRunner`] so tests can
//! substitute a recording fake for the host tools.

use crate::{Error, Result};
use std::ffi::OsString;
use std::process::Command;
use tracing::{debug, error};

/// Captured result of one tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Exit status; `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Diagnostic text for error reporting: stderr, or stdout when the tool
    /// wrote nothing to stderr.
    pub fn diagnostic(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else {
            self.stderr.clone()
        }
    }
}

/// Runs an external program to completion.
pub trait ToolRunner: Send + Sync {
    /// Runs `program` with `args` and captures its output.
    ///
    /// Returns `Err` only if the process could not be started; a non-zero
    /// exit is reported through [`ToolOutput::status`].
    fn run(&self, program: &str, args: &[OsString]) -> Result<ToolOutput>;

    /// Runs the program and turns a non-zero exit into
    /// [`Error::ExternalTool`] carrying the tool's diagnostic text.
    fn run_checked(&self, program: &str, args: &[OsString]) -> Result<ToolOutput> {
        let output = self.run(program, args)?;
        if !output.success() {
            let message = output.diagnostic();
            error!(tool = program, status = ?output.status, "{}", message.trim());
            return Err(Error::external_tool(program, message));
        }
        Ok(output)
    }
}

/// [`ToolRunner`] backed by [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemToolRunner;

impl ToolRunner for SystemToolRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<ToolOutput> {
        debug!(tool = program, args = %redacted(args), "running external tool");

        let output = Command::new(program).args(args).output().map_err(|e| {
            error!("Failed to execute {}: {}", program, e);
            Error::external_tool(program, format!("failed to execute: {}", e))
        })?;

        Ok(ToolOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Flags whose following argument is a secret.
const SECRET_FLAGS: &[&str] = &["-p", "-P", "--password"];

/// Renders an argument list for logs with password values masked.
pub fn redacted(args: &[OsString]) -> String {
    let mut rendered = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        let arg = arg.to_string_lossy();
        if hide_next {
            rendered.push("<hidden>".to_string());
            hide_next = false;
            continue;
        }
        hide_next = SECRET_FLAGS.contains(&arg.as_ref());
        rendered.push(arg.into_owned());
    }
    rendered.join(" ")
}

/// Builds an owned argument vector from anything string-like.
///
/// ```
/// let args = ipakit::tools::args(["--force", "--sign", "ABC"]);
/// assert_eq!(args.len(), 3);
/// ```
pub fn args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    items.into_iter().map(Into::into).collect()
}
