//! External-process seam for the packet-filter, set and routing tools.
//!
//! Reconciliation shells out to `ipset`, `iptables`/`ip6tables` and `ip`.
//! Going through [`CommandExecutor`] lets unit tests script tool responses.

use anyhow::{Context, Result};
use std::io::Write;
use std::process::{Command, Stdio};

#[cfg(test)]
use mockall::automock;

use crate::error::PbrError;

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code 0
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: String::new(),
            success: true,
            code: Some(0),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.to_string(),
            success: false,
            code: Some(code),
        }
    }

    /// Diagnostic text to attach to an error: stderr, else stdout.
    pub fn diagnostic(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }

    /// Turn a non-zero exit into an external-tool error for `object`.
    pub fn check(self, tool: &str, object: impl Into<String>) -> crate::error::Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(PbrError::tool(tool, object, self.diagnostic()))
        }
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
            code: output.status.code(),
        }
    }
}

/// Runs external commands. Mockable in tests.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    /// Execute with `stdin` piped to the child (e.g. `ipset restore`).
    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput>;
}

/// Runs real system commands.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map(CommandOutput::from)
            .with_context(|| format!("Failed to run {} {}", cmd, args.join(" ")))
    }

    fn execute_with_stdin(
        &self,
        cmd: &str,
        args: &[String],
        stdin_data: &str,
    ) -> Result<CommandOutput> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to run {}", cmd))?;

        // Dropping the handle closes the pipe so the tool sees EOF
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(stdin_data.as_bytes())
                .with_context(|| format!("Failed to feed {} on stdin", cmd))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for {}", cmd))?;

        Ok(CommandOutput::from(output))
    }
}

/// `&[&str]` to the `&[String]` the trait takes (mockall and `&[&str]` lifetimes don't mix).
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_to_strings() {
        let args = args_to_strings(&["rule", "show"]);
        assert_eq!(args, vec!["rule", "show"]);
    }

    #[test]
    fn test_check_wraps_failure_with_object() {
        let err = CommandOutput::failed(2, "ipset v7.1: The set with the given name does not exist\n")
            .check("ipset", "set vpn")
            .unwrap_err();
        match err {
            PbrError::ExternalTool {
                tool,
                object,
                output,
            } => {
                assert_eq!(tool, "ipset");
                assert_eq!(object, "set vpn");
                assert!(output.ends_with("does not exist"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(CommandOutput::ok("").check("ip", "x").is_ok());
    }

    #[test]
    fn test_diagnostic_falls_back_to_stdout() {
        let out = CommandOutput {
            stdout: "details\n".to_string(),
            stderr: "  ".to_string(),
            success: false,
            code: Some(1),
        };
        assert_eq!(out.diagnostic(), "details");
    }

    #[test]
    fn test_real_command_executor_execute_echo() {
        let executor = RealCommandExecutor::new();
        let output = executor
            .execute("echo", &args_to_strings(&["-n", "hello"]))
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "hello");
    }

    #[test]
    fn test_real_command_executor_with_stdin() {
        let executor = RealCommandExecutor::new();
        let output = executor
            .execute_with_stdin("cat", &[], "create vpn hash:net")
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "create vpn hash:net");
    }

    #[test]
    fn test_real_command_executor_missing_binary() {
        let executor = RealCommandExecutor::new();
        assert!(executor.execute("/nonexistent/ipset", &[]).is_err());
    }
}
