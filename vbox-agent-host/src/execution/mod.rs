//! Process execution for the agent
//!
//! Runs an external program to completion and captures both streams.
//! VBoxManage reports failures on stderr, so callers work with the captured
//! text rather than the exit code.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Captured output of one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[cfg(test)]
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn stderr(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn has_error(&self) -> bool {
        !self.stderr.trim().is_empty()
    }
}

/// Runs a program with arguments and returns what it printed
#[async_trait]
pub trait Execute: Send + Sync {
    /// Never fails: a process that cannot be spawned is reported through `stderr`
    async fn execute(&self, program: &str, args: &[String]) -> CommandOutput;
}

/// Production executor backed by `tokio::process`
pub struct ProcessExecutor;

#[async_trait]
impl Execute for ProcessExecutor {
    async fn execute(&self, program: &str, args: &[String]) -> CommandOutput {
        debug!("Execute: {} {:?}", program, args);

        let output = AsyncCommand::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match output {
            Ok(output) => CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            },
            Err(e) => CommandOutput::stderr(format!("Failed to execute {}: {}", program, e)),
        }
    }
}
