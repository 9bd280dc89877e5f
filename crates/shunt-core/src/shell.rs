//! Shell command execution.
//!
//! All kernel state that isn't reachable through a pseudo-file (routing
//! tables, policy rules, sysctls, netfilter) is driven through external
//! commands. Calls are synchronous and blocking; they are short and rare
//! compared to the event rate.

use std::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("cannot spawn `{command}`")]
pub struct ShellError {
    pub command: String,
    #[source]
    pub source: std::io::Error,
}

/// What a finished command left behind. A non-zero exit status is data,
/// not an error: callers decide how loud to be about it.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

pub trait CommandExecutor: Send + Sync {
    fn execute(&self, command: &str) -> Result<CommandOutput, ShellError>;
}

/// Production executor: `sh -c <command>`.
pub struct ShellExecutor;

impl CommandExecutor for ShellExecutor {
    fn execute(&self, command: &str) -> Result<CommandOutput, ShellError> {
        log::debug!("executing: {command}");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|source| ShellError {
                command: command.to_string(),
                source,
            })?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        })
    }
}
