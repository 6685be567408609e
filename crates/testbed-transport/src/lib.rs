//! Remote execution for testbed hosts
//!
//! Steps never talk to a host directly. They render a [`Script`] and hand it
//! to a [`Transport`], which runs it over SSH or on the local machine and
//! returns the captured output. Scripts signal that they mutated the host by
//! printing [`CHANGED_MARKER`].

pub mod local;
pub mod process;
pub mod retry;
pub mod script;
pub mod ssh;

pub use local::LocalTransport;
pub use retry::{poll_until, retry, RetryPolicy, WaitError};
pub use script::{encode_powershell, ps_quote, sh_quote, Script, Shell};
pub use ssh::SshTransport;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

/// Line printed by a script when it changed host state
pub const CHANGED_MARKER: &str = "__testbed_changed__";

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Command on {target} failed ({status}): {stderr}")]
    CommandFailed {
        target: String,
        status: String,
        stderr: String,
    },

    #[error("Transfer of {path} to {target} failed: {message}")]
    Transfer {
        target: String,
        path: String,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured result of one script or helper invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Whether the script reported a state change
    pub fn changed(&self) -> bool {
        self.stdout.lines().any(|line| line.trim() == CHANGED_MARKER)
    }

    /// Stdout without the change marker, trimmed
    pub fn payload(&self) -> String {
        self.stdout
            .lines()
            .filter(|line| line.trim() != CHANGED_MARKER)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    pub fn status_text(&self) -> String {
        match self.status {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// A host scripts can be run on
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human readable target, used in logs and errors
    fn target(&self) -> String;

    /// Shell dialect the host expects scripts in
    fn shell(&self) -> Shell;

    /// Run a script and capture its output without checking the exit code
    async fn execute(&self, script: &Script) -> Result<CommandOutput, TransportError>;

    /// Copy a local file to `remote`
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError>;

    /// Mirror a local directory into `remote`, returning whether anything was
    /// transferred
    async fn sync_dir(&self, local: &Path, remote: &str) -> Result<bool, TransportError>;

    /// Run a script and fail unless it exits successfully
    async fn run(&self, script: &Script) -> Result<CommandOutput, TransportError> {
        let output = self.execute(script).await?;
        if !output.success() {
            let stderr = if output.stderr.trim().is_empty() {
                output.payload()
            } else {
                output.stderr.trim().to_string()
            };
            return Err(TransportError::CommandFailed {
                target: self.target(),
                status: output.status_text(),
                stderr,
            });
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_marker_detection() {
        let output = CommandOutput {
            status: Some(0),
            stdout: format!("installing\n{}\r\n", CHANGED_MARKER),
            stderr: String::new(),
        };
        assert!(output.success());
        assert!(output.changed());
        assert_eq!(output.payload(), "installing");
    }

    #[test]
    fn test_unchanged_output() {
        let output = CommandOutput {
            status: Some(0),
            stdout: "{\"thumbprint\":\"AB\"}\n".to_string(),
            stderr: String::new(),
        };
        assert!(!output.changed());
        assert_eq!(output.payload(), "{\"thumbprint\":\"AB\"}");
    }

    #[test]
    fn test_status_text() {
        let failed = CommandOutput {
            status: Some(3),
            ..Default::default()
        };
        assert!(!failed.success());
        assert_eq!(failed.status_text(), "exit code 3");

        let killed = CommandOutput::default();
        assert_eq!(killed.status_text(), "terminated by signal");
    }
}
