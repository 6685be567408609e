//! Transport that runs scripts on the machine executing testbed

use async_trait::async_trait;
use std::path::Path;

use crate::process::{rsync_transferred, run_process, run_transfer};
use crate::script::{encode_powershell, Script, Shell};
use crate::{CommandOutput, Transport, TransportError};

/// Local execution, used when testbed runs on the target host itself
#[derive(Debug, Clone)]
pub struct LocalTransport {
    shell: Shell,
    powershell: String,
}

impl LocalTransport {
    pub fn new(shell: Shell) -> Self {
        Self {
            shell,
            powershell: "powershell.exe".to_string(),
        }
    }

    /// Use a different PowerShell executable (e.g. `pwsh`)
    pub fn powershell_executable(mut self, program: impl Into<String>) -> Self {
        self.powershell = program.into();
        self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn target(&self) -> String {
        "localhost".to_string()
    }

    fn shell(&self) -> Shell {
        self.shell
    }

    async fn execute(&self, script: &Script) -> Result<CommandOutput, TransportError> {
        match script.shell() {
            Shell::PowerShell => {
                let args = vec![
                    "-NoProfile".to_string(),
                    "-NonInteractive".to_string(),
                    "-EncodedCommand".to_string(),
                    encode_powershell(&script.render()),
                ];
                run_process(&self.powershell, &args, None).await
            }
            Shell::Posix => run_process("sh", &["-s".to_string()], Some(&script.render())).await,
        }
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let dest = Path::new(remote);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, dest)
            .await
            .map_err(|e| TransportError::Transfer {
                target: self.target(),
                path: local.display().to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn sync_dir(&self, local: &Path, remote: &str) -> Result<bool, TransportError> {
        let args = vec![
            "-a".to_string(),
            "--delete".to_string(),
            "--itemize-changes".to_string(),
            format!("{}/", local.display()),
            format!("{}/", remote.trim_end_matches('/')),
        ];
        let output =
            run_transfer("rsync", &args, &self.target(), &local.display().to_string()).await?;
        Ok(rsync_transferred(&output.stdout))
    }
}
