//! OpenSSH based transport (`ssh`, `scp`, `rsync`)

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::process::{rsync_transferred, run_process, run_transfer};
use crate::script::{encode_powershell, Script, Shell};
use crate::{CommandOutput, Transport, TransportError};

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Runs scripts on a remote host through the system `ssh` client
#[derive(Debug, Clone)]
pub struct SshTransport {
    host: String,
    user: Option<String>,
    port: u16,
    identity_file: Option<PathBuf>,
    shell: Shell,
    sudo: bool,
}

impl SshTransport {
    pub fn new(host: impl Into<String>, shell: Shell) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: DEFAULT_SSH_PORT,
            identity_file: None,
            shell,
            sudo: false,
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Run POSIX scripts through `sudo -n`
    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn common_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    /// `ssh` arguments and stdin for a script
    pub fn ssh_command(&self, script: &Script) -> (Vec<String>, Option<String>) {
        let mut args = self.common_options();
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args.push(self.destination());

        match script.shell() {
            Shell::PowerShell => {
                args.extend(
                    [
                        "powershell.exe",
                        "-NoProfile",
                        "-NonInteractive",
                        "-ExecutionPolicy",
                        "Bypass",
                        "-EncodedCommand",
                    ]
                    .iter()
                    .map(|s| s.to_string()),
                );
                args.push(encode_powershell(&script.render()));
                (args, None)
            }
            Shell::Posix => {
                if self.sudo {
                    args.extend(["sudo", "-n", "sh", "-s"].iter().map(|s| s.to_string()));
                } else {
                    args.extend(["sh", "-s"].iter().map(|s| s.to_string()));
                }
                (args, Some(script.render()))
            }
        }
    }

    /// `scp` arguments for an upload
    pub fn scp_command(&self, local: &Path, remote: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-P".to_string());
        args.push(self.port.to_string());
        args.push(local.display().to_string());
        args.push(format!("{}:{}", self.destination(), remote));
        args
    }

    /// `rsync` arguments for a directory mirror
    pub fn rsync_command(&self, local: &Path, remote: &str) -> Vec<String> {
        let mut ssh = format!(
            "ssh -o BatchMode=yes -o StrictHostKeyChecking=accept-new -p {}",
            self.port
        );
        if let Some(identity) = &self.identity_file {
            ssh.push_str(&format!(" -i {}", identity.display()));
        }

        let mut args = vec![
            "-a".to_string(),
            "--delete".to_string(),
            "--itemize-changes".to_string(),
            "-e".to_string(),
            ssh,
        ];
        if self.sudo {
            args.push("--rsync-path=sudo -n rsync".to_string());
        }
        args.push(format!("{}/", local.display()));
        args.push(format!(
            "{}:{}/",
            self.destination(),
            remote.trim_end_matches('/')
        ));
        args
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn target(&self) -> String {
        self.destination()
    }

    fn shell(&self) -> Shell {
        self.shell
    }

    async fn execute(&self, script: &Script) -> Result<CommandOutput, TransportError> {
        let (args, stdin) = self.ssh_command(script);
        run_process("ssh", &args, stdin.as_deref()).await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        debug!("Uploading {} to {}:{}", local.display(), self.host, remote);
        let args = self.scp_command(local, remote);
        run_transfer("scp", &args, &self.target(), &local.display().to_string()).await?;
        Ok(())
    }

    async fn sync_dir(&self, local: &Path, remote: &str) -> Result<bool, TransportError> {
        debug!("Syncing {} to {}:{}", local.display(), self.host, remote);
        let args = self.rsync_command(local, remote);
        let output =
            run_transfer("rsync", &args, &self.target(), &local.display().to_string()).await?;
        Ok(rsync_transferred(&output.stdout))
    }
}
