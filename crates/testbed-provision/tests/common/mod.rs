//! Scripted transport and fixtures shared by the play tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use testbed_provision::TestbedConfig;
use testbed_transport::{CommandOutput, Script, Shell, Transport, TransportError, CHANGED_MARKER};

/// A single certificate, enough for `rustls_pemfile` to find one entry
pub const FAKE_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIBszCCAVmgAwIBAgIUDw==\n-----END CERTIFICATE-----\n";

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Script(String),
    Upload { local: PathBuf, remote: String },
    Sync { local: PathBuf, remote: String },
}

struct Response {
    needle: String,
    outputs: Mutex<VecDeque<CommandOutput>>,
}

/// Answers each script with the canned output of the first registered
/// needle found in its rendered text; anything else succeeds silently
pub struct ScriptedTransport {
    shell: Shell,
    responses: Vec<Response>,
    sync_changes: bool,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn new(shell: Shell) -> Self {
        Self {
            shell,
            responses: Vec::new(),
            sync_changes: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(self, needle: &str, stdout: &str) -> Self {
        self.respond_seq(needle, &[stdout])
    }

    /// Successive outputs for the same needle; the last one repeats
    pub fn respond_seq(mut self, needle: &str, stdouts: &[&str]) -> Self {
        let outputs = stdouts.iter().map(|stdout| ok(stdout)).collect();
        self.responses.push(Response {
            needle: needle.to_string(),
            outputs: Mutex::new(outputs),
        });
        self
    }

    pub fn fail(mut self, needle: &str, status: i32, stderr: &str) -> Self {
        let output = CommandOutput {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.to_string(),
        };
        self.responses.push(Response {
            needle: needle.to_string(),
            outputs: Mutex::new(VecDeque::from([output])),
        });
        self
    }

    pub fn sync_changes(mut self, changed: bool) -> Self {
        self.sync_changes = changed;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Script(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Upload { remote, .. } => Some(remote),
                _ => None,
            })
            .collect()
    }

    /// Index of the first script containing `needle`
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.scripts().iter().position(|text| text.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.scripts()
            .iter()
            .filter(|text| text.contains(needle))
            .count()
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

/// Stdout of a script that reported a change
pub fn changed(payload: &str) -> String {
    if payload.is_empty() {
        format!("{}\n", CHANGED_MARKER)
    } else {
        format!("{}\n{}\n", CHANGED_MARKER, payload)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn target(&self) -> String {
        "scripted".to_string()
    }

    fn shell(&self) -> Shell {
        self.shell
    }

    async fn execute(&self, script: &Script) -> Result<CommandOutput, TransportError> {
        let text = script.render();
        self.calls.lock().unwrap().push(Call::Script(text.clone()));

        for response in &self.responses {
            if text.contains(&response.needle) {
                let mut outputs = response.outputs.lock().unwrap();
                let output = if outputs.len() > 1 {
                    outputs.pop_front()
                } else {
                    outputs.front().cloned()
                };
                return Ok(output.unwrap_or_else(|| ok("")));
            }
        }
        Ok(ok(""))
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(Call::Upload {
            local: local.to_path_buf(),
            remote: remote.to_string(),
        });
        Ok(())
    }

    async fn sync_dir(&self, local: &Path, remote: &str) -> Result<bool, TransportError> {
        self.calls.lock().unwrap().push(Call::Sync {
            local: local.to_path_buf(),
            remote: remote.to_string(),
        });
        Ok(self.sync_changes)
    }
}

/// Two-endpoint config; `linux_extra` is appended to the `linux` section
pub fn config_yaml(linux_extra: &str) -> String {
    format!(
        r#"
domain:
  name: testbed.local
  username: admin
  password: secret
  user_retry_attempts: 2
  user_retry_delay_seconds: 1
windows:
  hostname: DC01
  address: 192.168.56.10
linux:
  hostname: TEST
  address: 192.168.56.11
  runtime_user: vagrant
{}
listeners:
  adapter_wait_timeout_seconds: 5
  endpoints:
    - name: cbt-sha256
      key_algorithm: sha256
    - name: verification
"#,
        linux_extra
    )
}

pub fn load_config(dir: &Path, linux_extra: &str) -> (TestbedConfig, PathBuf) {
    let path = dir.join(".testbed.yml");
    std::fs::write(&path, config_yaml(linux_extra)).unwrap();
    (TestbedConfig::load(&path).unwrap(), path)
}

/// Pre-generated certificate output so no script has to run
pub fn seed_certificates(dir: &Path, names: &[&str]) {
    let output_dir = dir.join("cert_setup");
    std::fs::create_dir_all(&output_dir).unwrap();
    std::fs::write(output_dir.join("ca.pem"), FAKE_PEM).unwrap();
    for name in names {
        std::fs::write(output_dir.join(format!("{}.pfx", name)), b"pfx").unwrap();
    }
    std::fs::write(output_dir.join("complete.txt"), "seeded\n").unwrap();
}
