//! Testbed configuration file support
//!
//! The environment is described by a single `.testbed.yml` file, discovered
//! by walking up from the current directory. Relative paths inside the file
//! are resolved against the directory that contains it.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use testbed_endpoint::{EndpointSpec, EndpointTable, DEFAULT_ADAPTER_PREFIX, DEFAULT_BASE_PORT};
use testbed_listener::ReconcileOptions;
use testbed_transport::RetryPolicy;

use crate::error::ConfigError;

const CONFIG_FILE_NAMES: [&str; 2] = [".testbed.yml", ".testbed.yaml"];

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestbedConfig {
    pub domain: DomainConfig,

    pub windows: WindowsConfig,

    pub linux: LinuxConfig,

    #[serde(default)]
    pub listeners: ListenerConfig,

    #[serde(default)]
    pub certificates: CertificateConfig,
}

/// Active Directory domain created on the Windows host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainConfig {
    /// DNS name of the forest root domain, e.g. `testbed.local`
    pub name: String,

    /// Domain user created for the test suite
    pub username: String,

    /// Password of the domain user (supports ${ENV_VAR} expansion)
    pub password: String,

    /// DSRM password used during promotion, defaults to `password`
    #[serde(default)]
    pub safe_mode_password: Option<String>,

    #[serde(default = "default_user_retry_attempts")]
    pub user_retry_attempts: u32,

    #[serde(default = "default_user_retry_delay")]
    pub user_retry_delay_seconds: u64,
}

fn default_user_retry_attempts() -> u32 {
    30
}

fn default_user_retry_delay() -> u64 {
    15
}

/// How a host is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    #[default]
    Ssh,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(default, rename = "type")]
    pub kind: ConnectionKind,

    pub user: Option<String>,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub identity_file: Option<PathBuf>,

    /// Elevate POSIX scripts with `sudo -n`
    #[serde(default = "default_sudo")]
    pub sudo: bool,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_sudo() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            kind: ConnectionKind::Ssh,
            user: None,
            port: default_ssh_port(),
            identity_file: None,
            sudo: default_sudo(),
        }
    }
}

/// The domain controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowsConfig {
    pub hostname: String,

    /// Management address, also the external address of every port forward
    pub address: Ipv4Addr,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default = "default_reboot_timeout")]
    pub reboot_timeout_seconds: u64,
}

fn default_reboot_timeout() -> u64 {
    900
}

/// The Docker test runner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinuxConfig {
    pub hostname: String,

    pub address: Ipv4Addr,

    #[serde(default)]
    pub connection: ConnectionConfig,

    /// User that runs the test containers
    pub runtime_user: String,

    #[serde(default = "default_packages")]
    pub packages: Vec<String>,

    #[serde(default = "default_resolver_head")]
    pub resolver_head: String,

    #[serde(default = "default_ca_trust_dir")]
    pub ca_trust_dir: String,

    /// Where the PSWSMan module archive is extracted
    #[serde(default = "default_pswsman_dir")]
    pub pswsman_dir: String,

    #[serde(default)]
    pub sync: Vec<SyncEntry>,
}

fn default_packages() -> Vec<String> {
    [
        "docker.io",
        "realmd",
        "sssd",
        "sssd-tools",
        "adcli",
        "krb5-user",
        "packagekit",
        "resolvconf",
        "rsync",
        "unzip",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

fn default_resolver_head() -> String {
    "/etc/resolvconf/resolv.conf.d/head".to_string()
}

fn default_ca_trust_dir() -> String {
    "/usr/local/share/ca-certificates".to_string()
}

fn default_pswsman_dir() -> String {
    "/usr/local/share/powershell/Modules".to_string()
}

/// A local directory mirrored onto the Linux host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncEntry {
    pub src: PathBuf,
    pub dest: String,
}

/// Per-certificate listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    #[serde(default = "default_adapter_prefix")]
    pub adapter_prefix: String,

    #[serde(default = "default_adapter_poll_interval")]
    pub adapter_poll_interval_seconds: u64,

    /// 0 waits forever
    #[serde(default = "default_adapter_wait_timeout")]
    pub adapter_wait_timeout_seconds: u64,

    /// Re-add port forwards that went missing or point elsewhere even when
    /// the listener is already correct
    #[serde(default)]
    pub repair_port_forward_drift: bool,

    #[serde(default = "EndpointSpec::defaults")]
    pub endpoints: Vec<EndpointSpec>,
}

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

fn default_adapter_prefix() -> String {
    DEFAULT_ADAPTER_PREFIX.to_string()
}

fn default_adapter_poll_interval() -> u64 {
    1
}

fn default_adapter_wait_timeout() -> u64 {
    120
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            adapter_prefix: default_adapter_prefix(),
            adapter_poll_interval_seconds: default_adapter_poll_interval(),
            adapter_wait_timeout_seconds: default_adapter_wait_timeout(),
            repair_port_forward_drift: false,
            endpoints: EndpointSpec::defaults(),
        }
    }
}

/// Certificate generation and upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertificateConfig {
    /// Script that writes `ca.pem` and one `<name>.pfx` per endpoint
    #[serde(default = "default_cert_script")]
    pub script: PathBuf,

    #[serde(default = "default_cert_output_dir")]
    pub output_dir: PathBuf,

    /// PFX export password (supports ${ENV_VAR} expansion)
    #[serde(default = "default_cert_password")]
    pub password: String,

    /// Staging directory on the Windows host
    #[serde(default = "default_cert_remote_dir")]
    pub remote_dir: String,
}

fn default_cert_script() -> PathBuf {
    PathBuf::from("generate_cert.sh")
}

fn default_cert_output_dir() -> PathBuf {
    PathBuf::from("cert_setup")
}

fn default_cert_password() -> String {
    "password".to_string()
}

fn default_cert_remote_dir() -> String {
    r"C:\Windows\TEMP\testbed-certs".to_string()
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            script: default_cert_script(),
            output_dir: default_cert_output_dir(),
            password: default_cert_password(),
            remote_dir: default_cert_remote_dir(),
        }
    }
}

impl TestbedConfig {
    /// Discover and load the config by walking up from the current directory
    ///
    /// Falls back to `<config dir>/testbed/config.yml` when no project file
    /// is found.
    pub fn discover() -> Result<Option<(PathBuf, Self)>, ConfigError> {
        let current_dir = std::env::current_dir().map_err(|source| ConfigError::Read {
            path: PathBuf::from("."),
            source,
        })?;
        if let Some(found) = Self::discover_from(&current_dir)? {
            return Ok(Some(found));
        }

        match Self::user_config_path() {
            Some(path) if path.exists() => {
                let config = Self::load(&path)?;
                Ok(Some((path, config)))
            }
            _ => Ok(None),
        }
    }

    /// Discover config starting from a specific directory
    pub fn discover_from(start_dir: &Path) -> Result<Option<(PathBuf, Self)>, ConfigError> {
        let mut current = start_dir.to_path_buf();

        loop {
            for name in CONFIG_FILE_NAMES {
                let path = current.join(name);
                if path.exists() {
                    let config = Self::load(&path)?;
                    return Ok(Some((path, config)));
                }
            }

            if !current.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Per-user fallback location
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("testbed").join("config.yml"))
    }

    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: TestbedConfig = serde_yaml::from_str(content)?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let domain = &self.domain.name;
        if domain.is_empty() || !domain.contains('.') || domain.starts_with('.') {
            return Err(ConfigError::Invalid(format!(
                "domain name '{}' must be a dotted DNS name",
                domain
            )));
        }
        if self.domain.username.is_empty() {
            return Err(ConfigError::Invalid("domain username is empty".to_string()));
        }
        if self.domain.user_retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "user_retry_attempts must be at least 1".to_string(),
            ));
        }

        for (section, hostname) in [
            ("windows", &self.windows.hostname),
            ("linux", &self.linux.hostname),
        ] {
            if !is_valid_hostname(hostname) {
                return Err(ConfigError::Invalid(format!(
                    "{} hostname '{}' must be alphanumeric with hyphens only",
                    section, hostname
                )));
            }
        }

        if self.linux.runtime_user.is_empty() {
            return Err(ConfigError::Invalid("linux runtime_user is empty".to_string()));
        }
        for entry in &self.linux.sync {
            if entry.src.as_os_str().is_empty() || entry.dest.is_empty() {
                return Err(ConfigError::Invalid(
                    "sync entries need both src and dest".to_string(),
                ));
            }
        }

        if self.listeners.adapter_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("adapter_prefix is empty".to_string()));
        }
        if self.listeners.adapter_poll_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "adapter_poll_interval_seconds must be at least 1".to_string(),
            ));
        }

        // Port and adapter derivation must be one-to-one
        self.endpoint_table()?;
        Ok(())
    }

    /// Derive the endpoint table
    pub fn endpoint_table(&self) -> Result<EndpointTable, ConfigError> {
        Ok(EndpointTable::new(
            self.listeners.base_port,
            &self.listeners.adapter_prefix,
            self.listeners.endpoints.clone(),
        )?)
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        let listeners = &self.listeners;
        let mut adapter_wait =
            RetryPolicy::unbounded(Duration::from_secs(listeners.adapter_poll_interval_seconds));
        if listeners.adapter_wait_timeout_seconds > 0 {
            adapter_wait =
                adapter_wait.with_timeout(Duration::from_secs(listeners.adapter_wait_timeout_seconds));
        }
        ReconcileOptions {
            adapter_wait,
            repair_port_forward_drift: listeners.repair_port_forward_drift,
        }
    }

    pub fn user_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::unbounded(Duration::from_secs(self.domain.user_retry_delay_seconds))
            .with_max_attempts(self.domain.user_retry_attempts)
    }

    /// Fully qualified name of the domain controller
    pub fn windows_fqdn(&self) -> String {
        format!("{}.{}", self.windows.hostname, self.domain.name).to_lowercase()
    }

    /// Generate a template config file content
    pub fn template() -> String {
        r#"# Testbed configuration
#
# Relative paths are resolved against the directory containing this file.

domain:
  name: testbed.local
  username: testbed-admin
  password: "${TESTBED_PASSWORD}"
  # safe_mode_password: "${TESTBED_SAFE_MODE_PASSWORD}"
  user_retry_attempts: 30
  user_retry_delay_seconds: 15

windows:
  hostname: DC01
  address: 192.168.56.10
  connection:
    type: ssh
    user: Administrator
    # identity_file: ~/.ssh/id_ed25519
  reboot_timeout_seconds: 900

linux:
  hostname: TEST
  address: 192.168.56.11
  connection:
    type: ssh
    user: vagrant
  runtime_user: vagrant
  # packages: [docker.io, realmd, sssd, sssd-tools, adcli, krb5-user, packagekit, resolvconf, rsync, unzip]
  sync:
    - src: ./tests
      dest: /home/vagrant/tests

listeners:
  base_port: 29900
  adapter_prefix: "TestBed Loopback Adapter"
  adapter_poll_interval_seconds: 1
  # 0 waits forever
  adapter_wait_timeout_seconds: 120
  repair_port_forward_drift: false
  # Omit to use the default 11 endpoints
  # endpoints:
  #   - name: cbt-sha256
  #     key_algorithm: sha256
  #   - name: verification-bad-cn
  #     subject: fake-host

certificates:
  script: ./generate_cert.sh
  output_dir: ./cert_setup
  password: "${TESTBED_CERT_PASSWORD}"
"#
        .to_string()
    }

    /// Write the template, refusing to clobber an existing file unless forced
    pub fn write_template(path: &Path, force: bool) -> Result<(), ConfigError> {
        if path.exists() && !force {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        std::fs::write(path, Self::template()).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl DomainConfig {
    pub fn password(&self) -> String {
        expand_env_vars(&self.password)
    }

    pub fn safe_mode_password(&self) -> String {
        match &self.safe_mode_password {
            Some(password) => expand_env_vars(password),
            None => self.password(),
        }
    }
}

impl CertificateConfig {
    pub fn password(&self) -> String {
        expand_env_vars(&self.password)
    }
}

/// Resolve `path` against the config file's directory
///
/// Absolute paths are kept and a leading `~` expands to the home directory.
pub fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Expand environment variables in a string
///
/// Supports `${VAR}` syntax. If the variable is not set, returns empty string.
pub fn expand_env_vars(input: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };

    re.replace_all(input, |caps: &regex_lite::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
