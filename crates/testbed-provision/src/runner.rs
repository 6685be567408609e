//! Top-level run orchestration

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use testbed_endpoint::EndpointTable;
use testbed_listener::ReconcilePlan;
use testbed_transport::{LocalTransport, Shell, SshTransport, Transport};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::artifacts::PswsmanArchive;
use crate::certs::{CertificateGenerator, CA_FILE};
use crate::config::{resolve_path, ConnectionConfig, ConnectionKind, TestbedConfig};
use crate::error::ProvisionError;
use crate::linux::LinuxPlay;
use crate::recap::PlayRecap;
use crate::tags::{Tag, TagSelection};
use crate::windows::WindowsPlay;

/// Runs the Windows play, then the Linux play, against a loaded config
pub struct Provisioner {
    config: TestbedConfig,
    config_dir: PathBuf,
    table: EndpointTable,
}

impl Provisioner {
    /// `config_path` is the file the config was loaded from; relative paths
    /// in it resolve against its directory
    pub fn new(config: TestbedConfig, config_path: &Path) -> Result<Self, ProvisionError> {
        let config_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let table = config.endpoint_table()?;

        Ok(Self {
            config,
            config_dir,
            table,
        })
    }

    pub fn config(&self) -> &TestbedConfig {
        &self.config
    }

    pub fn table(&self) -> &EndpointTable {
        &self.table
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn certificate_generator(&self) -> CertificateGenerator {
        let certificates = &self.config.certificates;
        CertificateGenerator::new(
            resolve_path(&self.config_dir, &certificates.script),
            resolve_path(&self.config_dir, &certificates.output_dir),
            certificates.password(),
            self.config.windows_fqdn(),
        )
    }

    pub fn windows_transport(&self) -> Box<dyn Transport> {
        self.transport(
            &self.config.windows.connection,
            self.config.windows.address,
            Shell::PowerShell,
        )
    }

    pub fn linux_transport(&self) -> Box<dyn Transport> {
        self.transport(
            &self.config.linux.connection,
            self.config.linux.address,
            Shell::Posix,
        )
    }

    fn transport(
        &self,
        connection: &ConnectionConfig,
        address: Ipv4Addr,
        shell: Shell,
    ) -> Box<dyn Transport> {
        match connection.kind {
            ConnectionKind::Local => Box::new(LocalTransport::new(shell)),
            ConnectionKind::Ssh => {
                let mut transport = SshTransport::new(address.to_string(), shell)
                    .port(connection.port)
                    .sudo(connection.sudo);
                if let Some(user) = &connection.user {
                    transport = transport.user(user.clone());
                }
                if let Some(identity) = &connection.identity_file {
                    transport = transport.identity_file(resolve_path(&self.config_dir, identity));
                }
                Box::new(transport)
            }
        }
    }

    /// Check local prerequisites of the selected plays before touching any
    /// host
    pub fn preflight(&self, tags: &TagSelection) -> Result<Option<PswsmanArchive>, ProvisionError> {
        if tags.includes(Tag::Windows) {
            let certificates = self.certificate_generator();
            let script = resolve_path(&self.config_dir, &self.config.certificates.script);
            if !certificates.is_complete() && !script.is_file() {
                return Err(ProvisionError::Precondition(format!(
                    "certificate script {} does not exist and {} has not been generated",
                    script.display(),
                    certificates.sentinel_path().display()
                )));
            }
        }

        if tags.includes(Tag::Linux) {
            for entry in &self.config.linux.sync {
                let src = resolve_path(&self.config_dir, &entry.src);
                if !src.is_dir() {
                    return Err(ProvisionError::Precondition(format!(
                        "sync source {} is not a directory",
                        src.display()
                    )));
                }
            }
        }

        if tags.includes(Tag::BuildArtifacts) {
            return Ok(Some(PswsmanArchive::locate(&self.config_dir)?));
        }
        Ok(None)
    }

    /// Provision both hosts over the configured connections
    pub async fn run(&self, tags: &TagSelection) -> Result<Vec<PlayRecap>, ProvisionError> {
        let windows = self.windows_transport();
        let linux = self.linux_transport();
        self.run_with(tags, windows.as_ref(), linux.as_ref()).await
    }

    /// Provision both hosts over the given transports
    pub async fn run_with(
        &self,
        tags: &TagSelection,
        windows: &dyn Transport,
        linux: &dyn Transport,
    ) -> Result<Vec<PlayRecap>, ProvisionError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id);

        async move {
            let archive = self.preflight(tags)?;
            info!(
                tags = %tags,
                endpoints = self.table.len(),
                "Starting provisioning run"
            );

            let mut recaps = Vec::new();

            if tags.includes(Tag::Windows) {
                let mut recap = PlayRecap::new(self.config.windows_fqdn());
                let certificates = self.certificate_generator();
                let result = WindowsPlay::new(windows, &self.config, &self.table, &certificates)
                    .run(&mut recap)
                    .await;
                recap.log_summary();
                result?;
                recaps.push(recap);
            }

            if tags.includes(Tag::Linux) || archive.is_some() {
                let mut recap = PlayRecap::new(self.config.linux.hostname.to_lowercase());
                let result = self
                    .run_linux(tags, linux, archive.as_ref(), &mut recap)
                    .await;
                recap.log_summary();
                result?;
                recaps.push(recap);
            }

            info!("Provisioning run finished");
            Ok(recaps)
        }
        .instrument(span)
        .await
    }

    async fn run_linux(
        &self,
        tags: &TagSelection,
        linux: &dyn Transport,
        archive: Option<&PswsmanArchive>,
        recap: &mut PlayRecap,
    ) -> Result<(), ProvisionError> {
        if tags.includes(Tag::Linux) {
            let mut play = LinuxPlay::new(linux, &self.config, &self.config_dir);
            let ca_pem = self.certificate_generator().output_dir().join(CA_FILE);
            if ca_pem.is_file() {
                play = play.with_ca(ca_pem);
            }
            play.run(recap).await?;
        }

        if let Some(archive) = archive {
            archive
                .install(linux, &self.config.linux.pswsman_dir, recap)
                .await?;
        }
        Ok(())
    }

    /// Listener plan of every endpoint over the configured connection
    pub async fn plan(&self) -> Result<Vec<(String, ReconcilePlan)>, ProvisionError> {
        let windows = self.windows_transport();
        self.plan_with(windows.as_ref()).await
    }

    pub async fn plan_with(
        &self,
        windows: &dyn Transport,
    ) -> Result<Vec<(String, ReconcilePlan)>, ProvisionError> {
        let certificates = self.certificate_generator();
        WindowsPlay::new(windows, &self.config, &self.table, &certificates)
            .plan_listeners()
            .await
    }
}
