//! Windows domain controller play
//!
//! Steps run strictly in order. Promotion (and its reboot) happens before
//! any directory object is created, and every loopback adapter exists
//! before the first listener is reconciled.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use testbed_endpoint::{Endpoint, EndpointTable};
use testbed_listener::{ListenerReconciler, PowerShellListenerHost, ReconcilePlan};
use testbed_transport::{poll_until, retry, RetryPolicy, Script, Transport, TransportError};
use tracing::{info, info_span, Instrument};

use crate::certs::{CertificateBundle, CertificateGenerator, CA_FILE};
use crate::config::TestbedConfig;
use crate::error::ProvisionError;
use crate::recap::{PlayRecap, StepStatus};

const REBOOT_POLL_INTERVAL: Duration = Duration::from_secs(10);

const GET_MANAGEMENT_ADAPTER: &str = r#"
$ip = Get-NetIPAddress -IPAddress $Address -AddressFamily IPv4 -ErrorAction SilentlyContinue |
    Select-Object -First 1
if ($ip) {
    $ip.InterfaceAlias
}
"#;

const INSTALL_LOOPBACK_MODULE: &str = r#"
if (-not (Get-PackageProvider -ListAvailable -Name NuGet -ErrorAction SilentlyContinue)) {
    Install-PackageProvider -Name NuGet -MinimumVersion 2.8.5.201 -Force | Out-Null
    Write-Changed
}
if (-not (Get-Module -ListAvailable -Name LoopbackAdapter)) {
    Install-Module -Name LoopbackAdapter -Scope AllUsers -Force -SkipPublisherCheck
    Write-Changed
}
"#;

const PROMOTE_DOMAIN_CONTROLLER: &str = r#"
$role = (Get-CimInstance -ClassName Win32_ComputerSystem).DomainRole
if ($role -lt 4) {
    $feature = Get-WindowsFeature -Name AD-Domain-Services
    if (-not $feature.Installed) {
        Install-WindowsFeature -Name AD-Domain-Services -IncludeManagementTools | Out-Null
    }
    $safeMode = ConvertTo-SecureString -String $SafeModePassword -AsPlainText -Force
    Install-ADDSForest -DomainName $DomainName -SafeModeAdministratorPassword $safeMode `
        -InstallDns -NoRebootOnCompletion -Force -WarningAction SilentlyContinue | Out-Null
    Write-Changed
}
"#;

const GET_BOOT_TIME: &str = r#"
(Get-CimInstance -ClassName Win32_OperatingSystem).LastBootUpTime.ToUniversalTime().ToString('o')
"#;

const REBOOT: &str = r#"
shutdown.exe /r /t 5 /c "testbed: domain controller promotion"
if ($LASTEXITCODE -ne 0) {
    throw "shutdown.exe failed with exit code $LASTEXITCODE"
}
"#;

const SET_DNS_LOOPBACK: &str = r#"
$current = @((Get-DnsClientServerAddress -InterfaceAlias $Alias -AddressFamily IPv4).ServerAddresses)
if ($current.Count -ne 1 -or $current[0] -ne '127.0.0.1') {
    Set-DnsClientServerAddress -InterfaceAlias $Alias -ServerAddresses '127.0.0.1'
    Write-Changed
}
"#;

const DOMAIN_USER: &str = r#"
Import-Module ActiveDirectory
$user = Get-ADUser -Filter 'sAMAccountName -eq $UserName'
if (-not $user) {
    $secure = ConvertTo-SecureString -String $Password -AsPlainText -Force
    New-ADUser -Name $UserName -SamAccountName $UserName -UserPrincipalName "$UserName@$DomainName" `
        -AccountPassword $secure -PasswordNeverExpires $true -Enabled $true
    $user = Get-ADUser -Identity $UserName
    Write-Changed
}
$admins = Get-ADGroup -Identity 'Domain Admins'
$member = Get-ADGroupMember -Identity $admins | Where-Object { $_.SID -eq $user.SID }
if (-not $member) {
    Add-ADGroupMember -Identity $admins -Members $user
    Write-Changed
}
"#;

const STAGING_DIR: &str = r#"
if (-not (Test-Path -LiteralPath $Path)) {
    New-Item -ItemType Directory -Path $Path -Force | Out-Null
}
"#;

const IMPORT_CERTIFICATES: &str = r#"
$securePassword = ConvertTo-SecureString -String $Password -AsPlainText -Force

$caPath = Join-Path $Dir $CaFile
$ca = New-Object System.Security.Cryptography.X509Certificates.X509Certificate2 -ArgumentList $caPath
if (-not (Test-Path -LiteralPath "Cert:\LocalMachine\Root\$($ca.Thumbprint)")) {
    Import-Certificate -FilePath $caPath -CertStoreLocation Cert:\LocalMachine\Root | Out-Null
    Write-Changed
}

$result = @()
for ($i = 0; $i -lt $Names.Count; $i++) {
    $path = Join-Path $Dir $Files[$i]
    $cert = New-Object System.Security.Cryptography.X509Certificates.X509Certificate2 -ArgumentList $path, $Password
    if (-not (Test-Path -LiteralPath "Cert:\LocalMachine\My\$($cert.Thumbprint)")) {
        Import-PfxCertificate -FilePath $path -CertStoreLocation Cert:\LocalMachine\My -Password $securePassword | Out-Null
        Write-Changed
    }
    $result += @{ name = $Names[$i]; thumbprint = $cert.Thumbprint }
}
ConvertTo-Json -InputObject @($result) -Compress
"#;

const READ_THUMBPRINTS: &str = r#"
$result = @()
for ($i = 0; $i -lt $Names.Count; $i++) {
    $path = Join-Path $Dir $Files[$i]
    if (-not (Test-Path -LiteralPath $path)) {
        throw "$path has not been uploaded yet, run 'testbed run --tags windows' first"
    }
    $cert = New-Object System.Security.Cryptography.X509Certificates.X509Certificate2 -ArgumentList $path, $Password
    $result += @{ name = $Names[$i]; thumbprint = $cert.Thumbprint }
}
ConvertTo-Json -InputObject @($result) -Compress
"#;

const CREATE_ADAPTERS: &str = r#"
Import-Module LoopbackAdapter
foreach ($name in $Names) {
    if (-not (Get-NetAdapter -Name $name -ErrorAction SilentlyContinue)) {
        New-LoopbackAdapter -Name $name -Force | Out-Null
        Write-Changed
    }
}
"#;

const FIREWALL_RULES: &str = r#"
for ($i = 0; $i -lt $Names.Count; $i++) {
    if (-not (Get-NetFirewallRule -DisplayName $Names[$i] -ErrorAction SilentlyContinue)) {
        New-NetFirewallRule -DisplayName $Names[$i] -Direction Inbound -Protocol TCP `
            -LocalPort $Ports[$i] -Action Allow -Profile Any | Out-Null
        Write-Changed
    }
}
"#;

const CBT_HARDENING: &str = r#"
$item = Get-Item -Path WSMan:\localhost\Service\Auth\CbtHardeningLevel
if ($item.Value -ne 'Strict') {
    Set-Item -Path WSMan:\localhost\Service\Auth\CbtHardeningLevel -Value Strict
    Write-Changed
}
"#;

#[derive(Debug, Deserialize)]
struct ThumbprintRecord {
    name: String,
    thumbprint: String,
}

/// Provisions the domain controller and its per-certificate listeners
pub struct WindowsPlay<'a> {
    transport: &'a dyn Transport,
    config: &'a TestbedConfig,
    table: &'a EndpointTable,
    certificates: &'a CertificateGenerator,
}

impl<'a> WindowsPlay<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        config: &'a TestbedConfig,
        table: &'a EndpointTable,
        certificates: &'a CertificateGenerator,
    ) -> Self {
        Self {
            transport,
            config,
            table,
            certificates,
        }
    }

    pub async fn run(&self, recap: &mut PlayRecap) -> Result<(), ProvisionError> {
        let span = info_span!("windows", host = %self.transport.target());
        self.run_steps(recap).instrument(span).await
    }

    async fn run_steps(&self, recap: &mut PlayRecap) -> Result<(), ProvisionError> {
        let alias = self.management_adapter(recap).await?;

        self.step(recap, "loopback module", &Script::powershell(INSTALL_LOOPBACK_MODULE))
            .await?;

        self.promote(recap).await?;

        let dns = Script::powershell(SET_DNS_LOOPBACK).var("Alias", &alias);
        self.step(recap, "dns loopback", &dns).await?;

        self.domain_user(recap).await?;

        let thumbprints = self.install_certificates(recap).await?;

        let adapters = Script::powershell(CREATE_ADAPTERS)
            .list("Names", self.table.iter().map(|e| e.adapter_name.clone()));
        self.step(recap, "loopback adapters", &adapters).await?;

        let firewall = Script::powershell(FIREWALL_RULES)
            .list("Names", self.table.iter().map(|e| e.firewall_rule_name()))
            .list("Ports", self.table.iter().map(|e| e.external_port.to_string()));
        self.step(recap, "firewall rules", &firewall).await?;

        self.step(recap, "cbt hardening", &Script::powershell(CBT_HARDENING))
            .await?;

        self.reconcile_listeners(recap, &thumbprints).await
    }

    /// Name of the interface that owns the configured management address
    pub async fn management_adapter(&self, recap: &mut PlayRecap) -> Result<String, ProvisionError> {
        const STEP: &str = "management adapter";
        let address = self.config.windows.address;

        let script = Script::powershell(GET_MANAGEMENT_ADAPTER).var("Address", address.to_string());
        let alias = self
            .transport
            .run(&script)
            .await
            .map_err(ProvisionError::step(STEP))?
            .payload();

        if alias.is_empty() {
            return Err(ProvisionError::Precondition(format!(
                "no interface on {} owns {}",
                self.transport.target(),
                address
            )));
        }
        info!(adapter = %alias, address = %address, "Resolved management adapter");
        recap.record(STEP, StepStatus::Ok);
        Ok(alias)
    }

    async fn promote(&self, recap: &mut PlayRecap) -> Result<(), ProvisionError> {
        let domain = &self.config.domain;
        let script = Script::powershell(PROMOTE_DOMAIN_CONTROLLER)
            .var("DomainName", &domain.name)
            .var("SafeModePassword", domain.safe_mode_password());

        let status = self.step(recap, "domain controller", &script).await?;
        if status == StepStatus::Changed {
            self.reboot(recap).await?;
        } else {
            recap.record("reboot", StepStatus::Skipped);
        }
        Ok(())
    }

    /// Restart the host and wait until it reports a new boot time
    async fn reboot(&self, recap: &mut PlayRecap) -> Result<(), ProvisionError> {
        const STEP: &str = "reboot";

        let before = self
            .transport
            .run(&Script::powershell(GET_BOOT_TIME))
            .await
            .map_err(ProvisionError::step(STEP))?
            .payload();

        info!("Rebooting after domain controller promotion");
        self.transport
            .run(&Script::powershell(REBOOT))
            .await
            .map_err(ProvisionError::step(STEP))?;

        let policy = RetryPolicy::unbounded(REBOOT_POLL_INTERVAL)
            .with_timeout(Duration::from_secs(self.config.windows.reboot_timeout_seconds));
        let transport = self.transport;
        let before = before.as_str();
        poll_until(&policy, "reboot", || async move {
            let check: Result<Option<String>, TransportError> =
                match transport.run(&Script::powershell(GET_BOOT_TIME)).await {
                    Ok(output) => {
                        let boot = output.payload();
                        Ok((!boot.is_empty() && boot != before).then_some(boot))
                    }
                    // Unreachable while restarting
                    Err(_) => Ok(None),
                };
            check
        })
        .await
        .map_err(|cause| ProvisionError::Wait {
            step: STEP.to_string(),
            cause,
        })?;

        recap.record(STEP, StepStatus::Changed);
        Ok(())
    }

    /// Directory services take a while to answer after promotion, so user
    /// creation is retried
    async fn domain_user(&self, recap: &mut PlayRecap) -> Result<StepStatus, ProvisionError> {
        const STEP: &str = "domain user";
        let domain = &self.config.domain;
        let script = Script::powershell(DOMAIN_USER)
            .var("UserName", &domain.username)
            .var("Password", domain.password())
            .var("DomainName", &domain.name);

        let transport = self.transport;
        let script = &script;
        let output = retry(&self.config.user_retry_policy(), STEP, || async move {
            transport.run(script).await
        })
        .await
        .map_err(|cause| ProvisionError::Wait {
            step: STEP.to_string(),
            cause,
        })?;

        Ok(recap.record(STEP, StepStatus::from_changed(output.changed())))
    }

    /// Generate (once), upload and import the test certificates
    ///
    /// Returns the thumbprint of each endpoint's certificate.
    async fn install_certificates(
        &self,
        recap: &mut PlayRecap,
    ) -> Result<HashMap<String, String>, ProvisionError> {
        let generated = self.certificates.ensure(self.table).await?;
        recap.record("generate certificates", StepStatus::from_changed(generated));

        let bundle = self.certificates.bundle(self.table)?;
        info!(
            ca_certificates = bundle.ca_certificates,
            endpoints = bundle.pfx.len(),
            "Certificate bundle verified"
        );
        self.upload_bundle(&bundle).await?;

        let remote_dir = &self.config.certificates.remote_dir;
        let script = Script::powershell(IMPORT_CERTIFICATES)
            .var("Dir", remote_dir)
            .var("CaFile", CA_FILE)
            .var("Password", self.config.certificates.password())
            .list("Names", self.table.iter().map(|e| e.name().to_string()))
            .list("Files", self.table.iter().map(|e| e.pfx_file_name()));
        let output = self
            .transport
            .run(&script)
            .await
            .map_err(ProvisionError::step("import certificates"))?;
        recap.record(
            "import certificates",
            StepStatus::from_changed(output.changed()),
        );

        self.table_thumbprints("import certificates", &output.payload())
    }

    async fn upload_bundle(&self, bundle: &CertificateBundle) -> Result<(), ProvisionError> {
        const STEP: &str = "upload certificates";
        let remote_dir = &self.config.certificates.remote_dir;

        self.transport
            .run(&Script::powershell(STAGING_DIR).var("Path", remote_dir))
            .await
            .map_err(ProvisionError::step(STEP))?;

        self.transport
            .upload(&bundle.ca_pem, &remote_file(remote_dir, CA_FILE))
            .await
            .map_err(ProvisionError::step(STEP))?;
        for (name, path) in &bundle.pfx {
            self.transport
                .upload(path, &remote_file(remote_dir, &format!("{}.pfx", name)))
                .await
                .map_err(ProvisionError::step(STEP))?;
        }
        Ok(())
    }

    /// Thumbprints of the already uploaded PFX files, without importing
    async fn read_thumbprints(&self) -> Result<HashMap<String, String>, ProvisionError> {
        const STEP: &str = "read thumbprints";
        let script = Script::powershell(READ_THUMBPRINTS)
            .var("Dir", &self.config.certificates.remote_dir)
            .var("Password", self.config.certificates.password())
            .list("Names", self.table.iter().map(|e| e.name().to_string()))
            .list("Files", self.table.iter().map(|e| e.pfx_file_name()));
        let output = self
            .transport
            .run(&script)
            .await
            .map_err(ProvisionError::step(STEP))?;
        self.table_thumbprints(STEP, &output.payload())
    }

    fn table_thumbprints(
        &self,
        step: &str,
        payload: &str,
    ) -> Result<HashMap<String, String>, ProvisionError> {
        let thumbprints = parse_thumbprints(payload).map_err(|message| ProvisionError::Output {
            step: step.to_string(),
            message,
        })?;

        for endpoint in self.table {
            if !thumbprints.contains_key(endpoint.name()) {
                return Err(ProvisionError::Output {
                    step: step.to_string(),
                    message: format!("no thumbprint for endpoint '{}'", endpoint.name()),
                });
            }
        }
        Ok(thumbprints)
    }

    async fn reconcile_listeners(
        &self,
        recap: &mut PlayRecap,
        thumbprints: &HashMap<String, String>,
    ) -> Result<(), ProvisionError> {
        let host = PowerShellListenerHost::new(self.transport);
        let reconciler = ListenerReconciler::new(&host, self.config.reconcile_options());
        let targets = self.targets(thumbprints)?;

        let outcomes = reconciler
            .reconcile_all(targets, self.config.windows.address)
            .await?;
        for outcome in outcomes {
            recap.record(
                format!("listener {}", outcome.endpoint),
                StepStatus::from_changed(outcome.changed()),
            );
        }
        Ok(())
    }

    /// Compute the listener plan of every endpoint without changing anything
    pub async fn plan_listeners(&self) -> Result<Vec<(String, ReconcilePlan)>, ProvisionError> {
        let thumbprints = self.read_thumbprints().await?;
        let host = PowerShellListenerHost::new(self.transport);
        let reconciler = ListenerReconciler::new(&host, self.config.reconcile_options());

        let mut plans = Vec::with_capacity(self.table.len());
        for (endpoint, thumbprint) in self.targets(&thumbprints)? {
            let plan = reconciler
                .plan_endpoint(endpoint, thumbprint, self.config.windows.address)
                .await?;
            plans.push((endpoint.name().to_string(), plan));
        }
        Ok(plans)
    }

    fn targets<'t>(
        &'t self,
        thumbprints: &'t HashMap<String, String>,
    ) -> Result<Vec<(&'t Endpoint, &'t str)>, ProvisionError> {
        self.table
            .iter()
            .map(|endpoint| {
                thumbprints
                    .get(endpoint.name())
                    .map(|tp| (endpoint, tp.as_str()))
                    .ok_or_else(|| {
                        ProvisionError::Precondition(format!(
                            "no certificate thumbprint for endpoint '{}'",
                            endpoint.name()
                        ))
                    })
            })
            .collect()
    }

    async fn step(
        &self,
        recap: &mut PlayRecap,
        name: &str,
        script: &Script,
    ) -> Result<StepStatus, ProvisionError> {
        let output = self
            .transport
            .run(script)
            .await
            .map_err(ProvisionError::step(name))?;
        Ok(recap.record(name, StepStatus::from_changed(output.changed())))
    }
}

/// Remote path for an upload; OpenSSH on Windows takes forward slashes
fn remote_file(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.replace('\\', "/").trim_end_matches('/'), name)
}

/// Parse `[{"name": .., "thumbprint": ..}]` into a name → thumbprint map
pub fn parse_thumbprints(payload: &str) -> Result<HashMap<String, String>, String> {
    let records: Vec<ThumbprintRecord> =
        serde_json::from_str(payload).map_err(|e| format!("{}: {:?}", e, payload))?;
    Ok(records
        .into_iter()
        .map(|r| (r.name, r.thumbprint.to_uppercase()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_file() {
        assert_eq!(
            remote_file(r"C:\Windows\TEMP\testbed-certs", "ca.pem"),
            "C:/Windows/TEMP/testbed-certs/ca.pem"
        );
        assert_eq!(remote_file("C:/certs/", "a.pfx"), "C:/certs/a.pfx");
    }

    #[test]
    fn test_parse_thumbprints() {
        let payload = r#"[{"name":"cbt-sha1","thumbprint":"ab12"},{"name":"verification","thumbprint":"CD34"}]"#;
        let thumbprints = parse_thumbprints(payload).unwrap();

        assert_eq!(thumbprints.len(), 2);
        assert_eq!(thumbprints["cbt-sha1"], "AB12");
        assert_eq!(thumbprints["verification"], "CD34");
    }

    #[test]
    fn test_parse_thumbprints_invalid() {
        assert!(parse_thumbprints("").is_err());
        assert!(parse_thumbprints("{\"name\":1}").is_err());
    }
}
