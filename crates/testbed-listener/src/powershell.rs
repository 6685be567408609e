//! [`ListenerHost`] backed by PowerShell over a [`Transport`]

use async_trait::async_trait;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddrV4};
use testbed_transport::{Script, Transport};
use tracing::debug;

use crate::host::{HostError, ListenerAddress, ListenerHost, ObservedListener, PortForwardRule};

const GET_FRIENDLY_NAME: &str = r#"
$cert = Get-Item -LiteralPath "Cert:\LocalMachine\My\$Thumbprint" -ErrorAction SilentlyContinue
if (-not $cert) {
    throw "Certificate $Thumbprint not found in Cert:\LocalMachine\My"
}
ConvertTo-Json -InputObject @{ friendly_name = [string]$cert.FriendlyName } -Compress
"#;

const SET_FRIENDLY_NAME: &str = r#"
$cert = Get-Item -LiteralPath "Cert:\LocalMachine\My\$Thumbprint"
$cert.FriendlyName = $FriendlyName
"#;

const GET_ADAPTER_IPV4: &str = r#"
$ip = Get-NetIPAddress -InterfaceAlias $Adapter -AddressFamily IPv4 -ErrorAction SilentlyContinue |
    Where-Object { $_.AddressState -eq 'Preferred' } |
    Select-Object -First 1
if ($ip) {
    $ip.IPAddress
}
"#;

const GET_HTTPS_LISTENERS: &str = r#"
$listeners = @(Get-WSManInstance -ResourceURI winrm/config/listener -Enumerate |
    Where-Object { $_.Transport -eq 'HTTPS' } |
    ForEach-Object {
        @{
            address = [string]$_.Address
            port = [int]$_.Port
            thumbprint = [string]$_.CertificateThumbprint
        }
    })
ConvertTo-Json -InputObject $listeners -Compress
"#;

const REMOVE_LISTENER: &str = r#"
Remove-WSManInstance -ResourceURI winrm/config/listener -SelectorSet @{
    Address = $Address
    Transport = 'HTTPS'
}
"#;

const CREATE_LISTENER: &str = r#"
New-WSManInstance -ResourceURI winrm/config/listener -SelectorSet @{
    Address = $Address
    Transport = 'HTTPS'
} -ValueSet @{
    Port = $Port
    CertificateThumbprint = $Thumbprint
} | Out-Null
"#;

const SHOW_PORT_PROXY: &str = r#"
netsh interface portproxy show v4tov4
if ($LASTEXITCODE -ne 0) {
    throw "netsh portproxy show failed with exit code $LASTEXITCODE"
}
"#;

const ADD_PORT_PROXY: &str = r#"
$output = netsh interface portproxy add v4tov4 "listenaddress=$ListenAddress" "listenport=$ListenPort" "connectaddress=$ConnectAddress" "connectport=$ConnectPort"
if ($LASTEXITCODE -ne 0) {
    throw "netsh portproxy add failed: $output"
}
"#;

#[derive(Debug, Deserialize)]
struct FriendlyNameRecord {
    friendly_name: String,
}

#[derive(Debug, Deserialize)]
struct ListenerRecord {
    address: String,
    port: u16,
    #[serde(default)]
    thumbprint: Option<String>,
}

impl From<ListenerRecord> for ObservedListener {
    fn from(record: ListenerRecord) -> Self {
        ObservedListener {
            address: ListenerAddress::parse(&record.address),
            port: record.port,
            thumbprint: record.thumbprint.filter(|tp| !tp.trim().is_empty()),
        }
    }
}

/// Windows host reached through a PowerShell-capable transport
pub struct PowerShellListenerHost<'a> {
    transport: &'a dyn Transport,
}

impl<'a> PowerShellListenerHost<'a> {
    pub fn new(transport: &'a dyn Transport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<'a> ListenerHost for PowerShellListenerHost<'a> {
    async fn certificate_friendly_name(&self, thumbprint: &str) -> Result<String, HostError> {
        let script = Script::powershell(GET_FRIENDLY_NAME).var("Thumbprint", thumbprint);
        let output = self.transport.run(&script).await?;
        let record: FriendlyNameRecord =
            serde_json::from_str(&output.payload()).map_err(|e| HostError::Parse {
                what: "certificate",
                message: e.to_string(),
            })?;
        Ok(record.friendly_name)
    }

    async fn set_certificate_friendly_name(
        &self,
        thumbprint: &str,
        friendly_name: &str,
    ) -> Result<(), HostError> {
        let script = Script::powershell(SET_FRIENDLY_NAME)
            .var("Thumbprint", thumbprint)
            .var("FriendlyName", friendly_name);
        self.transport.run(&script).await?;
        Ok(())
    }

    async fn adapter_ipv4(&self, adapter: &str) -> Result<Option<Ipv4Addr>, HostError> {
        let script = Script::powershell(GET_ADAPTER_IPV4).var("Adapter", adapter);
        let output = self.transport.run(&script).await?;
        let payload = output.payload();
        if payload.is_empty() {
            debug!(adapter = %adapter, "Adapter has no IPv4 address yet");
            return Ok(None);
        }
        payload
            .parse::<Ipv4Addr>()
            .map(Some)
            .map_err(|e| HostError::Parse {
                what: "adapter address",
                message: format!("{}: {:?}", e, payload),
            })
    }

    async fn https_listeners(&self) -> Result<Vec<ObservedListener>, HostError> {
        let output = self
            .transport
            .run(&Script::powershell(GET_HTTPS_LISTENERS))
            .await?;
        parse_listeners(&output.payload())
    }

    async fn remove_listener(&self, listener: &ObservedListener) -> Result<(), HostError> {
        let script = Script::powershell(REMOVE_LISTENER).var("Address", listener.address.to_wsman());
        self.transport.run(&script).await?;
        Ok(())
    }

    async fn create_listener(
        &self,
        address: Ipv4Addr,
        port: u16,
        thumbprint: &str,
    ) -> Result<(), HostError> {
        let script = Script::powershell(CREATE_LISTENER)
            .var("Address", ListenerAddress::Ip(address).to_wsman())
            .int("Port", i64::from(port))
            .var("Thumbprint", thumbprint);
        self.transport.run(&script).await?;
        Ok(())
    }

    async fn port_forwards(&self) -> Result<Vec<PortForwardRule>, HostError> {
        let output = self
            .transport
            .run(&Script::powershell(SHOW_PORT_PROXY))
            .await?;
        Ok(parse_portproxy_table(&output.stdout))
    }

    async fn add_port_forward(&self, rule: &PortForwardRule) -> Result<(), HostError> {
        let script = Script::powershell(ADD_PORT_PROXY)
            .var("ListenAddress", rule.listen.ip().to_string())
            .int("ListenPort", i64::from(rule.listen.port()))
            .var("ConnectAddress", rule.connect.ip().to_string())
            .int("ConnectPort", i64::from(rule.connect.port()));
        self.transport.run(&script).await?;
        Ok(())
    }
}

/// Parse the JSON array emitted by the listener enumeration script
pub fn parse_listeners(payload: &str) -> Result<Vec<ObservedListener>, HostError> {
    if payload.trim().is_empty() {
        return Ok(Vec::new());
    }
    let records: Vec<ListenerRecord> =
        serde_json::from_str(payload).map_err(|e| HostError::Parse {
            what: "listener",
            message: e.to_string(),
        })?;
    Ok(records.into_iter().map(ObservedListener::from).collect())
}

/// Parse `netsh interface portproxy show v4tov4`
///
/// Rows that do not consist of two IPv4 address/port pairs (headers, rules
/// pointing at host names) are skipped. A `*` listen address is read as
/// `0.0.0.0`.
pub fn parse_portproxy_table(output: &str) -> Vec<PortForwardRule> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 4 {
                return None;
            }
            let listen_ip = match fields[0] {
                "*" => Ipv4Addr::UNSPECIFIED,
                other => other.parse().ok()?,
            };
            let listen_port = fields[1].parse().ok()?;
            let connect_ip = fields[2].parse().ok()?;
            let connect_port = fields[3].parse().ok()?;
            Some(PortForwardRule {
                listen: SocketAddrV4::new(listen_ip, listen_port),
                connect: SocketAddrV4::new(connect_ip, connect_port),
            })
        })
        .collect()
}
