//! Host-side state the listener reconciler reads and mutates

use async_trait::async_trait;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use testbed_transport::TransportError;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Errors talking to the host's certificate, adapter and WSMan stores
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unexpected {what} output: {message}")]
    Parse { what: &'static str, message: String },
}

/// Address a WSMan listener is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerAddress {
    /// `*`, every address
    Any,
    /// `IP:<address>`, or a bare IPv4 address
    Ip(Ipv4Addr),
    /// Any other selector (`MAC:...`, `IP:` ranges, IPv6)
    Other(String),
}

impl ListenerAddress {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == "*" {
            return ListenerAddress::Any;
        }
        if let Ok(ip) = raw.strip_prefix("IP:").unwrap_or(raw).parse::<Ipv4Addr>() {
            return ListenerAddress::Ip(ip);
        }
        ListenerAddress::Other(raw.to_string())
    }

    /// Selector value used by WSMan
    pub fn to_wsman(&self) -> String {
        match self {
            ListenerAddress::Any => "*".to_string(),
            ListenerAddress::Ip(ip) => format!("IP:{}", ip),
            ListenerAddress::Other(raw) => raw.clone(),
        }
    }
}

impl fmt::Display for ListenerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wsman())
    }
}

/// An HTTPS listener as currently configured on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedListener {
    pub address: ListenerAddress,
    pub port: u16,
    pub thumbprint: Option<String>,
}

impl ObservedListener {
    /// Thumbprints are hex and compared without regard to case
    pub fn thumbprint_matches(&self, thumbprint: &str) -> bool {
        self.thumbprint
            .as_deref()
            .map(|tp| tp.trim().eq_ignore_ascii_case(thumbprint.trim()))
            .unwrap_or(false)
    }
}

impl fmt::Display for ObservedListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HTTPS {} port {} cert {}",
            self.address,
            self.port,
            self.thumbprint.as_deref().unwrap_or("<none>")
        )
    }
}

/// `listen -> connect` IPv4 port proxy rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortForwardRule {
    pub listen: SocketAddrV4,
    pub connect: SocketAddrV4,
}

impl fmt::Display for PortForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.listen, self.connect)
    }
}

/// Operations the reconciler needs from a Windows host
///
/// The PowerShell implementation lives in [`crate::powershell`]; tests use
/// mocks and in-memory fakes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ListenerHost: Send + Sync {
    /// Friendly name of a certificate in `Cert:\LocalMachine\My`
    async fn certificate_friendly_name(&self, thumbprint: &str) -> Result<String, HostError>;

    async fn set_certificate_friendly_name(
        &self,
        thumbprint: &str,
        friendly_name: &str,
    ) -> Result<(), HostError>;

    /// Preferred IPv4 address of an adapter, `None` while unassigned
    async fn adapter_ipv4(&self, adapter: &str) -> Result<Option<Ipv4Addr>, HostError>;

    /// All listeners using the HTTPS transport
    async fn https_listeners(&self) -> Result<Vec<ObservedListener>, HostError>;

    async fn remove_listener(&self, listener: &ObservedListener) -> Result<(), HostError>;

    async fn create_listener(
        &self,
        address: Ipv4Addr,
        port: u16,
        thumbprint: &str,
    ) -> Result<(), HostError>;

    async fn port_forwards(&self) -> Result<Vec<PortForwardRule>, HostError>;

    /// Add or overwrite the rule for `rule.listen`
    async fn add_port_forward(&self, rule: &PortForwardRule) -> Result<(), HostError>;
}
