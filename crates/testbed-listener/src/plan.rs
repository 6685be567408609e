//! Pure reconciliation decisions
//!
//! Nothing here touches a host. Given what the host looks like and what the
//! endpoint should look like, the planner lists the mutations needed to get
//! there. An empty plan means the endpoint is already in its desired state.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use testbed_endpoint::Endpoint;

use crate::host::{ListenerAddress, ObservedListener, PortForwardRule};

/// Desired listener state for one endpoint, once the adapter address is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredListener {
    pub endpoint: String,
    pub address: Ipv4Addr,
    pub port: u16,
    pub thumbprint: String,
    pub forward: PortForwardRule,
}

impl DesiredListener {
    pub fn for_endpoint(
        endpoint: &Endpoint,
        thumbprint: &str,
        external_address: Ipv4Addr,
        adapter_address: Ipv4Addr,
    ) -> Self {
        Self {
            endpoint: endpoint.name().to_string(),
            address: adapter_address,
            port: endpoint.listener_port,
            thumbprint: thumbprint.to_string(),
            forward: PortForwardRule {
                listen: SocketAddrV4::new(external_address, endpoint.external_port),
                connect: SocketAddrV4::new(adapter_address, endpoint.listener_port),
            },
        }
    }

    fn is_satisfied_by(&self, listener: &ObservedListener) -> bool {
        listener.port == self.port
            && listener.address == ListenerAddress::Ip(self.address)
            && listener.thumbprint_matches(&self.thumbprint)
    }
}

/// One host mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SetFriendlyName {
        thumbprint: String,
        friendly_name: String,
    },
    RemoveListener(ObservedListener),
    CreateListener {
        address: Ipv4Addr,
        port: u16,
        thumbprint: String,
    },
    AddPortForward(PortForwardRule),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::SetFriendlyName {
                thumbprint,
                friendly_name,
            } => write!(f, "set friendly name of {} to {}", thumbprint, friendly_name),
            Action::RemoveListener(listener) => write!(f, "remove listener {}", listener),
            Action::CreateListener {
                address,
                port,
                thumbprint,
            } => write!(
                f,
                "create HTTPS listener IP:{} port {} cert {}",
                address, port, thumbprint
            ),
            Action::AddPortForward(rule) => write!(f, "add port forward {}", rule),
        }
    }
}

/// Ordered list of mutations for one endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub actions: Vec<Action>,
    /// Adapter without an IPv4 address yet; the listener and forward it
    /// needs cannot be planned until it has one
    pub pending_adapter: Option<String>,
}

impl ReconcilePlan {
    pub fn changed(&self) -> bool {
        !self.actions.is_empty() || self.pending_adapter.is_some()
    }

    pub fn extend(&mut self, actions: impl IntoIterator<Item = Action>) {
        self.actions.extend(actions);
    }
}

/// Set the friendly name iff it differs
pub fn plan_friendly_name(thumbprint: &str, current: &str, desired: &str) -> Option<Action> {
    (current != desired).then(|| Action::SetFriendlyName {
        thumbprint: thumbprint.to_string(),
        friendly_name: desired.to_string(),
    })
}

/// Decide listener and port-forward mutations
///
/// `forwards` is `None` when the caller did not inspect the port proxy
/// table; the forward rule is then only written alongside a (re)created
/// listener.
pub fn plan_listener(
    desired: &DesiredListener,
    listeners: &[ObservedListener],
    forwards: Option<&[PortForwardRule]>,
) -> Vec<Action> {
    let mut actions = Vec::new();
    let mut satisfied = false;

    for listener in listeners.iter().filter(|l| l.port == desired.port) {
        if !satisfied && desired.is_satisfied_by(listener) {
            satisfied = true;
        } else {
            actions.push(Action::RemoveListener(listener.clone()));
        }
    }

    // WSMan keys listeners by address and transport, so a listener left on
    // the adapter address under another port blocks the create
    if !satisfied {
        let bound_here = ListenerAddress::Ip(desired.address);
        for listener in listeners
            .iter()
            .filter(|l| l.port != desired.port && l.address == bound_here)
        {
            actions.push(Action::RemoveListener(listener.clone()));
        }
    }

    if !satisfied {
        actions.push(Action::CreateListener {
            address: desired.address,
            port: desired.port,
            thumbprint: desired.thumbprint.clone(),
        });
        actions.push(Action::AddPortForward(desired.forward));
    } else if let Some(forwards) = forwards {
        if !forwards.contains(&desired.forward) {
            actions.push(Action::AddPortForward(desired.forward));
        }
    }

    actions
}
