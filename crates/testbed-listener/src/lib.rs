//! Per-certificate WinRM HTTPS listener reconciliation
//!
//! For every endpoint the reconciler makes sure that:
//!
//! - the certificate carries the friendly name `test_<name>_<external port>`
//! - an HTTPS listener is bound to the endpoint's loopback adapter address on
//!   the listener port, using the endpoint's certificate
//! - a port proxy rule forwards the external port on the host's public
//!   address to that listener
//!
//! Decisions are made by the pure functions in [`plan`]; [`reconciler`]
//! observes the host, plans, and applies the resulting actions in order.

pub mod host;
pub mod plan;
pub mod powershell;
pub mod reconciler;

pub use host::{HostError, ListenerAddress, ListenerHost, ObservedListener, PortForwardRule};
pub use plan::{plan_friendly_name, plan_listener, Action, DesiredListener, ReconcilePlan};
pub use powershell::{parse_portproxy_table, PowerShellListenerHost};
pub use reconciler::{
    ListenerReconciler, ReconcileError, ReconcileOptions, ReconcileOutcome,
    DEFAULT_ADAPTER_POLL_INTERVAL, DEFAULT_ADAPTER_WAIT_TIMEOUT,
};
