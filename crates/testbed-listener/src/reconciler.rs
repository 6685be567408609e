//! Listener reconciliation against a live host

use std::net::Ipv4Addr;
use std::time::Duration;
use testbed_endpoint::Endpoint;
use testbed_transport::{poll_until, RetryPolicy, WaitError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::host::{HostError, ListenerHost};
use crate::plan::{plan_friendly_name, plan_listener, Action, DesiredListener, ReconcilePlan};

/// Default delay between adapter address checks
pub const DEFAULT_ADAPTER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default upper bound on waiting for an adapter address
pub const DEFAULT_ADAPTER_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Reconciliation errors
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("Adapter '{adapter}' for endpoint '{endpoint}' has no IPv4 address: {cause}")]
    AdapterAddress {
        endpoint: String,
        adapter: String,
        cause: WaitError<HostError>,
    },
}

/// Reconciler tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Policy for waiting on the loopback adapter's address
    pub adapter_wait: RetryPolicy,
    /// Re-check the port proxy rule even when the listener already matches
    pub repair_port_forward_drift: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            adapter_wait: RetryPolicy::unbounded(DEFAULT_ADAPTER_POLL_INTERVAL)
                .with_timeout(DEFAULT_ADAPTER_WAIT_TIMEOUT),
            repair_port_forward_drift: false,
        }
    }
}

/// What happened to one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub endpoint: String,
    pub actions: Vec<Action>,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        !self.actions.is_empty()
    }
}

/// Brings each endpoint's certificate label, HTTPS listener and port forward
/// into the desired state
pub struct ListenerReconciler<'a, H: ListenerHost + ?Sized> {
    host: &'a H,
    options: ReconcileOptions,
}

impl<'a, H: ListenerHost + ?Sized> ListenerReconciler<'a, H> {
    pub fn new(host: &'a H, options: ReconcileOptions) -> Self {
        Self { host, options }
    }

    /// Reconcile one endpoint
    ///
    /// The certificate identified by `thumbprint` must already be in the
    /// machine store and the endpoint's adapter must already exist.
    pub async fn reconcile(
        &self,
        endpoint: &Endpoint,
        thumbprint: &str,
        external_address: Ipv4Addr,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let mut applied = Vec::new();

        let current = self.host.certificate_friendly_name(thumbprint).await?;
        if let Some(action) = plan_friendly_name(thumbprint, &current, &endpoint.friendly_name()) {
            self.apply(&action).await?;
            applied.push(action);
        }

        let adapter_address = self.wait_for_adapter(endpoint).await?;
        let desired =
            DesiredListener::for_endpoint(endpoint, thumbprint, external_address, adapter_address);

        for action in self.plan_listener_for(&desired).await? {
            self.apply(&action).await?;
            applied.push(action);
        }

        if applied.is_empty() {
            debug!(endpoint = %endpoint.name(), "Listener already in desired state");
        } else {
            info!(
                endpoint = %endpoint.name(),
                changes = applied.len(),
                "Listener reconciled"
            );
        }

        Ok(ReconcileOutcome {
            endpoint: endpoint.name().to_string(),
            actions: applied,
        })
    }

    /// Reconcile endpoints one at a time, in order, stopping at the first
    /// failure
    pub async fn reconcile_all<'e, I>(
        &self,
        targets: I,
        external_address: Ipv4Addr,
    ) -> Result<Vec<ReconcileOutcome>, ReconcileError>
    where
        I: IntoIterator<Item = (&'e Endpoint, &'e str)>,
    {
        let mut outcomes = Vec::new();
        for (endpoint, thumbprint) in targets {
            outcomes.push(self.reconcile(endpoint, thumbprint, external_address).await?);
        }
        Ok(outcomes)
    }

    /// Compute what [`reconcile`](Self::reconcile) would do without
    /// mutating the host
    ///
    /// The adapter is observed once rather than waited for; one without an
    /// address is reported as [`ReconcilePlan::pending_adapter`].
    pub async fn plan_endpoint(
        &self,
        endpoint: &Endpoint,
        thumbprint: &str,
        external_address: Ipv4Addr,
    ) -> Result<ReconcilePlan, ReconcileError> {
        let mut plan = ReconcilePlan::default();

        let current = self.host.certificate_friendly_name(thumbprint).await?;
        plan.extend(plan_friendly_name(
            thumbprint,
            &current,
            &endpoint.friendly_name(),
        ));

        let Some(adapter_address) = self.host.adapter_ipv4(&endpoint.adapter_name).await? else {
            debug!(adapter = %endpoint.adapter_name, "Adapter has no address, listener not planned");
            plan.pending_adapter = Some(endpoint.adapter_name.clone());
            return Ok(plan);
        };
        let desired =
            DesiredListener::for_endpoint(endpoint, thumbprint, external_address, adapter_address);
        plan.extend(self.plan_listener_for(&desired).await?);

        Ok(plan)
    }

    async fn plan_listener_for(&self, desired: &DesiredListener) -> Result<Vec<Action>, HostError> {
        let listeners = self.host.https_listeners().await?;
        let forwards = if self.options.repair_port_forward_drift {
            Some(self.host.port_forwards().await?)
        } else {
            None
        };
        Ok(plan_listener(desired, &listeners, forwards.as_deref()))
    }

    async fn wait_for_adapter(&self, endpoint: &Endpoint) -> Result<Ipv4Addr, ReconcileError> {
        if !self.options.adapter_wait.is_bounded() {
            warn!(
                adapter = %endpoint.adapter_name,
                "Waiting for adapter address without a timeout"
            );
        }

        let host = self.host;
        let adapter = endpoint.adapter_name.as_str();
        poll_until(&self.options.adapter_wait, "adapter address", || async move {
            host.adapter_ipv4(adapter).await
        })
        .await
        .map_err(|cause| ReconcileError::AdapterAddress {
            endpoint: endpoint.name().to_string(),
            adapter: endpoint.adapter_name.clone(),
            cause,
        })
    }

    async fn apply(&self, action: &Action) -> Result<(), HostError> {
        info!("Applying: {}", action);
        match action {
            Action::SetFriendlyName {
                thumbprint,
                friendly_name,
            } => {
                self.host
                    .set_certificate_friendly_name(thumbprint, friendly_name)
                    .await
            }
            Action::RemoveListener(listener) => self.host.remove_listener(listener).await,
            Action::CreateListener {
                address,
                port,
                thumbprint,
            } => self.host.create_listener(*address, *port, thumbprint).await,
            Action::AddPortForward(rule) => self.host.add_port_forward(rule).await,
        }
    }
}
