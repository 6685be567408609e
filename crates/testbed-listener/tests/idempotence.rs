//! Reconciliation against an in-memory host

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Mutex;
use std::time::Duration;
use testbed_endpoint::EndpointTable;
use testbed_listener::{
    HostError, ListenerAddress, ListenerHost, ListenerReconciler, ObservedListener,
    PortForwardRule, ReconcileOptions,
};
use testbed_transport::RetryPolicy;

const EXTERNAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 56, 10);

#[derive(Default)]
struct State {
    friendly_names: HashMap<String, String>,
    adapters: HashMap<String, Ipv4Addr>,
    listeners: Vec<ObservedListener>,
    forwards: Vec<PortForwardRule>,
    removed: usize,
    created: usize,
    mutations: usize,
}

#[derive(Default)]
struct FakeHost {
    state: Mutex<State>,
}

impl FakeHost {
    fn for_table(table: &EndpointTable) -> Self {
        let host = FakeHost::default();
        {
            let mut state = host.state.lock().unwrap();
            for endpoint in table {
                state
                    .friendly_names
                    .insert(thumbprint(endpoint.index), String::new());
                state.adapters.insert(
                    endpoint.adapter_name.clone(),
                    Ipv4Addr::new(169, 254, 10, endpoint.index as u8 + 1),
                );
            }
        }
        host
    }

    fn mutations(&self) -> usize {
        self.state.lock().unwrap().mutations
    }
}

fn thumbprint(index: usize) -> String {
    format!("{:040X}", index + 1)
}

#[async_trait]
impl ListenerHost for FakeHost {
    async fn certificate_friendly_name(&self, thumbprint: &str) -> Result<String, HostError> {
        let state = self.state.lock().unwrap();
        state
            .friendly_names
            .get(thumbprint)
            .cloned()
            .ok_or_else(|| HostError::Parse {
                what: "certificate",
                message: format!("{} not found", thumbprint),
            })
    }

    async fn set_certificate_friendly_name(
        &self,
        thumbprint: &str,
        friendly_name: &str,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        state
            .friendly_names
            .insert(thumbprint.to_string(), friendly_name.to_string());
        state.mutations += 1;
        Ok(())
    }

    async fn adapter_ipv4(&self, adapter: &str) -> Result<Option<Ipv4Addr>, HostError> {
        Ok(self.state.lock().unwrap().adapters.get(adapter).copied())
    }

    async fn https_listeners(&self) -> Result<Vec<ObservedListener>, HostError> {
        Ok(self.state.lock().unwrap().listeners.clone())
    }

    async fn remove_listener(&self, listener: &ObservedListener) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        state
            .listeners
            .retain(|l| !(l.address == listener.address && l.port == listener.port));
        state.removed += 1;
        state.mutations += 1;
        Ok(())
    }

    async fn create_listener(
        &self,
        address: Ipv4Addr,
        port: u16,
        thumbprint: &str,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        state.listeners.push(ObservedListener {
            address: ListenerAddress::Ip(address),
            port,
            thumbprint: Some(thumbprint.to_string()),
        });
        state.created += 1;
        state.mutations += 1;
        Ok(())
    }

    async fn port_forwards(&self) -> Result<Vec<PortForwardRule>, HostError> {
        Ok(self.state.lock().unwrap().forwards.clone())
    }

    async fn add_port_forward(&self, rule: &PortForwardRule) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        state.forwards.retain(|r| r.listen != rule.listen);
        state.forwards.push(*rule);
        state.mutations += 1;
        Ok(())
    }
}

fn options(repair_port_forward_drift: bool) -> ReconcileOptions {
    ReconcileOptions {
        adapter_wait: RetryPolicy::unbounded(Duration::from_millis(10))
            .with_timeout(Duration::from_secs(1)),
        repair_port_forward_drift,
    }
}

fn targets(table: &EndpointTable) -> Vec<(&testbed_endpoint::Endpoint, String)> {
    table.iter().map(|e| (e, thumbprint(e.index))).collect()
}

#[tokio::test]
async fn test_second_run_changes_nothing() {
    let table = EndpointTable::with_defaults().unwrap();
    let host = FakeHost::for_table(&table);
    let reconciler = ListenerReconciler::new(&host, options(false));
    let targets = targets(&table);

    let first = reconciler
        .reconcile_all(targets.iter().map(|(e, tp)| (*e, tp.as_str())), EXTERNAL_IP)
        .await
        .unwrap();
    assert_eq!(first.len(), 11);
    assert!(first.iter().all(|o| o.changed()));
    let after_first = host.mutations();
    // friendly name + listener + forward per endpoint
    assert_eq!(after_first, 11 * 3);

    let second = reconciler
        .reconcile_all(targets.iter().map(|(e, tp)| (*e, tp.as_str())), EXTERNAL_IP)
        .await
        .unwrap();
    assert!(second.iter().all(|o| !o.changed()));
    assert_eq!(host.mutations(), after_first);

    let state = host.state.lock().unwrap();
    assert_eq!(state.listeners.len(), 11);
    assert_eq!(state.forwards.len(), 11);
    assert_eq!(
        state.friendly_names.get(&thumbprint(1)).unwrap(),
        "test_cbt-sha256_29902"
    );
    assert!(state.forwards.contains(&PortForwardRule {
        listen: SocketAddrV4::new(EXTERNAL_IP, 29902),
        connect: SocketAddrV4::new(Ipv4Addr::new(169, 254, 10, 2), 29903),
    }));
}

#[tokio::test]
async fn test_stale_listener_replaced_exactly_once() {
    let table = EndpointTable::with_defaults().unwrap();
    let endpoint = table.get("cbt-sha256").unwrap();
    let host = FakeHost::for_table(&table);
    {
        let mut state = host.state.lock().unwrap();
        state.listeners.push(ObservedListener {
            address: ListenerAddress::Ip(Ipv4Addr::new(169, 254, 10, 2)),
            port: 29903,
            thumbprint: Some("DEADBEEF".to_string()),
        });
    }

    let reconciler = ListenerReconciler::new(&host, options(false));
    let outcome = reconciler
        .reconcile(endpoint, &thumbprint(1), EXTERNAL_IP)
        .await
        .unwrap();
    assert!(outcome.changed());

    let state = host.state.lock().unwrap();
    assert_eq!(state.removed, 1);
    assert_eq!(state.created, 1);
    assert_eq!(state.listeners.len(), 1);
    assert!(state.listeners[0].thumbprint_matches(&thumbprint(1)));
}

#[tokio::test]
async fn test_forward_drift_only_repaired_when_enabled() {
    let table = EndpointTable::with_defaults().unwrap();
    let endpoint = table.get("verification").unwrap();
    let tp = thumbprint(endpoint.index);
    let host = FakeHost::for_table(&table);

    ListenerReconciler::new(&host, options(false))
        .reconcile(endpoint, &tp, EXTERNAL_IP)
        .await
        .unwrap();

    // Something else rewrites the forward behind our back
    let drifted = PortForwardRule {
        listen: SocketAddrV4::new(EXTERNAL_IP, endpoint.external_port),
        connect: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 99), endpoint.listener_port),
    };
    {
        let mut state = host.state.lock().unwrap();
        state.forwards = vec![drifted];
    }

    let legacy = ListenerReconciler::new(&host, options(false))
        .reconcile(endpoint, &tp, EXTERNAL_IP)
        .await
        .unwrap();
    assert!(!legacy.changed());
    assert_eq!(host.state.lock().unwrap().forwards, vec![drifted]);

    let repaired = ListenerReconciler::new(&host, options(true))
        .reconcile(endpoint, &tp, EXTERNAL_IP)
        .await
        .unwrap();
    assert!(repaired.changed());
    let forwards = host.state.lock().unwrap().forwards.clone();
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].connect.ip(), &Ipv4Addr::new(169, 254, 10, 7));
}
