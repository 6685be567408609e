//! Ordinal-index derivation and the validated endpoint table

use std::collections::HashMap;

use crate::spec::{is_valid_endpoint_name, EndpointSpec};
use crate::EndpointError;

/// First external port handed out to endpoint 0
pub const DEFAULT_BASE_PORT: u16 = 29900;

/// Interface alias of the loopback adapter for endpoint 0
pub const DEFAULT_ADAPTER_PREFIX: &str = "TestBed Loopback Adapter";

/// Derive `(external_port, listener_port)` for an ordinal index
///
/// `external = base + 2*index`, `listener = external + 1`. Returns the first
/// port that does not fit in a `u16` as the error value.
pub fn derive_ports(base_port: u16, index: usize) -> Result<(u16, u16), u32> {
    let external = u32::from(base_port) + 2 * index as u32;
    let listener = external + 1;

    let external = u16::try_from(external).map_err(|_| external)?;
    let listener = u16::try_from(listener).map_err(|_| listener)?;
    Ok((external, listener))
}

/// Adapter alias for an ordinal index, numbered the way Windows numbers
/// duplicate device names
pub fn adapter_name(prefix: &str, index: usize) -> String {
    if index == 0 {
        prefix.to_string()
    } else {
        format!("{} #{}", prefix, index + 1)
    }
}

/// An endpoint spec together with everything derived from its position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub index: usize,
    pub spec: EndpointSpec,
    pub external_port: u16,
    pub listener_port: u16,
    pub adapter_name: String,
}

impl Endpoint {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Certificate friendly name encoding the test name and external port
    pub fn friendly_name(&self) -> String {
        format!("test_{}_{}", self.spec.name, self.external_port)
    }

    /// Firewall rule name opening the external port.
    ///
    /// Has no closing parenthesis, matching rules on existing hosts.
    pub fn firewall_rule_name(&self) -> String {
        format!("WinRM HTTPS ({}", self.spec.name)
    }

    /// File stem of the PFX produced by the certificate script
    pub fn pfx_file_name(&self) -> String {
        format!("{}.pfx", self.spec.name)
    }
}

/// The configured endpoints, validated to map index to ports and adapter
/// names one-to-one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTable {
    base_port: u16,
    endpoints: Vec<Endpoint>,
}

impl EndpointTable {
    pub fn new(
        base_port: u16,
        adapter_prefix: &str,
        specs: Vec<EndpointSpec>,
    ) -> Result<Self, EndpointError> {
        let mut endpoints = Vec::with_capacity(specs.len());
        let mut names: HashMap<String, usize> = HashMap::new();
        let mut ports: HashMap<u16, usize> = HashMap::new();
        let mut adapters: HashMap<String, usize> = HashMap::new();

        for (index, spec) in specs.into_iter().enumerate() {
            if !is_valid_endpoint_name(&spec.name) {
                return Err(EndpointError::InvalidName(spec.name));
            }
            if names.insert(spec.name.clone(), index).is_some() {
                return Err(EndpointError::DuplicateName(spec.name));
            }

            let (external_port, listener_port) =
                derive_ports(base_port, index).map_err(|port| EndpointError::PortOverflow {
                    name: spec.name.clone(),
                    index,
                    port,
                })?;

            for port in [external_port, listener_port] {
                if let Some(other) = ports.insert(port, index) {
                    let other: &Endpoint = &endpoints[other];
                    return Err(EndpointError::PortCollision {
                        name: spec.name,
                        other: other.spec.name.clone(),
                        port,
                    });
                }
            }

            let adapter = adapter_name(adapter_prefix, index);
            if let Some(other) = adapters.insert(adapter.clone(), index) {
                let other: &Endpoint = &endpoints[other];
                return Err(EndpointError::AdapterCollision {
                    name: spec.name,
                    other: other.spec.name.clone(),
                    adapter,
                });
            }

            endpoints.push(Endpoint {
                index,
                spec,
                external_port,
                listener_port,
                adapter_name: adapter,
            });
        }

        Ok(Self {
            base_port,
            endpoints,
        })
    }

    /// Table built from [`EndpointSpec::defaults`]
    pub fn with_defaults() -> Result<Self, EndpointError> {
        Self::new(
            DEFAULT_BASE_PORT,
            DEFAULT_ADAPTER_PREFIX,
            EndpointSpec::defaults(),
        )
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Endpoint> {
        self.endpoints.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.spec.name == name)
    }
}

impl<'a> IntoIterator for &'a EndpointTable {
    type Item = &'a Endpoint;
    type IntoIter = std::slice::Iter<'a, Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.endpoints.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyAlgorithm;

    fn spec(name: &str) -> EndpointSpec {
        EndpointSpec::new(name, KeyAlgorithm::Default)
    }

    #[test]
    fn test_cbt_sha256_example() {
        let table = EndpointTable::with_defaults().unwrap();
        let endpoint = table.get("cbt-sha256").unwrap();

        assert_eq!(endpoint.index, 1);
        assert_eq!(endpoint.external_port, 29902);
        assert_eq!(endpoint.listener_port, 29903);
        assert_eq!(endpoint.friendly_name(), "test_cbt-sha256_29902");
        assert_eq!(endpoint.firewall_rule_name(), "WinRM HTTPS (cbt-sha256");
        assert_eq!(endpoint.adapter_name, "TestBed Loopback Adapter #2");
    }

    #[test]
    fn test_adapter_names() {
        assert_eq!(adapter_name("Loopback Adapter", 0), "Loopback Adapter");
        assert_eq!(adapter_name("Loopback Adapter", 1), "Loopback Adapter #2");
        assert_eq!(adapter_name("Loopback Adapter", 10), "Loopback Adapter #11");
    }

    #[test]
    fn test_ports_distinct_and_increasing() {
        let table = EndpointTable::with_defaults().unwrap();
        assert_eq!(table.len(), 11);

        let mut seen = std::collections::HashSet::new();
        let mut last = 0u16;
        for endpoint in &table {
            assert!(seen.insert(endpoint.external_port));
            assert!(seen.insert(endpoint.listener_port));
            assert!(endpoint.external_port > last);
            assert_eq!(endpoint.listener_port, endpoint.external_port + 1);
            last = endpoint.listener_port;
        }

        let first = table.iter().next().unwrap();
        assert_eq!(first.external_port, 29900);
        assert_eq!(first.adapter_name, DEFAULT_ADAPTER_PREFIX);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = EndpointTable::new(29900, "A", vec![spec("one"), spec("one")]);
        assert_eq!(
            result.unwrap_err(),
            EndpointError::DuplicateName("one".to_string())
        );
    }

    #[test]
    fn test_invalid_name_rejected() {
        let result = EndpointTable::new(29900, "A", vec![spec("bad name")]);
        assert!(matches!(result, Err(EndpointError::InvalidName(_))));
    }

    #[test]
    fn test_port_overflow_rejected() {
        let result = EndpointTable::new(65533, "A", vec![spec("a"), spec("b")]);
        assert_eq!(
            result.unwrap_err(),
            EndpointError::PortOverflow {
                name: "b".to_string(),
                index: 1,
                port: 65535 + 1,
            }
        );

        // 65534/65535 is the last pair that fits
        let table = EndpointTable::new(65534, "A", vec![spec("a")]).unwrap();
        assert_eq!(table.iter().next().unwrap().listener_port, 65535);
    }

    #[test]
    fn test_derive_ports() {
        assert_eq!(derive_ports(29900, 0), Ok((29900, 29901)));
        assert_eq!(derive_ports(29900, 10), Ok((29920, 29921)));
        assert_eq!(derive_ports(65535, 0), Err(65536));
    }
}
