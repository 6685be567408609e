//! Declarative description of one test certificate endpoint

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::EndpointError;

/// Signature algorithm the test certificate is issued with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    Sha1,
    Sha256,
    Sha256Pss,
    Sha384,
    Sha512,
    Sha512Pss,
    /// Let the certificate script pick its default
    #[default]
    Default,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Sha1 => "sha1",
            KeyAlgorithm::Sha256 => "sha256",
            KeyAlgorithm::Sha256Pss => "sha256-pss",
            KeyAlgorithm::Sha384 => "sha384",
            KeyAlgorithm::Sha512 => "sha512",
            KeyAlgorithm::Sha512Pss => "sha512-pss",
            KeyAlgorithm::Default => "default",
        }
    }

    /// Whether the signature uses RSASSA-PSS padding
    pub fn is_pss(&self) -> bool {
        matches!(self, KeyAlgorithm::Sha256Pss | KeyAlgorithm::Sha512Pss)
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha1" => Ok(KeyAlgorithm::Sha1),
            "sha256" => Ok(KeyAlgorithm::Sha256),
            "sha256-pss" => Ok(KeyAlgorithm::Sha256Pss),
            "sha384" => Ok(KeyAlgorithm::Sha384),
            "sha512" => Ok(KeyAlgorithm::Sha512),
            "sha512-pss" => Ok(KeyAlgorithm::Sha512Pss),
            "default" => Ok(KeyAlgorithm::Default),
            other => Err(EndpointError::UnknownKeyAlgorithm(other.to_string())),
        }
    }
}

/// One configured test certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointSpec {
    /// Test name, used for the friendly name and firewall rule
    pub name: String,

    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,

    /// Explicit certificate subject, defaults to the host FQDN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default)]
    pub self_signed: bool,

    /// Issued by the testbed CA rather than an untrusted one
    #[serde(default = "default_system_ca")]
    pub system_ca: bool,
}

fn default_system_ca() -> bool {
    true
}

impl EndpointSpec {
    pub fn new(name: impl Into<String>, key_algorithm: KeyAlgorithm) -> Self {
        Self {
            name: name.into(),
            key_algorithm,
            subject: None,
            self_signed: false,
            system_ca: true,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn self_signed(mut self) -> Self {
        self.self_signed = true;
        self
    }

    pub fn untrusted_ca(mut self) -> Self {
        self.system_ca = false;
        self
    }

    /// Subject the certificate is issued for
    pub fn subject_or<'a>(&'a self, host_fqdn: &'a str) -> &'a str {
        self.subject.as_deref().unwrap_or(host_fqdn)
    }

    /// The 11 endpoints the integration suite expects, in port order
    pub fn defaults() -> Vec<EndpointSpec> {
        vec![
            EndpointSpec::new("cbt-sha1", KeyAlgorithm::Sha1),
            EndpointSpec::new("cbt-sha256", KeyAlgorithm::Sha256),
            EndpointSpec::new("cbt-sha256-pss", KeyAlgorithm::Sha256Pss),
            EndpointSpec::new("cbt-sha384", KeyAlgorithm::Sha384),
            EndpointSpec::new("cbt-sha512", KeyAlgorithm::Sha512),
            EndpointSpec::new("cbt-sha512-pss", KeyAlgorithm::Sha512Pss),
            EndpointSpec::new("verification", KeyAlgorithm::Default),
            EndpointSpec::new("verification-bad-ca", KeyAlgorithm::Default).untrusted_ca(),
            EndpointSpec::new("verification-bad-cn", KeyAlgorithm::Default)
                .with_subject("fake-host"),
            EndpointSpec::new("verification-self-signed", KeyAlgorithm::Default).self_signed(),
            EndpointSpec::new("verification-default", KeyAlgorithm::Default),
        ]
    }
}

/// Endpoint names feed firewall rules and file names, keep them plain
pub(crate) fn is_valid_endpoint_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_algorithm_serde_names() {
        let parsed: Vec<KeyAlgorithm> =
            serde_yaml::from_str("[sha1, sha256, sha256-pss, sha384, sha512, sha512-pss, default]")
                .unwrap();
        assert_eq!(
            parsed,
            vec![
                KeyAlgorithm::Sha1,
                KeyAlgorithm::Sha256,
                KeyAlgorithm::Sha256Pss,
                KeyAlgorithm::Sha384,
                KeyAlgorithm::Sha512,
                KeyAlgorithm::Sha512Pss,
                KeyAlgorithm::Default,
            ]
        );

        for alg in parsed {
            assert_eq!(alg.as_str().parse::<KeyAlgorithm>().unwrap(), alg);
        }
    }

    #[test]
    fn test_key_algorithm_unknown() {
        let err = "md5".parse::<KeyAlgorithm>().unwrap_err();
        assert_eq!(err, EndpointError::UnknownKeyAlgorithm("md5".to_string()));
    }

    #[test]
    fn test_spec_defaults_from_yaml() {
        let spec: EndpointSpec = serde_yaml::from_str("name: verification").unwrap();
        assert_eq!(spec.key_algorithm, KeyAlgorithm::Default);
        assert!(spec.subject.is_none());
        assert!(!spec.self_signed);
        assert!(spec.system_ca);
        assert_eq!(spec.subject_or("dc01.testbed.local"), "dc01.testbed.local");
    }

    #[test]
    fn test_subject_override() {
        let spec = EndpointSpec::new("verification-bad-cn", KeyAlgorithm::Default)
            .with_subject("fake-host");
        assert_eq!(spec.subject_or("dc01.testbed.local"), "fake-host");
    }

    #[test]
    fn test_default_table_shape() {
        let specs = EndpointSpec::defaults();
        assert_eq!(specs.len(), 11);
        assert_eq!(specs[1].name, "cbt-sha256");
        assert_eq!(specs.iter().filter(|s| s.key_algorithm.is_pss()).count(), 2);
        assert!(specs.iter().any(|s| s.self_signed));
        assert!(specs.iter().any(|s| !s.system_ca));
    }

    #[test]
    fn test_valid_endpoint_names() {
        assert!(is_valid_endpoint_name("cbt-sha256"));
        assert!(is_valid_endpoint_name("verification_2"));
        assert!(!is_valid_endpoint_name(""));
        assert!(!is_valid_endpoint_name("cbt sha256"));
        assert!(!is_valid_endpoint_name("cbt(sha256)"));
    }
}
