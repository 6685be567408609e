//! Test certificate generation
//!
//! Certificates are produced by an external script that runs once per
//! environment. The script receives a JSON manifest of the endpoints and
//! must write `ca.pem` plus one `<name>.pfx` per endpoint into the output
//! directory. A `complete.txt` sentinel written after a successful run keeps
//! later runs from regenerating (and so re-keying) the certificates.

use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use testbed_endpoint::EndpointTable;
use testbed_transport::process::run_process;
use tracing::{debug, info};

use crate::error::ProvisionError;

pub const SENTINEL_FILE: &str = "complete.txt";
pub const CA_FILE: &str = "ca.pem";
pub const MANIFEST_FILE: &str = "endpoints.json";

#[derive(Debug, Serialize)]
struct ManifestEntry<'a> {
    name: &'a str,
    key_algorithm: &'a str,
    subject: &'a str,
    self_signed: bool,
    system_ca: bool,
    pfx: String,
    external_port: u16,
    listener_port: u16,
}

/// Runs the certificate script, at most once per output directory
#[derive(Debug, Clone)]
pub struct CertificateGenerator {
    script: PathBuf,
    output_dir: PathBuf,
    password: String,
    host_fqdn: String,
}

/// Files produced by the certificate script, verified locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub ca_pem: PathBuf,
    pub ca_certificates: usize,
    /// `(endpoint name, pfx path)` in endpoint order
    pub pfx: Vec<(String, PathBuf)>,
}

impl CertificateGenerator {
    pub fn new(
        script: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        password: impl Into<String>,
        host_fqdn: impl Into<String>,
    ) -> Self {
        Self {
            script: script.into(),
            output_dir: output_dir.into(),
            password: password.into(),
            host_fqdn: host_fqdn.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn sentinel_path(&self) -> PathBuf {
        self.output_dir.join(SENTINEL_FILE)
    }

    pub fn is_complete(&self) -> bool {
        self.sentinel_path().exists()
    }

    /// Run the script unless the sentinel exists; returns whether it ran
    ///
    /// The script is invoked as `sh <script> <manifest> <output dir>` with the
    /// PFX export password on stdin.
    pub async fn ensure(&self, table: &EndpointTable) -> Result<bool, ProvisionError> {
        if self.is_complete() {
            debug!(
                sentinel = %self.sentinel_path().display(),
                "Certificates already generated"
            );
            return Ok(false);
        }

        if !self.script.exists() {
            return Err(ProvisionError::Precondition(format!(
                "certificate script {} does not exist",
                self.script.display()
            )));
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(ProvisionError::io(&self.output_dir))?;

        let manifest_path = self.output_dir.join(MANIFEST_FILE);
        tokio::fs::write(&manifest_path, self.manifest(table))
            .await
            .map_err(ProvisionError::io(&manifest_path))?;

        info!(
            script = %self.script.display(),
            endpoints = table.len(),
            "Generating test certificates"
        );
        let args = vec![
            self.script.display().to_string(),
            manifest_path.display().to_string(),
            self.output_dir.display().to_string(),
        ];
        let stdin = format!("{}\n", self.password);
        let output = run_process("sh", &args, Some(&stdin))
            .await
            .map_err(ProvisionError::step("generate certificates"))?;

        if !output.success() {
            return Err(ProvisionError::CertificateScript {
                script: self.script.clone(),
                status: output.status_text(),
                stderr: output.stderr.trim().to_string(),
            });
        }

        let sentinel = self.sentinel_path();
        tokio::fs::write(&sentinel, format!("{}\n", chrono::Utc::now().to_rfc3339()))
            .await
            .map_err(ProvisionError::io(&sentinel))?;
        Ok(true)
    }

    /// JSON manifest handed to the script
    pub fn manifest(&self, table: &EndpointTable) -> String {
        let entries: Vec<ManifestEntry<'_>> = table
            .iter()
            .map(|endpoint| ManifestEntry {
                name: endpoint.name(),
                key_algorithm: endpoint.spec.key_algorithm.as_str(),
                subject: endpoint.spec.subject_or(&self.host_fqdn),
                self_signed: endpoint.spec.self_signed,
                system_ca: endpoint.spec.system_ca,
                pfx: endpoint.pfx_file_name(),
                external_port: endpoint.external_port,
                listener_port: endpoint.listener_port,
            })
            .collect();
        // Serializing plain strings, integers and bools cannot fail
        serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string())
    }

    /// Verify that the CA bundle parses and every PFX is present
    pub fn bundle(&self, table: &EndpointTable) -> Result<CertificateBundle, ProvisionError> {
        let ca_pem = self.output_dir.join(CA_FILE);
        let ca_certificates = count_pem_certificates(&ca_pem)?;

        let mut pfx = Vec::with_capacity(table.len());
        for endpoint in table {
            let path = self.output_dir.join(endpoint.pfx_file_name());
            if !path.is_file() {
                return Err(ProvisionError::Precondition(format!(
                    "certificate for endpoint '{}' missing: {}",
                    endpoint.name(),
                    path.display()
                )));
            }
            pfx.push((endpoint.name().to_string(), path));
        }

        Ok(CertificateBundle {
            ca_pem,
            ca_certificates,
            pfx,
        })
    }
}

/// Number of certificates in a PEM file; zero is an error
pub fn count_pem_certificates(path: &Path) -> Result<usize, ProvisionError> {
    let file = File::open(path).map_err(|e| {
        ProvisionError::Precondition(format!("cannot open {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            ProvisionError::Precondition(format!("failed to parse {}: {}", path.display(), e))
        })?;

    if certs.is_empty() {
        return Err(ProvisionError::Precondition(format!(
            "{} contains no certificates",
            path.display()
        )));
    }
    Ok(certs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use testbed_endpoint::{EndpointSpec, KeyAlgorithm};

    // Any base64 body is accepted by the PEM reader; it does not parse DER
    const FAKE_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIBszCCAVmgAwIBAgIUDw==\n-----END CERTIFICATE-----\n";

    fn table() -> EndpointTable {
        EndpointTable::new(
            29900,
            "TestBed Loopback Adapter",
            vec![
                EndpointSpec::new("cbt-sha256", KeyAlgorithm::Sha256),
                EndpointSpec::new("verification-bad-cn", KeyAlgorithm::Default)
                    .with_subject("fake-host"),
            ],
        )
        .unwrap()
    }

    fn generator(dir: &Path) -> CertificateGenerator {
        CertificateGenerator::new(
            dir.join("generate_cert.sh"),
            dir.join("cert_setup"),
            "pw",
            "dc01.testbed.local",
        )
    }

    #[test]
    fn test_manifest_contents() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = generator(temp_dir.path()).manifest(&table());
        let value: serde_json::Value = serde_json::from_str(&manifest).unwrap();

        assert_eq!(value[0]["name"], "cbt-sha256");
        assert_eq!(value[0]["key_algorithm"], "sha256");
        assert_eq!(value[0]["subject"], "dc01.testbed.local");
        assert_eq!(value[0]["pfx"], "cbt-sha256.pfx");
        assert_eq!(value[1]["subject"], "fake-host");
        assert_eq!(value[1]["external_port"], 29902);
    }

    #[test]
    fn test_bundle_requires_ca_and_pfx() {
        let temp_dir = TempDir::new().unwrap();
        let generator = generator(temp_dir.path());
        std::fs::create_dir_all(generator.output_dir()).unwrap();

        assert!(matches!(
            generator.bundle(&table()),
            Err(ProvisionError::Precondition(_))
        ));

        std::fs::write(generator.output_dir().join(CA_FILE), FAKE_PEM).unwrap();
        std::fs::write(generator.output_dir().join("cbt-sha256.pfx"), b"pfx").unwrap();
        let err = generator.bundle(&table()).unwrap_err();
        assert!(err.to_string().contains("verification-bad-cn"));

        std::fs::write(
            generator.output_dir().join("verification-bad-cn.pfx"),
            b"pfx",
        )
        .unwrap();
        let bundle = generator.bundle(&table()).unwrap();
        assert_eq!(bundle.ca_certificates, 1);
        assert_eq!(bundle.pfx.len(), 2);
        assert_eq!(bundle.pfx[0].0, "cbt-sha256");
    }

    #[test]
    fn test_empty_ca_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CA_FILE);
        std::fs::write(&path, "not a pem file\n").unwrap();

        let err = count_pem_certificates(&path).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }

    #[tokio::test]
    async fn test_missing_script_is_precondition() {
        let temp_dir = TempDir::new().unwrap();
        let err = generator(temp_dir.path()).ensure(&table()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Precondition(_)));
    }
}
