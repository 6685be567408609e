//! Provisioning error types

use std::path::PathBuf;
use testbed_endpoint::EndpointError;
use testbed_listener::ReconcileError;
use testbed_transport::{TransportError, WaitError};
use thiserror::Error;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("Config file already exists: {0:?} (use --force to overwrite)")]
    AlreadyExists(PathBuf),
}

/// Errors raised while running a play
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Something that must hold before any remote work is missing
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Unknown tag '{0}': expected windows, linux or build_artifacts")]
    UnknownTag(String),

    #[error("Step '{step}' failed: {source}")]
    Step {
        step: String,
        source: TransportError,
    },

    #[error("Step '{step}' gave up: {cause}")]
    Wait {
        step: String,
        cause: WaitError<TransportError>,
    },

    #[error("Step '{step}' returned unexpected output: {message}")]
    Output { step: String, message: String },

    #[error("Certificate script {script:?} failed ({status}): {stderr}")]
    CertificateScript {
        script: PathBuf,
        status: String,
        stderr: String,
    },

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ProvisionError {
    pub(crate) fn step(step: &str) -> impl FnOnce(TransportError) -> ProvisionError + '_ {
        move |source| ProvisionError::Step {
            step: step.to_string(),
            source,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> ProvisionError {
        let path = path.into();
        move |source| ProvisionError::Io { path, source }
    }
}
