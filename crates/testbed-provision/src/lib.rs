//! Provisioning plays for the WinRM listener testbed
//!
//! A run brings up two hosts:
//!
//! - the Windows domain controller, promoted to a forest root and exposing
//!   one HTTPS WinRM listener per test certificate behind a port forward
//! - the Linux test runner, joined to the domain with Docker available
//!
//! Each step asserts a state through a script and reports whether it had to
//! change anything. Re-running against a provisioned environment changes
//! nothing.

pub mod artifacts;
pub mod certs;
pub mod config;
pub mod error;
pub mod linux;
pub mod recap;
pub mod runner;
pub mod tags;
pub mod windows;

pub use artifacts::PswsmanArchive;
pub use certs::{CertificateBundle, CertificateGenerator};
pub use config::{expand_env_vars, TestbedConfig};
pub use error::{ConfigError, ProvisionError};
pub use linux::LinuxPlay;
pub use recap::{PlayRecap, StepStatus};
pub use runner::Provisioner;
pub use tags::{Tag, TagSelection};
pub use windows::WindowsPlay;
