//! Endpoint model for the WinRM listener testbed
//!
//! Every test certificate gets an ordinal position in the configured list.
//! That position alone determines the external port, the listener port and
//! the loopback adapter dedicated to the endpoint.

pub mod spec;
pub mod table;

pub use spec::{EndpointSpec, KeyAlgorithm};
pub use table::{
    adapter_name, derive_ports, Endpoint, EndpointTable, DEFAULT_ADAPTER_PREFIX,
    DEFAULT_BASE_PORT,
};

use thiserror::Error;

/// Endpoint configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Invalid endpoint name '{0}': must be alphanumeric with hyphens/underscores only")]
    InvalidName(String),

    #[error("Duplicate endpoint name: {0}")]
    DuplicateName(String),

    #[error("Endpoint '{name}' at index {index} needs port {port} which exceeds 65535")]
    PortOverflow {
        name: String,
        index: usize,
        port: u32,
    },

    #[error("Endpoint '{name}' collides with '{other}' on port {port}")]
    PortCollision {
        name: String,
        other: String,
        port: u16,
    },

    #[error("Endpoint '{name}' collides with '{other}' on adapter '{adapter}'")]
    AdapterCollision {
        name: String,
        other: String,
        adapter: String,
    },

    #[error("Unknown key algorithm: {0}")]
    UnknownKeyAlgorithm(String),
}
