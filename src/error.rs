//! Error types for NATlab.
//!
//! The translation hot path never surfaces errors: a packet that cannot
//! be parsed or mapped is dropped. Errors here are for setup, allocation,
//! configuration, and probe I/O.

use std::io;
use std::net::SocketAddrV4;

use thiserror::Error;

use crate::types::UdpEndpoint;

/// Result type alias for NATlab operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for NATlab.
#[derive(Error, Debug)]
pub enum Error {
    // NAT datapath errors
    #[error("NAT error: {0}")]
    Nat(#[from] NatError),

    // Probe errors
    #[error("name resolution failed for {host}: {reason}")]
    Resolve { host: String, reason: String },

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Setup errors
    #[error("interface {0} not found")]
    InterfaceNotFound(String),

    #[error("packet queue unavailable: {0}")]
    QueueUnavailable(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// WAN endpoint allocation errors.
#[derive(Error, Debug)]
pub enum NatError {
    #[error("no WAN IPs configured")]
    NoWanIps,

    #[error("no available WAN port after {attempts} attempts")]
    PortExhausted { attempts: usize },

    #[error("WAN endpoint {0} is already reserved by a live mapping")]
    EndpointBusy(UdpEndpoint),

    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddrV4, reason: String },
}
