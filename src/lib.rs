//! # NATlab
//!
//! Testbed for studying how NAT gateways behave and how NAT-traversal
//! software copes with them.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        natlab (CLI)                             │
//! ├───────────────────┬─────────────────────┬───────────────────────┤
//! │     NAT box       │    Probe client     │     Probe server      │
//! │  ┌─────────────┐  │  ┌───────────────┐  │  ┌─────────────────┐  │
//! │  │  NatRunner  │  │  │ mapping phase │  │  │  K IPs × M ports│  │
//! │  │ Translator  │  │  │ firewall phase│  │  │  UDP reflector  │  │
//! │  │ PortManager │  │  │ analyzer      │  │  │                 │  │
//! │  └─────────────┘  │  └───────────────┘  │  └─────────────────┘  │
//! ├───────────────────┴─────────────────────┴───────────────────────┤
//! │        PacketView / UdpEndpoint / UdpTuple / wire codec         │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! The NAT box sits between a LAN and a WAN interface, consuming whole
//! IPv4/UDP datagrams from a kernel packet queue and rewriting them in
//! place. Its behavior along every RFC 4787 axis (mapping reuse,
//! filtering, port assignment, address pooling, refresh direction) is
//! selected by [`config::NatConfig`]. The probe pair observes such a NAT
//! from the outside and reduces raw observations to categorical findings.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)] // ASCII diagrams in docs

pub mod cli;
pub mod config;
pub mod error;
pub mod nat;
pub mod probe;
pub mod types;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
