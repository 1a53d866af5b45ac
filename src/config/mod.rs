//! Configuration management for NATlab.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// NAT datapath configuration.
    #[serde(default)]
    pub nat: NatConfig,

    /// Probe client configuration.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.nat.validate()?;
        self.probe.validate()
    }
}

/// How much of the remote endpoint participates in a table key.
///
/// Applies to both mapping reuse and inbound filtering, per the RFC 4787
/// taxonomy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointDependence {
    /// Key ignores the remote endpoint entirely.
    #[default]
    EndpointIndependent,
    /// Key includes the remote IP but not the remote port.
    AddressDependent,
    /// Key includes the full remote endpoint.
    AddressAndPortDependent,
}

impl EndpointDependence {
    fn strictness(self) -> u8 {
        match self {
            Self::EndpointIndependent => 0,
            Self::AddressDependent => 1,
            Self::AddressAndPortDependent => 2,
        }
    }

    /// Whether `self` admits at most what `other` admits.
    pub fn is_no_more_permissive_than(self, other: Self) -> bool {
        self.strictness() >= other.strictness()
    }
}

/// Which WAN IP a LAN source may be placed on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressPooling {
    /// Uniformly random across the WAN pool.
    #[default]
    Arbitrary,
    /// Deterministic per LAN IP; allocation fails if that IP is exhausted.
    Paired,
    /// Paired first, arbitrary on failure.
    SoftPaired,
}

/// How the WAN port relates to the LAN source port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortAssignment {
    /// Kernel picks any ephemeral port.
    #[default]
    Arbitrary,
    /// Same port number if free, other WAN IPs as fallback.
    Preserving,
    /// Same port number always; an earlier mapping holding it is evicted.
    Overloading,
}

/// Which traffic direction re-arms a mapping's deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MappingRefreshDirection {
    #[default]
    OutboundOnly,
    InboundOnly,
    Both,
}

impl MappingRefreshDirection {
    pub fn refreshes_outbound(self) -> bool {
        matches!(self, Self::OutboundOnly | Self::Both)
    }

    pub fn refreshes_inbound(self) -> bool {
        matches!(self, Self::InboundOnly | Self::Both)
    }
}

/// Hairpinning behavior. Declared by configuration but not realized by
/// the datapath.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HairpinningBehavior {
    #[default]
    None,
    InternalSource,
    ExternalSource,
}

/// NAT behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatConfig {
    /// How much of the remote endpoint a mapping key includes.
    #[serde(default)]
    pub mapping_reuse: EndpointDependence,

    /// How much of the remote endpoint inbound filtering matches on.
    #[serde(default = "default_filtering")]
    pub filtering_behavior: EndpointDependence,

    /// Idle timeout for mappings and filter entries.
    #[serde(default = "default_mapping_timeout", with = "humantime_serde")]
    pub mapping_timeout: Duration,

    /// Which traffic direction re-arms deadlines.
    #[serde(default)]
    pub mapping_refresh_direction: MappingRefreshDirection,

    /// WAN port selection discipline.
    #[serde(default)]
    pub port_assignment: PortAssignment,

    /// WAN IP selection discipline.
    #[serde(default)]
    pub address_pooling: AddressPooling,

    /// Hairpinning declaration (not implemented by the datapath).
    #[serde(default)]
    pub hairpinning: HairpinningBehavior,
}

fn default_filtering() -> EndpointDependence {
    EndpointDependence::AddressAndPortDependent
}

fn default_mapping_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            mapping_reuse: EndpointDependence::EndpointIndependent,
            filtering_behavior: default_filtering(),
            mapping_timeout: default_mapping_timeout(),
            mapping_refresh_direction: MappingRefreshDirection::OutboundOnly,
            port_assignment: PortAssignment::Arbitrary,
            address_pooling: AddressPooling::Arbitrary,
            hairpinning: HairpinningBehavior::None,
        }
    }
}

impl NatConfig {
    /// Validate the knob combination.
    ///
    /// RFC 4787 requires filtering to be no more permissive than mapping
    /// reuse; a violation here would admit inbound traffic the mapping
    /// tables cannot attribute.
    pub fn validate(&self) -> Result<()> {
        if !self
            .filtering_behavior
            .is_no_more_permissive_than(self.mapping_reuse)
        {
            return Err(Error::InvalidConfig(format!(
                "filtering behavior {:?} is more permissive than mapping reuse {:?}",
                self.filtering_behavior, self.mapping_reuse
            )));
        }
        if self.mapping_timeout.is_zero() {
            return Err(Error::InvalidConfig("mapping timeout must be nonzero".into()));
        }
        Ok(())
    }
}

/// Probe client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Probe server hostnames.
    #[serde(default = "default_probe_servers")]
    pub servers: Vec<String>,

    /// Destination ports to probe.
    #[serde(default = "default_probe_ports")]
    pub ports: Vec<u16>,

    /// DNS resolution timeout.
    #[serde(default = "default_resolve_timeout", with = "humantime_serde")]
    pub resolve_timeout: Duration,

    /// Total duration of the mapping phase.
    #[serde(default = "default_mapping_duration", with = "humantime_serde")]
    pub mapping_duration: Duration,

    /// Transmit interval during the mapping phase.
    #[serde(default = "default_mapping_interval", with = "humantime_serde")]
    pub mapping_transmit_interval: Duration,

    /// Number of ephemeral sockets used in the mapping phase.
    #[serde(default = "default_mapping_sockets")]
    pub mapping_sockets: usize,

    /// Total duration of the firewall phase.
    #[serde(default = "default_firewall_duration", with = "humantime_serde")]
    pub firewall_duration: Duration,

    /// Transmit interval during the firewall phase.
    #[serde(default = "default_firewall_interval", with = "humantime_serde")]
    pub firewall_transmit_interval: Duration,
}

fn default_probe_servers() -> Vec<String> {
    vec!["natprobe1.universe.tf.".into(), "natprobe2.universe.tf.".into()]
}

/// The default destination port list covers each of the three IANA port
/// ranges with at least two ports each, favoring protocols that tend to
/// be open even on restrictive networks (QUIC, VPN, VOIP).
pub fn default_probe_ports() -> Vec<u16> {
    vec![
        80, 443, 500, 1194, 1701, 1723, 3478, 4500, 5060, 5061, 51820, 60000,
    ]
}

fn default_resolve_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_mapping_duration() -> Duration {
    Duration::from_secs(3)
}
fn default_mapping_interval() -> Duration {
    Duration::from_millis(200)
}
fn default_mapping_sockets() -> usize {
    3
}
fn default_firewall_duration() -> Duration {
    Duration::from_secs(3)
}
fn default_firewall_interval() -> Duration {
    Duration::from_millis(50)
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            servers: default_probe_servers(),
            ports: default_probe_ports(),
            resolve_timeout: default_resolve_timeout(),
            mapping_duration: default_mapping_duration(),
            mapping_transmit_interval: default_mapping_interval(),
            mapping_sockets: default_mapping_sockets(),
            firewall_duration: default_firewall_duration(),
            firewall_transmit_interval: default_firewall_interval(),
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::InvalidConfig("no probe servers configured".into()));
        }
        if self.ports.is_empty() {
            return Err(Error::InvalidConfig("no probe ports configured".into()));
        }
        if self.mapping_sockets == 0 {
            return Err(Error::InvalidConfig("mapping sockets must be nonzero".into()));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
