//! Raw probe results and their interpretation.
//!
//! The client records uninterpreted observations; [`ProbeReport::analyze`]
//! turns them into categorical findings about the NAT between us and the
//! probe servers, and [`Analysis::narrative`] renders those findings for
//! humans.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::types::UdpEndpoint;

/// The outcome of a single NAT mapping discovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingProbe {
    /// The local endpoint we probed from.
    pub local: UdpEndpoint,
    /// The mapped endpoint assigned by the NAT. `None` on timeout.
    pub mapped: Option<UdpEndpoint>,
    /// The remote server endpoint we probed.
    pub remote: UdpEndpoint,
    /// The probe never produced a reply.
    pub timeout: bool,
}

impl fmt::Display for MappingProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mapped {
            Some(mapped) => write!(f, "{} -> {} -> {}", self.local, mapped, self.remote),
            None => write!(f, "{} -> ??? -> {} (timeout)", self.local, self.remote),
        }
    }
}

/// The outcome of the firewall state probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallProbe {
    /// The local endpoint we transmitted from.
    pub local: UdpEndpoint,
    /// The remote server endpoint we kept transmitting to.
    pub remote: UdpEndpoint,
    /// Distinct remote endpoints whose replies made it back in.
    pub received: Vec<UdpEndpoint>,
}

/// The raw, uninterpreted result of a full probe run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeReport {
    pub mapping_probes: Vec<MappingProbe>,
    pub firewall: Option<FirewallProbe>,
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mapping_probes.is_empty() {
            return write!(f, "No data (did the probe fail?)");
        }

        writeln!(f, "Mapping probes:")?;
        for probe in &self.mapping_probes {
            writeln!(f, "  {probe}")?;
        }

        match &self.firewall {
            None => write!(f, "No firewall probe data.")?,
            Some(fw) => {
                writeln!(
                    f,
                    "Firewall probe with outbound traffic {} -> {}",
                    fw.local, fw.remote
                )?;
                for addr in &fw.received {
                    writeln!(f, "  {addr}")?;
                }
            }
        }

        Ok(())
    }
}

impl ProbeReport {
    /// Interpret the raw observations.
    pub fn analyze(&self) -> Analysis {
        Analysis {
            no_data: self.no_data(),
            mapping_varies_by_dest_ip: self.mapping_varies_by(|p| p.remote.ip),
            mapping_varies_by_dest_port: self.mapping_varies_by(|p| p.remote.port),
            firewall_enforces_dest_ip: self.firewall_enforces(|ep| ep.ip),
            firewall_enforces_dest_port: self.firewall_enforces(|ep| ep.port),
            mapping_preserves_source_port: self.mapping_preserves_source_port(),
            multiple_public_ips: self.multiple_public_ips(),
            filtered_egress: self.filtered_egress(),
        }
    }

    /// Replace every observed IP with a generated one, keeping the
    /// mapping stable, so results can be shared without leaking
    /// addresses.
    pub fn anonymize(&mut self) {
        let mut ips: HashMap<Ipv4Addr, Ipv4Addr> = HashMap::new();
        let (mut a, mut b) = (1u8, 1u8);

        let mut anon = |ip: Ipv4Addr| -> Ipv4Addr {
            *ips.entry(ip).or_insert_with(|| {
                let generated = Ipv4Addr::new(a, a, b, b);
                b = b.wrapping_add(1);
                if b == 0 {
                    a = a.wrapping_add(1);
                }
                generated
            })
        };

        for probe in &mut self.mapping_probes {
            probe.local.ip = anon(probe.local.ip);
            if let Some(mapped) = &mut probe.mapped {
                mapped.ip = anon(mapped.ip);
            }
            probe.remote.ip = anon(probe.remote.ip);
        }
        if let Some(fw) = &mut self.firewall {
            fw.local.ip = anon(fw.local.ip);
            fw.remote.ip = anon(fw.remote.ip);
            for addr in &mut fw.received {
                addr.ip = anon(addr.ip);
            }
        }
    }

    fn successes(&self) -> impl Iterator<Item = (&MappingProbe, UdpEndpoint)> + '_ {
        self.mapping_probes
            .iter()
            .filter(|p| !p.timeout)
            .filter_map(|p| p.mapped.map(|m| (p, m)))
    }

    fn no_data(&self) -> bool {
        self.successes().next().is_none()
    }

    /// For a fixed local endpoint, does changing the chosen remote
    /// attribute change the mapped endpoint?
    ///
    /// The first success per local endpoint establishes the baseline;
    /// later probes with a different remote attribute that show a
    /// different mapping are the positive signal.
    fn mapping_varies_by<K: PartialEq + Copy>(
        &self,
        remote_key: impl Fn(&MappingProbe) -> K,
    ) -> bool {
        let mut baseline: Option<(UdpEndpoint, K, UdpEndpoint)> = None;

        for (probe, mapped) in self.successes() {
            match baseline {
                Some((local, key, base_mapped)) if local == probe.local => {
                    if remote_key(probe) == key {
                        continue;
                    }
                    if mapped != base_mapped {
                        return true;
                    }
                }
                _ => {
                    baseline = Some((probe.local, remote_key(probe), mapped));
                }
            }
        }
        false
    }

    /// Did every reply in the firewall phase come from the transmitted-to
    /// attribute (IP or port)?
    fn firewall_enforces<K: PartialEq>(&self, key: impl Fn(&UdpEndpoint) -> K) -> bool {
        match &self.firewall {
            None => false,
            Some(fw) => fw.received.iter().all(|r| key(r) == key(&fw.remote)),
        }
    }

    /// The NAT is port-preserving if at least 80% of successful probes
    /// kept the local source port.
    fn mapping_preserves_source_port(&self) -> bool {
        let (mut total, mut preserved) = (0usize, 0usize);
        for (probe, mapped) in self.successes() {
            total += 1;
            if probe.local.port == mapped.port {
                preserved += 1;
            }
        }
        total > 0 && preserved as f64 / total as f64 >= 0.8
    }

    fn multiple_public_ips(&self) -> bool {
        let ips: HashSet<Ipv4Addr> = self.successes().map(|(_, m)| m.ip).collect();
        ips.len() > 1
    }

    /// Destination ports that only ever timed out, across every server
    /// IP, while other ports got through: a heuristic for outbound port
    /// filtering.
    fn filtered_egress(&self) -> Vec<u16> {
        let mut working: HashSet<u16> = self
            .mapping_probes
            .iter()
            .filter(|p| !p.timeout)
            .map(|p| p.remote.port)
            .collect();

        let mut filtered = Vec::new();
        for probe in &self.mapping_probes {
            if probe.timeout && !working.contains(&probe.remote.port) {
                filtered.push(probe.remote.port);
                working.insert(probe.remote.port);
            }
        }
        filtered.sort_unstable();
        filtered
    }
}

/// Categorical findings about the NAT under observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    /// There is no data to analyze.
    pub no_data: bool,
    /// Assigned public ip:port depends on the destination IP.
    pub mapping_varies_by_dest_ip: bool,
    /// Assigned public ip:port depends on the destination port.
    pub mapping_varies_by_dest_port: bool,
    /// Firewall requires outbound traffic to an IP before allowing
    /// inbound traffic from that IP.
    pub firewall_enforces_dest_ip: bool,
    /// Firewall requires outbound traffic to a port before allowing
    /// inbound traffic from that port.
    pub firewall_enforces_dest_port: bool,
    /// Assigned public port tries to match the LAN port.
    pub mapping_preserves_source_port: bool,
    /// Multiple assigned public IPs observed.
    pub multiple_public_ips: bool,
    /// Destination ports whose probes all timed out while others worked.
    pub filtered_egress: Vec<u16>,
}

impl Analysis {
    /// A human-readable interpretation of the findings.
    pub fn narrative(&self) -> String {
        if self.no_data {
            return "Probing got no useful data at all. Either the probe servers are down, \
                    or extremely strict UDP filtering is in place on your LAN."
                .into();
        }

        let mut out = Vec::new();

        out.push(match (self.mapping_varies_by_dest_ip, self.mapping_varies_by_dest_port) {
            (true, true) => {
                "NAT allocates a new ip:port for every unique 5-tuple (protocol, source ip, \
                 source port, destination ip, destination port).\n  This makes NAT traversal \
                 more difficult."
            }
            (true, false) => {
                "NAT allocates a new ip:port for every unique IP 4-tuple (protocol, source ip, \
                 source port, destination ip).\n  This makes NAT traversal more difficult."
            }
            (false, true) => {
                "NAT allocates a new ip:port for every unique port 4-tuple (protocol, source ip, \
                 source port, destination port).\n  This is unusual!\n  This makes NAT traversal \
                 more difficult."
            }
            (false, false) => {
                "NAT allocates a new ip:port for every unique 3-tuple (protocol, source ip, \
                 source port).\n  This is best practice for NAT devices."
            }
        });

        out.push(match (self.firewall_enforces_dest_ip, self.firewall_enforces_dest_port) {
            (true, true) => {
                "Firewall requires outbound traffic to an ip:port before allowing inbound \
                 traffic from that ip:port.\n  This is common practice for NAT gateways.\n  \
                 This makes NAT traversal more difficult."
            }
            (true, false) => {
                "Firewall requires outbound traffic to an ip before allowing inbound traffic \
                 from that ip, but the ports don't have to match.\n  This makes NAT traversal \
                 more difficult."
            }
            (false, true) => {
                "Firewall requires outbound traffic to a port before allowing inbound traffic \
                 from that port, but the IPs don't have to match.\n  This is unusual!\n  This \
                 makes NAT traversal more difficult."
            }
            (false, false) => {
                "Firewall allows inbound traffic from any source, with no prerequisites.\n  \
                 This is best practice for \"traversal-friendly\" NAT devices."
            }
        });

        if self.mapping_preserves_source_port {
            out.push("NAT seems to try and make the public port number match the LAN port number.");
        } else {
            out.push("NAT seems to randomize the public port when allocating a new mapping.");
        }

        if self.multiple_public_ips {
            out.push(
                "NAT seems to use different public IPs for different mappings.\n  This makes \
                 NAT traversal more difficult.",
            );
        } else {
            out.push("NAT seems to only use one public IP for this client.");
        }

        let mut text = out.join("\n");
        if !self.filtered_egress.is_empty() {
            let ports: Vec<String> = self.filtered_egress.iter().map(u16::to_string).collect();
            text.push_str(&format!(
                "\nOutbound traffic to ports {} seems to be blocked.",
                ports.join(", ")
            ));
        }
        text
    }
}
