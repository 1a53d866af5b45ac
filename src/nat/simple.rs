//! A fixed-policy NAT: endpoint-independent mapping, no inbound
//! filtering, fully random port allocation.
//!
//! The full-cone baseline the tweakable translator generalizes. Also
//! serves as a lightweight [`Translator`] double in tests that don't care
//! about policy knobs.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::packet::PacketView;
use super::portmgr::{PortManager, PortReservation};
use super::{Translator, Verdict};
use crate::config::{AddressPooling, PortAssignment};
use crate::error::Result;
use crate::types::UdpEndpoint;

const TIMEOUT: Duration = Duration::from_secs(120);

struct Entry {
    mapped: UdpEndpoint,
    #[allow(dead_code)]
    reservation: PortReservation,
    deadline: Instant,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

/// Endpoint-independent NAT with no filtering.
pub struct EndpointIndependentNat {
    ports: PortManager,
    /// Outbound lookup: LAN source endpoint -> entry.
    by_original: HashMap<UdpEndpoint, Entry>,
    /// Inbound lookup: WAN endpoint -> LAN source.
    by_mapped: HashMap<UdpEndpoint, UdpEndpoint>,
}

impl EndpointIndependentNat {
    pub fn new(wan_ips: Vec<Ipv4Addr>) -> Result<Self> {
        let ports =
            PortManager::new(wan_ips, AddressPooling::Arbitrary, PortAssignment::Arbitrary)?;
        Ok(Self {
            ports,
            by_original: HashMap::new(),
            by_mapped: HashMap::new(),
        })
    }

    pub fn mapping_count(&self) -> usize {
        self.by_original.len()
    }

    fn delete(&mut self, original: UdpEndpoint) {
        if let Some(entry) = self.by_original.remove(&original) {
            let back = self.by_mapped.remove(&entry.mapped);
            assert_eq!(
                back,
                Some(original),
                "mapping tables out of sync deleting {original}"
            );
        }
    }
}

impl Translator for EndpointIndependentNat {
    fn translate_outbound(&mut self, packet: &mut [u8]) -> Verdict {
        let now = Instant::now();
        let Some(mut pkt) = PacketView::parse(packet) else {
            return Verdict::Drop;
        };
        let original = pkt.src();

        if self
            .by_original
            .get(&original)
            .is_some_and(|e| e.expired(now))
        {
            self.delete(original);
        }

        if !self.by_original.contains_key(&original) {
            let reservation = match self.ports.allocate(original) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, lan = %original, "failed to park WAN port");
                    return Verdict::Drop;
                }
            };
            let mapped = reservation.endpoint();
            debug!(lan = %original, wan = %mapped, "created mapping");
            self.by_original.insert(
                original,
                Entry {
                    mapped,
                    reservation,
                    deadline: now + TIMEOUT,
                },
            );
            self.by_mapped.insert(mapped, original);
        }

        let mapped = self.by_original[&original].mapped;
        pkt.set_src(mapped);
        Verdict::Mangle
    }

    fn translate_inbound(&mut self, packet: &mut [u8]) -> Verdict {
        let now = Instant::now();
        let Some(mut pkt) = PacketView::parse(packet) else {
            return Verdict::Drop;
        };

        let original = match self.by_mapped.get(&pkt.dst()).copied() {
            Some(o) => o,
            None => return Verdict::Drop,
        };
        if self.by_original[&original].expired(now) {
            self.delete(original);
            return Verdict::Drop;
        }

        let entry = self
            .by_original
            .get_mut(&original)
            .expect("mapping tables out of sync");
        entry.deadline = now + TIMEOUT;
        pkt.set_dst(original);
        Verdict::Mangle
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let dead: Vec<UdpEndpoint> = self
            .by_original
            .iter()
            .filter(|(_, e)| e.expired(now))
            .map(|(&k, _)| k)
            .collect();
        for original in dead {
            self.delete(original);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::packet::build_udp4;
    use crate::types::UdpTuple;

    const LO1: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    fn ep(a: u8, b: u8, c: u8, d: u8, port: u16) -> UdpEndpoint {
        UdpEndpoint::new(Ipv4Addr::new(a, b, c, d), port)
    }

    #[test]
    fn full_cone_round_trip() {
        let mut nat = EndpointIndependentNat::new(vec![LO1]).unwrap();
        let lan = ep(10, 0, 0, 5, 1000);
        let remote = ep(198, 51, 100, 10, 443);

        let mut buf = build_udp4(UdpTuple::new(lan, remote), b"ping");
        assert_eq!(nat.translate_outbound(&mut buf), Verdict::Mangle);
        let wan = PacketView::parse(&mut buf).unwrap().src();
        assert_eq!(wan.ip, LO1);

        // Unsolicited sources reach the LAN host: no filtering at all.
        let stranger = ep(203, 0, 113, 1, 1);
        let mut reply = build_udp4(UdpTuple::new(stranger, wan), b"pong");
        assert_eq!(nat.translate_inbound(&mut reply), Verdict::Mangle);
        assert_eq!(PacketView::parse(&mut reply).unwrap().dst(), lan);
    }

    #[test]
    fn mapping_is_reused_across_destinations() {
        let mut nat = EndpointIndependentNat::new(vec![LO1]).unwrap();
        let lan = ep(10, 0, 0, 5, 1000);

        let mut a = build_udp4(UdpTuple::new(lan, ep(198, 51, 100, 10, 443)), b"");
        let mut b = build_udp4(UdpTuple::new(lan, ep(198, 51, 100, 20, 53)), b"");
        nat.translate_outbound(&mut a);
        nat.translate_outbound(&mut b);

        assert_eq!(
            PacketView::parse(&mut a).unwrap().src(),
            PacketView::parse(&mut b).unwrap().src()
        );
        assert_eq!(nat.mapping_count(), 1);
    }

    #[test]
    fn inbound_to_unknown_endpoint_drops() {
        let mut nat = EndpointIndependentNat::new(vec![LO1]).unwrap();
        let mut buf = build_udp4(
            UdpTuple::new(ep(198, 51, 100, 10, 443), ep(127, 0, 0, 1, 40000)),
            b"",
        );
        assert_eq!(nat.translate_inbound(&mut buf), Verdict::Drop);
    }
}
