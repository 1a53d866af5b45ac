//! The tweakable NAT translator.
//!
//! One instance owns the whole translation state: the mapping records,
//! the two lookup tables over them, the filter table, and the port
//! manager. All mutation happens through `&mut self` from the queue
//! callback, so the tables need no locking and the create-or-reuse path
//! is deterministic per LAN source.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

use tracing::{debug, trace, warn};

use super::packet::PacketView;
use super::portmgr::{PortManager, PortReservation};
use super::{Translator, Verdict};
use crate::config::{EndpointDependence, NatConfig};
use crate::error::{NatError, Result};
use crate::types::{UdpEndpoint, UdpTuple};

type MappingId = u64;

/// One active LAN-to-WAN translation.
struct Mapping {
    /// Masked tuple this mapping is indexed under in `by_lan`.
    lan_key: UdpTuple,
    /// The original LAN source.
    lan: UdpEndpoint,
    /// The allocated public source.
    wan: UdpEndpoint,
    /// Keeps the host kernel off our WAN port. Released on deletion.
    #[allow(dead_code)]
    reservation: PortReservation,
    deadline: Instant,
}

impl Mapping {
    fn expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

/// The configurable NAT datapath core.
pub struct TweakableNat {
    config: NatConfig,
    ports: PortManager,

    /// Mapping records, owned here; the index tables hold ids into this.
    mappings: HashMap<MappingId, Mapping>,
    /// Outbound lookup: masked LAN-oriented tuple -> mapping.
    by_lan: HashMap<UdpTuple, MappingId>,
    /// Inbound lookup: WAN endpoint -> mapping.
    by_wan: HashMap<UdpEndpoint, MappingId>,

    /// Filter state: which (masked) remotes have recently been sent to,
    /// and until when inbound traffic from them is admitted.
    sent: HashMap<UdpTuple, Instant>,

    next_id: MappingId,
}

impl TweakableNat {
    /// Build a translator over the given WAN address pool.
    ///
    /// Fails if the configuration violates its construction invariants or
    /// the pool is empty.
    pub fn new(config: NatConfig, wan_ips: Vec<Ipv4Addr>) -> Result<Self> {
        config.validate()?;
        let ports = PortManager::new(wan_ips, config.address_pooling, config.port_assignment)?;
        Ok(Self::with_ports(config, ports))
    }

    /// Deterministic variant for tests.
    pub fn with_seed(config: NatConfig, wan_ips: Vec<Ipv4Addr>, seed: u64) -> Result<Self> {
        config.validate()?;
        let ports =
            PortManager::with_seed(wan_ips, config.address_pooling, config.port_assignment, seed)?;
        Ok(Self::with_ports(config, ports))
    }

    fn with_ports(config: NatConfig, ports: PortManager) -> Self {
        Self {
            config,
            ports,
            mappings: HashMap::new(),
            by_lan: HashMap::new(),
            by_wan: HashMap::new(),
            sent: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn config(&self) -> &NatConfig {
        &self.config
    }

    /// Number of live mappings (expired entries not yet swept included).
    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    /// Number of WAN ports currently parked.
    pub fn reservation_count(&self) -> usize {
        self.ports.reserved_count()
    }

    /// Drop every mapping and filter entry whose deadline has passed.
    pub fn expire_idle(&mut self, now: Instant) {
        let dead: Vec<MappingId> = self
            .mappings
            .iter()
            .filter(|(_, m)| m.expired(now))
            .map(|(&id, _)| id)
            .collect();
        for id in dead {
            self.delete_mapping(id);
        }
        self.sent.retain(|_, deadline| *deadline > now);
    }

    /// Mask the destination of a LAN-oriented tuple per the dependence
    /// level, producing a table key.
    fn mask_tuple(tuple: UdpTuple, dependence: EndpointDependence) -> UdpTuple {
        let mut key = tuple;
        match dependence {
            EndpointDependence::EndpointIndependent => key.dst = UdpEndpoint::UNSPECIFIED,
            EndpointDependence::AddressDependent => key.dst.port = 0,
            EndpointDependence::AddressAndPortDependent => {}
        }
        key
    }

    /// Record or re-arm the filter entry for a LAN-oriented tuple whose
    /// source is the mapping's WAN endpoint.
    ///
    /// Outbound traffic always creates the entry; the deadline is re-armed
    /// only when the refresh direction covers the packet's direction.
    fn update_filter_state(&mut self, oriented: UdpTuple, outbound: bool, now: Instant) {
        let key = Self::mask_tuple(oriented, self.config.filtering_behavior);
        let deadline = now + self.config.mapping_timeout;
        let dir = self.config.mapping_refresh_direction;

        if outbound {
            self.sent.entry(key).or_insert(deadline);
        }
        if (outbound && dir.refreshes_outbound()) || (!outbound && dir.refreshes_inbound()) {
            self.sent.insert(key, deadline);
        }
    }

    /// Whether a live filter entry admits this LAN-oriented tuple.
    /// Expired entries are evicted on the spot.
    fn filter_allows(&mut self, oriented: UdpTuple, now: Instant) -> bool {
        let key = Self::mask_tuple(oriented, self.config.filtering_behavior);
        match self.sent.get(&key) {
            Some(&deadline) if deadline > now => true,
            Some(_) => {
                self.sent.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Allocate a WAN endpoint and insert the mapping under both tables.
    ///
    /// With overloading port assignment, a contested endpoint's current
    /// owner is evicted first and the allocation retried once.
    fn create_mapping(
        &mut self,
        lan_key: UdpTuple,
        lan: UdpEndpoint,
        now: Instant,
    ) -> Option<MappingId> {
        let mut evicted = false;
        loop {
            match self.ports.allocate(lan) {
                Ok(reservation) => {
                    let wan = reservation.endpoint();
                    let id = self.next_id;
                    self.next_id += 1;

                    let prev_lan = self.by_lan.insert(lan_key, id);
                    let prev_wan = self.by_wan.insert(wan, id);
                    assert!(
                        prev_lan.is_none() && prev_wan.is_none(),
                        "mapping tables out of sync inserting {lan} -> {wan}"
                    );
                    self.mappings.insert(
                        id,
                        Mapping {
                            lan_key,
                            lan,
                            wan,
                            reservation,
                            deadline: now + self.config.mapping_timeout,
                        },
                    );
                    debug!(%lan, %wan, "created mapping");
                    return Some(id);
                }
                Err(NatError::EndpointBusy(contested)) => {
                    if evicted {
                        warn!(endpoint = %contested, %lan, "WAN endpoint still busy after eviction");
                        return None;
                    }
                    let owner = match self.by_wan.get(&contested) {
                        Some(&id) => id,
                        None => panic!(
                            "port manager reserves {contested} but no mapping owns it"
                        ),
                    };
                    trace!(endpoint = %contested, "evicting mapping for overload");
                    self.delete_mapping(owner);
                    evicted = true;
                }
                Err(err) => {
                    warn!(error = %err, %lan, "WAN endpoint allocation failed");
                    return None;
                }
            }
        }
    }

    /// Remove a mapping from the record arena and both index tables,
    /// releasing its port reservation.
    fn delete_mapping(&mut self, id: MappingId) {
        let mapping = self
            .mappings
            .remove(&id)
            .unwrap_or_else(|| panic!("mapping {id} indexed but not present"));
        let lan_entry = self.by_lan.remove(&mapping.lan_key);
        let wan_entry = self.by_wan.remove(&mapping.wan);
        assert!(
            lan_entry == Some(id) && wan_entry == Some(id),
            "mapping tables out of sync deleting {} -> {}",
            mapping.lan,
            mapping.wan
        );
        trace!(lan = %mapping.lan, wan = %mapping.wan, "deleted mapping");
        // Reservation released here.
    }

    fn mapping_mut(&mut self, id: MappingId) -> &mut Mapping {
        self.mappings
            .get_mut(&id)
            .unwrap_or_else(|| panic!("mapping {id} indexed but not present"))
    }

    #[cfg(test)]
    fn assert_tables_consistent(&self) {
        assert_eq!(self.by_lan.len(), self.mappings.len());
        assert_eq!(self.by_wan.len(), self.mappings.len());
        assert_eq!(self.ports.reserved_count(), self.mappings.len());
        for (&id, m) in &self.mappings {
            assert_eq!(self.by_lan.get(&m.lan_key), Some(&id));
            assert_eq!(self.by_wan.get(&m.wan), Some(&id));
            assert!(self.ports.is_reserved(m.wan));
        }
    }
}

impl Translator for TweakableNat {
    fn translate_outbound(&mut self, packet: &mut [u8]) -> Verdict {
        let now = Instant::now();
        let Some(mut pkt) = PacketView::parse(packet) else {
            return Verdict::Drop;
        };
        let tuple = pkt.tuple();
        let key = Self::mask_tuple(tuple, self.config.mapping_reuse);

        let live = match self.by_lan.get(&key).copied() {
            Some(id) if self.mappings[&id].expired(now) => {
                self.delete_mapping(id);
                None
            }
            other => other,
        };
        let id = match live {
            Some(id) => id,
            None => match self.create_mapping(key, tuple.src, now) {
                Some(id) => id,
                None => return Verdict::Drop,
            },
        };

        if self.config.mapping_refresh_direction.refreshes_outbound() {
            let deadline = now + self.config.mapping_timeout;
            self.mapping_mut(id).deadline = deadline;
        }

        let wan = self.mappings[&id].wan;
        pkt.set_src(wan);
        // Filter state keys on the rewritten (WAN-side) source, so the
        // flipped tuple of a reply lands on the same key.
        self.update_filter_state(UdpTuple::new(wan, tuple.dst), true, now);

        Verdict::Mangle
    }

    fn translate_inbound(&mut self, packet: &mut [u8]) -> Verdict {
        let now = Instant::now();
        let Some(mut pkt) = PacketView::parse(packet) else {
            return Verdict::Drop;
        };
        let tuple = pkt.tuple();

        let id = match self.by_wan.get(&tuple.dst).copied() {
            Some(id) => id,
            None => return Verdict::Drop,
        };
        if self.mappings[&id].expired(now) {
            self.delete_mapping(id);
            return Verdict::Drop;
        }

        let oriented = tuple.flip();
        if !self.filter_allows(oriented, now) {
            trace!(src = %tuple.src, dst = %tuple.dst, "inbound blocked by filter");
            return Verdict::Drop;
        }

        if self.config.mapping_refresh_direction.refreshes_inbound() {
            let deadline = now + self.config.mapping_timeout;
            self.mapping_mut(id).deadline = deadline;
        }
        self.update_filter_state(oriented, false, now);

        let lan = self.mappings[&id].lan;
        pkt.set_dst(lan);
        Verdict::Mangle
    }

    fn sweep(&mut self) {
        self.expire_idle(Instant::now());
    }
}
