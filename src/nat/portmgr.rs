//! WAN endpoint allocation and port parking.
//!
//! The port manager hands out WAN `(ip, port)` pairs for new mappings. A
//! successful allocation returns a [`PortReservation`] that keeps a real
//! UDP socket bound at that endpoint for the mapping's lifetime, so the
//! host kernel cannot hand the same port to anyone else. Dropping the
//! reservation releases the port.

use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::trace;

use crate::config::{AddressPooling, PortAssignment};
use crate::error::NatError;
use crate::types::UdpEndpoint;

/// Retry budget for binds racing in-flight kernel allocations.
pub const BIND_ATTEMPTS: usize = 256;

type Registry = Arc<Mutex<HashSet<UdpEndpoint>>>;

/// Owner of one reserved WAN endpoint.
///
/// Holds the bound socket; the kernel will refuse the port to any other
/// non-reusing socket while this is alive.
pub struct PortReservation {
    endpoint: UdpEndpoint,
    _socket: Socket,
    registry: Registry,
}

impl PortReservation {
    /// The endpoint exactly as the kernel bound it.
    pub fn endpoint(&self) -> UdpEndpoint {
        self.endpoint
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        let removed = self.registry.lock().remove(&self.endpoint);
        // A reservation the registry doesn't know about means the port
        // manager's state has diverged from the sockets actually held.
        // Cross-mapping leakage is worse than crashing.
        assert!(
            removed,
            "port manager registry out of sync: released unknown reservation {}",
            self.endpoint
        );
    }
}

impl fmt::Debug for PortReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortReservation")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Allocates WAN endpoints according to the configured pooling and
/// port-assignment disciplines.
pub struct PortManager {
    wan_ips: Vec<Ipv4Addr>,
    pooling: AddressPooling,
    assignment: PortAssignment,
    registry: Registry,
    rng: StdRng,
}

impl PortManager {
    pub fn new(
        wan_ips: Vec<Ipv4Addr>,
        pooling: AddressPooling,
        assignment: PortAssignment,
    ) -> Result<Self, NatError> {
        Self::with_rng(wan_ips, pooling, assignment, StdRng::from_entropy())
    }

    /// Deterministic variant for tests.
    pub fn with_seed(
        wan_ips: Vec<Ipv4Addr>,
        pooling: AddressPooling,
        assignment: PortAssignment,
        seed: u64,
    ) -> Result<Self, NatError> {
        Self::with_rng(wan_ips, pooling, assignment, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        wan_ips: Vec<Ipv4Addr>,
        pooling: AddressPooling,
        assignment: PortAssignment,
        rng: StdRng,
    ) -> Result<Self, NatError> {
        if wan_ips.is_empty() {
            return Err(NatError::NoWanIps);
        }
        Ok(Self {
            wan_ips,
            pooling,
            assignment,
            registry: Arc::new(Mutex::new(HashSet::new())),
            rng,
        })
    }

    /// Allocate a WAN endpoint for the given LAN source.
    ///
    /// The returned endpoint is exactly what the kernel bound. An
    /// [`NatError::EndpointBusy`] means the overloading discipline wants an
    /// endpoint a live mapping still owns; the caller evicts that mapping
    /// and retries.
    pub fn allocate(&mut self, lan: UdpEndpoint) -> Result<PortReservation, NatError> {
        let candidates = self.candidate_ips(lan.ip);

        match self.assignment {
            PortAssignment::Preserving => {
                for ip in &candidates {
                    if let Ok(res) = self.bind_wan(*ip, lan.port) {
                        return Ok(res);
                    }
                }
                Err(NatError::PortExhausted {
                    attempts: candidates.len(),
                })
            }

            PortAssignment::Overloading => {
                let want = UdpEndpoint::new(candidates[0], lan.port);
                if self.registry.lock().contains(&want) {
                    return Err(NatError::EndpointBusy(want));
                }
                self.bind_wan(want.ip, want.port)
            }

            PortAssignment::Arbitrary => {
                for attempt in 0..BIND_ATTEMPTS {
                    let ip = candidates[attempt % candidates.len()];
                    if let Ok(res) = self.bind_wan(ip, 0) {
                        return Ok(res);
                    }
                }
                Err(NatError::PortExhausted {
                    attempts: BIND_ATTEMPTS,
                })
            }
        }
    }

    /// Number of currently held reservations.
    pub fn reserved_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Whether a live reservation holds the given endpoint.
    pub fn is_reserved(&self, endpoint: UdpEndpoint) -> bool {
        self.registry.lock().contains(&endpoint)
    }

    /// The WAN IPs a mapping for `lan_ip` may land on, in preference order.
    fn candidate_ips(&mut self, lan_ip: Ipv4Addr) -> Vec<Ipv4Addr> {
        match self.pooling {
            AddressPooling::Arbitrary => {
                let mut ips = self.wan_ips.clone();
                ips.shuffle(&mut self.rng);
                ips
            }
            AddressPooling::Paired => vec![self.paired_ip(lan_ip)],
            AddressPooling::SoftPaired => {
                let mut ips = vec![self.paired_ip(lan_ip)];
                let mut rest = self.wan_ips.clone();
                rest.shuffle(&mut self.rng);
                ips.extend(rest);
                ips
            }
        }
    }

    /// Deterministic per-LAN-IP pool member. Not uniform, but stable.
    fn paired_ip(&self, lan_ip: Ipv4Addr) -> Ipv4Addr {
        let h = u32::from_le_bytes(lan_ip.octets()) as usize;
        self.wan_ips[h % self.wan_ips.len()]
    }

    fn bind_wan(&self, ip: Ipv4Addr, port: u16) -> Result<PortReservation, NatError> {
        let addr = SocketAddrV4::new(ip, port);
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
            NatError::BindFailed {
                addr,
                reason: e.to_string(),
            }
        })?;
        // The whole point of the reservation is to conflict with other
        // binds on this endpoint.
        socket
            .set_reuse_address(false)
            .map_err(|e| NatError::BindFailed {
                addr,
                reason: e.to_string(),
            })?;
        socket.bind(&addr.into()).map_err(|e| NatError::BindFailed {
            addr,
            reason: e.to_string(),
        })?;

        let bound = socket
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .and_then(|a| match a {
                SocketAddr::V4(v4) => Some(UdpEndpoint::from(v4)),
                SocketAddr::V6(_) => None,
            })
            .ok_or_else(|| NatError::BindFailed {
                addr,
                reason: "bound address is not IPv4".into(),
            })?;

        let inserted = self.registry.lock().insert(bound);
        assert!(
            inserted,
            "port manager registry out of sync: kernel bound {bound} twice"
        );

        trace!(endpoint = %bound, "reserved WAN endpoint");
        Ok(PortReservation {
            endpoint: bound,
            _socket: socket,
            registry: Arc::clone(&self.registry),
        })
    }
}

impl fmt::Debug for PortManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortManager")
            .field("wan_ips", &self.wan_ips)
            .field("pooling", &self.pooling)
            .field("assignment", &self.assignment)
            .field("reserved", &self.reserved_count())
            .finish()
    }
}
