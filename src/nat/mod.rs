//! The configurable NAT datapath.
//!
//! A user-space packet-mangling engine placed between a LAN and a WAN
//! interface. Whole IPv4/UDP datagrams arrive from a kernel packet queue,
//! get their addresses and ports rewritten in place, and leave with a
//! verdict. The translation state (mapping tables, filter table, parked
//! WAN ports) reproduces the RFC 4787 / 5780 taxonomy of NAT behaviors
//! under the knobs in [`crate::config::NatConfig`].
//!
//! ```text
//! ┌───────────┐   buffers + ingress index    ┌──────────────────────────┐
//! │  kernel   │ ───────────────────────────> │        NatRunner         │
//! │  packet   │                              │  ┌────────────────────┐  │
//! │  queue    │ <─────────────────────────── │  │     Translator     │  │
//! └───────────┘     verdict (by packet-id)   │  │  mapping tables    │  │
//!                                            │  │  filter table      │  │
//!                                            │  │  ┌──────────────┐  │  │
//!                                            │  │  │ PortManager  │  │  │
//!                                            │  │  │ parked ports │  │  │
//!                                            │  │  └──────────────┘  │  │
//!                                            │  └────────────────────┘  │
//!                                            └──────────────────────────┘
//! ```

mod packet;
mod portmgr;
mod runner;
mod simple;
mod translator;

pub use packet::{PacketView, IPV4_MIN_HEADER_LEN, UDP_HEADER_LEN};
pub use portmgr::{PortManager, PortReservation, BIND_ATTEMPTS};
pub use runner::{NatRunner, RunnerStats, QUEUE_NUM};
pub use simple::EndpointIndependentNat;
pub use translator::TweakableNat;

/// What to do with a packet after translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Emit the packet unchanged.
    Accept,
    /// Emit the now-mutated buffer.
    Mangle,
    /// Discard the packet.
    Drop,
}

/// The translation capability the datapath dispatches to.
///
/// Packets get fed in, may be mutated in place, and the verdict dictates
/// whether the buffer makes it off the machine. Implementations never
/// return errors across this boundary: everything recoverable is a
/// [`Verdict::Drop`].
pub trait Translator {
    /// Translate a packet arriving from the LAN interface.
    fn translate_outbound(&mut self, packet: &mut [u8]) -> Verdict;

    /// Translate a packet arriving from the WAN interface.
    fn translate_inbound(&mut self, packet: &mut [u8]) -> Verdict;

    /// Evict idle table state. Called periodically by the runner; the
    /// translator is free to do all expiry lazily instead.
    fn sweep(&mut self) {}
}
