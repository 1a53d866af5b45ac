//! NAT probing: an active client, a reflector server, and the analyzer
//! that turns raw observations into categorical findings.
//!
//! The wire protocol is deliberately dumb. A request is exactly 180 bytes;
//! the first two bytes ask the server to reply from a different IP and/or
//! a different port. A response is exactly 18 bytes: the source ip:port
//! the server observed, which is the client's NAT mapping. Every other
//! length is discarded on both sides.

mod client;
mod report;
mod server;

pub use client::{probe, resolve_servers};
pub use report::{Analysis, FirewallProbe, MappingProbe, ProbeReport};
pub use server::ProbeServer;

use std::net::Ipv6Addr;

use crate::types::UdpEndpoint;

/// Exact request length.
pub const REQUEST_LEN: usize = 180;

/// Exact response length.
pub const RESPONSE_LEN: usize = 18;

/// Build a request asking the server to vary its response endpoint.
pub fn encode_request(vary_ip: bool, vary_port: bool) -> [u8; REQUEST_LEN] {
    let mut buf = [0u8; REQUEST_LEN];
    buf[0] = u8::from(vary_ip);
    buf[1] = u8::from(vary_port);
    buf
}

/// Decode a request's vary flags. `None` for any other length.
pub fn parse_request(buf: &[u8]) -> Option<(bool, bool)> {
    if buf.len() != REQUEST_LEN {
        return None;
    }
    Some((buf[0] == 1, buf[1] == 1))
}

/// Encode the observed source endpoint: 16 bytes of IPv4-mapped IPv6
/// address followed by the big-endian port.
pub fn encode_response(observed: UdpEndpoint) -> [u8; RESPONSE_LEN] {
    let mut buf = [0u8; RESPONSE_LEN];
    buf[..16].copy_from_slice(&observed.ip.to_ipv6_mapped().octets());
    buf[16..].copy_from_slice(&observed.port.to_be_bytes());
    buf
}

/// Decode a response into the mapped endpoint. `None` for any other
/// length, or an address that isn't IPv4-mapped.
pub fn parse_response(buf: &[u8]) -> Option<UdpEndpoint> {
    if buf.len() != RESPONSE_LEN {
        return None;
    }
    let mut ip_bytes = [0u8; 16];
    ip_bytes.copy_from_slice(&buf[..16]);
    let ip = Ipv6Addr::from(ip_bytes).to_ipv4_mapped()?;
    let port = u16::from_be_bytes([buf[16], buf[17]]);
    Some(UdpEndpoint::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn request_flags_round_trip() {
        for (vary_ip, vary_port) in [(false, false), (true, false), (false, true), (true, true)] {
            let req = encode_request(vary_ip, vary_port);
            assert_eq!(req.len(), REQUEST_LEN);
            assert_eq!(parse_request(&req), Some((vary_ip, vary_port)));
        }
    }

    #[test]
    fn request_rejects_other_lengths() {
        assert!(parse_request(&[0u8; 179]).is_none());
        assert!(parse_request(&[0u8; 181]).is_none());
        assert!(parse_request(&[]).is_none());
    }

    #[test]
    fn response_encodes_mapped_ipv6_form() {
        let ep = UdpEndpoint::new(Ipv4Addr::new(203, 0, 113, 9), 40000);
        let buf = encode_response(ep);
        assert_eq!(&buf[..12], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(&buf[12..16], &[203, 0, 113, 9]);
        assert_eq!(parse_response(&buf), Some(ep));
    }

    #[test]
    fn response_rejects_other_lengths() {
        assert!(parse_response(&[0u8; 17]).is_none());
        assert!(parse_response(&[0u8; 19]).is_none());
    }

    #[test]
    fn response_rejects_non_v4_address() {
        let mut buf = [0u8; RESPONSE_LEN];
        buf[0] = 0x20; // 2000::/16, not IPv4-mapped
        assert!(parse_response(&buf).is_none());
    }
}
