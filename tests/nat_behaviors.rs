//! End-to-end NAT datapath scenarios, driven through the public API the
//! way the queue loop drives it: raw packet bytes in, verdicts out.

use std::collections::HashMap;
use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;

use natlab::config::{
    AddressPooling, EndpointDependence, MappingRefreshDirection, NatConfig, PortAssignment,
};
use natlab::nat::{NatRunner, PacketView, Translator, TweakableNat, Verdict};
use natlab::types::{InterfaceRole, UdpEndpoint, UdpTuple};

const LO1: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const LAN_IF: u32 = 10;
const WAN_IF: u32 = 20;

const REMOTE_A: UdpEndpoint = UdpEndpoint::new(Ipv4Addr::new(198, 51, 100, 10), 443);
const REMOTE_B: UdpEndpoint = UdpEndpoint::new(Ipv4Addr::new(198, 51, 100, 20), 53);

fn lan_host(port: u16) -> UdpEndpoint {
    UdpEndpoint::new(Ipv4Addr::new(10, 0, 0, 5), port)
}

/// Minimal IPv4/UDP datagram builder with a valid header checksum.
fn build_udp4(tuple: UdpTuple, payload: &[u8]) -> Vec<u8> {
    let total_len = 28 + payload.len();
    let mut buf = vec![0u8; total_len];
    buf[0] = 0x45;
    buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buf[8] = 64;
    buf[9] = 17;
    buf[12..16].copy_from_slice(&tuple.src.ip.octets());
    buf[16..20].copy_from_slice(&tuple.dst.ip.octets());
    buf[20..22].copy_from_slice(&tuple.src.port.to_be_bytes());
    buf[22..24].copy_from_slice(&tuple.dst.port.to_be_bytes());
    buf[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    buf[28..].copy_from_slice(payload);

    let mut sum: u32 = 0;
    for i in (0..20).step_by(2) {
        if i == 10 {
            continue;
        }
        sum += u32::from(u16::from_be_bytes([buf[i], buf[i + 1]]));
    }
    sum = (sum & 0xffff) + (sum >> 16);
    sum = (sum & 0xffff) + (sum >> 16);
    buf[10..12].copy_from_slice(&(!(sum as u16)).to_be_bytes());
    buf
}

fn parse_tuple(buf: &mut [u8]) -> UdpTuple {
    PacketView::parse(buf).expect("packet must stay parseable").tuple()
}

/// One's-complement sum over the IP header must be 0xffff when the
/// checksum field is valid.
fn header_is_valid(buf: &[u8]) -> bool {
    let header_len = usize::from(buf[0] & 0x0f) * 4;
    let mut sum: u32 = 0;
    for i in (0..header_len).step_by(2) {
        sum += u32::from(u16::from_be_bytes([buf[i], buf[i + 1]]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16 == 0xffff
}

fn runner(config: NatConfig) -> NatRunner {
    let translator = TweakableNat::with_seed(config, vec![LO1], 7).unwrap();
    NatRunner::new(
        Box::new(translator),
        HashMap::from([(LAN_IF, InterfaceRole::Lan), (WAN_IF, InterfaceRole::Wan)]),
    )
}

#[test]
fn full_cone_session_round_trips_through_the_runner() {
    let config = NatConfig {
        mapping_reuse: EndpointDependence::EndpointIndependent,
        filtering_behavior: EndpointDependence::EndpointIndependent,
        ..Default::default()
    };
    let mut runner = runner(config);

    // LAN host talks out.
    let original = UdpTuple::new(lan_host(1000), REMOTE_A);
    let mut outbound = build_udp4(original, b"hello");
    assert_eq!(runner.process(LAN_IF, &mut outbound), Verdict::Mangle);
    assert!(header_is_valid(&outbound));

    let mangled = parse_tuple(&mut outbound);
    assert_eq!(mangled.src.ip, LO1);
    assert_eq!(mangled.dst, REMOTE_A);

    // The reply comes back to the WAN endpoint and is rewritten to the
    // LAN host, restoring the original addressing.
    let mut reply = build_udp4(mangled.flip(), b"world");
    assert_eq!(runner.process(WAN_IF, &mut reply), Verdict::Mangle);
    assert!(header_is_valid(&reply));
    assert_eq!(parse_tuple(&mut reply), original.flip());

    let stats = runner.stats();
    assert_eq!(stats.outbound_mangled, 1);
    assert_eq!(stats.inbound_mangled, 1);
}

#[test]
fn symmetric_nat_assigns_and_enforces_per_destination() {
    // Address-and-port-dependent everything: the classic symmetric NAT.
    let config = NatConfig {
        mapping_reuse: EndpointDependence::AddressAndPortDependent,
        filtering_behavior: EndpointDependence::AddressAndPortDependent,
        ..Default::default()
    };
    let mut runner = runner(config);

    let mut to_a = build_udp4(UdpTuple::new(lan_host(1000), REMOTE_A), b"");
    let mut to_b = build_udp4(UdpTuple::new(lan_host(1000), REMOTE_B), b"");
    assert_eq!(runner.process(LAN_IF, &mut to_a), Verdict::Mangle);
    assert_eq!(runner.process(LAN_IF, &mut to_b), Verdict::Mangle);

    let wan_a = parse_tuple(&mut to_a).src;
    let wan_b = parse_tuple(&mut to_b).src;
    assert_ne!(wan_a, wan_b, "per-destination mappings must differ");

    // Each remote can answer on its own mapping.
    let mut reply_a = build_udp4(UdpTuple::new(REMOTE_A, wan_a), b"");
    assert_eq!(runner.process(WAN_IF, &mut reply_a), Verdict::Mangle);

    // But not on the other's: wrong filter key.
    let mut cross = build_udp4(UdpTuple::new(REMOTE_B, wan_a), b"");
    assert_eq!(runner.process(WAN_IF, &mut cross), Verdict::Drop);
}

#[test]
fn unknown_ingress_and_unsolicited_inbound_drop() {
    let mut runner = runner(NatConfig::default());

    let mut packet = build_udp4(UdpTuple::new(lan_host(1000), REMOTE_A), b"");
    assert_eq!(runner.process(99, &mut packet), Verdict::Drop);

    let mut unsolicited = build_udp4(
        UdpTuple::new(REMOTE_A, UdpEndpoint::new(LO1, 40404)),
        b"",
    );
    assert_eq!(runner.process(WAN_IF, &mut unsolicited), Verdict::Drop);
}

#[test]
fn expired_mapping_releases_its_wan_port() {
    let config = NatConfig {
        mapping_reuse: EndpointDependence::EndpointIndependent,
        filtering_behavior: EndpointDependence::EndpointIndependent,
        mapping_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let mut nat = TweakableNat::with_seed(config, vec![LO1], 7).unwrap();

    let mut outbound = build_udp4(UdpTuple::new(lan_host(1000), REMOTE_A), b"");
    assert_eq!(nat.translate_outbound(&mut outbound), Verdict::Mangle);
    let wan = parse_tuple(&mut outbound).src;

    // Reserved: a foreign bind on the WAN endpoint must fail.
    assert!(UdpSocket::bind(wan.to_socket_addr()).is_err());

    std::thread::sleep(Duration::from_millis(100));
    nat.sweep();
    assert_eq!(nat.mapping_count(), 0);

    // Released: the same bind now succeeds.
    UdpSocket::bind(wan.to_socket_addr()).unwrap();
}

#[test]
fn preserving_assignment_with_paired_pooling() {
    let probe = UdpSocket::bind((LO1, 0)).unwrap();
    let free = probe.local_addr().unwrap().port();
    drop(probe);

    let config = NatConfig {
        mapping_reuse: EndpointDependence::AddressAndPortDependent,
        filtering_behavior: EndpointDependence::AddressAndPortDependent,
        port_assignment: PortAssignment::Preserving,
        address_pooling: AddressPooling::Paired,
        ..Default::default()
    };
    let mut nat = TweakableNat::with_seed(config, vec![LO1], 7).unwrap();

    let mut outbound = build_udp4(UdpTuple::new(lan_host(free), REMOTE_A), b"");
    assert_eq!(nat.translate_outbound(&mut outbound), Verdict::Mangle);
    assert_eq!(parse_tuple(&mut outbound).src, UdpEndpoint::new(LO1, free));
}

#[test]
fn inbound_refresh_keeps_a_session_alive() {
    let config = NatConfig {
        mapping_reuse: EndpointDependence::EndpointIndependent,
        filtering_behavior: EndpointDependence::EndpointIndependent,
        mapping_timeout: Duration::from_millis(200),
        mapping_refresh_direction: MappingRefreshDirection::Both,
        ..Default::default()
    };
    let mut nat = TweakableNat::with_seed(config, vec![LO1], 7).unwrap();

    let mut outbound = build_udp4(UdpTuple::new(lan_host(1000), REMOTE_A), b"");
    nat.translate_outbound(&mut outbound);
    let wan = parse_tuple(&mut outbound).src;

    // Keep the session alive with inbound traffic alone.
    for _ in 0..3 {
        std::thread::sleep(Duration::from_millis(120));
        let mut reply = build_udp4(UdpTuple::new(REMOTE_A, wan), b"");
        assert_eq!(nat.translate_inbound(&mut reply), Verdict::Mangle);
    }
}
