//! The probe client: active characterization of the NAT in front of us.
//!
//! Two phases. The mapping phase opens a handful of ephemeral sockets and
//! sprays requests at every server endpoint, recording which public
//! mapping each (local, remote) pair was assigned. The firewall phase
//! then repurposes one working destination and asks the server to reply
//! from endpoints we never contacted; whatever gets through tells us what
//! the filtering enforces.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{encode_request, parse_response, RESPONSE_LEN};
use super::report::{FirewallProbe, MappingProbe, ProbeReport};
use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::types::UdpEndpoint;

/// Run the full probe: resolve, map, then probe the firewall through the
/// first working mapping.
pub async fn probe(config: &ProbeConfig) -> Result<ProbeReport> {
    config.validate()?;

    let ips = resolve_servers(&config.servers, config.resolve_timeout).await?;
    let dests: Vec<UdpEndpoint> = ips
        .iter()
        .flat_map(|&ip| config.ports.iter().map(move |&port| UdpEndpoint::new(ip, port)))
        .collect();

    info!(
        ips = ips.len(),
        ports = config.ports.len(),
        sockets = config.mapping_sockets,
        "probing NAT mapping behavior"
    );
    let mapping_probes = probe_mapping(&dests, config).await?;

    let firewall = match mapping_probes.iter().find(|p| !p.timeout) {
        Some(working) => {
            info!(dest = %working.remote, "probing firewall behavior");
            Some(probe_firewall(working.remote, config).await?)
        }
        None => {
            warn!("no working destination; skipping firewall probe");
            None
        }
    };

    Ok(ProbeReport {
        mapping_probes,
        firewall,
    })
}

/// Resolve the configured server names to IPv4 addresses.
///
/// `resolve_timeout` bounds the whole resolution pass, not each host.
pub async fn resolve_servers(hosts: &[String], resolve_timeout: Duration) -> Result<Vec<Ipv4Addr>> {
    let deadline = Instant::now() + resolve_timeout;
    let mut ips = Vec::new();
    for host in hosts {
        let name = host.trim_end_matches('.');
        let addrs = timeout_at(deadline, lookup_host((name, 0u16)))
            .await
            .map_err(|_| Error::Resolve {
                host: host.clone(),
                reason: "timed out".into(),
            })?
            .map_err(|e| Error::Resolve {
                host: host.clone(),
                reason: e.to_string(),
            })?;

        for addr in addrs {
            if let std::net::SocketAddr::V4(v4) = addr {
                ips.push(*v4.ip());
            }
        }
    }
    if ips.is_empty() {
        return Err(Error::Resolve {
            host: hosts.join(", "),
            reason: "no IPv4 addresses".into(),
        });
    }
    ips.dedup();
    Ok(ips)
}

/// Mapping phase: N sockets, each spraying every destination.
async fn probe_mapping(dests: &[UdpEndpoint], config: &ProbeConfig) -> Result<Vec<MappingProbe>> {
    let mut handles = Vec::new();
    for _ in 0..config.mapping_sockets {
        handles.push(tokio::spawn(probe_one_mapping(
            dests.to_vec(),
            config.mapping_duration,
            config.mapping_transmit_interval,
        )));
    }

    let mut probes = Vec::new();
    for handle in handles {
        probes.extend(
            handle
                .await
                .map_err(|e| Error::Internal(format!("mapping task failed: {e}")))??,
        );
    }
    Ok(probes)
}

/// One socket's worth of the mapping phase.
///
/// A sender task per destination transmits on the interval; the receiver
/// records one probe per distinct (local, mapped, remote) observation.
/// Destinations that never answered become timeout probes.
async fn probe_one_mapping(
    dests: Vec<UdpEndpoint>,
    duration: Duration,
    tx_interval: Duration,
) -> Result<Vec<MappingProbe>> {
    let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
    let local = UdpEndpoint::from_socket_addr(socket.local_addr()?)
        .ok_or_else(|| Error::Internal("ephemeral socket is not IPv4".into()))?;

    let deadline = Instant::now() + duration;
    let cancel = CancellationToken::new();
    let senders = spawn_senders(&socket, &dests, tx_interval, &cancel, false);

    let mut probes = Vec::new();
    let mut seen: HashSet<(UdpEndpoint, UdpEndpoint)> = HashSet::new();
    let mut seen_by_dest: HashSet<UdpEndpoint> = HashSet::new();
    let mut buf = [0u8; 2048];

    loop {
        let received = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break, // phase deadline
            Ok(Err(e)) => {
                cancel.cancel();
                join_all(senders).await;
                return Err(e.into());
            }
            Ok(Ok(r)) => r,
        };

        let (n, src) = received;
        if n != RESPONSE_LEN {
            continue;
        }
        let Some(mapped) = parse_response(&buf[..n]) else {
            continue;
        };
        let Some(remote) = UdpEndpoint::from_socket_addr(src) else {
            continue;
        };

        seen_by_dest.insert(remote);
        if seen.insert((mapped, remote)) {
            debug!(%local, %mapped, %remote, "observed mapping");
            probes.push(MappingProbe {
                local,
                mapped: Some(mapped),
                remote,
                timeout: false,
            });
        }
    }

    cancel.cancel();
    join_all(senders).await;

    for dest in dests {
        if !seen_by_dest.contains(&dest) {
            probes.push(MappingProbe {
                local,
                mapped: None,
                remote: dest,
                timeout: true,
            });
        }
    }
    Ok(probes)
}

/// Firewall phase: one socket, one destination, cycling the vary flags so
/// the server is asked for every response-endpoint combination in turn.
async fn probe_firewall(
    dest: UdpEndpoint,
    config: &ProbeConfig,
) -> Result<FirewallProbe> {
    let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
    let local = UdpEndpoint::from_socket_addr(socket.local_addr()?)
        .ok_or_else(|| Error::Internal("ephemeral socket is not IPv4".into()))?;

    let deadline = Instant::now() + config.firewall_duration;
    let cancel = CancellationToken::new();
    let senders = spawn_senders(
        &socket,
        &[dest],
        config.firewall_transmit_interval,
        &cancel,
        true,
    );

    let mut received = Vec::new();
    let mut seen: HashSet<UdpEndpoint> = HashSet::new();
    let mut buf = [0u8; 2048];

    loop {
        let result = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Err(e)) => {
                cancel.cancel();
                join_all(senders).await;
                return Err(e.into());
            }
            Ok(Ok(r)) => r,
        };

        let (n, src) = result;
        if n != RESPONSE_LEN {
            continue;
        }
        let Some(from) = UdpEndpoint::from_socket_addr(src) else {
            continue;
        };
        if seen.insert(from) {
            debug!(%from, "firewall let a reply through");
            received.push(from);
        }
    }

    cancel.cancel();
    join_all(senders).await;

    Ok(FirewallProbe {
        local,
        remote: dest,
        received,
    })
}

/// One sender task per destination. With `cycle`, a 2-bit counter walks
/// the request through all four vary combinations: neither, IP, port,
/// both.
fn spawn_senders(
    socket: &Arc<UdpSocket>,
    dests: &[UdpEndpoint],
    tx_interval: Duration,
    cancel: &CancellationToken,
    cycle: bool,
) -> Vec<JoinHandle<()>> {
    dests
        .iter()
        .map(|&dest| {
            let socket = Arc::clone(socket);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut counter: u8 = 0;
                loop {
                    let request = if cycle {
                        let req = encode_request(counter & 1 == 1, counter >> 1 == 1);
                        counter = (counter + 1) % 4;
                        req
                    } else {
                        encode_request(false, false)
                    };

                    if let Err(e) = socket.send_to(&request, dest.to_socket_addr()).await {
                        debug!(%dest, error = %e, "send failed");
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(tx_interval) => {}
                    }
                }
            })
        })
        .collect()
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}
