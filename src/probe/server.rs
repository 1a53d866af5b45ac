//! The probe server: a multi-endpoint UDP reflector.
//!
//! Binds one socket per (public IP, configured port) combination. Each
//! well-formed request names, via its two vary flags, whether the reply
//! should come from a different IP and/or a different port; the server
//! picks a matching socket from its bind set and reflects the observed
//! source endpoint back. A client behind a NAT thereby learns its mapping
//! and, by inviting replies from endpoints it never contacted, the NAT's
//! filtering behavior.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::{encode_response, parse_request};
use crate::error::Result;
use crate::types::UdpEndpoint;

/// The reflector and its bind set.
pub struct ProbeServer {
    endpoints: Arc<Vec<(SocketAddrV4, Arc<UdpSocket>)>>,
}

impl ProbeServer {
    /// Bind every IP × port combination. Any single failure is fatal: a
    /// partial bind set would silently skew probe results.
    pub async fn bind(ips: &[Ipv4Addr], ports: &[u16]) -> Result<Self> {
        if ips.len() < 2 {
            warn!(
                available = ips.len(),
                "fewer than two public IPs; IP-varying probes will go unanswered"
            );
        }

        let mut endpoints = Vec::with_capacity(ips.len() * ports.len());
        for &ip in ips {
            for &port in ports {
                let addr = SocketAddrV4::new(ip, port);
                let socket = UdpSocket::bind(addr).await?;
                info!(%addr, "listening");
                endpoints.push((addr, Arc::new(socket)));
            }
        }
        Ok(Self {
            endpoints: Arc::new(endpoints),
        })
    }

    /// Addresses of the bind set, in bind order.
    pub fn local_addrs(&self) -> Vec<SocketAddrV4> {
        self.endpoints.iter().map(|(addr, _)| *addr).collect()
    }

    /// Run one receive loop per bound socket. Never returns under normal
    /// operation.
    pub async fn run(&self) -> Result<()> {
        let mut handles = Vec::new();
        for index in 0..self.endpoints.len() {
            let endpoints = Arc::clone(&self.endpoints);
            handles.push(tokio::spawn(serve_socket(endpoints, index)));
        }
        info!(sockets = handles.len(), "startup complete");

        for handle in handles {
            handle
                .await
                .map_err(|e| crate::error::Error::Internal(format!("server task failed: {e}")))?;
        }
        Ok(())
    }
}

/// Receive loop for one socket of the bind set.
async fn serve_socket(endpoints: Arc<Vec<(SocketAddrV4, Arc<UdpSocket>)>>, index: usize) {
    let (my_addr, socket) = &endpoints[index];
    let (my_addr, socket) = (*my_addr, Arc::clone(socket));
    let mut buf = [0u8; 2048];

    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(addr = %my_addr, error = %e, "receive failed");
                continue;
            }
        };

        let Some((vary_ip, vary_port)) = parse_request(&buf[..n]) else {
            debug!(len = n, %src, addr = %my_addr, "ignoring malformed packet");
            continue;
        };
        let Some(observed) = UdpEndpoint::from_socket_addr(src) else {
            continue;
        };

        // Pick a response socket whose IP differs from ours iff vary_ip,
        // and whose port differs iff vary_port.
        let response = endpoints.iter().find(|(addr, _)| {
            (addr.ip() == my_addr.ip()) != vary_ip && (addr.port() == my_addr.port()) != vary_port
        });
        let Some((resp_addr, resp_socket)) = response else {
            debug!(vary_ip, vary_port, "no socket satisfies the requested variation");
            continue;
        };

        if let Err(e) = resp_socket.send_to(&encode_response(observed), src).await {
            warn!(%src, error = %e, "failed to send response");
            continue;
        }
        info!(
            client = %observed,
            via = %resp_addr,
            vary_ip,
            vary_port,
            "provided NAT mapping"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{encode_request, parse_response, RESPONSE_LEN};
    use std::time::Duration;

    const LO1: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    async fn start_server(ports_wanted: usize) -> (Vec<SocketAddrV4>, tokio::task::JoinHandle<()>) {
        // Grab free ports first, then bind the server on them.
        let mut ports = Vec::new();
        let mut holders = Vec::new();
        for _ in 0..ports_wanted {
            let s = std::net::UdpSocket::bind((LO1, 0)).unwrap();
            ports.push(s.local_addr().unwrap().port());
            holders.push(s);
        }
        drop(holders);

        let server = ProbeServer::bind(&[LO1], &ports).await.unwrap();
        let addrs = server.local_addrs();
        let handle = tokio::spawn(async move {
            let _ = server.run().await;
        });
        (addrs, handle)
    }

    async fn exchange(
        client: &UdpSocket,
        dest: SocketAddrV4,
        vary_ip: bool,
        vary_port: bool,
    ) -> Option<(UdpEndpoint, SocketAddrV4)> {
        client
            .send_to(&encode_request(vary_ip, vary_port), dest)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let recv = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf)).await;
        match recv {
            Ok(Ok((n, from))) => {
                assert_eq!(n, RESPONSE_LEN);
                let from = match from {
                    std::net::SocketAddr::V4(v4) => v4,
                    other => panic!("unexpected source {other}"),
                };
                Some((parse_response(&buf[..n]).unwrap(), from))
            }
            _ => None,
        }
    }

    #[tokio::test]
    async fn reflects_observed_source() {
        let (addrs, server) = start_server(2).await;
        let client = UdpSocket::bind((LO1, 0)).await.unwrap();
        let local = client.local_addr().unwrap();

        let (observed, from) = exchange(&client, addrs[0], false, false).await.unwrap();
        assert_eq!(observed.port, local.port());
        assert_eq!(observed.ip, LO1);
        // No variation requested: the receiving socket replied.
        assert_eq!(from, addrs[0]);

        server.abort();
    }

    #[tokio::test]
    async fn varies_port_on_request() {
        let (addrs, server) = start_server(2).await;
        let client = UdpSocket::bind((LO1, 0)).await.unwrap();

        let (_, from) = exchange(&client, addrs[0], false, true).await.unwrap();
        assert_eq!(from, addrs[1]);

        server.abort();
    }

    #[tokio::test]
    async fn drops_unsatisfiable_variation() {
        // One IP only: vary_ip can never be satisfied.
        let (addrs, server) = start_server(2).await;
        let client = UdpSocket::bind((LO1, 0)).await.unwrap();

        assert!(exchange(&client, addrs[0], true, false).await.is_none());

        server.abort();
    }

    #[tokio::test]
    async fn ignores_wrong_length_requests() {
        let (addrs, server) = start_server(1).await;
        let client = UdpSocket::bind((LO1, 0)).await.unwrap();

        client.send_to(&[0u8; 64], addrs[0]).await.unwrap();
        let mut buf = [0u8; 64];
        let recv = tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
        assert!(recv.is_err());

        server.abort();
    }
}
