//! Owns every local socket and the interned table of remote
//! endpoint-definitions. Resolves `(address, port, reliable)` to a
//! live transport, dialing TCP lazily and reusing UDP's single unicast
//! socket for everything it sends.
//!
//! No lock is ever held across an I/O call or a callback into the routing
//! manager: this type only ever appears behind an `Arc`, and each method
//! either touches its own `tokio::sync::Mutex` briefly or performs I/O with
//! no lock held at all.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use someip_proto::{EndpointDefinitionKey, EndpointDefinitionTable, EndpointHandle};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::endpoint::capability::EndpointCapability;
use crate::endpoint::tcp::TcpEndpoint;
use crate::endpoint::udp::UdpEndpoint;
use crate::error::EndpointError;

/// `preferred` first, then every other port in `range` (if any), so a bind
/// conflict on the configured port falls through to the next free one
/// instead of failing outright.
fn candidate_ports(preferred: u16, range: Option<(u16, u16)>) -> Vec<u16> {
    let mut ports = vec![preferred];
    if let Some((lo, hi)) = range {
        ports.extend((lo..=hi).filter(|p| *p != preferred));
    }
    ports
}

/// One fully-framed PDU received on any local endpoint, tagged with where
/// it came from and how it arrived.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub peer: SocketAddr,
    pub reliable: bool,
    pub data: Bytes,
}

pub struct EndpointManager {
    udp_unicast: Arc<UdpEndpoint>,
    udp_multicast: Option<Arc<UdpEndpoint>>,
    multicast_group: Option<SocketAddr>,
    tcp: Arc<TcpEndpoint>,
    table: Mutex<EndpointDefinitionTable>,
}

impl EndpointManager {
    pub async fn new(
        unicast_addr: SocketAddr,
        multicast: Option<(SocketAddr, IpAddr)>,
        inbound: mpsc::Sender<Inbound>,
        magic_cookies_enabled: bool,
        tcp_send_timeout: Duration,
        client_port_range: Option<(u16, u16)>,
    ) -> Result<Arc<Self>, EndpointError> {
        let mut last_err = None;
        let mut bound = None;
        for port in candidate_ports(unicast_addr.port(), client_port_range) {
            let addr = SocketAddr::new(unicast_addr.ip(), port);
            let udp_unicast = match UdpEndpoint::bind(addr) {
                Ok(u) => u,
                Err(e) => {
                    warn!(port, error = %e, "unicast udp bind failed, trying next candidate port");
                    last_err = Some(e);
                    continue;
                }
            };
            let (tcp_tx, tcp_rx) = mpsc::channel(256);
            match TcpEndpoint::bind(addr, tcp_tx, magic_cookies_enabled, tcp_send_timeout).await {
                Ok(tcp) => {
                    bound = Some((addr, udp_unicast, tcp, tcp_rx));
                    break;
                }
                Err(e) => {
                    warn!(port, error = %e, "tcp listener bind failed, trying next candidate port");
                    last_err = Some(e);
                    continue;
                }
            }
        }
        let (unicast_addr, udp_unicast, tcp, mut tcp_rx) = bound.ok_or_else(|| {
            last_err.unwrap_or(EndpointError::Bind {
                addr: unicast_addr,
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "no candidate port was available"),
            })
        })?;
        let udp_unicast = Arc::new(udp_unicast);

        let (udp_multicast, multicast_group) = match multicast {
            Some((bind_addr, group)) => (
                Some(Arc::new(UdpEndpoint::bind_multicast(bind_addr, group)?)),
                Some(SocketAddr::new(group, bind_addr.port())),
            ),
            None => (None, None),
        };

        let tcp_inbound = inbound.clone();
        tokio::spawn(async move {
            while let Some((peer, data)) = tcp_rx.recv().await {
                if tcp_inbound
                    .send(Inbound {
                        peer,
                        reliable: true,
                        data,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        spawn_udp_recv_loop(udp_unicast.clone(), inbound.clone());
        if let Some(mc) = &udp_multicast {
            spawn_udp_recv_loop(mc.clone(), inbound);
        }

        Ok(Arc::new(Self {
            udp_unicast,
            udp_multicast,
            multicast_group,
            tcp,
            table: Mutex::new(EndpointDefinitionTable::new()),
        }))
    }

    pub fn local_unicast_addr(&self) -> SocketAddr {
        self.udp_unicast.local_addr()
    }

    pub async fn intern(&self, key: EndpointDefinitionKey) -> EndpointHandle {
        self.table.lock().await.intern(key)
    }

    /// Look up the address and reliability a previously-interned handle
    /// resolves to.
    pub async fn resolve(&self, handle: EndpointHandle) -> Option<(SocketAddr, bool)> {
        let table = self.table.lock().await;
        let def = table.get(handle)?;
        Some((SocketAddr::new(def.address(), def.remote_port()), def.reliability().is_reliable()))
    }

    /// Send one PDU to `dst` over UDP or TCP as requested by `reliable`,
    /// dialing out a fresh TCP connection first if none is open yet.
    pub async fn send_unicast(&self, dst: SocketAddr, reliable: bool, data: Bytes) -> Result<(), EndpointError> {
        if reliable {
            if self.tcp.send_to(dst, data.clone()).await.is_err() {
                self.tcp.connect(dst).await?;
                self.tcp.send_to(dst, data).await?;
            }
            Ok(())
        } else {
            self.udp_unicast.send_to(dst, data).await
        }
    }

    pub async fn send_multicast(&self, data: Bytes) -> Result<(), EndpointError> {
        let dst = self
            .multicast_group
            .ok_or_else(|| EndpointError::NotBound(self.udp_unicast.local_addr()))?;
        // Any UDP socket can send to a multicast group; membership is only
        // required to *receive* from it, so the plain unicast socket does.
        self.udp_unicast.send_to(dst, data).await
    }
}

fn spawn_udp_recv_loop(endpoint: Arc<UdpEndpoint>, inbound: mpsc::Sender<Inbound>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        loop {
            let (n, peer) = match endpoint.recv(&mut buf).await {
                Ok(v) => v,
                Err(_) => break,
            };
            let data = Bytes::copy_from_slice(&buf[..n]);
            if inbound
                .send(Inbound {
                    peer,
                    reliable: false,
                    data,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    });
}
