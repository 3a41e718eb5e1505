//! UDP endpoint: unicast SOME/IP traffic and SD multicast, both framed as
//! one datagram per PDU. Grounded on `mdns::conn::DnsConn`'s
//! `socket2`-then-`tokio::net::UdpSocket` setup for the multicast-join
//! dance.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;

use crate::endpoint::capability::EndpointCapability;
use crate::error::EndpointError;

pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpEndpoint {
    /// Bind a plain unicast UDP endpoint.
    pub fn bind(addr: SocketAddr) -> Result<Self, EndpointError> {
        let socket = std::net::UdpSocket::bind(addr).map_err(|source| EndpointError::Bind { addr, source })?;
        socket
            .set_nonblocking(true)
            .map_err(|source| EndpointError::Bind { addr, source })?;
        let local_addr = socket.local_addr().map_err(|source| EndpointError::Bind { addr, source })?;
        let socket = UdpSocket::from_std(socket).map_err(|source| EndpointError::Bind { addr, source })?;
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Bind a socket that also joins `multicast_group` on every configured
    /// local address, for receiving SOME/IP-SD multicast.
    pub fn bind_multicast(bind_addr: SocketAddr, multicast_group: IpAddr) -> Result<Self, EndpointError> {
        let domain = if bind_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|source| EndpointError::Bind { addr: bind_addr, source })?;
        socket
            .set_reuse_address(true)
            .map_err(|source| EndpointError::Bind { addr: bind_addr, source })?;
        #[cfg(unix)]
        socket
            .set_reuse_port(true)
            .map_err(|source| EndpointError::Bind { addr: bind_addr, source })?;
        socket
            .bind(&SockAddr::from(bind_addr))
            .map_err(|source| EndpointError::Bind { addr: bind_addr, source })?;

        match (multicast_group, bind_addr.ip()) {
            (IpAddr::V4(group), IpAddr::V4(iface)) => {
                socket
                    .join_multicast_v4(&group, &iface)
                    .map_err(|source| EndpointError::Bind { addr: bind_addr, source })?;
            }
            (IpAddr::V4(group), IpAddr::V4(_)) | (IpAddr::V4(group), _) => {
                socket
                    .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                    .map_err(|source| EndpointError::Bind { addr: bind_addr, source })?;
            }
            (IpAddr::V6(group), _) => {
                socket
                    .join_multicast_v6(&group, 0)
                    .map_err(|source| EndpointError::Bind { addr: bind_addr, source })?;
            }
        }

        socket
            .set_nonblocking(true)
            .map_err(|source| EndpointError::Bind { addr: bind_addr, source })?;
        let local_addr = bind_addr;
        let socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(socket).map_err(|source| EndpointError::Bind { addr: bind_addr, source })?;
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), EndpointError> {
        self.socket.recv_from(buf).await.map_err(EndpointError::Recv)
    }
}

#[async_trait]
impl EndpointCapability for UdpEndpoint {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn is_reliable(&self) -> bool {
        false
    }

    async fn send_to(&self, dst: SocketAddr, data: Bytes) -> Result<(), EndpointError> {
        self.socket
            .send_to(&data, dst)
            .await
            .map(|_| ())
            .map_err(|source| EndpointError::Send { addr: dst, source })
    }
}
