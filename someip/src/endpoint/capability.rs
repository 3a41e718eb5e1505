//! Endpoint capability trait: a tcp/udp client/server endpoint hierarchy
//! that would otherwise share a virtual base becomes one trait plus
//! per-transport structs, dispatched with `async-trait` instead of a
//! v-table.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::EndpointError;

/// A transport an endpoint manager can send datagrams/messages on.
///
/// Implemented once for UDP (`endpoint::udp::UdpEndpoint`) and once for TCP
/// (`endpoint::tcp::TcpEndpoint`); both sides of the routing manager talk to
/// this trait and never match on the concrete transport.
#[async_trait]
pub trait EndpointCapability: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    fn is_reliable(&self) -> bool;

    /// Send one already-framed SOME/IP PDU to `dst`. For TCP endpoints
    /// `dst` identifies which open connection to use; unconnected
    /// destinations return [`EndpointError::NotBound`].
    async fn send_to(&self, dst: SocketAddr, data: Bytes) -> Result<(), EndpointError>;
}
