//! Error taxonomy for the async layer. Wire/state-machine errors from
//! `someip-proto` are wrapped rather than duplicated; everything socket- or
//! task-shaped is added here.

use std::net::SocketAddr;

use someip_proto::{CodecError, ConfigError};
use thiserror::Error;

/// Errors raised while binding, sending on, or receiving from an endpoint.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EndpointError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("send to {addr} failed: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("receive failed: {0}")]
    Recv(#[source] std::io::Error),

    #[error("no endpoint bound for {0}")]
    NotBound(SocketAddr),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("the endpoint driver task has already shut down")]
    DriverGone,
}

/// Errors raised by the routing manager while processing a command or an
/// inbound message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RoutingError {
    #[error("service {service:#06x}.{instance:#06x} is not known to the routing manager")]
    UnknownService { service: u16, instance: u16 },

    #[error("eventgroup {eventgroup:#06x} of service {service:#06x}.{instance:#06x} is not known")]
    UnknownEventgroup {
        service: u16,
        instance: u16,
        eventgroup: u16,
    },

    #[error("client {0:#06x} is not allowed to access this method/eventgroup by local policy")]
    AccessDenied(u16),

    #[error("the routing manager task has already shut down")]
    ManagerGone,

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Top-level error type returned from the public API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
