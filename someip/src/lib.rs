//! Async runtime for a SOME/IP routing and service-discovery core.
//!
//! [`Runtime::bind`] owns the local sockets and spawns the routing manager
//! task; the [`RoutingManagerClient`] it returns is the cheap, `Clone`able
//! handle every caller actually keeps. This split — a sans-IO state-machine
//! crate (`someip-proto`) driven by an owning async crate that spawns a
//! single task per endpoint — mirrors `quinn-proto`/`quinn`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

pub mod config;
pub mod discovery;
#[cfg(all(unix, feature = "socket-activation"))]
pub mod env;
pub mod error;
pub mod endpoint;
pub mod registry;
pub mod routing;

pub use config::{Config, Role};
pub use error::{EndpointError, Error, RoutingError};
pub use routing::{ClientEvent, RoutingManagerClient};

/// A bound SOME/IP instance: the endpoint manager plus the routing manager
/// task backing it. Dropping this does not stop the routing manager task —
/// every outstanding [`RoutingManagerClient`] keeps it alive — but it does
/// drop this handle's own reference.
///
/// A client role dialing a routing root over local IPC
/// ([`Config::routing_root_path`]) owns no local endpoints of its own — the
/// host role on the other end of that socket does the actual network I/O —
/// so `endpoints` is `None` for that case and [`Self::local_unicast_addr`]
/// has nothing to report.
#[derive(Debug)]
pub struct Runtime {
    endpoints: Option<Arc<endpoint::EndpointManager>>,
}

impl Runtime {
    /// Bind local sockets per `config` and spawn the routing manager task,
    /// returning the client handle used to drive it.
    ///
    /// If `config.role` is [`Role::Client`] and
    /// [`Config::routing_root_path`] is set, this dials that path as a
    /// separate routing-manager client instead of spawning an in-process
    /// host: no local sockets are bound, every command and event crosses
    /// the local IPC connection to whatever host role owns the routing
    /// root. Leaving `routing_root_path` unset keeps the single-process
    /// fast path, where a client role still drives its own in-process
    /// routing manager directly.
    pub async fn bind(config: Config) -> Result<(Self, RoutingManagerClient), Error> {
        let config = config.build()?;

        #[cfg(unix)]
        if config.role == config::Role::Client {
            if let Some(path) = config.routing_root_path.clone() {
                let (command_tx, command_rx) = mpsc::channel(config.command_queue_depth);
                tokio::spawn(routing::ipc::run_client_session(
                    path,
                    command_rx,
                    config.assign_client_timeout,
                    config.register_application_timeout,
                ));
                return Ok((Self { endpoints: None }, RoutingManagerClient::new(command_tx)));
            }
        }

        let unicast_addr = SocketAddr::new(config.unicast_address, config.sd_unicast_port);
        let multicast = match config.role {
            config::Role::Host => Some((
                SocketAddr::new(config.sd_multicast.ip(), config.sd_multicast.port()),
                config.sd_multicast.ip(),
            )),
            config::Role::Client => None,
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(config.command_queue_depth);
        let endpoints = endpoint::EndpointManager::new(
            unicast_addr,
            multicast,
            inbound_tx,
            config.magic_cookies_enabled,
            config.tcp_send_timeout,
            config.client_port_range,
        )
        .await?;

        #[cfg(unix)]
        let routing_root_for_listener = matches!(config.role, config::Role::Host).then(|| config.routing_root_path.clone()).flatten();

        let (command_tx, command_rx) = mpsc::channel(config.command_queue_depth);
        let host = routing::RoutingManagerHost::new(config, endpoints.clone());
        tokio::spawn(host.run(command_rx, inbound_rx));

        #[cfg(unix)]
        if let Some(path) = routing_root_for_listener {
            tokio::spawn(routing::ipc::run_host_listener(path, command_tx.clone()));
        }

        let client = RoutingManagerClient::new(command_tx);
        Ok((Self { endpoints: Some(endpoints) }, client))
    }

    /// The local address SOME/IP and SOME/IP-SD unicast traffic binds to,
    /// or `None` for a client role that only talks to a routing root over
    /// local IPC and owns no sockets of its own.
    pub fn local_unicast_addr(&self) -> Option<SocketAddr> {
        self.endpoints.as_ref().map(|e| e.local_unicast_addr())
    }
}
