//! User-facing configuration. Plain data, validated once at
//! [`Config::build`] time rather than scattered through the routing manager
//! (grounded on the simple validated-struct style of `mdns`'s `Config`).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use someip_proto::SdTimers;

use crate::error::Error;

/// Which local role this process plays for SOME/IP-SD: a host
/// owns the unicast/multicast SD endpoints and answers finds; a client-only
/// process still sends finds/subscribes but never offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    /// Local unicast address SOME/IP and SOME/IP-SD unicast traffic binds
    /// to.
    pub unicast_address: IpAddr,
    /// SD multicast group and port (default `224.244.224.245:30490`).
    pub sd_multicast: SocketAddr,
    /// Port SD unicast traffic is sent from/received on.
    pub sd_unicast_port: u16,
    pub sd_timers: SdTimers,
    /// Maximum remote subscribers per `(service, instance, eventgroup)`
    /// before additional subscriptions are nacked; `0` disables the limit.
    pub max_remote_subscribers: u8,
    /// Enable the TCP magic-cookie resync handshake.
    pub magic_cookies_enabled: bool,
    /// How long a routing-manager command channel will buffer before a
    /// sender blocks.
    pub command_queue_depth: usize,
    /// Adopt sockets handed down via systemd socket activation instead of
    /// binding fresh ones. Only meaningful with the `socket-activation`
    /// feature.
    pub use_socket_activation: bool,
    pub tcp_connect_timeout: Duration,
    /// Ceiling on how long a single queued TCP send may sit unsent before
    /// its connection is torn down. A warning is logged once half this
    /// interval has passed.
    pub tcp_send_timeout: Duration,
    /// Local ports the unicast UDP/TCP endpoints may bind to when the
    /// configured port is taken; `None` means bind only the configured
    /// port and fail if it's unavailable.
    pub client_port_range: Option<(u16, u16)>,
    /// Distinguishes endpoints that otherwise share `(address, port,
    /// reliable)` but belong to independent SD partitions (multiple
    /// logical SOME/IP networks sharing one host). `0` when unused.
    pub partition_id: u16,
    /// Path to the routing manager's local IPC socket (unix domain,
    /// `SOCK_STREAM`). A host role binds a listener here so separate
    /// processes can attach as routing-manager clients; a client role
    /// dials it instead of running its own in-process routing manager.
    /// `None` keeps the single-process fast path: a client role falls back
    /// to its own in-process routing manager, as if it were colocated with
    /// a host in the same process.
    pub routing_root_path: Option<PathBuf>,
    /// How long a client role waits for `ASSIGN_CLIENT_ACK` after dialing
    /// the routing root before giving up and retrying.
    pub assign_client_timeout: Duration,
    /// How long a client role waits for `REGISTERED_ACK` after
    /// `REGISTER_APPLICATION` before giving up and retrying.
    pub register_application_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Host,
            unicast_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            sd_multicast: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(224, 244, 224, 245)), 30490),
            sd_unicast_port: 30490,
            sd_timers: SdTimers::default(),
            max_remote_subscribers: 0,
            magic_cookies_enabled: true,
            command_queue_depth: 256,
            use_socket_activation: false,
            tcp_connect_timeout: Duration::from_secs(5),
            tcp_send_timeout: Duration::from_millis(2000),
            client_port_range: None,
            partition_id: 0,
            routing_root_path: None,
            assign_client_timeout: Duration::from_secs(10),
            register_application_timeout: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Validate cross-field invariants and hand back a ready-to-use config.
    /// Construction alone never fails; only `build` does, so callers can use
    /// struct-update syntax freely before checking it once.
    pub fn build(self) -> Result<Self, Error> {
        self.sd_timers.validate()?;
        if !self.sd_multicast.ip().is_multicast() {
            return Err(Error::InvalidConfig(format!(
                "{} is not a multicast address",
                self.sd_multicast.ip()
            )));
        }
        #[cfg(not(unix))]
        if self.routing_root_path.is_some() {
            return Err(Error::InvalidConfig(
                "routing_root_path requires a unix domain socket, which this target doesn't have".to_string(),
            ));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        assert!(Config::default().build().is_ok());
    }

    #[test]
    fn rejects_non_multicast_sd_group() {
        let cfg = Config {
            sd_multicast: "192.0.2.1:30490".parse().unwrap(),
            ..Config::default()
        };
        assert!(cfg.build().is_err());
    }
}
