//! systemd socket activation: adopt file descriptors handed down via
//! `LISTEN_FDS`/`LISTEN_PID` rather than binding fresh sockets, without
//! depending on an external `systemd`/`sd-notify` crate.

#![cfg(all(unix, feature = "socket-activation"))]

use std::env;
use std::net::UdpSocket;
use std::os::unix::io::{FromRawFd, RawFd};

/// First inherited descriptor, per the `sd_listen_fds` convention.
const SD_LISTEN_FDS_START: RawFd = 3;

/// Returns the descriptors systemd passed down for this process, if any,
/// consuming the environment variables so a second call (or a child
/// process) doesn't also try to adopt them.
pub fn listen_fds() -> Vec<RawFd> {
    let pid_matches = env::var("LISTEN_PID")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .map(|pid| pid == std::process::id())
        .unwrap_or(false);

    let count = env::var("LISTEN_FDS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);

    env::remove_var("LISTEN_PID");
    env::remove_var("LISTEN_FDS");
    env::remove_var("LISTEN_FDNAMES");

    if !pid_matches || count == 0 {
        return Vec::new();
    }
    (0..count)
        .map(|i| SD_LISTEN_FDS_START + i as RawFd)
        .collect()
}

/// Adopt the `n`th inherited descriptor as a UDP socket. `fd` must be a
/// valid, open descriptor obtained from [`listen_fds`]; ownership transfers
/// to the returned socket.
///
/// # Safety
/// `fd` must refer to a live, otherwise-unused socket descriptor (true for
/// anything returned by [`listen_fds`], which systemd guarantees is only
/// handed to this process once).
pub unsafe fn adopt_udp_socket(fd: RawFd) -> UdpSocket {
    UdpSocket::from_raw_fd(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_pid_yields_no_fds() {
        std::env::set_var("LISTEN_PID", "1");
        std::env::set_var("LISTEN_FDS", "1");
        assert!(listen_fds().is_empty());
    }
}
