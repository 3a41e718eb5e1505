//! Thin wrapper tying [`someip_proto::RebootTracker`] observations to the
//! registries that need flushing when a peer reboots: every
//! subscription learned from that address is no longer trustworthy and
//! must be expired so it isn't double-counted once the peer resubscribes.

use std::net::IpAddr;

use someip_proto::{EndpointHandle, SessionDirection, SessionId};

use crate::registry::EventgroupRegistry;

#[derive(Debug, Default)]
pub struct RebootGuard {
    tracker: someip_proto::RebootTracker,
}

impl RebootGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an incoming SD message's reboot flag and session id. If it
    /// indicates `peer` rebooted, expire every remote subscription whose
    /// subscriber endpoint `resolve` reports as belonging to `peer`.
    pub fn observe_and_flush(
        &mut self,
        peer: IpAddr,
        direction: SessionDirection,
        session: SessionId,
        reboot_flag: bool,
        eventgroups: &mut EventgroupRegistry,
        resolve: impl Fn(EndpointHandle) -> Option<IpAddr> + Copy,
    ) -> bool {
        let rebooted = self.tracker.observe(peer, direction, session, reboot_flag);
        if rebooted {
            for (_, eg) in eventgroups.iter_mut() {
                eg.expire_subscriptions_from(|subscriber| {
                    resolve(subscriber).filter(|addr| *addr == peer)
                });
            }
        }
        rebooted
    }

    pub fn forget(&mut self, peer: IpAddr) {
        self.tracker.forget(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_is_never_a_reboot() {
        let mut guard = RebootGuard::new();
        let mut eventgroups = EventgroupRegistry::new();
        let rebooted = guard.observe_and_flush(
            "198.51.100.5".parse().unwrap(),
            SessionDirection::Unicast,
            SessionId(1),
            true,
            &mut eventgroups,
            |_| None,
        );
        assert!(!rebooted);
    }
}
