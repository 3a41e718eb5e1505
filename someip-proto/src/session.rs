//! Session counters and reboot detection: SD session ids increment
//! per direction and wrap to 1 (never 0); an unexpected drop in a peer's
//! counter, or a `reboot flag` toggle, means that peer rebooted and every
//! subscription/offer learned from it must be expired.

use std::net::IpAddr;

use rustc_hash::FxHashMap;

use crate::primitive::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionDirection {
    Unicast,
    Multicast,
}

/// Outgoing or incoming session-id sequence for one direction. SOME/IP-SD
/// session ids start at 1 and wrap from `0xFFFF` back to `1` (`0` is never
/// used on the wire).
#[derive(Debug, Clone, Copy)]
pub struct SessionState {
    next: u16,
    pub reboot_flag: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            next: 1,
            reboot_flag: true,
        }
    }
}

impl SessionState {
    /// Returns the session id to stamp on the next outgoing message and
    /// advances the counter.
    pub fn next_outgoing(&mut self) -> (SessionId, bool) {
        let id = SessionId(self.next);
        let flag = self.reboot_flag;
        self.next = if self.next == 0xFFFF { 1 } else { self.next + 1 };
        self.reboot_flag = false;
        (id, flag)
    }
}

/// Per-peer observed session state, keyed by `(address, direction)`, used
/// to detect reboots on the receive side.
#[derive(Debug, Default)]
pub struct RebootTracker {
    observed: FxHashMap<(IpAddr, SessionDirection), (SessionId, bool)>,
}

impl RebootTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an incoming `(session, reboot_flag)` observation from `peer`
    /// and report whether it indicates the peer rebooted.
    ///
    /// A reboot is detected when the reboot flag transitions from unset to
    /// set, or the flag is set while the session id did not reset to 1 (a
    /// peer that never reset but keeps the flag pinned is not considered a
    /// fresh reboot after the first observation).
    pub fn observe(
        &mut self,
        peer: IpAddr,
        direction: SessionDirection,
        session: SessionId,
        reboot_flag: bool,
    ) -> bool {
        let key = (peer, direction);
        match self.observed.get(&key) {
            None => {
                self.observed.insert(key, (session, reboot_flag));
                false
            }
            Some(&(prev_session, prev_flag)) => {
                let rebooted = reboot_flag && (!prev_flag || session.get() < prev_session.get());
                self.observed.insert(key, (session, reboot_flag));
                rebooted
            }
        }
    }

    pub fn forget(&mut self, peer: IpAddr) {
        self.observed.retain(|(addr, _), _| *addr != peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_session_wraps_from_0xffff_to_1_never_0() {
        let mut state = SessionState::default();
        state.next = 0xFFFF;
        let (id, _) = state.next_outgoing();
        assert_eq!(id, SessionId(0xFFFF));
        let (id2, _) = state.next_outgoing();
        assert_eq!(id2, SessionId(1));
    }

    #[test]
    fn first_reboot_flag_set_is_not_itself_a_reboot() {
        let mut tracker = RebootTracker::new();
        let peer: IpAddr = "198.51.100.9".parse().unwrap();
        assert!(!tracker.observe(peer, SessionDirection::Unicast, SessionId(1), true));
    }

    #[test]
    fn reboot_flag_toggling_on_signals_reboot() {
        let mut tracker = RebootTracker::new();
        let peer: IpAddr = "198.51.100.9".parse().unwrap();
        assert!(!tracker.observe(peer, SessionDirection::Unicast, SessionId(1), false));
        assert!(tracker.observe(peer, SessionDirection::Unicast, SessionId(2), true));
    }

    #[test]
    fn session_id_regression_with_flag_set_signals_reboot() {
        let mut tracker = RebootTracker::new();
        let peer: IpAddr = "198.51.100.9".parse().unwrap();
        assert!(!tracker.observe(peer, SessionDirection::Unicast, SessionId(500), true));
        assert!(tracker.observe(peer, SessionDirection::Unicast, SessionId(1), true));
    }
}
