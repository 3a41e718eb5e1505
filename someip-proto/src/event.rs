//! Per-event bookkeeping: cached payload, reliability, and the change
//! filters that decide whether a new value is actually worth sending.

use std::time::{Duration, Instant};

use crate::primitive::{EventId, Reliability};
use crate::EventgroupHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Plain field/event: every update is sent (subject to debounce).
    Event,
    /// Selective event: only the eventgroup's currently-selected
    /// subscribers receive updates.
    Selective,
}

/// Decides whether a new value is significant enough to send, and at what
/// minimum spacing (cyclic update, debounce, epsilon-change).
#[derive(Debug, Clone)]
pub struct DebounceFilter {
    /// Floor under the cyclic resend triggered by `max_interval`: a resend
    /// of an unchanged value additionally waits for this much time to have
    /// passed. Never suppresses a genuine, mask-filtered change.
    pub min_interval: Option<Duration>,
    /// If set, an update older than this interval is sent even if the
    /// value did not change ("cyclic update" keepalive).
    pub max_interval: Option<Duration>,
    /// Per-byte change mask: bit set to 1 in `ignore_mask[i]` excludes that
    /// bit of payload byte `i` from the change comparison. `0xFF` excludes
    /// the whole byte. Bytes beyond the mask's length are never excluded.
    pub ignore_mask: Vec<u8>,
    last_sent: Option<Instant>,
    last_value: Option<Vec<u8>>,
}

impl DebounceFilter {
    pub fn new(min_interval: Option<Duration>, max_interval: Option<Duration>) -> Self {
        Self {
            min_interval,
            max_interval,
            ignore_mask: Vec::new(),
            last_sent: None,
            last_value: None,
        }
    }

    pub fn passthrough() -> Self {
        Self::new(None, None)
    }

    pub fn with_ignore_mask(mut self, ignore_mask: Vec<u8>) -> Self {
        self.ignore_mask = ignore_mask;
        self
    }

    fn mask_byte(&self, index: usize) -> u8 {
        self.ignore_mask.get(index).copied().unwrap_or(0)
    }

    /// Mask-aware comparison against the last sent value: a byte masked
    /// `0xFF` never contributes to a change, a partially-masked byte only
    /// compares its unmasked bits, and bytes appended/removed past the
    /// shorter of the two buffers count as a change unless fully masked.
    fn changed(&self, payload: &[u8]) -> bool {
        let Some(last) = self.last_value.as_deref() else {
            return true;
        };
        let min_len = last.len().min(payload.len());
        let max_len = last.len().max(payload.len());
        for i in min_len..max_len {
            if self.mask_byte(i) != 0xFF {
                return true;
            }
        }
        for i in 0..min_len {
            let mask = self.mask_byte(i);
            if mask == 0xFF {
                continue;
            }
            if (last[i] & !mask) != (payload[i] & !mask) {
                return true;
            }
        }
        false
    }

    /// Evaluate a candidate payload at `now`. Mutates internal state only
    /// when the caller goes on to actually send (call [`Self::record_sent`]
    /// after honoring a `Send` outcome).
    ///
    /// A mask-filtered change always sends, regardless of `min_interval`:
    /// rate-limiting only ever throttles the cyclic resend of an unchanged
    /// value, never a genuine update.
    pub fn evaluate(&self, payload: &[u8], now: Instant) -> UpdateOutcome {
        if self.changed(payload) {
            return UpdateOutcome::Send;
        }
        if let Some(max) = self.max_interval {
            let due = match self.last_sent {
                None => true,
                Some(last) => {
                    let elapsed = now.duration_since(last);
                    elapsed >= max && self.min_interval.map_or(true, |min| elapsed >= min)
                }
            };
            if due {
                return UpdateOutcome::Send;
            }
        }
        UpdateOutcome::Suppressed
    }

    pub fn record_sent(&mut self, payload: &[u8], now: Instant) {
        self.last_sent = Some(now);
        self.last_value = Some(payload.to_vec());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Send,
    Suppressed,
}

/// An event as tracked by the registry. The cached payload is what a
/// newly-acked subscriber receives as its initial event, per the
/// `force_initial_events` path.
#[derive(Debug)]
pub struct Event {
    pub id: EventId,
    pub reliability: Reliability,
    pub kind: EventKind,
    pub eventgroups: Vec<EventgroupHandle>,
    pub filter: DebounceFilter,
    cached_payload: Option<Vec<u8>>,
}

impl Event {
    pub fn new(id: EventId, reliability: Reliability, kind: EventKind) -> Self {
        Self {
            id,
            reliability,
            kind,
            eventgroups: Vec::new(),
            filter: DebounceFilter::passthrough(),
            cached_payload: None,
        }
    }

    pub fn cached_payload(&self) -> Option<&[u8]> {
        self.cached_payload.as_deref()
    }

    pub fn set_cached_payload(&mut self, payload: &[u8]) {
        self.cached_payload = Some(payload.to_vec());
    }

    pub fn add_eventgroup(&mut self, eventgroup: EventgroupHandle) {
        if !self.eventgroups.contains(&eventgroup) {
            self.eventgroups.push(eventgroup);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_suppresses_unchanged_value_but_never_a_genuine_change() {
        let mut filter = DebounceFilter::new(Some(Duration::from_millis(100)), None);
        let t0 = Instant::now();
        assert_eq!(filter.evaluate(b"a", t0), UpdateOutcome::Send);
        filter.record_sent(b"a", t0);
        assert_eq!(
            filter.evaluate(b"a", t0 + Duration::from_millis(10)),
            UpdateOutcome::Suppressed
        );
        assert_eq!(
            filter.evaluate(b"b", t0 + Duration::from_millis(10)),
            UpdateOutcome::Send,
            "a genuine change is never held back by min_interval"
        );
    }

    #[test]
    fn ignore_mask_excludes_masked_bits_from_change_detection() {
        let mut filter = DebounceFilter::passthrough().with_ignore_mask(vec![0x00, 0xFF, 0x0F]);
        let t0 = Instant::now();
        assert_eq!(filter.evaluate(&[0x01, 0x02, 0x30], t0), UpdateOutcome::Send);
        filter.record_sent(&[0x01, 0x02, 0x30], t0);
        // byte 1 fully masked, byte 2's high nibble masked: no real change.
        assert_eq!(
            filter.evaluate(&[0x01, 0xFF, 0x35], t0),
            UpdateOutcome::Suppressed,
            "only masked bits differ"
        );
        // byte 0 differs and is not masked at all.
        assert_eq!(filter.evaluate(&[0x02, 0xFF, 0x35], t0), UpdateOutcome::Send);
        // byte 2's low nibble differs and is not masked.
        assert_eq!(filter.evaluate(&[0x01, 0xFF, 0x31], t0), UpdateOutcome::Send);
    }

    #[test]
    fn cyclic_max_interval_forces_resend_of_unchanged_value() {
        let mut filter = DebounceFilter::new(None, Some(Duration::from_millis(50)));
        let t0 = Instant::now();
        filter.record_sent(b"a", t0);
        assert_eq!(
            filter.evaluate(b"a", t0 + Duration::from_millis(60)),
            UpdateOutcome::Send
        );
    }

    #[test]
    fn min_interval_floors_the_cyclic_resend_but_not_a_real_change() {
        let mut filter = DebounceFilter::new(Some(Duration::from_millis(80)), Some(Duration::from_millis(50)));
        let t0 = Instant::now();
        filter.record_sent(b"a", t0);
        assert_eq!(
            filter.evaluate(b"a", t0 + Duration::from_millis(60)),
            UpdateOutcome::Suppressed,
            "max_interval elapsed but min_interval floor has not"
        );
        assert_eq!(
            filter.evaluate(b"a", t0 + Duration::from_millis(90)),
            UpdateOutcome::Send
        );
    }

    #[test]
    fn epsilon_change_sends_on_any_value_change_without_interval_config() {
        let mut filter = DebounceFilter::passthrough();
        let t0 = Instant::now();
        assert_eq!(filter.evaluate(b"a", t0), UpdateOutcome::Send);
        filter.record_sent(b"a", t0);
        assert_eq!(filter.evaluate(b"a", t0), UpdateOutcome::Suppressed);
        assert_eq!(filter.evaluate(b"b", t0), UpdateOutcome::Send);
    }
}
