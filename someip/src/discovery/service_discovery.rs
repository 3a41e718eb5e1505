//! Builds outgoing SD messages and drives the offer/find repetition-phase
//! machine. Pure functions over `someip-proto` types; the owning
//! task (`routing::host::RoutingManagerHost`) supplies the current time and
//! sends the resulting bytes.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use someip_proto::sd::{
    Entry, EventgroupEntry, EventgroupEntryType, LayerFourProtocol, Option_, OptionRefs,
    SdFlags, SdMessage, ServiceEntry, ServiceEntryType,
};
use someip_proto::{ClientId, EventgroupId, InstanceId, MajorVersion, MinorVersion, Phase, ServiceId, Ttl};

/// One offered service's repetition-phase state, tracked independently so
/// a service offered after startup doesn't inherit another service's
/// phase.
#[derive(Debug)]
struct Tracked {
    service: ServiceId,
    instance: InstanceId,
    phase: Phase,
    due_at: Instant,
}

#[derive(Debug, Default)]
pub struct PhaseTable {
    offers: Vec<Tracked>,
}

impl PhaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, service: ServiceId, instance: InstanceId, now: Instant) {
        if self.offers.iter().any(|t| t.service == service && t.instance == instance) {
            return;
        }
        self.offers.push(Tracked {
            service,
            instance,
            phase: Phase::InitialWait,
            due_at: now,
        });
    }

    pub fn untrack(&mut self, service: ServiceId, instance: InstanceId) {
        self.offers.retain(|t| !(t.service == service && t.instance == instance));
    }

    /// Every offer due by `now`, advancing its phase and rescheduling it.
    pub fn due(
        &mut self,
        now: Instant,
        max_repetitions: u32,
        base_delay: Duration,
        cyclic_delay: Duration,
    ) -> Vec<(ServiceId, InstanceId)> {
        let mut fired = Vec::new();
        for t in &mut self.offers {
            if t.due_at > now {
                continue;
            }
            fired.push((t.service, t.instance));
            let (next_phase, delay) = t.phase.advance(max_repetitions, base_delay);
            t.phase = next_phase;
            let delay = if next_phase.is_main() { cyclic_delay } else { delay };
            t.due_at = now + delay;
        }
        fired
    }
}

/// Build a service entry plus its endpoint option(s) for an `OfferService`
/// (or, with `ttl = Ttl::STOP`, a `StopOfferService`).
pub fn build_offer(
    service: ServiceId,
    instance: InstanceId,
    major: MajorVersion,
    minor: MinorVersion,
    ttl: Ttl,
    endpoint: SocketAddr,
    reliable: bool,
) -> SdMessage {
    let mut msg = SdMessage::new(SdFlags {
        reboot: false,
        unicast: true,
        explicit_initial_data_control: false,
    });
    msg.options.push(match endpoint {
        SocketAddr::V4(a) => Option_::Ip4Endpoint {
            address: *a.ip(),
            proto: LayerFourProtocol::from_reliability(if reliable {
                someip_proto::Reliability::Reliable
            } else {
                someip_proto::Reliability::Unreliable
            }),
            port: a.port(),
        },
        SocketAddr::V6(a) => Option_::Ip6Endpoint {
            address: *a.ip(),
            proto: LayerFourProtocol::from_reliability(if reliable {
                someip_proto::Reliability::Reliable
            } else {
                someip_proto::Reliability::Unreliable
            }),
            port: a.port(),
        },
    });
    msg.entries.push(Entry::Service(ServiceEntry {
        kind: ServiceEntryType::Offer,
        options: OptionRefs {
            index1: 0,
            count1: 1,
            index2: 0,
            count2: 0,
        },
        service,
        instance,
        major,
        ttl,
        minor,
    }));
    msg
}

/// Build a find-service entry (no options).
pub fn build_find(service: ServiceId, instance: InstanceId, major: MajorVersion, minor: MinorVersion) -> SdMessage {
    let mut msg = SdMessage::new(SdFlags::default());
    msg.entries.push(Entry::Service(ServiceEntry {
        kind: ServiceEntryType::Find,
        options: OptionRefs::default(),
        service,
        instance,
        major,
        ttl: Ttl(0xFFFF_FF),
        minor,
    }));
    msg
}

/// Build a subscribe-eventgroup entry plus its endpoint option.
pub fn build_subscribe(
    service: ServiceId,
    instance: InstanceId,
    eventgroup: EventgroupId,
    major: MajorVersion,
    ttl: Ttl,
    endpoint: SocketAddr,
    reliable: bool,
    counter: u8,
) -> SdMessage {
    let mut msg = SdMessage::new(SdFlags {
        reboot: false,
        unicast: true,
        explicit_initial_data_control: false,
    });
    msg.options.push(match endpoint {
        SocketAddr::V4(a) => Option_::Ip4Endpoint {
            address: *a.ip(),
            proto: LayerFourProtocol::from_reliability(if reliable {
                someip_proto::Reliability::Reliable
            } else {
                someip_proto::Reliability::Unreliable
            }),
            port: a.port(),
        },
        SocketAddr::V6(a) => Option_::Ip6Endpoint {
            address: *a.ip(),
            proto: LayerFourProtocol::from_reliability(if reliable {
                someip_proto::Reliability::Reliable
            } else {
                someip_proto::Reliability::Unreliable
            }),
            port: a.port(),
        },
    });
    msg.entries.push(Entry::Eventgroup(EventgroupEntry {
        kind: EventgroupEntryType::Subscribe,
        options: OptionRefs {
            index1: 0,
            count1: 1,
            index2: 0,
            count2: 0,
        },
        service,
        instance,
        major,
        ttl,
        counter,
        eventgroup,
    }));
    msg
}

/// Build a subscribe-ack (or, with `ttl = Ttl::STOP`, a nack) entry.
/// `selected_clients`, when the originating subscribe carried a
/// selective-event option, is echoed back as the same option so the
/// subscriber learns which of its clients were actually accepted.
pub fn build_subscribe_ack(
    service: ServiceId,
    instance: InstanceId,
    eventgroup: EventgroupId,
    major: MajorVersion,
    ttl: Ttl,
    counter: u8,
    selected_clients: Option<&[ClientId]>,
) -> SdMessage {
    let mut msg = SdMessage::new(SdFlags::default());
    let options = match selected_clients {
        Some(clients) => {
            msg.options.push(Option_::Selective(clients.to_vec()));
            OptionRefs {
                index1: 0,
                count1: 1,
                index2: 0,
                count2: 0,
            }
        }
        None => OptionRefs::default(),
    };
    msg.entries.push(Entry::Eventgroup(EventgroupEntry {
        kind: EventgroupEntryType::SubscribeAck,
        options,
        service,
        instance,
        major,
        ttl,
        counter,
        eventgroup,
    }));
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_table_fires_initial_wait_immediately_then_reschedules() {
        let mut table = PhaseTable::new();
        let now = Instant::now();
        table.track(ServiceId(1), InstanceId(1), now);
        let fired = table.due(now, 2, Duration::from_millis(10), Duration::from_secs(1));
        assert_eq!(fired, vec![(ServiceId(1), InstanceId(1))]);
        // not due again immediately
        assert!(table.due(now, 2, Duration::from_millis(10), Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn untrack_stops_further_firing() {
        let mut table = PhaseTable::new();
        let now = Instant::now();
        table.track(ServiceId(1), InstanceId(1), now);
        table.untrack(ServiceId(1), InstanceId(1));
        assert!(table.due(now, 2, Duration::from_millis(10), Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn build_offer_carries_one_endpoint_option() {
        let msg = build_offer(
            ServiceId(1),
            InstanceId(1),
            MajorVersion(1),
            MinorVersion(0),
            Ttl(3),
            "192.0.2.1:30501".parse().unwrap(),
            true,
        );
        assert_eq!(msg.options.len(), 1);
        assert_eq!(msg.entries.len(), 1);
    }
}
