//! Applies an incoming subscribe/stop-subscribe eventgroup entry to an
//! [`EventgroupInfo`]: merges with a matching in-flight
//! subscription from the same endpoint rather than creating a duplicate,
//! enforces the per-address subscriber limit, and expires a denied
//! client's previously-accepted subscriptions.

use std::net::IpAddr;
use std::time::Instant;

use someip_proto::{ClientId, EndpointHandle, EventgroupInfo, RemoteSubscription, Ttl, PENDING_SUBSCRIPTION_ID};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Ack {
        ttl: Ttl,
        /// Echoes the selective-event option's client list, if the
        /// subscribe carried one, so the caller can attach the same
        /// option to the outgoing ack.
        selected_clients: Option<Vec<ClientId>>,
    },
    Nack,
    /// A stop-subscribe was applied; the peer gets an ack with `ttl = 0`.
    Stopped,
}

/// Apply one subscribe (`ttl > 0`) or stop-subscribe (`ttl == 0`) entry.
///
/// `allowed` is the access-control decision for this client/eventgroup,
/// evaluated by the caller (which has the client id the subscribe's
/// embedded options resolve to, if any); a denied subscribe expires any
/// subscription this endpoint already held, since a revoked grant must not
/// leave a standing subscription behind.
///
/// `requested_clients` is the selective-event option's client list, if the
/// entry carried one. A fresh or merged subscribe records it both on the
/// eventgroup (the currently-selected set `notify` consults) and on the
/// [`RemoteSubscription`] itself (so a later `notify` can tell which
/// clients behind this subscriber endpoint are actually selected).
pub fn handle_subscribe(
    eg: &mut EventgroupInfo,
    subscriber: EndpointHandle,
    address: IpAddr,
    ttl: Ttl,
    allowed: bool,
    requested_clients: Option<&[ClientId]>,
    now: Instant,
) -> SubscribeOutcome {
    if !allowed {
        if let Some(id) = eg.find_by_subscriber(subscriber) {
            eg.remove_remote_subscription(id, address);
        }
        return SubscribeOutcome::Nack;
    }

    if ttl.is_stop() {
        if let Some(id) = eg.find_by_subscriber(subscriber) {
            eg.remove_remote_subscription(id, address);
        }
        return SubscribeOutcome::Stopped;
    }

    if let Some(id) = eg.find_by_subscriber(subscriber) {
        // A subscribe for an eventgroup we already track from this exact
        // endpoint: treat as a refresh/merge rather than a second
        // subscription, bumping the owed-acks counter instead of creating
        // a sibling.
        if let Some(sub) = eg.subscription_mut(id) {
            sub.ttl = ttl;
            sub.answers += 1;
            sub.is_initial = false;
            if let Some(clients) = requested_clients {
                sub.reset(clients.iter().copied());
            }
        }
        if let Some(clients) = requested_clients {
            eg.set_selected_clients(Some(clients.to_vec()));
        }
        return SubscribeOutcome::Ack {
            ttl,
            selected_clients: requested_clients.map(|c| c.to_vec()),
        };
    }

    if eg.is_remote_subscription_limit_reached(address) {
        return SubscribeOutcome::Nack;
    }

    let mut subscription = RemoteSubscription::new(PENDING_SUBSCRIPTION_ID, subscriber, ttl);
    if let Some(clients) = requested_clients {
        subscription.reset(clients.iter().copied());
    }
    eg.add_remote_subscription(subscription, address);
    if let Some(clients) = requested_clients {
        eg.set_selected_clients(Some(clients.to_vec()));
    }
    let _ = now;
    SubscribeOutcome::Ack {
        ttl,
        selected_clients: requested_clients.map(|c| c.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use someip_proto::{Arena, EndpointDefinition, EndpointDefinitionKey, EventgroupId, InstanceId, MajorVersion, ServiceId};

    fn handle() -> EndpointHandle {
        let mut arena: Arena<EndpointDefinition> = Arena::new();
        arena.insert(EndpointDefinition {
            key: EndpointDefinitionKey {
                address: "198.51.100.7".parse().unwrap(),
                port: 30501,
                reliable: false,
                service: ServiceId(1),
                instance: InstanceId(1),
                partition_id: 0,
            },
            remote_port: 30501,
        })
    }

    fn eg() -> EventgroupInfo {
        EventgroupInfo::new(ServiceId(1), InstanceId(1), EventgroupId(1), MajorVersion(1), Ttl(3), 0)
    }

    #[test]
    fn fresh_subscribe_is_acked_and_tracked() {
        let mut eg = eg();
        let sub = handle();
        let addr: IpAddr = "198.51.100.7".parse().unwrap();
        let outcome = handle_subscribe(&mut eg, sub, addr, Ttl(3), true, None, Instant::now());
        assert_eq!(
            outcome,
            SubscribeOutcome::Ack {
                ttl: Ttl(3),
                selected_clients: None
            }
        );
        assert_eq!(eg.remote_subscriber_count(addr), 1);
    }

    #[test]
    fn repeated_subscribe_from_same_endpoint_merges_instead_of_duplicating() {
        let mut eg = eg();
        let sub = handle();
        let addr: IpAddr = "198.51.100.7".parse().unwrap();
        handle_subscribe(&mut eg, sub, addr, Ttl(3), true, None, Instant::now());
        handle_subscribe(&mut eg, sub, addr, Ttl(5), true, None, Instant::now());
        assert_eq!(eg.remote_subscriber_count(addr), 1, "merged, not duplicated");
        let id = eg.find_by_subscriber(sub).unwrap();
        assert_eq!(eg.subscription(id).unwrap().answers, 2);
    }

    #[test]
    fn denied_client_is_nacked_and_existing_subscription_revoked() {
        let mut eg = eg();
        let sub = handle();
        let addr: IpAddr = "198.51.100.7".parse().unwrap();
        handle_subscribe(&mut eg, sub, addr, Ttl(3), true, None, Instant::now());
        let outcome = handle_subscribe(&mut eg, sub, addr, Ttl(3), false, None, Instant::now());
        assert_eq!(outcome, SubscribeOutcome::Nack);
        assert_eq!(eg.remote_subscriber_count(addr), 0);
    }

    #[test]
    fn stop_subscribe_removes_tracked_subscription() {
        let mut eg = eg();
        let sub = handle();
        let addr: IpAddr = "198.51.100.7".parse().unwrap();
        handle_subscribe(&mut eg, sub, addr, Ttl(3), true, None, Instant::now());
        let outcome = handle_subscribe(&mut eg, sub, addr, Ttl::STOP, true, None, Instant::now());
        assert_eq!(outcome, SubscribeOutcome::Stopped);
        assert_eq!(eg.remote_subscriber_count(addr), 0);
    }

    #[test]
    fn limit_reached_nacks_a_genuinely_new_subscriber() {
        let mut eg = EventgroupInfo::new(ServiceId(1), InstanceId(1), EventgroupId(1), MajorVersion(1), Ttl(3), 1);
        let addr: IpAddr = "198.51.100.7".parse().unwrap();

        let mut arena: Arena<EndpointDefinition> = Arena::new();
        let sub1 = arena.insert(EndpointDefinition {
            key: EndpointDefinitionKey {
                address: addr,
                port: 30501,
                reliable: false,
                service: ServiceId(1),
                instance: InstanceId(1),
                partition_id: 0,
            },
            remote_port: 30501,
        });
        let sub2 = arena.insert(EndpointDefinition {
            key: EndpointDefinitionKey {
                address: addr,
                port: 30502,
                reliable: false,
                service: ServiceId(1),
                instance: InstanceId(1),
                partition_id: 0,
            },
            remote_port: 30502,
        });

        handle_subscribe(&mut eg, sub1, addr, Ttl(3), true, None, Instant::now());
        let outcome = handle_subscribe(&mut eg, sub2, addr, Ttl(3), true, None, Instant::now());
        assert_eq!(outcome, SubscribeOutcome::Nack);
    }

    #[test]
    fn selective_subscribe_echoes_client_list_and_updates_selection() {
        let mut eg = eg();
        let sub = handle();
        let addr: IpAddr = "198.51.100.7".parse().unwrap();
        let selection = [ClientId(0x0001), ClientId(0x0002)];
        let outcome = handle_subscribe(&mut eg, sub, addr, Ttl(3), true, Some(&selection), Instant::now());
        assert_eq!(
            outcome,
            SubscribeOutcome::Ack {
                ttl: Ttl(3),
                selected_clients: Some(selection.to_vec())
            }
        );
        assert!(eg.is_client_selected(ClientId(0x0001)));
        assert!(!eg.is_client_selected(ClientId(0x00ff)));
    }
}
