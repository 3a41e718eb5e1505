//! Per-`(service, instance, eventgroup)` bookkeeping: configuration,
//! subscriber endpoints, and remote subscriptions.

use std::net::IpAddr;
use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::primitive::{ClientId, EventgroupId, InstanceId, MajorVersion, ServiceId, Ttl};
use crate::{EndpointHandle, EventHandle};

/// Reserved id meaning "no id assigned yet" (vsomeip's
/// `PENDING_SUBSCRIPTION_ID`). Real ids are assigned starting at 1.
pub const PENDING_SUBSCRIPTION_ID: RemoteSubscriptionId = RemoteSubscriptionId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteSubscriptionId(pub u16);

/// An eventgroup's configured (or auto-detected) reliability. `Auto` is
/// fixed to a concrete mode the first time an event with known reliability
/// is added, or an offer for the service is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityMode {
    Auto,
    Reliable,
    Unreliable,
    Both,
}

impl ReliabilityMode {
    pub fn is_resolved(self) -> bool {
        !matches!(self, ReliabilityMode::Auto)
    }

    pub fn accepts_reliable(self) -> bool {
        matches!(self, ReliabilityMode::Reliable | ReliabilityMode::Both)
    }

    pub fn accepts_unreliable(self) -> bool {
        matches!(self, ReliabilityMode::Unreliable | ReliabilityMode::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSubscriptionState {
    Pending,
    Acked,
    Nacked,
    Unknown,
}

/// `(eventgroupinfo_ref, subscriber_endpoint, reliable?, unreliable?, ttl,
/// clients[])`. Overlapping incoming subscriptions for the same
/// `(eventgroupinfo, endpoint pair)` become children of an existing
/// "parent" subscription; a child's ack increments the parent's `answers`
/// counter instead of emitting a second SD ack (grounded on
/// `remote_subscription.{hpp,cpp}`).
#[derive(Debug)]
pub struct RemoteSubscription {
    pub id: RemoteSubscriptionId,
    pub subscriber: EndpointHandle,
    pub reliable: Option<EndpointHandle>,
    pub unreliable: Option<EndpointHandle>,
    pub ttl: Ttl,
    pub is_initial: bool,
    pub force_initial_events: bool,
    pub parent: Option<RemoteSubscriptionId>,
    /// Number of SD acknowledgements still owed for this subscription.
    /// Usually 1; larger if a matching subscription arrived before the
    /// prior one could be acknowledged.
    pub answers: u32,
    clients: FxHashMap<ClientId, (ClientSubscriptionState, Option<Instant>)>,
}

impl RemoteSubscription {
    pub fn new(id: RemoteSubscriptionId, subscriber: EndpointHandle, ttl: Ttl) -> Self {
        Self {
            id,
            subscriber,
            reliable: None,
            unreliable: None,
            ttl,
            is_initial: true,
            force_initial_events: false,
            parent: None,
            answers: 1,
            clients: FxHashMap::default(),
        }
    }

    pub fn reset(&mut self, clients: impl IntoIterator<Item = ClientId>) {
        self.clients.clear();
        for c in clients {
            self.clients
                .insert(c, (ClientSubscriptionState::Pending, None));
        }
    }

    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.keys().copied()
    }

    pub fn has_client(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    pub fn remove_client(&mut self, client: ClientId) {
        self.clients.remove(&client);
    }

    pub fn client_state(&self, client: ClientId) -> ClientSubscriptionState {
        self.clients
            .get(&client)
            .map(|(state, _)| *state)
            .unwrap_or(ClientSubscriptionState::Unknown)
    }

    /// Setting a terminal state (acked/nacked) for a client fixes its
    /// expiration to `now + ttl`, computed lazily on first transition rather
    /// than tracked from subscribe time.
    pub fn set_client_state(&mut self, client: ClientId, state: ClientSubscriptionState, now: Instant) {
        if let Some(entry) = self.clients.get_mut(&client) {
            entry.0 = state;
            if entry.1.is_none()
                && matches!(
                    state,
                    ClientSubscriptionState::Acked | ClientSubscriptionState::Nacked
                )
            {
                entry.1 = Some(now + std::time::Duration::from_secs(self.ttl.0 as u64));
            }
        }
    }

    pub fn set_all_client_states(&mut self, state: ClientSubscriptionState, now: Instant) {
        let clients: Vec<_> = self.clients.keys().copied().collect();
        for c in clients {
            self.set_client_state(c, state, now);
        }
    }

    pub fn expiration(&self, client: ClientId) -> Option<Instant> {
        self.clients.get(&client).and_then(|(_, exp)| *exp)
    }

    /// True while at least one client is still pending acknowledgement.
    pub fn is_pending(&self) -> bool {
        self.clients
            .values()
            .any(|(s, _)| *s == ClientSubscriptionState::Pending)
    }

    /// True only once every client has been acked.
    pub fn is_acknowledged(&self) -> bool {
        self.clients
            .values()
            .all(|(s, _)| *s == ClientSubscriptionState::Acked)
    }
}

/// `(service, instance, eventgroup)` configuration and live subscription
/// state.
#[derive(Debug)]
pub struct EventgroupInfo {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub eventgroup: EventgroupId,
    pub major: MajorVersion,
    pub ttl: Ttl,
    multicast: Option<(IpAddr, u16)>,
    pub threshold: u8,
    events: Vec<EventHandle>,
    reliability: ReliabilityMode,
    subscriptions: FxHashMap<RemoteSubscriptionId, RemoteSubscription>,
    next_subscription_id: u16,
    remote_subscriber_count: FxHashMap<IpAddr, u8>,
    pub max_remote_subscribers: u8,
    /// Currently-selected subscriber clients for this eventgroup's
    /// selective event, if any. `None` means no selectivity has been
    /// negotiated yet and every subscriber is eligible.
    selected_clients: Option<FxHashSet<ClientId>>,
}

impl EventgroupInfo {
    pub fn new(
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        ttl: Ttl,
        max_remote_subscribers: u8,
    ) -> Self {
        Self {
            service,
            instance,
            eventgroup,
            major,
            ttl,
            multicast: None,
            threshold: 0,
            events: Vec::new(),
            reliability: ReliabilityMode::Auto,
            subscriptions: FxHashMap::default(),
            next_subscription_id: 1,
            remote_subscriber_count: FxHashMap::default(),
            max_remote_subscribers,
            selected_clients: None,
        }
    }

    /// Replace the eventgroup's selective-event client set. Called whenever
    /// a subscribe arrives carrying a selective-event option; `None`
    /// clears any existing selection, going back to "everyone eligible".
    pub fn set_selected_clients(&mut self, clients: Option<Vec<ClientId>>) {
        self.selected_clients = clients.map(|c| c.into_iter().collect());
    }

    pub fn selected_clients(&self) -> Option<&FxHashSet<ClientId>> {
        self.selected_clients.as_ref()
    }

    /// Whether `client` should receive updates for this eventgroup's
    /// selective event. Always true when no selection has been negotiated.
    pub fn is_client_selected(&self, client: ClientId) -> bool {
        self.selected_clients.as_ref().map_or(true, |set| set.contains(&client))
    }

    pub fn is_multicast(&self) -> bool {
        self.multicast.is_some()
    }

    pub fn multicast(&self) -> Option<(IpAddr, u16)> {
        self.multicast
    }

    pub fn set_multicast(&mut self, address: IpAddr, port: u16) {
        self.multicast = Some((address, port));
    }

    /// Whether multicast should be used for the current number of
    /// subscribers, per the configured `threshold`.
    pub fn is_sending_multicast(&self) -> bool {
        self.is_multicast() && self.subscriptions.len() as u8 >= self.threshold
    }

    pub fn events(&self) -> &[EventHandle] {
        &self.events
    }

    pub fn add_event(&mut self, event: EventHandle) {
        if !self.events.contains(&event) {
            self.events.push(event);
        }
    }

    pub fn remove_event(&mut self, event: EventHandle) {
        self.events.retain(|e| *e != event);
    }

    /// An eventgroup is selective iff it contains exactly one event and
    /// that event is of `Selective` type — checked by the caller (which
    /// owns the `Event` arena); this only reports the event count.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn reliability(&self) -> ReliabilityMode {
        self.reliability
    }

    /// Fix the reliability mode once it is known:
    /// "reliability = auto means the first event added with a known
    /// reliability fixes it; otherwise remains unknown until an offer is
    /// observed." A no-op once already resolved.
    pub fn resolve_reliability(&mut self, mode: ReliabilityMode) {
        if !self.reliability.is_resolved() {
            self.reliability = mode;
        }
    }

    pub fn remote_subscriber_count(&self, address: IpAddr) -> u8 {
        self.remote_subscriber_count.get(&address).copied().unwrap_or(0)
    }

    pub fn is_remote_subscription_limit_reached(&self, address: IpAddr) -> bool {
        self.max_remote_subscribers != 0
            && self.remote_subscriber_count(address) >= self.max_remote_subscribers
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &RemoteSubscription> {
        self.subscriptions.values()
    }

    pub fn subscriptions_mut(&mut self) -> impl Iterator<Item = &mut RemoteSubscription> {
        self.subscriptions.values_mut()
    }

    pub fn subscription(&self, id: RemoteSubscriptionId) -> Option<&RemoteSubscription> {
        self.subscriptions.get(&id)
    }

    pub fn subscription_mut(&mut self, id: RemoteSubscriptionId) -> Option<&mut RemoteSubscription> {
        self.subscriptions.get_mut(&id)
    }

    /// Find an existing subscription with the same subscriber endpoint
    /// (used to detect "matching subscription" for the merge-vs-child
    /// decision).
    pub fn find_by_subscriber(&self, subscriber: EndpointHandle) -> Option<RemoteSubscriptionId> {
        self.subscriptions
            .values()
            .find(|s| s.subscriber == subscriber && s.parent.is_none())
            .map(|s| s.id)
    }

    pub fn add_remote_subscription(
        &mut self,
        mut subscription: RemoteSubscription,
        address: IpAddr,
    ) -> RemoteSubscriptionId {
        let id = RemoteSubscriptionId(self.next_subscription_id);
        self.next_subscription_id = self.next_subscription_id.wrapping_add(1).max(1);
        subscription.id = id;
        self.subscriptions.insert(id, subscription);
        *self.remote_subscriber_count.entry(address).or_insert(0) += 1;
        id
    }

    pub fn remove_remote_subscription(&mut self, id: RemoteSubscriptionId, address: IpAddr) {
        if self.subscriptions.remove(&id).is_some() {
            if let Some(count) = self.remote_subscriber_count.get_mut(&address) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn clear_remote_subscriptions(&mut self) {
        self.subscriptions.clear();
        self.remote_subscriber_count.clear();
    }

    /// Expire (remove) every subscription whose subscriber address
    /// matches `address` — used by reboot detection and by the
    /// security-deny path ("previously-accepted
    /// subscriptions for that port/reliability are expired").
    pub fn expire_subscriptions_from(
        &mut self,
        mut matches: impl FnMut(EndpointHandle) -> Option<IpAddr>,
    ) -> Vec<RemoteSubscriptionId> {
        let mut expired = Vec::new();
        let ids: Vec<_> = self.subscriptions.keys().copied().collect();
        for id in ids {
            let subscriber = self.subscriptions[&id].subscriber;
            if let Some(address) = matches(subscriber) {
                self.remove_remote_subscription(id, address);
                expired.push(id);
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Arena, EndpointDefinition, EndpointDefinitionKey};

    fn endpoint_handle() -> EndpointHandle {
        let mut arena: Arena<EndpointDefinition> = Arena::new();
        arena.insert(EndpointDefinition {
            key: EndpointDefinitionKey {
                address: "192.0.2.1".parse().unwrap(),
                port: 30501,
                reliable: true,
                service: ServiceId(1),
                instance: InstanceId(1),
                partition_id: 0,
            },
            remote_port: 30501,
        })
    }

    #[test]
    fn auto_reliability_resolves_once() {
        let mut eg = EventgroupInfo::new(
            ServiceId(1),
            InstanceId(1),
            EventgroupId(1),
            MajorVersion(1),
            Ttl(3),
            0,
        );
        assert_eq!(eg.reliability(), ReliabilityMode::Auto);
        eg.resolve_reliability(ReliabilityMode::Reliable);
        assert_eq!(eg.reliability(), ReliabilityMode::Reliable);
        eg.resolve_reliability(ReliabilityMode::Both);
        assert_eq!(eg.reliability(), ReliabilityMode::Reliable, "already resolved, stays fixed");
    }

    #[test]
    fn subscription_insert_tracks_per_ip_count_and_limit() {
        let mut eg = EventgroupInfo::new(
            ServiceId(1),
            InstanceId(1),
            EventgroupId(1),
            MajorVersion(1),
            Ttl(3),
            1,
        );
        let addr: IpAddr = "198.51.100.2".parse().unwrap();
        let ep = endpoint_handle();
        let sub = RemoteSubscription::new(PENDING_SUBSCRIPTION_ID, ep, Ttl(3));
        assert!(!eg.is_remote_subscription_limit_reached(addr));
        eg.add_remote_subscription(sub, addr);
        assert_eq!(eg.remote_subscriber_count(addr), 1);
        assert!(eg.is_remote_subscription_limit_reached(addr));
    }

    #[test]
    fn pending_acked_transitions() {
        let mut sub = RemoteSubscription::new(PENDING_SUBSCRIPTION_ID, endpoint_handle(), Ttl(3));
        sub.reset([ClientId(1), ClientId(2)]);
        assert!(sub.is_pending());
        assert!(!sub.is_acknowledged());
        let now = Instant::now();
        sub.set_client_state(ClientId(1), ClientSubscriptionState::Acked, now);
        assert!(sub.is_pending(), "client 2 still pending");
        sub.set_client_state(ClientId(2), ClientSubscriptionState::Acked, now);
        assert!(!sub.is_pending());
        assert!(sub.is_acknowledged());
        assert!(sub.expiration(ClientId(1)).is_some());
    }
}
