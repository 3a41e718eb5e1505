//! The routing manager task: the one place all shared state lives. Every
//! other type in this crate reaches it only through
//! [`crate::routing::command::Command`] messages, never a shared lock.
//!
//! Grounded on `quinn::endpoint::EndpointDriver`'s shape: a single task
//! that owns all mutable state and is driven by a `tokio::select!` over an
//! inbound-datagram channel, a command channel, and a timer.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use someip_proto::sd::{Entry, SdMessage};
use someip_proto::{
    header, ClientId, EndpointDefinitionKey, EventId, EventgroupId, InstanceId, MajorVersion,
    MessageType, MethodId, MinorVersion, Request, ReturnCode, ServiceId, SessionDirection,
    SessionState, SomeIpHeader, Subscription, Ttl, SD_METHOD, SD_SERVICE,
};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::discovery::{service_discovery as sd_build, PhaseTable, RebootGuard};
use crate::endpoint::{EndpointManager, Inbound};
use crate::error::RoutingError;
use crate::registry::{EventgroupRegistry, EventRegistry, ServiceRegistry};
use crate::routing::access_control::AccessControl;
use crate::routing::command::{ClientEvent, Command};

/// Pseudo client id used for the one SD subscription this process keeps
/// per remote eventgroup, regardless of how many local clients are
/// actually interested in it.
const AGGREGATE_CLIENT: ClientId = ClientId(0x0001);

pub struct RoutingManagerHost {
    config: Config,
    endpoints: std::sync::Arc<EndpointManager>,
    services: ServiceRegistry,
    eventgroups: EventgroupRegistry,
    events: EventRegistry,
    requests: FxHashMap<(ClientId, ServiceId, InstanceId), Request>,
    clients: FxHashMap<ClientId, mpsc::Sender<ClientEvent>>,
    access_control: AccessControl,
    session: SessionState,
    reboot: RebootGuard,
    phase_table: PhaseTable,
    local_subscribers: FxHashMap<(ServiceId, InstanceId, EventgroupId), FxHashSet<ClientId>>,
    subscriptions_out: FxHashMap<(ServiceId, InstanceId, EventgroupId), Subscription>,
}

impl RoutingManagerHost {
    pub fn new(config: Config, endpoints: std::sync::Arc<EndpointManager>) -> Self {
        Self {
            config,
            endpoints,
            services: ServiceRegistry::new(),
            eventgroups: EventgroupRegistry::new(),
            events: EventRegistry::new(),
            requests: FxHashMap::default(),
            clients: FxHashMap::default(),
            access_control: AccessControl::new(),
            session: SessionState::default(),
            reboot: RebootGuard::new(),
            phase_table: PhaseTable::new(),
            local_subscribers: FxHashMap::default(),
            subscriptions_out: FxHashMap::default(),
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut inbound: mpsc::Receiver<Inbound>) {
        let mut ticks = interval(Duration::from_millis(50));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            debug!("command channel closed, routing manager shutting down");
                            break;
                        }
                    }
                }
                msg = inbound.recv() => {
                    match msg {
                        Some(msg) => self.handle_inbound(msg).await,
                        None => {
                            debug!("inbound channel closed, routing manager shutting down");
                            break;
                        }
                    }
                }
                _ = ticks.tick() => {
                    self.on_tick().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::OfferService {
                service,
                instance,
                major,
                minor,
                ttl,
                reliable,
                unreliable,
            } => self.offer_service(service, instance, major, minor, ttl, reliable, unreliable).await,
            Command::StopOfferService { service, instance } => self.stop_offer_service(service, instance).await,
            Command::RequestService {
                client,
                service,
                instance,
                major,
                minor,
            } => self.request_service(client, service, instance, major, minor).await,
            Command::ReleaseService { client, service, instance } => {
                if let Some(req) = self.requests.get_mut(&(client, service, instance)) {
                    req.refcount = req.refcount.saturating_sub(1);
                    if req.refcount == 0 {
                        self.requests.remove(&(client, service, instance));
                    }
                }
            }
            Command::CreateEventgroup {
                service,
                instance,
                eventgroup,
                major,
                ttl,
            } => {
                if self.eventgroups.find(service, instance, eventgroup).is_none() {
                    self.eventgroups.insert(someip_proto::EventgroupInfo::new(
                        service,
                        instance,
                        eventgroup,
                        major,
                        ttl,
                        self.config.max_remote_subscribers,
                    ));
                }
            }
            Command::AddEventToEventgroup {
                service,
                instance,
                eventgroup,
                event,
                reliable,
            } => self.add_event_to_eventgroup(service, instance, eventgroup, event, reliable),
            Command::Subscribe {
                client,
                service,
                instance,
                eventgroup,
                major,
            } => self.subscribe(client, service, instance, eventgroup, major).await,
            Command::Unsubscribe {
                client,
                service,
                instance,
                eventgroup,
            } => self.unsubscribe(client, service, instance, eventgroup).await,
            Command::Notify {
                service,
                instance,
                event,
                payload,
            } => self.notify(service, instance, event, payload).await,
            Command::Send {
                client,
                service,
                instance,
                method,
                payload,
                reply,
            } => {
                let result = self.send(client, service, instance, method, payload).await;
                let _ = reply.send(result);
            }
            Command::RegisterClient { client, events } => {
                self.clients.insert(client, events);
            }
            Command::UnregisterClient { client } => {
                self.clients.remove(&client);
            }
        }
    }

    async fn offer_service(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
        reliable: bool,
        unreliable: bool,
    ) {
        let local_addr = self.endpoints.local_unicast_addr();
        let mut info = someip_proto::ServiceInfo::new(service, instance, major, minor, ttl);
        if reliable {
            info.reliable = Some(
                self.endpoints
                    .intern(EndpointDefinitionKey {
                        address: local_addr.ip(),
                        port: local_addr.port(),
                        reliable: true,
                        service,
                        instance,
                        partition_id: self.config.partition_id,
                    })
                    .await,
            );
        }
        if unreliable {
            info.unreliable = Some(
                self.endpoints
                    .intern(EndpointDefinitionKey {
                        address: local_addr.ip(),
                        port: local_addr.port(),
                        reliable: false,
                        service,
                        instance,
                        partition_id: self.config.partition_id,
                    })
                    .await,
            );
        }
        self.services.insert(info);
        self.phase_table.track(service, instance, Instant::now());
        trace!(?service, ?instance, "offered service");

        let waiting: Vec<ClientId> = self
            .requests
            .iter()
            .filter(|(_, req)| req.matches_offer(service, instance, major, minor))
            .map(|((c, _, _), _)| *c)
            .collect();
        for client in waiting {
            self.tell_client(client, ClientEvent::ServiceAvailable { service, instance }).await;
        }
    }

    async fn stop_offer_service(&mut self, service: ServiceId, instance: InstanceId) {
        let Some(info) = self.services.remove(service, instance) else {
            return;
        };
        self.phase_table.untrack(service, instance);
        self.events.remove_all_for_service(service, instance);
        self.eventgroups.remove_all_for_service(service, instance);

        let waiting: Vec<ClientId> = self
            .requests
            .iter()
            .filter(|(_, req)| req.matches_offer(service, instance, info.major, info.minor))
            .map(|((c, _, _), _)| *c)
            .collect();
        for client in waiting {
            self.tell_client(client, ClientEvent::ServiceUnavailable { service, instance }).await;
        }

        let (reliable, endpoint) = match (info.reliable, info.unreliable) {
            (Some(h), _) => (true, h),
            (None, Some(h)) => (false, h),
            (None, None) => return,
        };
        if let Some((addr, _)) = self.endpoints.resolve(endpoint).await {
            let msg = sd_build::build_offer(service, instance, info.major, info.minor, Ttl::STOP, addr, reliable);
            self.send_sd_multicast(msg).await;
        }
    }

    /// A rebooted peer's prior offers are no longer trustworthy: every
    /// service it offered is withdrawn just as if it had sent a
    /// `StopOfferService`, without waiting for that peer's own TTL to
    /// expire or for it to actually send one.
    async fn expire_services_from_rebooted_peer(&mut self, peer: IpAddr) {
        let mut stale = Vec::new();
        for (_, info) in self.services.iter() {
            let mut from_peer = false;
            for endpoint in [info.reliable, info.unreliable].into_iter().flatten() {
                if let Some((addr, _)) = self.endpoints.resolve(endpoint).await {
                    if addr.ip() == peer {
                        from_peer = true;
                        break;
                    }
                }
            }
            if from_peer {
                stale.push((info.service, info.instance));
            }
        }
        for (service, instance) in stale {
            let Some(info) = self.services.remove(service, instance) else {
                continue;
            };
            self.events.remove_all_for_service(service, instance);
            self.eventgroups.remove_all_for_service(service, instance);
            let waiting: Vec<ClientId> = self
                .requests
                .iter()
                .filter(|(_, req)| req.matches_offer(service, instance, info.major, info.minor))
                .map(|((c, _, _), _)| *c)
                .collect();
            for client in waiting {
                self.tell_client(client, ClientEvent::ServiceUnavailable { service, instance }).await;
            }
        }
    }

    async fn request_service(&mut self, client: ClientId, service: ServiceId, instance: InstanceId, major: MajorVersion, minor: MinorVersion) {
        let req = self
            .requests
            .entry((client, service, instance))
            .and_modify(|req| req.refcount += 1)
            .or_insert_with(|| Request::new(service, instance, major, minor));

        let matches = self
            .services
            .find(service, instance)
            .and_then(|h| self.services.get(h))
            .is_some_and(|info| req.matches_offer(service, instance, info.major, info.minor));
        if matches {
            self.tell_client(client, ClientEvent::ServiceAvailable { service, instance }).await;
        }
    }

    fn add_event_to_eventgroup(&mut self, service: ServiceId, instance: InstanceId, eventgroup: EventgroupId, event: EventId, reliable: bool) {
        let reliability = if reliable {
            someip_proto::Reliability::Reliable
        } else {
            someip_proto::Reliability::Unreliable
        };
        let event_handle = match self.events.find(service, instance, event) {
            Some(h) => h,
            None => self.events.insert(service, instance, someip_proto::Event::new(event, reliability, someip_proto::EventKind::Event)),
        };
        if let Some(eg_handle) = self.eventgroups.find(service, instance, eventgroup) {
            if let Some(eg) = self.eventgroups.get_mut(eg_handle) {
                eg.add_event(event_handle);
            }
            if let Some(ev) = self.events.get_mut(event_handle) {
                ev.add_eventgroup(eg_handle);
            }
        }
    }

    async fn subscribe(&mut self, client: ClientId, service: ServiceId, instance: InstanceId, eventgroup: EventgroupId, major: MajorVersion) {
        self.local_subscribers
            .entry((service, instance, eventgroup))
            .or_default()
            .insert(client);

        if let Some(eg_handle) = self.eventgroups.find(service, instance, eventgroup) {
            let events: Vec<someip_proto::EventHandle> = self.eventgroups.get(eg_handle).map(|eg| eg.events().to_vec()).unwrap_or_default();
            for event_handle in events {
                let cached = match self.events.get(event_handle) {
                    Some(ev) => {
                        let eligible = ev.kind != someip_proto::EventKind::Selective
                            || self.eventgroups.get(eg_handle).map_or(true, |eg| eg.is_client_selected(client));
                        if eligible {
                            ev.cached_payload().map(|p| (ev.id, p.to_vec()))
                        } else {
                            None
                        }
                    }
                    None => None,
                };
                if let Some((event_id, payload)) = cached {
                    self.tell_client(
                        client,
                        ClientEvent::Notification {
                            service,
                            instance,
                            event: event_id,
                            payload: Bytes::from(payload),
                        },
                    )
                    .await;
                }
            }
        }

        let key = (service, instance, eventgroup);
        if self.subscriptions_out.contains_key(&key) {
            return;
        }

        let mut sub = Subscription::new(AGGREGATE_CLIENT, service, instance, eventgroup, major);
        if let Some(service_handle) = self.services.find(service, instance) {
            if let Some(info) = self.services.get(service_handle) {
                let remote_endpoint = info.unreliable.or(info.reliable);
                if let Some(handle) = remote_endpoint {
                    if let Some((addr, reliable)) = self.endpoints.resolve(handle).await {
                        let local_addr = self.endpoints.local_unicast_addr();
                        let target = SocketAddr::new(addr.ip(), self.config.sd_unicast_port);
                        let ttl = self.subscription_ttl();
                        let msg = sd_build::build_subscribe(service, instance, eventgroup, major, ttl, local_addr, reliable, 0);
                        self.send_sd_unicast(target, msg).await;
                    }
                }
            }
        }
        sub.state = sub.state.on_subscribe_sent();
        self.subscriptions_out.insert(key, sub);
    }

    async fn unsubscribe(&mut self, client: ClientId, service: ServiceId, instance: InstanceId, eventgroup: EventgroupId) {
        let key = (service, instance, eventgroup);
        if let Some(set) = self.local_subscribers.get_mut(&key) {
            set.remove(&client);
            if set.is_empty() {
                self.local_subscribers.remove(&key);
                if let Some(sub) = self.subscriptions_out.remove(&key) {
                    if let Some(service_handle) = self.services.find(service, instance) {
                        if let Some(info) = self.services.get(service_handle) {
                            if let Some(handle) = info.unreliable.or(info.reliable) {
                                if let Some((addr, reliable)) = self.endpoints.resolve(handle).await {
                                    let local_addr = self.endpoints.local_unicast_addr();
                                    let target = SocketAddr::new(addr.ip(), self.config.sd_unicast_port);
                                    let msg = sd_build::build_subscribe(service, instance, eventgroup, sub.major, Ttl::STOP, local_addr, reliable, 0);
                                    self.send_sd_unicast(target, msg).await;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Subscription TTL, scaled off the cyclic offer delay by the
    /// configured subscription TTL factor.
    fn subscription_ttl(&self) -> Ttl {
        let secs = self.config.sd_timers.cyclic_offer_delay.as_secs().max(1) as u32;
        Ttl(secs * self.config.sd_timers.ttl_factor_subscriptions.max(1))
    }

    async fn notify(&mut self, service: ServiceId, instance: InstanceId, event: EventId, payload: Bytes) {
        let Some(event_handle) = self.events.find(service, instance, event) else {
            return;
        };
        let now = Instant::now();
        let outcome = match self.events.get(event_handle) {
            Some(ev) => ev.filter.evaluate(&payload, now),
            None => return,
        };
        if outcome != someip_proto::UpdateOutcome::Send {
            return;
        }
        if let Some(ev) = self.events.get_mut(event_handle) {
            ev.filter.record_sent(&payload, now);
            ev.set_cached_payload(&payload);
        }

        let is_selective = self.events.get(event_handle).map(|e| e.kind) == Some(someip_proto::EventKind::Selective);
        let eventgroups = self.events.get(event_handle).map(|e| e.eventgroups.clone()).unwrap_or_default();
        let (session, _reboot) = self.session.next_outgoing();
        let header = SomeIpHeader {
            service,
            method: MethodId(event.get()),
            length: 8,
            client: someip_proto::ROUTING_CLIENT,
            session,
            interface_version: 1,
            message_type: MessageType::Notification,
            return_code: ReturnCode::Ok,
        };
        let pdu = header::encode_pdu(&header, &payload);

        for eg_handle in eventgroups {
            let targets: Vec<(SocketAddr, bool)> = match self.eventgroups.get(eg_handle) {
                Some(eg) => {
                    let mut out = Vec::new();
                    for sub in eg.subscriptions() {
                        // A selective event only reaches subscriber endpoints that
                        // named at least one client id and that id is currently
                        // selected; endpoints that never negotiated selectivity
                        // (no client list at all) still receive it.
                        if is_selective
                            && sub.clients().next().is_some()
                            && !sub.clients().any(|c| eg.is_client_selected(c))
                        {
                            continue;
                        }
                        if let Some((addr, reliable)) = self.endpoints.resolve(sub.subscriber).await {
                            out.push((addr, reliable));
                        }
                    }
                    out
                }
                None => Vec::new(),
            };
            for (addr, reliable) in targets {
                if let Err(e) = self.endpoints.send_unicast(addr, reliable, pdu.clone()).await {
                    warn!(%addr, error = %e, "failed to deliver notification");
                }
            }

            if let Some((service_key, instance_key, eventgroup_key)) = self.eventgroups.get(eg_handle).map(|eg| (eg.service, eg.instance, eg.eventgroup)) {
                if let Some(clients) = self.local_subscribers.get(&(service_key, instance_key, eventgroup_key)).cloned() {
                    for client in clients {
                        if is_selective {
                            let selected = self.eventgroups.get(eg_handle).map_or(true, |eg| eg.is_client_selected(client));
                            if !selected {
                                continue;
                            }
                        }
                        self.tell_client(
                            client,
                            ClientEvent::Notification {
                                service,
                                instance,
                                event,
                                payload: payload.clone(),
                            },
                        )
                        .await;
                    }
                }
            }
        }
    }

    /// Push every event's cached payload in `eg_handle` to `subscriber`,
    /// the way a freshly-acked subscriber gets caught up without waiting
    /// for the next real update.
    async fn send_initial_events(&mut self, service: ServiceId, eg_handle: someip_proto::EventgroupHandle, subscriber: someip_proto::EndpointHandle) {
        let Some((addr, reliable)) = self.endpoints.resolve(subscriber).await else {
            return;
        };
        let events: Vec<someip_proto::EventHandle> = match self.eventgroups.get(eg_handle) {
            Some(eg) => eg.events().to_vec(),
            None => return,
        };
        for event_handle in events {
            let cached = match self.events.get(event_handle) {
                Some(ev) => ev.cached_payload().map(|p| (ev.id, p.to_vec())),
                None => None,
            };
            let Some((event_id, payload)) = cached else {
                continue;
            };
            let (session, _reboot) = self.session.next_outgoing();
            let header = SomeIpHeader {
                service,
                method: MethodId(event_id.get()),
                length: 8,
                client: someip_proto::ROUTING_CLIENT,
                session,
                interface_version: 1,
                message_type: MessageType::Notification,
                return_code: ReturnCode::Ok,
            };
            let pdu = header::encode_pdu(&header, &payload);
            if let Err(e) = self.endpoints.send_unicast(addr, reliable, pdu).await {
                warn!(%addr, error = %e, "failed to deliver initial event on subscribe-ack");
            }
        }
    }

    async fn send(&mut self, client: ClientId, service: ServiceId, instance: InstanceId, method: MethodId, payload: Bytes) -> Result<(), RoutingError> {
        if !self.access_control.is_method_allowed(client, service, instance, method) {
            return Err(RoutingError::AccessDenied(client.get()));
        }
        let handle = self.services.find(service, instance).ok_or(RoutingError::UnknownService {
            service: service.get(),
            instance: instance.get(),
            partition_id: self.config.partition_id,
        })?;
        let info = self.services.get(handle).ok_or(RoutingError::UnknownService {
            service: service.get(),
            instance: instance.get(),
        })?;
        let endpoint = info.reliable.or(info.unreliable).ok_or(RoutingError::UnknownService {
            service: service.get(),
            instance: instance.get(),
        })?;
        let (addr, reliable) = self
            .endpoints
            .resolve(endpoint)
            .await
            .ok_or(RoutingError::UnknownService {
                service: service.get(),
                instance: instance.get(),
            })?;

        let (session, _reboot) = self.session.next_outgoing();
        let header = SomeIpHeader {
            service,
            method,
            length: 8,
            client,
            session,
            interface_version: 1,
            message_type: MessageType::Request,
            return_code: ReturnCode::Ok,
        };
        let pdu = header::encode_pdu(&header, &payload);
        self.endpoints.send_unicast(addr, reliable, pdu).await?;
        Ok(())
    }

    async fn handle_inbound(&mut self, msg: Inbound) {
        let mut slice = &msg.data[..];
        let header = match SomeIpHeader::decode(&mut slice) {
            Ok(h) => h,
            Err(e) => {
                trace!(error = %e, "dropping malformed pdu");
                return;
            }
        };

        if header.service == SD_SERVICE && header.method == SD_METHOD {
            match SdMessage::decode(slice) {
                Ok(sd_msg) => self.handle_sd_message(msg.peer, header.session, sd_msg).await,
                Err(e) => trace!(error = %e, "dropping malformed sd message"),
            }
            return;
        }

        trace!(peer = %msg.peer, service = %header.service, method = %header.method, "received someip pdu");
    }

    async fn handle_sd_message(&mut self, peer: SocketAddr, session: someip_proto::SessionId, msg: SdMessage) {
        // `observe_and_flush` needs a synchronous way to turn a subscriber's
        // `EndpointHandle` back into an address; resolution itself is async
        // (the interned table sits behind a tokio mutex), so resolve every
        // handle currently in play up front and hand the guard a snapshot.
        let mut subscriber_addrs: FxHashMap<someip_proto::EndpointHandle, IpAddr> = FxHashMap::default();
        for (_, eg) in self.eventgroups.iter() {
            for sub in eg.subscriptions() {
                if let std::collections::hash_map::Entry::Vacant(slot) = subscriber_addrs.entry(sub.subscriber) {
                    if let Some((addr, _)) = self.endpoints.resolve(sub.subscriber).await {
                        slot.insert(addr.ip());
                    }
                }
            }
        }

        // Reboot tracking keys off the peer's unicast session sequence;
        // its multicast sequence (offers it sends to the SD group) is
        // tracked the same way once this process also joins that group as
        // a client, which it does not yet model separately.
        let rebooted = self.reboot.observe_and_flush(
            peer.ip(),
            SessionDirection::Unicast,
            session,
            msg.flags.reboot,
            &mut self.eventgroups,
            |handle| subscriber_addrs.get(&handle).copied(),
        );
        if rebooted {
            debug!(%peer, "peer reboot detected, expired its subscriptions");
            self.expire_services_from_rebooted_peer(peer.ip()).await;
        }

        for entry in msg.entries.clone() {
            match entry {
                Entry::Service(service_entry) => self.handle_service_entry(peer, &msg, service_entry).await,
                Entry::Eventgroup(eg_entry) => self.handle_eventgroup_entry(peer, &msg, eg_entry).await,
            }
        }
    }

    async fn handle_service_entry(&mut self, peer: SocketAddr, msg: &SdMessage, entry: someip_proto::sd::ServiceEntry) {
        use someip_proto::sd::ServiceEntryType;
        match entry.kind {
            ServiceEntryType::Find => {
                if let Some(handle) = self.services.find(entry.service, entry.instance) {
                    if let Some(info) = self.services.get(handle) {
                        let (reliable, endpoint) = match (info.reliable, info.unreliable) {
                            (Some(h), _) => (true, h),
                            (None, Some(h)) => (false, h),
                            (None, None) => return,
                        };
                        if let Some((addr, _)) = self.endpoints.resolve(endpoint).await {
                            let reply = sd_build::build_offer(entry.service, entry.instance, info.major, info.minor, info.ttl, addr, reliable);
                            self.send_sd_unicast(peer, reply).await;
                        }
                    }
                }
            }
            ServiceEntryType::Offer if entry.ttl.is_stop() => {
                let Some(info) = self.services.remove(entry.service, entry.instance) else {
                    return;
                };
                self.events.remove_all_for_service(entry.service, entry.instance);
                self.eventgroups.remove_all_for_service(entry.service, entry.instance);
                let waiting: Vec<ClientId> = self
                    .requests
                    .iter()
                    .filter(|(_, req)| req.matches_offer(entry.service, entry.instance, info.major, info.minor))
                    .map(|((c, _, _), _)| *c)
                    .collect();
                for client in waiting {
                    self.tell_client(client, ClientEvent::ServiceUnavailable { service: entry.service, instance: entry.instance }).await;
                }
            }
            ServiceEntryType::Offer => {
                let options = msg.resolve_options(&someip_proto::sd::Entry::Service(entry));
                let (remote_ip, port, reliable) = match options.first() {
                    Some(someip_proto::sd::Option_::Ip4Endpoint { address, proto, port }) => {
                        (IpAddr::V4(*address), *port, proto.reliability().is_reliable())
                    }
                    Some(someip_proto::sd::Option_::Ip6Endpoint { address, proto, port }) => {
                        (IpAddr::V6(*address), *port, proto.reliability().is_reliable())
                    }
                    _ => return,
                };
                let handle = self
                    .endpoints
                    .intern(EndpointDefinitionKey {
                        address: remote_ip,
                        port,
                        reliable,
                        service: entry.service,
                        instance: entry.instance,
                        partition_id: self.config.partition_id,
                    })
                    .await;

                let service_handle = match self.services.find(entry.service, entry.instance) {
                    Some(h) => h,
                    None => self.services.insert(someip_proto::ServiceInfo::new(entry.service, entry.instance, entry.major, entry.minor, entry.ttl)),
                };
                if let Some(info) = self.services.get_mut(service_handle) {
                    if reliable {
                        info.reliable = Some(handle);
                    } else {
                        info.unreliable = Some(handle);
                    }
                    info.ttl = entry.ttl;
                }

                let waiting: Vec<ClientId> = self
                    .requests
                    .iter()
                    .filter(|(_, req)| req.matches_offer(entry.service, entry.instance, entry.major, entry.minor))
                    .map(|((c, _, _), _)| *c)
                    .collect();
                for client in waiting {
                    self.tell_client(client, ClientEvent::ServiceAvailable { service: entry.service, instance: entry.instance }).await;
                }
            }
        }
    }

    async fn handle_eventgroup_entry(&mut self, peer: SocketAddr, msg: &SdMessage, entry: someip_proto::sd::EventgroupEntry) {
        use someip_proto::sd::EventgroupEntryType;
        match entry.kind {
            EventgroupEntryType::Subscribe => {
                let options = msg.resolve_options(&Entry::Eventgroup(entry));
                let subscriber_addr = match options.first() {
                    Some(someip_proto::sd::Option_::Ip4Endpoint { address, .. }) => IpAddr::V4(*address),
                    Some(someip_proto::sd::Option_::Ip6Endpoint { address, .. }) => IpAddr::V6(*address),
                    _ => peer.ip(),
                };
                let (subscriber_port, reliable) = match options.first() {
                    Some(someip_proto::sd::Option_::Ip4Endpoint { port, proto, .. })
                    | Some(someip_proto::sd::Option_::Ip6Endpoint { port, proto, .. }) => (*port, proto.reliability().is_reliable()),
                    _ => (peer.port(), false),
                };
                let Some(eg_handle) = self.eventgroups.find(entry.service, entry.instance, entry.eventgroup) else {
                    let ack = sd_build::build_subscribe_ack(entry.service, entry.instance, entry.eventgroup, entry.major, Ttl::STOP, entry.counter, None);
                    self.send_sd_unicast(peer, ack).await;
                    return;
                };
                let subscriber = self
                    .endpoints
                    .intern(EndpointDefinitionKey {
                        address: subscriber_addr,
                        port: subscriber_port,
                        reliable,
                        service: entry.service,
                        instance: entry.instance,
                        partition_id: self.config.partition_id,
                    })
                    .await;
                let requested_clients: Option<Vec<ClientId>> = options.iter().find_map(|opt| match opt {
                    someip_proto::sd::Option_::Selective(clients) => Some(clients.clone()),
                    _ => None,
                });
                let allowed = true; // remote subscriber identity carries no local client id to check against
                let outcome = match self.eventgroups.get_mut(eg_handle) {
                    Some(eg) => crate::discovery::handle_subscribe(
                        eg,
                        subscriber,
                        subscriber_addr,
                        entry.ttl,
                        allowed,
                        requested_clients.as_deref(),
                        Instant::now(),
                    ),
                    None => return,
                };
                let (ack_ttl, selected_clients) = match outcome {
                    crate::discovery::SubscribeOutcome::Ack { ttl, selected_clients } => (ttl, selected_clients),
                    crate::discovery::SubscribeOutcome::Nack => (Ttl::STOP, None),
                    crate::discovery::SubscribeOutcome::Stopped => (Ttl::STOP, None),
                };
                let ack = sd_build::build_subscribe_ack(
                    entry.service,
                    entry.instance,
                    entry.eventgroup,
                    entry.major,
                    ack_ttl,
                    entry.counter,
                    selected_clients.as_deref(),
                );
                self.send_sd_unicast(peer, ack).await;
                if matches!(outcome, crate::discovery::SubscribeOutcome::Ack { .. }) {
                    self.send_initial_events(entry.service, eg_handle, subscriber).await;
                }
            }
            EventgroupEntryType::SubscribeAck => {
                let key = (entry.service, entry.instance, entry.eventgroup);
                if let Some(sub) = self.subscriptions_out.get_mut(&key) {
                    sub.state = if entry.ttl.is_stop() {
                        sub.state.on_nack()
                    } else {
                        sub.state.on_ack()
                    };
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let due = self.phase_table.due(
            now,
            self.config.sd_timers.repetitions_max,
            self.config.sd_timers.repetitions_base_delay,
            self.config.sd_timers.cyclic_offer_delay,
        );
        for (service, instance) in due {
            let Some(handle) = self.services.find(service, instance) else { continue };
            let Some(info) = self.services.get(handle) else { continue };
            let (reliable, endpoint) = match (info.reliable, info.unreliable) {
                (Some(h), _) => (true, h),
                (None, Some(h)) => (false, h),
                (None, None) => continue,
            };
            let (major, minor, ttl) = (info.major, info.minor, info.ttl);
            if let Some((addr, _)) = self.endpoints.resolve(endpoint).await {
                let msg = sd_build::build_offer(service, instance, major, minor, ttl, addr, reliable);
                self.send_sd_multicast(msg).await;
            }
        }
    }

    async fn send_sd_multicast(&mut self, msg: SdMessage) {
        let (session, reboot_flag) = self.session.next_outgoing();
        let mut msg = msg;
        msg.flags.reboot = reboot_flag;
        let header = sd_header(session);
        let pdu = header::encode_pdu(&header, &msg.encode());
        if let Err(e) = self.endpoints.send_multicast(pdu).await {
            warn!(error = %e, "failed to send sd multicast message");
        }
    }

    async fn send_sd_unicast(&mut self, dst: SocketAddr, msg: SdMessage) {
        let (session, reboot_flag) = self.session.next_outgoing();
        let mut msg = msg;
        msg.flags.reboot = reboot_flag;
        msg.flags.unicast = true;
        let header = sd_header(session);
        let pdu = header::encode_pdu(&header, &msg.encode());
        if let Err(e) = self.endpoints.send_unicast(dst, false, pdu).await {
            warn!(%dst, error = %e, "failed to send sd unicast message");
        }
    }

    async fn tell_client(&mut self, client: ClientId, event: ClientEvent) {
        if let Some(sender) = self.clients.get(&client) {
            if sender.send(event).await.is_err() {
                self.clients.remove(&client);
            }
        }
    }
}

fn sd_header(session: someip_proto::SessionId) -> SomeIpHeader {
    SomeIpHeader {
        service: SD_SERVICE,
        method: SD_METHOD,
        length: 8,
        client: someip_proto::ROUTING_CLIENT,
        session,
        interface_version: 1,
        message_type: MessageType::Notification,
        return_code: ReturnCode::Ok,
    }
}
