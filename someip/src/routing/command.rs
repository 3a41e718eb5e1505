//! The single entry point into the routing manager's state: every mutation
//! is a message sent over an `mpsc` channel to the task owned by
//! [`crate::routing::host::RoutingManagerHost`], never a direct call into
//! locked state, and no callback ever runs with a lock held.

use bytes::Bytes;
use someip_proto::{ClientId, EventId, EventgroupId, InstanceId, MajorVersion, MinorVersion, MethodId, ServiceId, Ttl};
use tokio::sync::{mpsc, oneshot};

use crate::error::RoutingError;

#[derive(Debug)]
pub enum Command {
    OfferService {
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
        reliable: bool,
        unreliable: bool,
    },
    StopOfferService {
        service: ServiceId,
        instance: InstanceId,
    },
    RequestService {
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    },
    ReleaseService {
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
    },
    CreateEventgroup {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        ttl: Ttl,
    },
    AddEventToEventgroup {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
        reliable: bool,
    },
    Subscribe {
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
    },
    Unsubscribe {
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    },
    Notify {
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Bytes,
    },
    Send {
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
        payload: Bytes,
        reply: oneshot::Sender<Result<(), RoutingError>>,
    },
    RegisterClient {
        client: ClientId,
        events: mpsc::Sender<ClientEvent>,
    },
    UnregisterClient {
        client: ClientId,
    },
}

/// Asynchronous notifications delivered back to a registered local client:
/// an event it subscribed to fired, or a method call it sent got answered.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Notification {
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Bytes,
    },
    ServiceAvailable {
        service: ServiceId,
        instance: InstanceId,
    },
    ServiceUnavailable {
        service: ServiceId,
        instance: InstanceId,
    },
}
