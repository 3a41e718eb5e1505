//! The handle every caller actually holds: a cheap `Clone` around a
//! command channel into [`super::host::RoutingManagerHost`]. No method here
//! ever touches routing-manager state directly.

use bytes::Bytes;
use someip_proto::{
    ClientId, EventId, EventgroupId, InstanceId, MajorVersion, MethodId, MinorVersion, ServiceId,
    Ttl,
};
use tokio::sync::{mpsc, oneshot};

use crate::error::RoutingError;
use crate::routing::command::{ClientEvent, Command};

#[derive(Debug, Clone)]
pub struct RoutingManagerClient {
    commands: mpsc::Sender<Command>,
}

impl RoutingManagerClient {
    pub(crate) fn new(commands: mpsc::Sender<Command>) -> Self {
        Self { commands }
    }

    async fn dispatch(&self, cmd: Command) -> Result<(), RoutingError> {
        self.commands.send(cmd).await.map_err(|_| RoutingError::ManagerGone)
    }

    pub async fn offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
        reliable: bool,
        unreliable: bool,
    ) -> Result<(), RoutingError> {
        self.dispatch(Command::OfferService {
            service,
            instance,
            major,
            minor,
            ttl,
            reliable,
            unreliable,
        })
        .await
    }

    pub async fn stop_offer_service(&self, service: ServiceId, instance: InstanceId) -> Result<(), RoutingError> {
        self.dispatch(Command::StopOfferService { service, instance }).await
    }

    pub async fn request_service(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<(), RoutingError> {
        self.dispatch(Command::RequestService {
            client,
            service,
            instance,
            major,
            minor,
        })
        .await
    }

    pub async fn release_service(&self, client: ClientId, service: ServiceId, instance: InstanceId) -> Result<(), RoutingError> {
        self.dispatch(Command::ReleaseService { client, service, instance }).await
    }

    pub async fn create_eventgroup(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        ttl: Ttl,
    ) -> Result<(), RoutingError> {
        self.dispatch(Command::CreateEventgroup {
            service,
            instance,
            eventgroup,
            major,
            ttl,
        })
        .await
    }

    pub async fn add_event_to_eventgroup(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
        reliable: bool,
    ) -> Result<(), RoutingError> {
        self.dispatch(Command::AddEventToEventgroup {
            service,
            instance,
            eventgroup,
            event,
            reliable,
        })
        .await
    }

    pub async fn subscribe(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
    ) -> Result<(), RoutingError> {
        self.dispatch(Command::Subscribe {
            client,
            service,
            instance,
            eventgroup,
            major,
        })
        .await
    }

    pub async fn unsubscribe(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> Result<(), RoutingError> {
        self.dispatch(Command::Unsubscribe {
            client,
            service,
            instance,
            eventgroup,
        })
        .await
    }

    pub async fn notify(&self, service: ServiceId, instance: InstanceId, event: EventId, payload: Bytes) -> Result<(), RoutingError> {
        self.dispatch(Command::Notify {
            service,
            instance,
            event,
            payload,
        })
        .await
    }

    /// Send a request and wait for the routing manager to confirm it was
    /// handed to a transport. This does not wait for the remote method's
    /// response PDU; delivering that back to the right caller is a
    /// session-id correlation layer callers build on top, not something the
    /// routing manager tracks on their behalf.
    pub async fn send(&self, client: ClientId, service: ServiceId, instance: InstanceId, method: MethodId, payload: Bytes) -> Result<(), RoutingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(Command::Send {
            client,
            service,
            instance,
            method,
            payload,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| RoutingError::ManagerGone)?
    }

    /// Register `client` to receive [`ClientEvent`]s, returning the
    /// receiving half. Dropping it is equivalent to calling
    /// [`Self::unregister_client`].
    pub async fn register_client(&self, client: ClientId, queue_depth: usize) -> Result<mpsc::Receiver<ClientEvent>, RoutingError> {
        let (tx, rx) = mpsc::channel(queue_depth);
        self.dispatch(Command::RegisterClient { client, events: tx }).await?;
        Ok(rx)
    }

    pub async fn unregister_client(&self, client: ClientId) -> Result<(), RoutingError> {
        self.dispatch(Command::UnregisterClient { client }).await
    }
}
