//! A local client's subscription to a remote eventgroup: the
//! client-side counterpart of [`crate::eventgroup::RemoteSubscription`].

use crate::primitive::{ClientId, EventgroupId, InstanceId, MajorVersion, ServiceId};

/// Mirrors vsomeip's local subscription state machine: a fresh subscribe
/// starts `NotAcknowledged`; a SubscribeAck moves it to `Acknowledged`;
/// re-sending a subscribe before expiry (TTL refresh) moves an already-acked
/// subscription through `Resubscribing`/`ResubscribingNotAcknowledged`
/// rather than dropping straight back to `NotAcknowledged`, so a transient
/// negative ack during a refresh doesn't un-offer events that are in fact
/// still flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSubscriptionState {
    NotAcknowledged,
    Resubscribing,
    ResubscribingNotAcknowledged,
    Acknowledged,
}

impl LocalSubscriptionState {
    pub fn is_acknowledged(self) -> bool {
        matches!(self, LocalSubscriptionState::Acknowledged)
    }

    /// Transition on a fresh (re)subscribe request going out.
    pub fn on_subscribe_sent(self) -> Self {
        match self {
            LocalSubscriptionState::Acknowledged => LocalSubscriptionState::Resubscribing,
            other => other,
        }
    }

    pub fn on_ack(self) -> Self {
        LocalSubscriptionState::Acknowledged
    }

    pub fn on_nack(self) -> Self {
        match self {
            LocalSubscriptionState::Resubscribing => {
                LocalSubscriptionState::ResubscribingNotAcknowledged
            }
            _ => LocalSubscriptionState::NotAcknowledged,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub client: ClientId,
    pub service: ServiceId,
    pub instance: InstanceId,
    pub eventgroup: EventgroupId,
    pub major: MajorVersion,
    pub state: LocalSubscriptionState,
}

impl Subscription {
    pub fn new(
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
    ) -> Self {
        Self {
            client,
            service,
            instance,
            eventgroup,
            major,
            state: LocalSubscriptionState::NotAcknowledged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resubscribe_then_nack_lands_on_resubscribing_not_acked_not_fresh() {
        let mut state = LocalSubscriptionState::Acknowledged;
        state = state.on_subscribe_sent();
        assert_eq!(state, LocalSubscriptionState::Resubscribing);
        state = state.on_nack();
        assert_eq!(state, LocalSubscriptionState::ResubscribingNotAcknowledged);
    }

    #[test]
    fn fresh_subscribe_nack_lands_on_not_acknowledged() {
        let state = LocalSubscriptionState::NotAcknowledged
            .on_subscribe_sent()
            .on_nack();
        assert_eq!(state, LocalSubscriptionState::NotAcknowledged);
    }
}
