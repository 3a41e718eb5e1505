//! Per-offered `(service, instance)` bookkeeping. Created on
//! `offer_service`, destroyed on `stop_offer_service`, owned by the routing
//! manager host.

use crate::primitive::{InstanceId, MajorVersion, MinorVersion, ServiceId, Ttl};
use crate::EndpointHandle;

#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub minor: MinorVersion,
    pub ttl: Ttl,
    pub reliable: Option<EndpointHandle>,
    pub unreliable: Option<EndpointHandle>,
    /// Set once the offering service's SD phase has reached `Main`; used
    /// by the unicast-vs-multicast answer rule.
    pub in_main_phase: bool,
}

impl ServiceInfo {
    pub fn new(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
    ) -> Self {
        Self {
            service,
            instance,
            major,
            minor,
            ttl,
            reliable: None,
            unreliable: None,
            in_main_phase: false,
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable.is_some()
    }

    pub fn is_unreliable(&self) -> bool {
        self.unreliable.is_some()
    }
}
