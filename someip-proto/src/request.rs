//! A local client's outstanding interest in a remote service:
//! "request service" before it has been matched to an offer.

use crate::primitive::{InstanceId, MajorVersion, MinorVersion, ServiceId};

#[derive(Debug, Clone)]
pub struct Request {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub minor: MinorVersion,
    /// Number of local clients that have requested this exact tuple.
    /// Released only once this drops to zero (reference-counted request;
    /// releasing is a no-op until the last requester exits).
    pub refcount: u32,
}

impl Request {
    pub fn new(service: ServiceId, instance: InstanceId, major: MajorVersion, minor: MinorVersion) -> Self {
        Self {
            service,
            instance,
            major,
            minor,
            refcount: 1,
        }
    }

    pub fn matches_offer(&self, service: ServiceId, instance: InstanceId, major: MajorVersion, minor: MinorVersion) -> bool {
        self.service == service
            && self.instance == instance
            && self.major == major
            && (self.minor == MinorVersion::ANY || self.minor == minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_minor_version_matches_every_offer() {
        let req = Request::new(ServiceId(1), InstanceId(1), MajorVersion(1), MinorVersion::ANY);
        assert!(req.matches_offer(ServiceId(1), InstanceId(1), MajorVersion(1), MinorVersion(42)));
        assert!(!req.matches_offer(ServiceId(2), InstanceId(1), MajorVersion(1), MinorVersion(42)));
    }

    #[test]
    fn exact_minor_version_must_match() {
        let req = Request::new(ServiceId(1), InstanceId(1), MajorVersion(1), MinorVersion(3));
        assert!(req.matches_offer(ServiceId(1), InstanceId(1), MajorVersion(1), MinorVersion(3)));
        assert!(!req.matches_offer(ServiceId(1), InstanceId(1), MajorVersion(1), MinorVersion(4)));
    }
}
