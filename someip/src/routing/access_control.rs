//! Local access control: which clients may request/subscribe to
//! which services. Checked once per command rather than threaded through
//! every call site.

use rustc_hash::FxHashSet;
use someip_proto::{ClientId, InstanceId, MethodId, ServiceId, ANY_METHOD};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Grant {
    service: ServiceId,
    instance: InstanceId,
}

/// An allow-list of `(service, instance)` pairs per client. An empty policy
/// (the default) allows everything: a client becomes restricted only once
/// something grants it an explicit allow-list.
#[derive(Debug, Default)]
pub struct AccessControl {
    grants: std::collections::HashMap<ClientId, FxHashSet<Grant>>,
    restricted_clients: FxHashSet<ClientId>,
    /// Per-`(client, service, instance)` method allow-list. Absent or empty
    /// means the service-level grant alone decides; once a client has any
    /// entry here, only the listed methods (or `ANY_METHOD`) pass.
    method_grants: std::collections::HashMap<(ClientId, ServiceId, InstanceId), FxHashSet<MethodId>>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict `client` to an explicit allow-list. Before this is called
    /// for a given client, it is unrestricted.
    pub fn allow(&mut self, client: ClientId, service: ServiceId, instance: InstanceId) {
        self.restricted_clients.insert(client);
        self.grants
            .entry(client)
            .or_default()
            .insert(Grant { service, instance });
    }

    /// Narrow an already-granted `(service, instance)` to one specific
    /// method, or pass `ANY_METHOD` to grant every method explicitly.
    /// Implies [`Self::allow`] for the same `(service, instance)`.
    pub fn allow_method(&mut self, client: ClientId, service: ServiceId, instance: InstanceId, method: MethodId) {
        self.allow(client, service, instance);
        self.method_grants.entry((client, service, instance)).or_default().insert(method);
    }

    pub fn is_allowed(&self, client: ClientId, service: ServiceId, instance: InstanceId) -> bool {
        if !self.restricted_clients.contains(&client) {
            return true;
        }
        self.grants
            .get(&client)
            .map(|grants| grants.contains(&Grant { service, instance }))
            .unwrap_or(false)
    }

    /// Checks the service-level grant first, then narrows by the
    /// per-method allow-list if `client` has one for this `(service,
    /// instance)`. A client with no method-level grants at all is allowed
    /// every method of a service it's otherwise allowed to reach.
    pub fn is_method_allowed(&self, client: ClientId, service: ServiceId, instance: InstanceId, method: MethodId) -> bool {
        if !self.is_allowed(client, service, instance) {
            return false;
        }
        match self.method_grants.get(&(client, service, instance)) {
            Some(methods) if !methods.is_empty() => methods.contains(&ANY_METHOD) || methods.contains(&method),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_client_is_allowed_everything() {
        let ac = AccessControl::new();
        assert!(ac.is_allowed(ClientId(1), ServiceId(1), InstanceId(1)));
    }

    #[test]
    fn restricted_client_only_sees_granted_services() {
        let mut ac = AccessControl::new();
        ac.allow(ClientId(1), ServiceId(1), InstanceId(1));
        assert!(ac.is_allowed(ClientId(1), ServiceId(1), InstanceId(1)));
        assert!(!ac.is_allowed(ClientId(1), ServiceId(2), InstanceId(1)));
        assert!(ac.is_allowed(ClientId(2), ServiceId(2), InstanceId(1)), "client 2 has no grants at all, so is unrestricted");
    }

    #[test]
    fn service_level_grant_without_method_grants_allows_every_method() {
        let mut ac = AccessControl::new();
        ac.allow(ClientId(1), ServiceId(1), InstanceId(1));
        assert!(ac.is_method_allowed(ClientId(1), ServiceId(1), InstanceId(1), MethodId(0x1234)));
        assert!(ac.is_method_allowed(ClientId(1), ServiceId(1), InstanceId(1), MethodId(0x5678)));
    }

    #[test]
    fn method_grant_narrows_to_the_listed_methods_only() {
        let mut ac = AccessControl::new();
        ac.allow_method(ClientId(1), ServiceId(1), InstanceId(1), MethodId(0x1111));
        assert!(ac.is_method_allowed(ClientId(1), ServiceId(1), InstanceId(1), MethodId(0x1111)));
        assert!(!ac.is_method_allowed(ClientId(1), ServiceId(1), InstanceId(1), MethodId(0x2222)));
    }

    #[test]
    fn any_method_grant_allows_every_method_of_that_service() {
        let mut ac = AccessControl::new();
        ac.allow_method(ClientId(1), ServiceId(1), InstanceId(1), ANY_METHOD);
        assert!(ac.is_method_allowed(ClientId(1), ServiceId(1), InstanceId(1), MethodId(0xabcd)));
    }

    #[test]
    fn method_grant_for_one_service_never_leaks_into_another() {
        let mut ac = AccessControl::new();
        ac.allow(ClientId(1), ServiceId(1), InstanceId(1));
        ac.allow_method(ClientId(1), ServiceId(2), InstanceId(1), ANY_METHOD);
        assert!(
            !ac.is_method_allowed(ClientId(1), ServiceId(3), InstanceId(1), MethodId(1)),
            "client has no grant at all for service 3"
        );
    }
}
