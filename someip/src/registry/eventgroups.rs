//! Eventgroup registry: owns the [`EventgroupInfo`] arena and the index
//! from `(service, instance, eventgroup)` to its handle.
//!
//! One flat `FxHashMap` keyed by the tuple that actually identifies an
//! eventgroup on the wire, rather than a tower of nested per-service,
//! per-instance maps.

use rustc_hash::FxHashMap;
use someip_proto::{Arena, EventgroupHandle, EventgroupId, EventgroupInfo, InstanceId, ServiceId};

#[derive(Debug, Default)]
pub struct EventgroupRegistry {
    arena: Arena<EventgroupInfo>,
    index: FxHashMap<(ServiceId, InstanceId, EventgroupId), EventgroupHandle>,
}

impl EventgroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: EventgroupInfo) -> EventgroupHandle {
        let key = (info.service, info.instance, info.eventgroup);
        let handle = self.arena.insert(info);
        self.index.insert(key, handle);
        handle
    }

    pub fn remove(&mut self, service: ServiceId, instance: InstanceId, eventgroup: EventgroupId) -> Option<EventgroupInfo> {
        let handle = self.index.remove(&(service, instance, eventgroup))?;
        self.arena.remove(handle)
    }

    pub fn remove_all_for_service(&mut self, service: ServiceId, instance: InstanceId) -> Vec<EventgroupInfo> {
        let keys: Vec<_> = self
            .index
            .keys()
            .filter(|(s, i, _)| *s == service && *i == instance)
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|(s, i, eg)| self.remove(s, i, eg))
            .collect()
    }

    pub fn find(&self, service: ServiceId, instance: InstanceId, eventgroup: EventgroupId) -> Option<EventgroupHandle> {
        self.index.get(&(service, instance, eventgroup)).copied()
    }

    pub fn get(&self, handle: EventgroupHandle) -> Option<&EventgroupInfo> {
        self.arena.get(handle)
    }

    pub fn get_mut(&mut self, handle: EventgroupHandle) -> Option<&mut EventgroupInfo> {
        self.arena.get_mut(handle)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EventgroupHandle, &mut EventgroupInfo)> {
        self.arena.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EventgroupHandle, &EventgroupInfo)> {
        self.arena.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use someip_proto::{MajorVersion, Ttl};

    #[test]
    fn remove_all_for_service_only_touches_that_service() {
        let mut reg = EventgroupRegistry::new();
        reg.insert(EventgroupInfo::new(ServiceId(1), InstanceId(1), EventgroupId(1), MajorVersion(1), Ttl(3), 0));
        reg.insert(EventgroupInfo::new(ServiceId(1), InstanceId(1), EventgroupId(2), MajorVersion(1), Ttl(3), 0));
        reg.insert(EventgroupInfo::new(ServiceId(2), InstanceId(1), EventgroupId(1), MajorVersion(1), Ttl(3), 0));

        let removed = reg.remove_all_for_service(ServiceId(1), InstanceId(1));
        assert_eq!(removed.len(), 2);
        assert!(reg.find(ServiceId(2), InstanceId(1), EventgroupId(1)).is_some());
    }
}
