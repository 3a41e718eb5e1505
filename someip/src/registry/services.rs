//! Offered-service registry: owns the [`ServiceInfo`] arena and the index
//! from `(service, instance)` to its handle.

use rustc_hash::FxHashMap;
use someip_proto::{Arena, InstanceId, ServiceHandle, ServiceId, ServiceInfo};

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    arena: Arena<ServiceInfo>,
    index: FxHashMap<(ServiceId, InstanceId), ServiceHandle>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: ServiceInfo) -> ServiceHandle {
        let key = (info.service, info.instance);
        let handle = self.arena.insert(info);
        self.index.insert(key, handle);
        handle
    }

    pub fn remove(&mut self, service: ServiceId, instance: InstanceId) -> Option<ServiceInfo> {
        let handle = self.index.remove(&(service, instance))?;
        self.arena.remove(handle)
    }

    pub fn find(&self, service: ServiceId, instance: InstanceId) -> Option<ServiceHandle> {
        self.index.get(&(service, instance)).copied()
    }

    pub fn get(&self, handle: ServiceHandle) -> Option<&ServiceInfo> {
        self.arena.get(handle)
    }

    pub fn get_mut(&mut self, handle: ServiceHandle) -> Option<&mut ServiceInfo> {
        self.arena.get_mut(handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ServiceHandle, &ServiceInfo)> {
        self.arena.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use someip_proto::{MajorVersion, MinorVersion, Ttl};

    #[test]
    fn insert_then_find_then_remove() {
        let mut reg = ServiceRegistry::new();
        let h = reg.insert(ServiceInfo::new(
            ServiceId(1),
            InstanceId(1),
            MajorVersion(1),
            MinorVersion(0),
            Ttl(3),
        ));
        assert_eq!(reg.find(ServiceId(1), InstanceId(1)), Some(h));
        reg.remove(ServiceId(1), InstanceId(1));
        assert_eq!(reg.find(ServiceId(1), InstanceId(1)), None);
        assert!(reg.get(h).is_none());
    }
}
