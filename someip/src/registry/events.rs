//! Event registry: owns the [`Event`] arena and the index from
//! `(service, instance, event)` to its handle.

use rustc_hash::FxHashMap;
use someip_proto::{Arena, Event, EventHandle, EventId, InstanceId, ServiceId};

#[derive(Debug, Default)]
pub struct EventRegistry {
    arena: Arena<Event>,
    index: FxHashMap<(ServiceId, InstanceId, EventId), EventHandle>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: ServiceId, instance: InstanceId, event: Event) -> EventHandle {
        let key = (service, instance, event.id);
        let handle = self.arena.insert(event);
        self.index.insert(key, handle);
        handle
    }

    pub fn find(&self, service: ServiceId, instance: InstanceId, event: EventId) -> Option<EventHandle> {
        self.index.get(&(service, instance, event)).copied()
    }

    pub fn get(&self, handle: EventHandle) -> Option<&Event> {
        self.arena.get(handle)
    }

    pub fn get_mut(&mut self, handle: EventHandle) -> Option<&mut Event> {
        self.arena.get_mut(handle)
    }

    pub fn remove_all_for_service(&mut self, service: ServiceId, instance: InstanceId) {
        let keys: Vec<_> = self
            .index
            .keys()
            .filter(|(s, i, _)| *s == service && *i == instance)
            .copied()
            .collect();
        for key in keys {
            if let Some(handle) = self.index.remove(&key) {
                self.arena.remove(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use someip_proto::{EventKind, Reliability};

    #[test]
    fn insert_then_find() {
        let mut reg = EventRegistry::new();
        let h = reg.insert(
            ServiceId(1),
            InstanceId(1),
            Event::new(EventId(1), Reliability::Unreliable, EventKind::Event),
        );
        assert_eq!(reg.find(ServiceId(1), InstanceId(1), EventId(1)), Some(h));
    }
}
