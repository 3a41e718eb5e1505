//! Endpoint-definitions: interned `(address, port, reliable, service,
//! instance)` tuples used to address remote parties without owning a
//! transport.

use std::net::IpAddr;

use rustc_hash::FxHashMap;

use crate::arena::Arena;
use crate::primitive::{InstanceId, Reliability, ServiceId};
use crate::EndpointHandle;

/// The interning key. Two requests for the same tuple return the same
/// [`EndpointHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointDefinitionKey {
    pub address: IpAddr,
    pub port: u16,
    pub reliable: bool,
    pub service: ServiceId,
    pub instance: InstanceId,
    /// Distinguishes otherwise-identical endpoint tuples that belong to
    /// independent SD partitions sharing one host; `0` when the local
    /// configuration has no partitioning in use.
    pub partition_id: u16,
}

/// An interned endpoint-definition. Never owns transport state; carries a
/// mutable `remote_port`, learned when a peer's ephemeral source port
/// differs from the port it offered on (dynamic port learning).
#[derive(Debug)]
pub struct EndpointDefinition {
    pub key: EndpointDefinitionKey,
    remote_port: u16,
}

impl EndpointDefinition {
    pub fn address(&self) -> IpAddr {
        self.key.address
    }

    pub fn port(&self) -> u16 {
        self.key.port
    }

    pub fn reliability(&self) -> Reliability {
        if self.key.reliable {
            Reliability::Reliable
        } else {
            Reliability::Unreliable
        }
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn set_remote_port(&mut self, port: u16) {
        self.remote_port = port;
    }
}

/// Global intern table: `(address, port, reliable, service, instance) ->
/// EndpointHandle`. Grounded on the `quinn-proto` pattern of keeping
/// handle-stable storage in a `slab`-backed arena rather than a web of
/// `shared_ptr`.
#[derive(Debug, Default)]
pub struct EndpointDefinitionTable {
    arena: Arena<EndpointDefinition>,
    index: FxHashMap<EndpointDefinitionKey, EndpointHandle>,
}

impl EndpointDefinitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing handle for `key`, or interns a new one.
    pub fn intern(&mut self, key: EndpointDefinitionKey) -> EndpointHandle {
        if let Some(handle) = self.index.get(&key) {
            return *handle;
        }
        let handle = self.arena.insert(EndpointDefinition {
            key,
            remote_port: key.port,
        });
        self.index.insert(key, handle);
        handle
    }

    pub fn get(&self, handle: EndpointHandle) -> Option<&EndpointDefinition> {
        self.arena.get(handle)
    }

    pub fn get_mut(&mut self, handle: EndpointHandle) -> Option<&mut EndpointDefinition> {
        self.arena.get_mut(handle)
    }

    pub fn lookup(&self, key: &EndpointDefinitionKey) -> Option<EndpointHandle> {
        self.index.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(port: u16) -> EndpointDefinitionKey {
        EndpointDefinitionKey {
            address: "192.0.2.1".parse().unwrap(),
            port,
            reliable: true,
            service: ServiceId(0x1234),
            instance: InstanceId(0x5678),
            partition_id: 0,
        }
    }

    #[test]
    fn different_partition_ids_intern_distinct_handles_for_identical_tuples() {
        let mut table = EndpointDefinitionTable::new();
        let a = table.intern(key(30501));
        let mut other = key(30501);
        other.partition_id = 1;
        let b = table.intern(other);
        assert_ne!(a, b);
    }

    #[test]
    fn interning_returns_same_handle_for_equal_tuples() {
        let mut table = EndpointDefinitionTable::new();
        let a = table.intern(key(30501));
        let b = table.intern(key(30501));
        assert_eq!(a, b);
        let c = table.intern(key(30502));
        assert_ne!(a, c);
    }

    #[test]
    fn remote_port_is_mutable_after_interning() {
        let mut table = EndpointDefinitionTable::new();
        let h = table.intern(key(30501));
        table.get_mut(h).unwrap().set_remote_port(40000);
        assert_eq!(table.get(h).unwrap().remote_port(), 40000);
        // identity/key are unaffected
        assert_eq!(table.get(h).unwrap().port(), 30501);
    }
}
