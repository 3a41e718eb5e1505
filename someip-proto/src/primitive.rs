//! Fixed-width domain primitives shared by the wire codec and the state
//! machines. service/instance/
//! eventgroup/method/event/client/session are 16-bit, major version is
//! 8-bit, minor version is 32-bit, and TTL is a 24-bit seconds count
//! carried in a 32-bit field.

use std::fmt;

macro_rules! newtype_u16 {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u16);

        impl $name {
            pub const fn new(value: u16) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u16 {
                self.0
            }
        }

        impl From<u16> for $name {
            fn from(value: u16) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u16 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#06x}", self.0)
            }
        }
    };
}

newtype_u16!(ServiceId, "A SOME/IP service identifier.");
newtype_u16!(InstanceId, "A SOME/IP service instance identifier.");
newtype_u16!(EventgroupId, "A SOME/IP eventgroup identifier.");
newtype_u16!(MethodId, "A SOME/IP method identifier.");
newtype_u16!(EventId, "A SOME/IP event identifier.");
newtype_u16!(ClientId, "A 16-bit local or remote client identifier.");
newtype_u16!(SessionId, "A 16-bit SD session counter value.");

/// `service = 0xFFFF` is reserved for the service-discovery PDU itself.
pub const SD_SERVICE: ServiceId = ServiceId(0xFFFF);
/// `method = 0x8100` is the fixed SD method id.
pub const SD_METHOD: MethodId = MethodId(0x8100);
/// Routing-internal pseudo client id used to address "every local
/// subscriber of this event", e.g. in `notify`/`send`.
pub const ROUTING_CLIENT: ClientId = ClientId(0x0000);
/// Sentinel meaning "any event", used by the subscribe-to-any-event policy
/// hook.
pub const ANY_EVENT: EventId = EventId(0xFFFF);
/// Sentinel meaning "any method", used by access-control checks that are
/// not method-specific.
pub const ANY_METHOD: MethodId = MethodId(0xFFFF);

/// An 8-bit SOME/IP major version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MajorVersion(pub u8);

/// A 32-bit SOME/IP minor version. `0xFFFFFFFF` conventionally means "any".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MinorVersion(pub u32);

impl MinorVersion {
    pub const ANY: MinorVersion = MinorVersion(0xFFFF_FFFF);
}

/// A TTL in seconds. The wire representation is 24 bits; values are
/// truncated to `0x00FF_FFFF` on encode. `0` on the wire means "stop" for
/// entries that carry a ttl-as-stop-flag convention (offer/subscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ttl(pub u32);

impl Ttl {
    pub const STOP: Ttl = Ttl(0);
    /// The maximum value representable in the wire's 24-bit field.
    pub const MAX_WIRE: u32 = 0x00FF_FFFF;

    pub const fn is_stop(self) -> bool {
        self.0 == 0
    }

    /// Multiply by a configured factor, saturating at the 24-bit wire
    /// range. Used when installing a remote TTL into a local expiry timer.
    pub fn scaled(self, factor: u32) -> Ttl {
        let factor = factor.max(1);
        Ttl(self.0.saturating_mul(factor).min(Self::MAX_WIRE))
    }
}

/// Transport reliability of a single endpoint or wire entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reliability {
    Reliable,
    Unreliable,
}

impl Reliability {
    pub const fn is_reliable(self) -> bool {
        matches!(self, Reliability::Reliable)
    }
}
