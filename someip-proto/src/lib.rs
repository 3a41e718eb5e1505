//! Sans-IO data model, wire codecs, and state machines for a SOME/IP
//! routing and service-discovery core.
//!
//! This crate never touches a socket or spawns a task: every type here is
//! driven by an owning component (in the `someip` crate) that supplies the
//! current time and forwards bytes in both directions. That split mirrors
//! `quinn-proto`'s relationship to `quinn`.

#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod arena;
pub mod config;
pub mod endpoint_def;
pub mod error;
pub mod event;
pub mod eventgroup;
pub mod header;
pub mod ipc;
pub mod phase;
pub mod primitive;
pub mod request;
pub mod sd;
pub mod service_info;
pub mod session;
pub mod subscription;

pub use arena::{Arena, Handle};
pub use config::{SdTimers, TtlFactors};
pub use endpoint_def::{EndpointDefinition, EndpointDefinitionKey, EndpointDefinitionTable};
pub use error::{CodecError, ConfigError};
pub use event::{DebounceFilter, Event, EventKind, UpdateOutcome};
pub use eventgroup::{
    ClientSubscriptionState, EventgroupInfo, ReliabilityMode, RemoteSubscription,
    RemoteSubscriptionId, PENDING_SUBSCRIPTION_ID,
};
pub use header::{MessageType, ReturnCode, SomeIpHeader, HEADER_LEN, PROTOCOL_VERSION};
pub use ipc::{CommandCode, CommandFrame};
pub use phase::Phase;
pub use primitive::{
    ClientId, EventId, EventgroupId, InstanceId, MajorVersion, MethodId, MinorVersion,
    Reliability, ServiceId, SessionId, Ttl, ANY_EVENT, ANY_METHOD, ROUTING_CLIENT, SD_METHOD,
    SD_SERVICE,
};
pub use request::Request;
pub use service_info::ServiceInfo;
pub use session::{RebootTracker, SessionDirection, SessionState};
pub use subscription::{LocalSubscriptionState, Subscription};

pub type EndpointHandle = Handle<EndpointDefinition>;
pub type EventHandle = Handle<Event>;
pub type EventgroupHandle = Handle<EventgroupInfo>;
pub type ServiceHandle = Handle<ServiceInfo>;
