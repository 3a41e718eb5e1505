//! SOME/IP-SD: the service-discovery wire format layered on top of a
//! regular SOME/IP PDU addressed to the reserved SD service/method.

pub mod entry;
pub mod header;
pub mod message;
pub mod option;

pub use entry::{Entry, EventgroupEntry, EventgroupEntryType, OptionRefs, ServiceEntry, ServiceEntryType};
pub use header::SdFlags;
pub use message::SdMessage;
pub use option::{LayerFourProtocol, Option_};
