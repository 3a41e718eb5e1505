//! Arenas and lookup indices for everything the routing manager tracks:
//! offered services, their eventgroups, and their events.

pub mod eventgroups;
pub mod events;
pub mod services;

pub use eventgroups::EventgroupRegistry;
pub use events::EventRegistry;
pub use services::ServiceRegistry;
