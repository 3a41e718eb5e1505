//! The routing manager: [`host::RoutingManagerHost`] owns all
//! state and runs as a single task, [`client::RoutingManagerClient`] is the
//! cheaply-`Clone`able handle every caller actually holds.

pub mod access_control;
pub mod client;
pub mod command;
pub mod host;
#[cfg(unix)]
pub(crate) mod ipc;

pub use client::RoutingManagerClient;
pub use command::{ClientEvent, Command};
pub use host::RoutingManagerHost;
