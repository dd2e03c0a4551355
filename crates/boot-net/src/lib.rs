//! Network capabilities used during early guest boot.
//!
//! The boot orchestrator never talks to the kernel's networking subsystem
//! directly. It builds a [`NetworkStack`] once, in a fixed dependency order:
//!
//! 1. [`SysClient`] - raw namespace syscalls (`unshare`, `setns`, pinning)
//! 2. [`IpClient`] - link/address/route configuration through `ip`
//! 3. [`NamespaceManager`] - named network namespaces and switching
//! 4. [`InterfaceManager`] - veth pairs, addresses, routes
//! 5. [`NamespaceAwareExecutor`] - runs helper programs inside a namespace
//!
//! and then drives it through the handful of operations the boot pipeline
//! needs.

mod command;
mod config;
mod error;
mod executor;
mod interface;
mod namespace;
mod setup;
mod sys;

pub use command::CommandError;
pub use config::NetworkConfig;
pub use error::{NetworkError, Result};
pub use executor::NamespaceAwareExecutor;
pub use interface::{InterfaceManager, IpClient};
pub use namespace::NamespaceManager;
pub use setup::NetworkStack;
pub use sys::SysClient;
