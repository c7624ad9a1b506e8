//! Proxy core — aggregates tools from many backends behind one catalog.
//!
//! This module handles:
//! - Transports: line-delimited JSON-RPC over child stdio, or a remote
//!   event stream paired with POSTed requests
//! - Backend sessions: handshake, tool discovery, health and reconnects
//! - Child process supervision for subprocess backends
//! - The shared tool registry with namespacing and alias collision policy
//! - Request routing with a front-end-facing timeout
//!
//! Startup flows config → sessions → registry; at runtime the router reads
//! the registry and calls into sessions, and sessions republish their tools
//! after every reconnect.

pub mod config;
pub mod errors;
pub mod manager;
pub mod registry;
pub mod router;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::{load_config, BackendDescriptor, BackendKind, ProxyConfig};
pub use errors::{RouteError, RoutingError, StartError, ToolError};
pub use manager::{BackendStatus, ProxyManager};
pub use registry::ToolRegistry;
pub use router::RequestRouter;
pub use session::{BackendSession, SessionState};
pub use types::ToolDescriptor;
