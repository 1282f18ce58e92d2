//! agent-host: the tokio runtime around `membership-core`.
//!
//! Owns the network and the clock. The [`AgentHost`] facade spawns one
//! scheduler task that drives the sans-IO membership components.

pub mod agent;
pub mod cli;
pub mod error;
pub mod host;
pub mod messenger;
mod scheduler;
pub mod transport;

// Re-export key types for convenience
pub use agent::Agent;
pub use error::{HostError, Result};
pub use host::{AgentHost, HostState};
pub use messenger::{Inbound, Messenger};
pub use transport::{
    Delivery, MemoryNetwork, MemoryTransport, Transport, TransportError, UdpTransport,
};
