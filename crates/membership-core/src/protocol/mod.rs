//! Wire protocol between agent hosts.
//!
//! One bincode-encoded [`Envelope`] per datagram.

pub mod envelope;
pub mod message;

pub use envelope::{Envelope, MAX_DATAGRAM_SIZE, ProtocolError};
pub use message::{
    ClusterMessage, ExchangeKind, Gossip, GossipId, GossipPayload, StoreDigest, StoreUpdate,
    StoreUpdates,
};
