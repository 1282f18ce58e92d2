//! Cluster message kinds.
//!
//! **Failure detection:** `Ping`/`Ack` for direct probes, `PingReq` asks a
//! helper to probe a target for us and `IndirectAck` relays the outcome.
//!
//! **State exchange:** `Join` and `Heal` open a symmetric exchange: the
//! receiver answers with `Exchange` (updates the requester is missing plus
//! its own version vectors), and the requester closes with `Response`
//! carrying whatever the receiver lacks.
//!
//! **Dissemination:** gossip items ride piggybacked on every envelope.
//! `Store` carries a replicated-store delta directly to one peer.

use crate::{HostEndpoint, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique id of a gossip item: originating replica + sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GossipId {
    pub origin: ReplicaId,
    pub seq: u64,
}

/// A delta produced by a replicated map, tagged with the map's uri.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreUpdate {
    pub uri: String,
    pub updates: Vec<u8>,
}

/// Encoded version vectors of every replicated map (uri -> version).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDigest {
    pub versions: BTreeMap<String, Vec<u8>>,
}

/// Encoded updates for several replicated maps (uri -> update bytes).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreUpdates {
    pub updates: BTreeMap<String, Vec<u8>>,
}

impl StoreUpdates {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// What a gossip item announces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipPayload {
    /// `suspector` failed to reach `target`
    Suspect {
        target: HostEndpoint,
        suspector: HostEndpoint,
    },
    /// `endpoint` is alive (sent by the endpoint itself to refute suspicion)
    Alive { endpoint: HostEndpoint },
    /// A replicated-store delta
    Delta(StoreUpdate),
}

/// A gossip item as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gossip {
    pub id: GossipId,
    pub payload: GossipPayload,
}

/// Which exchange an `Exchange` reply belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeKind {
    Join,
    Heal,
}

/// The single message carried by an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterMessage {
    /// Direct probe of `target`
    Ping { seq: u64, target: HostEndpoint },
    Ack { seq: u64 },
    /// Ask the receiver to probe `target` on the sender's behalf
    PingReq { seq: u64, target: HostEndpoint },
    /// Outcome of a `PingReq` (`alive: false` is a nack)
    IndirectAck {
        seq: u64,
        target: HostEndpoint,
        alive: bool,
    },
    /// Announce self to a seed, carrying the full local state
    Join {
        digest: StoreDigest,
        updates: StoreUpdates,
    },
    /// Anti-entropy request
    Heal { digest: StoreDigest },
    /// Reply to `Join`/`Heal`
    Exchange {
        kind: ExchangeKind,
        response: StoreUpdates,
        request: StoreDigest,
    },
    /// Final leg of an exchange
    Response { updates: StoreUpdates },
    Store(StoreUpdate),
    /// Carrier for piggybacked gossip only
    Gossip,
}

impl ClusterMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterMessage::Ping { .. } => "ping",
            ClusterMessage::Ack { .. } => "ack",
            ClusterMessage::PingReq { .. } => "ping-req",
            ClusterMessage::IndirectAck { .. } => "indirect-ack",
            ClusterMessage::Join { .. } => "join",
            ClusterMessage::Heal { .. } => "heal",
            ClusterMessage::Exchange { .. } => "exchange",
            ClusterMessage::Response { .. } => "response",
            ClusterMessage::Store(_) => "store",
            ClusterMessage::Gossip => "gossip",
        }
    }
}
