//! Cluster envelope and its binary codec.
//!
//! Every datagram carries exactly one envelope. The envelope names the
//! cluster environment and the sending endpoint, holds one message, and
//! piggybacks any number of gossip items.

use super::{ClusterMessage, Gossip};
use crate::HostEndpoint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest payload that fits a single UDP datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    #[error("Failed to decode envelope: {0}")]
    Decode(String),

    #[error("Envelope too large: {0} bytes")]
    TooLarge(usize),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub env: String,
    pub sender: HostEndpoint,
    pub message: ClusterMessage,
    #[serde(default)]
    pub gossip: Vec<Gossip>,
}

impl Envelope {
    pub fn new(env: impl Into<String>, sender: HostEndpoint, message: ClusterMessage) -> Self {
        Self {
            env: env.into(),
            sender,
            message,
            gossip: Vec::new(),
        }
    }

    pub fn with_gossip(mut self, gossip: Vec<Gossip>) -> Self {
        self.gossip = gossip;
        self
    }

    /// Serialize to bincode, refusing anything that won't fit a datagram.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{GossipId, GossipPayload, StoreUpdate};
    use crate::ReplicaId;

    fn endpoint(port: u16) -> HostEndpoint {
        HostEndpoint::new("127.0.0.1", port, 7)
    }

    #[test]
    fn test_encode_decode_with_gossip() {
        let gossip = Gossip {
            id: GossipId {
                origin: ReplicaId::from(0xabcdef),
                seq: 3,
            },
            payload: GossipPayload::Delta(StoreUpdate {
                uri: "membership".to_string(),
                updates: vec![1, 2, 3],
            }),
        };
        let envelope = Envelope::new(
            "dev",
            endpoint(7000),
            ClusterMessage::Ping {
                seq: 9,
                target: endpoint(7001),
            },
        )
        .with_gossip(vec![gossip]);

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            Envelope::decode(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let envelope = Envelope::new(
            "dev",
            endpoint(7000),
            ClusterMessage::Store(StoreUpdate {
                uri: "membership".to_string(),
                updates: vec![0; MAX_DATAGRAM_SIZE],
            }),
        );
        assert!(matches!(envelope.encode(), Err(ProtocolError::TooLarge(_))));
    }
}
