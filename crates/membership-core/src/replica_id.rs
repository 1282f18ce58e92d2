//! Identity of one process's replica of the membership store.
//!
//! Doubles as the Loro peer id of every local document and as the origin
//! tag of locally created gossip, so two processes must never share one.
//! A restarted host gets a fresh id even when it reuses its address.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(u64);

impl ReplicaId {
    /// Draw a random id. Zero is reserved, so it is never returned.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        Self(rng.random_range(1..=u64::MAX))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for ReplicaId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}
