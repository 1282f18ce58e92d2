//! Gossip retransmission queue.
//!
//! Holds gossip items waiting to be piggybacked on outgoing envelopes.
//! Each item remembers which peers already have it (the peer it came from
//! and every peer it was sent to) and is never sent to them again. An item
//! is retired once it has gone to `limit` distinct peers, or once every
//! current peer has it. Items received from peers are de-duplicated by id
//! and re-queued so they keep spreading.

use crate::ReplicaId;
use crate::protocol::{Gossip, GossipId, GossipPayload};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;

/// Maximum number of queued gossip items before the most-sent are dropped
const MAX_GOSSIP_QUEUE_SIZE: usize = 256;

/// Number of gossip ids remembered for de-duplication
const SEEN_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
struct Pending {
    gossip: Gossip,
    transmits: usize,
    known: HashSet<SocketAddr>,
}

pub struct GossipQueue {
    origin: ReplicaId,
    next_seq: u64,
    pending: Vec<Pending>,
    seen: HashSet<GossipId>,
    seen_order: VecDeque<GossipId>,
}

impl GossipQueue {
    pub fn new(origin: ReplicaId) -> Self {
        Self {
            origin,
            next_seq: 1,
            pending: Vec::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queue a locally originated item.
    pub fn enqueue(&mut self, payload: GossipPayload) -> GossipId {
        let id = GossipId {
            origin: self.origin,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.remember(id);
        self.push(Gossip { id, payload }, HashSet::new());
        id
    }

    /// Offer an item received from the peer at `from`.
    ///
    /// Returns true if it had not been seen before (and is now queued).
    /// A duplicate still teaches us that `from` has the item.
    pub fn offer(&mut self, gossip: Gossip, from: SocketAddr) -> bool {
        if self.seen.contains(&gossip.id) {
            if let Some(pending) = self.pending.iter_mut().find(|p| p.gossip.id == gossip.id) {
                pending.known.insert(from);
            }
            return false;
        }
        self.remember(gossip.id);
        self.push(gossip, [from].into_iter().collect());
        true
    }

    /// Up to `max_items` items `peer` doesn't have yet, least-transmitted first.
    ///
    /// Nothing is charged until [`GossipQueue::mark_sent`].
    pub fn select_for(&self, peer: SocketAddr, max_items: usize) -> Vec<Gossip> {
        let mut eligible: Vec<&Pending> = self
            .pending
            .iter()
            .filter(|p| !p.known.contains(&peer))
            .collect();
        eligible.sort_by_key(|p| p.transmits);
        eligible
            .into_iter()
            .take(max_items)
            .map(|p| p.gossip.clone())
            .collect()
    }

    /// The items `ids` went out to `peer`.
    pub fn mark_sent(&mut self, ids: &[GossipId], peer: SocketAddr) {
        for pending in self.pending.iter_mut() {
            if ids.contains(&pending.gossip.id) && pending.known.insert(peer) {
                pending.transmits += 1;
            }
        }
    }

    /// Retire items sent to `limit` distinct peers, or known to all `peers`.
    ///
    /// With no peers at all nothing is retired; the items wait for a join.
    pub fn retire(&mut self, limit: usize, peers: usize) {
        let limit = limit.max(1);
        self.pending
            .retain(|p| p.transmits < limit && (peers == 0 || p.known.len() < peers));
    }

    /// Drop an item that can never be sent.
    pub fn discard(&mut self, id: GossipId) {
        self.pending.retain(|p| p.gossip.id != id);
    }

    fn push(&mut self, gossip: Gossip, known: HashSet<SocketAddr>) {
        self.pending.push(Pending {
            gossip,
            transmits: 0,
            known,
        });
        if self.pending.len() > MAX_GOSSIP_QUEUE_SIZE {
            self.pending.sort_by_key(|p| p.transmits);
            self.pending.truncate(MAX_GOSSIP_QUEUE_SIZE);
        }
    }

    fn remember(&mut self, id: GossipId) {
        if self.seen.insert(id) {
            self.seen_order.push_back(id);
            if self.seen_order.len() > SEEN_CAPACITY {
                if let Some(oldest) = self.seen_order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
    }
}
