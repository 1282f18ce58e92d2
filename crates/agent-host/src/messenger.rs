//! Messenger: envelope I/O plus gossip piggybacking.
//!
//! Every outgoing envelope carries up to `gossip_fanout_per_period` pending
//! gossip items the receiver doesn't have yet; as many as fit in one
//! datagram. An item is charged a transmit only once the envelope carrying
//! it has left, at most once per peer. Inbound datagrams are read by a background task and handed
//! to the scheduler as raw bytes; [`Messenger::accept`] decodes them and
//! filters out foreign environments, our own echoes and duplicate gossip.

use crate::transport::{Delivery, Transport, TransportError};
use futures::future::join_all;
use membership_core::protocol::GossipId;
use membership_core::{
    AgentHostOptions, Awareness, ClusterMessage, Envelope, Gossip, GossipPayload, GossipQueue,
    HostEndpoint, ProtocolError, ReplicaId,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Inbound datagrams buffered between the reader task and the scheduler.
const INBOUND_BUFFER: usize = 1024;

/// Inbound envelopes buffered for each observer.
const OBSERVER_BUFFER: usize = 256;

/// A decoded envelope and the gossip it carried that we hadn't seen yet.
#[derive(Debug)]
pub struct Inbound {
    pub envelope: Envelope,
    pub fresh: Vec<GossipPayload>,
}

pub struct Messenger {
    env: String,
    local: HostEndpoint,
    transport: Arc<dyn Transport>,
    gossip: GossipQueue,
    fanout: usize,
    per_envelope: usize,
    retransmit_multiplier: u32,
    retransmit_limit: usize,
    /// Other members; items every one of them has are retired
    peers: usize,
    observers: broadcast::Sender<Envelope>,
    reader: Option<JoinHandle<()>>,
}

impl Messenger {
    pub fn new(
        options: &AgentHostOptions,
        local: HostEndpoint,
        replica: ReplicaId,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_BUFFER);
        let awareness = Awareness::new(options.awareness_max_multiplier);

        Self {
            env: options.env.clone(),
            local,
            transport,
            gossip: GossipQueue::new(replica),
            fanout: options.gossip_fanout,
            per_envelope: options.gossip_fanout_per_period,
            retransmit_multiplier: options.retransmit_multiplier,
            retransmit_limit: awareness.retransmit_limit(
                options.gossip_fanout_per_period,
                options.retransmit_multiplier,
                1,
            ),
            peers: 0,
            observers,
            reader: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }

    pub fn set_local(&mut self, local: HostEndpoint) {
        self.local = local;
    }

    pub fn pending_gossip(&self) -> usize {
        self.gossip.len()
    }

    pub fn retransmit_limit(&self) -> usize {
        self.retransmit_limit
    }

    /// Spawn the reader task. Returns the stream of raw inbound datagrams.
    pub fn start(&mut self) -> mpsc::Receiver<(Vec<u8>, SocketAddr)> {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let transport = self.transport.clone();

        let reader = tokio::spawn(async move {
            loop {
                match transport.recv().await {
                    Ok(datagram) => {
                        if tx.send(datagram).await.is_err() {
                            break;
                        }
                    }
                    Err(TransportError::Closed) => break,
                    Err(e) => {
                        debug!("Receive failed: {}", e);
                    }
                }
            }
            trace!("Reader task exiting");
        });

        self.reader = Some(reader);
        rx
    }

    /// Observe every accepted inbound envelope.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.observers.subscribe()
    }

    pub fn observers(&self) -> broadcast::Sender<Envelope> {
        self.observers.clone()
    }

    /// Recompute the retransmit limit for the current health and size.
    pub fn tune(&mut self, awareness: &Awareness, cluster_size: usize) {
        self.retransmit_limit =
            awareness.retransmit_limit(self.per_envelope, self.retransmit_multiplier, cluster_size);
        self.peers = cluster_size.saturating_sub(1);
    }

    /// Queue a gossip item for dissemination.
    pub fn broadcast(&mut self, payload: GossipPayload) {
        let id = self.gossip.enqueue(payload);
        trace!("Queued gossip {}:{}", id.origin, id.seq);
    }

    /// Send `message` to `dest` with piggybacked gossip.
    ///
    /// Returns false if the envelope could not be encoded or the transport
    /// refused it; failures are logged, never fatal.
    pub async fn send(&mut self, message: ClusterMessage, dest: SocketAddr, delivery: Delivery) -> bool {
        let Some((payload, carried)) = self.seal(message, dest) else {
            return false;
        };

        match self.transport.send(&payload, dest, delivery).await {
            Ok(()) => {
                if !carried.is_empty() {
                    self.gossip.mark_sent(&carried, dest);
                    self.gossip.retire(self.retransmit_limit, self.peers);
                }
                true
            }
            Err(e) => {
                debug!("Send to {} failed: {}", dest, e);
                false
            }
        }
    }

    /// Push pending gossip to `targets` on bare carrier envelopes.
    ///
    /// Every target gets what it is missing before any item is retired, so
    /// one round always reaches the whole fanout.
    pub async fn spread(&mut self, targets: &[SocketAddr]) {
        if self.gossip.is_empty() || targets.is_empty() {
            return;
        }

        let mut outgoing = Vec::with_capacity(targets.len());
        for target in targets {
            match self.seal(ClusterMessage::Gossip, *target) {
                Some((payload, carried)) if !carried.is_empty() => {
                    outgoing.push((payload, carried, *target));
                }
                _ => {}
            }
        }

        let transport = &self.transport;
        let results = join_all(
            outgoing
                .iter()
                .map(|(payload, _, target)| transport.send(payload, *target, Delivery::BestEffort)),
        )
        .await;

        for ((_, carried, target), result) in outgoing.iter().zip(results) {
            match result {
                Ok(()) => self.gossip.mark_sent(carried, *target),
                Err(e) => debug!("Gossip to {} failed: {}", target, e),
            }
        }
        self.gossip.retire(self.retransmit_limit, self.peers);
    }

    /// Decode an inbound datagram.
    ///
    /// Returns `None` for garbage, other environments and our own echoes.
    pub fn accept(&mut self, data: &[u8], from: SocketAddr) -> Option<Inbound> {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping undecodable datagram from {}: {}", from, e);
                return None;
            }
        };

        if envelope.env != self.env {
            debug!(
                "Dropping {} from {} in env '{}'",
                envelope.message.kind(),
                from,
                envelope.env
            );
            return None;
        }

        if envelope.sender == self.local {
            return None;
        }

        trace!("Received {} from {}", envelope.message.kind(), envelope.sender);

        let fresh = envelope
            .gossip
            .iter()
            .filter(|gossip| self.gossip.offer((*gossip).clone(), from))
            .map(|gossip| gossip.payload.clone())
            .collect();

        if self.observers.receiver_count() > 0 {
            let _ = self.observers.send(envelope.clone());
        }

        Some(Inbound { envelope, fresh })
    }

    /// Stop reading and release the transport.
    pub async fn shutdown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.transport.shutdown().await;
    }

    /// Encode `message` for `dest` with as much pending gossip as fits.
    ///
    /// Returns the datagram and the ids of the gossip it carries. Gossip is
    /// halved until the envelope fits; an item too large to travel even on
    /// its own is discarded.
    fn seal(&mut self, message: ClusterMessage, dest: SocketAddr) -> Option<(Vec<u8>, Vec<GossipId>)> {
        let kind = message.kind();
        let gossip = self.gossip.select_for(dest, self.per_envelope);
        let mut envelope = Envelope::new(self.env.clone(), self.local.clone(), message).with_gossip(gossip);

        loop {
            match envelope.encode() {
                Ok(payload) => {
                    let carried = envelope.gossip.iter().map(|g| g.id).collect();
                    return Some((payload, carried));
                }
                Err(ProtocolError::TooLarge(size)) if !envelope.gossip.is_empty() => {
                    if let [only] = envelope.gossip.as_slice() {
                        if !self.fits_alone(only) {
                            warn!(
                                "Discarding gossip {}:{} too large for any datagram",
                                only.id.origin, only.id.seq
                            );
                            self.gossip.discard(only.id);
                        }
                    }
                    trace!(
                        "{} with {} gossip items is {} bytes, shrinking",
                        kind,
                        envelope.gossip.len(),
                        size
                    );
                    let keep = envelope.gossip.len() / 2;
                    envelope.gossip.truncate(keep);
                }
                Err(e) => {
                    warn!("Failed to encode {}: {}", kind, e);
                    return None;
                }
            }
        }
    }

    /// Whether `gossip` fits in a datagram on a bare carrier envelope.
    fn fits_alone(&self, gossip: &Gossip) -> bool {
        let carrier = Envelope::new(self.env.clone(), self.local.clone(), ClusterMessage::Gossip)
            .with_gossip(vec![gossip.clone()]);
        !matches!(carrier.encode(), Err(ProtocolError::TooLarge(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use membership_core::protocol::{MAX_DATAGRAM_SIZE, StoreUpdate};
    use std::net::IpAddr;

    fn localhost() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    fn messenger(network: &MemoryNetwork, env: &str, replica: u64) -> Messenger {
        let options = AgentHostOptions {
            env: env.to_string(),
            ..Default::default()
        };
        messenger_with(network, &options, replica)
    }

    fn messenger_with(network: &MemoryNetwork, options: &AgentHostOptions, replica: u64) -> Messenger {
        let transport = Arc::new(network.bind(localhost(), 0).unwrap());
        let port = transport.local_addr().port();
        Messenger::new(
            options,
            HostEndpoint::new("127.0.0.1", port, 1),
            ReplicaId::from(replica),
            transport,
        )
    }

    fn delta(size: usize) -> GossipPayload {
        GossipPayload::Delta(StoreUpdate {
            uri: "membership".to_string(),
            updates: vec![7; size],
        })
    }

    fn suspect_payload() -> GossipPayload {
        GossipPayload::Suspect {
            target: HostEndpoint::new("127.0.0.1", 9999, 1),
            suspector: HostEndpoint::new("127.0.0.1", 9998, 1),
        }
    }

    // ==================== Send / Accept ====================

    #[tokio::test]
    async fn test_send_and_accept() {
        let network = MemoryNetwork::new();
        let mut a = messenger(&network, "dev", 1);
        let mut b = messenger(&network, "dev", 2);
        let mut inbound = b.start();

        let sent = a
            .send(ClusterMessage::Ack { seq: 7 }, b.local_addr(), Delivery::BestEffort)
            .await;
        assert!(sent);

        let (data, from) = inbound.recv().await.unwrap();
        assert_eq!(from, a.local_addr());
        let accepted = b.accept(&data, from).unwrap();
        assert_eq!(accepted.envelope.message, ClusterMessage::Ack { seq: 7 });
        assert_eq!(accepted.envelope.sender.port, a.local_addr().port());
    }

    #[tokio::test]
    async fn test_other_env_dropped() {
        let network = MemoryNetwork::new();
        let mut a = messenger(&network, "prod", 1);
        let mut b = messenger(&network, "dev", 2);
        let mut inbound = b.start();

        a.send(ClusterMessage::Gossip, b.local_addr(), Delivery::BestEffort)
            .await;
        let (data, from) = inbound.recv().await.unwrap();
        assert!(b.accept(&data, from).is_none());
    }

    #[tokio::test]
    async fn test_garbage_dropped() {
        let network = MemoryNetwork::new();
        let mut b = messenger(&network, "dev", 2);
        assert!(b.accept(b"not an envelope", localhost_addr()).is_none());
    }

    fn localhost_addr() -> SocketAddr {
        SocketAddr::new(localhost(), 1234)
    }

    // ==================== Gossip ====================

    #[tokio::test]
    async fn test_gossip_piggybacked_once_per_receiver() {
        let network = MemoryNetwork::new();
        let mut a = messenger(&network, "dev", 1);
        let mut b = messenger(&network, "dev", 2);
        let mut inbound = b.start();

        a.broadcast(suspect_payload());
        a.send(ClusterMessage::Ack { seq: 1 }, b.local_addr(), Delivery::BestEffort)
            .await;
        a.send(ClusterMessage::Ack { seq: 2 }, b.local_addr(), Delivery::BestEffort)
            .await;

        let (data, from) = inbound.recv().await.unwrap();
        let first = b.accept(&data, from).unwrap();
        assert_eq!(first.fresh, vec![suspect_payload()]);

        let (data, from) = inbound.recv().await.unwrap();
        let second = b.accept(&data, from).unwrap();
        assert!(second.envelope.gossip.is_empty());
        assert!(second.fresh.is_empty());

        // Fresh gossip is queued for onward dissemination
        assert_eq!(b.pending_gossip(), 1);
    }

    #[tokio::test]
    async fn test_gossip_not_sent_back_to_sender() {
        let network = MemoryNetwork::new();
        let mut a = messenger(&network, "dev", 1);
        let mut b = messenger(&network, "dev", 2);
        let mut c = messenger(&network, "dev", 3);
        let mut a_inbound = a.start();
        let mut b_inbound = b.start();
        let mut c_inbound = c.start();

        a.broadcast(suspect_payload());
        a.send(ClusterMessage::Ack { seq: 1 }, b.local_addr(), Delivery::BestEffort)
            .await;
        let (data, from) = b_inbound.recv().await.unwrap();
        assert_eq!(b.accept(&data, from).unwrap().fresh.len(), 1);

        b.send(ClusterMessage::Ack { seq: 2 }, a.local_addr(), Delivery::BestEffort)
            .await;
        let (data, from) = a_inbound.recv().await.unwrap();
        assert!(a.accept(&data, from).unwrap().envelope.gossip.is_empty());

        // Onward to someone who lacks it
        b.send(ClusterMessage::Ack { seq: 3 }, c.local_addr(), Delivery::BestEffort)
            .await;
        let (data, from) = c_inbound.recv().await.unwrap();
        assert_eq!(c.accept(&data, from).unwrap().fresh, vec![suspect_payload()]);
    }

    #[tokio::test]
    async fn test_spread_round_reaches_fanout_before_retiring() {
        let network = MemoryNetwork::new();
        let options = AgentHostOptions {
            retransmit_multiplier: 1,
            ..Default::default()
        };
        let mut a = messenger_with(&network, &options, 1);
        let mut b = messenger(&network, "dev", 2);
        let mut c = messenger(&network, "dev", 3);
        let mut b_inbound = b.start();
        let mut c_inbound = c.start();

        a.tune(&Awareness::new(8), 5);
        assert_eq!(a.retransmit_limit(), 1);

        a.broadcast(suspect_payload());
        a.spread(&[b.local_addr(), c.local_addr()]).await;

        let (data, from) = b_inbound.recv().await.unwrap();
        assert_eq!(b.accept(&data, from).unwrap().fresh.len(), 1);
        let (data, from) = c_inbound.recv().await.unwrap();
        assert_eq!(c.accept(&data, from).unwrap().fresh.len(), 1);

        // Limit applied after the round
        assert_eq!(a.pending_gossip(), 0);
    }

    #[tokio::test]
    async fn test_gossip_retired_once_every_peer_has_it() {
        let network = MemoryNetwork::new();
        let mut a = messenger(&network, "dev", 1);
        let b = messenger(&network, "dev", 2);
        let c = messenger(&network, "dev", 3);

        a.tune(&Awareness::new(8), 3);
        a.broadcast(suspect_payload());
        a.spread(&[b.local_addr()]).await;
        assert_eq!(a.pending_gossip(), 1);

        // Nothing new for b: no carrier sent
        a.spread(&[b.local_addr()]).await;
        assert_eq!(a.pending_gossip(), 1);

        a.spread(&[c.local_addr()]).await;
        assert_eq!(a.pending_gossip(), 0);
    }

    #[tokio::test]
    async fn test_oversized_gossip_split_across_envelopes() {
        let network = MemoryNetwork::new();
        let mut a = messenger(&network, "dev", 1);
        let mut b = messenger(&network, "dev", 2);
        let mut inbound = b.start();

        a.broadcast(delta(40_000));
        a.broadcast(delta(40_001));

        let mut carried = Vec::new();
        for seq in 1..=2 {
            assert!(
                a.send(ClusterMessage::Ack { seq }, b.local_addr(), Delivery::BestEffort)
                    .await
            );
            let (data, from) = inbound.recv().await.unwrap();
            let accepted = b.accept(&data, from).unwrap();
            assert_eq!(accepted.envelope.message, ClusterMessage::Ack { seq });
            assert_eq!(accepted.fresh.len(), 1);
            carried.extend(accepted.fresh);
        }

        assert!(carried.contains(&delta(40_000)));
        assert!(carried.contains(&delta(40_001)));
    }

    #[tokio::test]
    async fn test_gossip_too_large_for_any_datagram_is_discarded() {
        let network = MemoryNetwork::new();
        let mut a = messenger(&network, "dev", 1);
        let mut b = messenger(&network, "dev", 2);
        let mut inbound = b.start();

        a.broadcast(delta(MAX_DATAGRAM_SIZE));
        assert!(
            a.send(ClusterMessage::Ack { seq: 9 }, b.local_addr(), Delivery::BestEffort)
                .await
        );

        let (data, from) = inbound.recv().await.unwrap();
        let accepted = b.accept(&data, from).unwrap();
        assert_eq!(accepted.envelope.message, ClusterMessage::Ack { seq: 9 });
        assert!(accepted.envelope.gossip.is_empty());
        assert_eq!(a.pending_gossip(), 0);
    }

    #[tokio::test]
    async fn test_spread_reaches_all_targets() {
        let network = MemoryNetwork::new();
        let mut a = messenger(&network, "dev", 1);
        let mut b = messenger(&network, "dev", 2);
        let mut c = messenger(&network, "dev", 3);
        let mut b_inbound = b.start();
        let mut c_inbound = c.start();

        a.broadcast(suspect_payload());
        a.spread(&[b.local_addr(), c.local_addr()]).await;

        let (data, from) = b_inbound.recv().await.unwrap();
        assert_eq!(b.accept(&data, from).unwrap().fresh.len(), 1);
        let (data, from) = c_inbound.recv().await.unwrap();
        assert_eq!(c.accept(&data, from).unwrap().fresh.len(), 1);
    }

    #[tokio::test]
    async fn test_observers_see_accepted_envelopes() {
        let network = MemoryNetwork::new();
        let mut a = messenger(&network, "dev", 1);
        let mut b = messenger(&network, "dev", 2);
        let mut inbound = b.start();
        let mut observer = b.subscribe();

        a.send(ClusterMessage::Ack { seq: 3 }, b.local_addr(), Delivery::BestEffort)
            .await;
        let (data, from) = inbound.recv().await.unwrap();
        b.accept(&data, from).unwrap();

        let seen = observer.recv().await.unwrap();
        assert_eq!(seen.message, ClusterMessage::Ack { seq: 3 });
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let network = MemoryNetwork::new();
        let mut a = messenger(&network, "dev", 1);
        let b = messenger(&network, "dev", 2);

        a.shutdown().await;
        assert!(
            !a.send(ClusterMessage::Gossip, b.local_addr(), Delivery::BestEffort)
                .await
        );
    }
}
