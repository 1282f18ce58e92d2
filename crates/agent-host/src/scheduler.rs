//! The control-loop scheduler.
//!
//! One tokio task owns every piece of mutable cluster state: the member
//! list, selector, control loops and messenger. It multiplexes facade
//! commands, inbound datagrams and a fixed tick, so no state is ever
//! touched from two places at once.

use crate::error::{HostError, Result};
use crate::messenger::{Inbound, Messenger};
use crate::transport::Delivery;
use membership_core::protocol::{ExchangeKind, StoreDigest, StoreUpdates};
use membership_core::{
    AgentHostOptions, AutoDropper, AutoHealer, AutoSeeder, ClusterMessage, DetectorEvent,
    DropperAction, GossipPayload, HostEndpoint, HostMemberList, JoinStart, Landscape,
    MemberSelector, Members, MergeOutcome, SeederEvent,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Requests from the facade.
#[derive(Debug)]
pub(crate) enum Command {
    Join {
        seeds: Vec<SocketAddr>,
        reply: oneshot::Sender<Result<()>>,
    },
    Host {
        agent: String,
        reply: oneshot::Sender<Result<()>>,
    },
    StopHosting {
        agent: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Live views published to the facade.
pub(crate) struct Views {
    pub local: watch::Sender<HostEndpoint>,
    pub members: watch::Sender<Members>,
    pub landscape: watch::Sender<Landscape>,
}

pub(crate) struct Scheduler {
    options: AgentHostOptions,
    started: Instant,
    messenger: Messenger,
    members: HostMemberList,
    selector: MemberSelector,
    dropper: AutoDropper,
    seeder: AutoSeeder,
    healer: AutoHealer,
    join_waiters: Vec<oneshot::Sender<Result<()>>>,
    next_spread: u64,
    views: Views,
}

impl Scheduler {
    pub fn new(
        options: AgentHostOptions,
        messenger: Messenger,
        members: HostMemberList,
        selector: MemberSelector,
        dropper: AutoDropper,
        views: Views,
    ) -> Self {
        let seeder = AutoSeeder::new(messenger.local_addr(), &options);
        let healer = AutoHealer::new(&options);

        let mut scheduler = Self {
            options,
            started: Instant::now(),
            messenger,
            members,
            selector,
            dropper,
            seeder,
            healer,
            join_waiters: Vec::new(),
            next_spread: 0,
            views,
        };
        scheduler.settle();
        scheduler
    }

    /// Drive the cluster until a `Stop` arrives or the facade goes away.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    ) {
        let mut ticker = tokio::time::interval(self.options.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.dropper.start();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command).await {
                            return;
                        }
                    }
                    None => {
                        debug!("Facade dropped, shutting down");
                        self.shutdown().await;
                        return;
                    }
                },
                Some((data, from)) = inbound.recv() => self.on_datagram(&data, from).await,
                _ = ticker.tick() => self.on_tick().await,
            }
        }
    }

    fn now(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    // ==================== Commands ====================

    /// Returns false once the scheduler has shut down.
    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Join { seeds, reply } => {
                let now = self.now();
                match self.seeder.join(seeds, now) {
                    JoinStart::Contact(addrs) => {
                        self.join_waiters.push(reply);
                        self.send_join(&addrs).await;
                    }
                    JoinStart::Coalesced => self.join_waiters.push(reply),
                    JoinStart::Complete => {
                        let _ = reply.send(Ok(()));
                    }
                    JoinStart::Stopped => {
                        let _ = reply.send(Err(HostError::JoinCancelled));
                    }
                }
            }
            Command::Host { agent, reply } => {
                let result = self.members.host(&agent).map(|hosted| {
                    if hosted {
                        info!("Hosting agent {}", agent);
                    }
                });
                self.settle();
                let _ = reply.send(result.map_err(HostError::from));
            }
            Command::StopHosting { agent, reply } => {
                let result = self.members.stop_hosting(&agent).map(|stopped| {
                    if stopped {
                        info!("Stopped hosting agent {}", agent);
                    }
                });
                self.settle();
                let _ = reply.send(result.map_err(HostError::from));
            }
            Command::Stop { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn send_join(&mut self, seeds: &[SocketAddr]) {
        let updates = match self.members.full_state() {
            Ok(updates) => updates,
            Err(e) => {
                warn!("Cannot export state for join: {}", e);
                return;
            }
        };
        let digest = self.members.digest();

        for seed in seeds {
            debug!("Sending join to {}", seed);
            let message = ClusterMessage::Join {
                digest: digest.clone(),
                updates: updates.clone(),
            };
            self.messenger.send(message, *seed, Delivery::Reliable).await;
        }
    }

    // ==================== Tick ====================

    async fn on_tick(&mut self) {
        let now = self.now();

        let actions = self
            .dropper
            .tick(now, &mut self.members, &mut self.selector);
        self.execute(actions).await;

        match self.seeder.check(now) {
            Some(SeederEvent::Contact(seeds)) => self.send_join(&seeds).await,
            Some(SeederEvent::Retrying { retry_at }) => {
                debug!("Join retry scheduled at {}ms", retry_at);
            }
            None => {}
        }

        if self.healer.tick(now) {
            self.heal(now).await;
        }

        if now >= self.next_spread {
            self.next_spread = now + self.options.gossip_period_ms;
            self.settle();
            let targets = self.peer_addrs(self.messenger.fanout());
            self.messenger.spread(&targets).await;
        }

        self.settle();
    }

    async fn execute(&mut self, actions: Vec<DropperAction>) {
        for action in actions {
            match action {
                DropperAction::Probe { seq, target, addr } => {
                    self.messenger
                        .send(ClusterMessage::Ping { seq, target }, addr, Delivery::BestEffort)
                        .await;
                }
                DropperAction::ProbeIndirect { seq, target } => {
                    let excluding: HashSet<HostEndpoint> =
                        [self.members.local().clone(), target.clone()].into_iter().collect();
                    let helpers = self
                        .selector
                        .select(self.options.indirect_probes, &excluding);
                    self.dropper
                        .detector_mut()
                        .set_helpers(seq, helpers.len());

                    if helpers.is_empty() {
                        debug!("No helpers available to probe {}", target);
                    }
                    for (helper, addr) in helpers {
                        debug!("Asking {} to probe {}", helper, target);
                        let message = ClusterMessage::PingReq {
                            seq,
                            target: target.clone(),
                        };
                        self.messenger.send(message, addr, Delivery::BestEffort).await;
                    }
                }
                DropperAction::Relay {
                    origin_addr,
                    origin_seq,
                    target,
                    alive,
                } => {
                    let message = ClusterMessage::IndirectAck {
                        seq: origin_seq,
                        target,
                        alive,
                    };
                    self.messenger
                        .send(message, origin_addr, Delivery::BestEffort)
                        .await;
                }
                DropperAction::Suspect { target } => {
                    let suspector = self.members.local().clone();
                    self.messenger
                        .broadcast(GossipPayload::Suspect { target, suspector });
                }
                DropperAction::Refuted { target } => {
                    self.messenger
                        .broadcast(GossipPayload::Alive { endpoint: target });
                }
                DropperAction::Dropped { .. } => {}
            }
        }
    }

    async fn heal(&mut self, now: u64) {
        let peer = self
            .peer_addrs(1)
            .into_iter()
            .next()
            .or_else(|| self.seeder.random_seed());

        let Some(peer) = peer else {
            debug!("No peer to heal with");
            return;
        };

        debug!("Healing with {}", peer);
        let message = ClusterMessage::Heal {
            digest: self.members.digest(),
        };
        if self.messenger.send(message, peer, Delivery::Reliable).await {
            self.healer.begin(peer, now);
        }
    }

    fn peer_addrs(&mut self, n: usize) -> Vec<SocketAddr> {
        let excluding: HashSet<HostEndpoint> = [self.members.local().clone()].into_iter().collect();
        self.selector
            .select(n, &excluding)
            .into_iter()
            .map(|(_, addr)| addr)
            .collect()
    }

    // ==================== Inbound ====================

    async fn on_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let Some(Inbound { envelope, fresh }) = self.messenger.accept(data, from) else {
            return;
        };
        let now = self.now();

        let events = self.dropper.detector_mut().observe(&envelope.sender, now);
        let actions = self.dropper.handle(events, &mut self.members);
        self.execute(actions).await;

        for payload in fresh {
            self.on_gossip(payload, now).await;
        }

        self.on_message(envelope.message, from, now).await;
        self.settle();
    }

    async fn on_gossip(&mut self, payload: GossipPayload, now: u64) {
        match payload {
            GossipPayload::Suspect { target, suspector } => {
                let local = self.members.local().clone();
                if target.same_host(&local) && target.incarnation <= local.incarnation {
                    info!("Refuting suspicion raised by {}", suspector);
                    self.messenger
                        .broadcast(GossipPayload::Alive { endpoint: local });
                } else if self.members.contains(&target) {
                    let events: Vec<DetectorEvent> = self
                        .dropper
                        .detector_mut()
                        .suspect(target, suspector, now)
                        .into_iter()
                        .collect();
                    let actions = self.dropper.handle(events, &mut self.members);
                    self.execute(actions).await;
                }
            }
            GossipPayload::Alive { endpoint } => {
                let events = self.dropper.detector_mut().observe(&endpoint, now);
                let actions = self.dropper.handle(events, &mut self.members);
                self.execute(actions).await;
            }
            GossipPayload::Delta(update) => match self.members.apply_remote(&update) {
                Ok(outcome) => self.on_merge(outcome),
                Err(e) => warn!("Failed to apply {} delta: {}", update.uri, e),
            },
        }
    }

    async fn on_message(&mut self, message: ClusterMessage, from: SocketAddr, now: u64) {
        match message {
            ClusterMessage::Ping { seq, target } => {
                if &target == self.members.local() {
                    self.messenger
                        .send(ClusterMessage::Ack { seq }, from, Delivery::BestEffort)
                        .await;
                } else {
                    debug!("Ignoring ping for {} (we are {})", target, self.members.local());
                }
            }
            ClusterMessage::Ack { seq } => {
                let events = self.dropper.detector_mut().receive_ack(seq);
                let actions = self.dropper.handle(events, &mut self.members);
                self.execute(actions).await;
            }
            ClusterMessage::PingReq { seq, target } => {
                match self.selector.resolver().resolve(&target) {
                    Ok(addr) => {
                        let relay_seq =
                            self.dropper
                                .detector_mut()
                                .start_relay(from, seq, target.clone(), now);
                        self.messenger
                            .send(
                                ClusterMessage::Ping {
                                    seq: relay_seq,
                                    target,
                                },
                                addr,
                                Delivery::BestEffort,
                            )
                            .await;
                    }
                    Err(e) => {
                        debug!("Cannot relay probe: {}", e);
                        let message = ClusterMessage::IndirectAck {
                            seq,
                            target,
                            alive: false,
                        };
                        self.messenger.send(message, from, Delivery::BestEffort).await;
                    }
                }
            }
            ClusterMessage::IndirectAck { seq, target, alive } => {
                let events = self
                    .dropper
                    .detector_mut()
                    .receive_indirect_ack(seq, &target, alive, now);
                let actions = self.dropper.handle(events, &mut self.members);
                self.execute(actions).await;
            }
            ClusterMessage::Join { digest, updates } => {
                self.merge(&updates);
                self.reply_exchange(ExchangeKind::Join, &digest, from).await;
            }
            ClusterMessage::Heal { digest } => {
                self.reply_exchange(ExchangeKind::Heal, &digest, from).await;
            }
            ClusterMessage::Exchange {
                kind,
                response,
                request,
            } => {
                self.merge(&response);
                match kind {
                    ExchangeKind::Join => {
                        if self.seeder.on_response() {
                            self.settle();
                            for waiter in self.join_waiters.drain(..) {
                                let _ = waiter.send(Ok(()));
                            }
                        }
                    }
                    ExchangeKind::Heal => {
                        self.healer.complete(from);
                    }
                }

                match self.members.updates_since(&request) {
                    Ok(updates) if !updates.is_empty() => {
                        self.messenger
                            .send(ClusterMessage::Response { updates }, from, Delivery::Reliable)
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Cannot answer exchange from {}: {}", from, e),
                }
            }
            ClusterMessage::Response { updates } => self.merge(&updates),
            ClusterMessage::Store(update) => match self.members.apply_remote(&update) {
                Ok(outcome) => self.on_merge(outcome),
                Err(e) => warn!("Failed to apply {} update from {}: {}", update.uri, from, e),
            },
            ClusterMessage::Gossip => {}
        }
    }

    async fn reply_exchange(&mut self, kind: ExchangeKind, digest: &StoreDigest, to: SocketAddr) {
        let response = match self.members.updates_since(digest) {
            Ok(response) => response,
            Err(e) => {
                warn!("Cannot answer {:?} from {}: {}", kind, to, e);
                return;
            }
        };
        let message = ClusterMessage::Exchange {
            kind,
            response,
            request: self.members.digest(),
        };
        self.messenger.send(message, to, Delivery::Reliable).await;
    }

    fn merge(&mut self, updates: &StoreUpdates) {
        if updates.is_empty() {
            return;
        }
        match self.members.merge(updates) {
            Ok(outcome) => self.on_merge(outcome),
            Err(e) => warn!("Failed to merge remote state: {}", e),
        }
    }

    fn on_merge(&mut self, outcome: MergeOutcome) {
        if let Some(local) = outcome.reincarnated {
            warn!("Evicted by the cluster, rejoining as {}", local);
            self.messenger.set_local(local.clone());
            self.dropper.detector_mut().set_local(local.clone());
            self.views.local.send_replace(local.clone());
            self.messenger
                .broadcast(GossipPayload::Alive { endpoint: local });
        }
    }

    // ==================== Views ====================

    /// Disseminate local changes and publish fresh views.
    fn settle(&mut self) {
        for update in self.members.take_outbound() {
            self.messenger.broadcast(GossipPayload::Delta(update));
        }

        let members = self.members.members();
        self.selector.refresh(members.keys().cloned());

        let detector = self.dropper.detector_mut();
        detector.set_cluster_size(members.len());
        detector.retain_members(|target| members.contains_key(target));
        self.messenger
            .tune(self.dropper.detector().awareness(), members.len());

        self.views.members.send_if_modified(|current| {
            if *current != members {
                *current = members;
                true
            } else {
                false
            }
        });

        let landscape = self.members.landscape();
        self.views.landscape.send_if_modified(|current| {
            if *current != landscape {
                *current = landscape;
                true
            } else {
                false
            }
        });
    }

    // ==================== Shutdown ====================

    async fn shutdown(&mut self) {
        info!("Stopping agent host {}", self.members.local());

        self.healer.stop();
        if self.seeder.stop() {
            debug!("Cancelled pending join");
        }
        for waiter in self.join_waiters.drain(..) {
            let _ = waiter.send(Err(HostError::JoinCancelled));
        }
        self.dropper.stop();

        // Tell a few peers we're leaving before the store goes quiet
        let targets = self.peer_addrs(self.messenger.fanout());
        if let Err(e) = self.members.stop() {
            warn!("Failed to stop member list: {}", e);
        }
        for update in self.members.take_outbound() {
            for target in &targets {
                self.messenger
                    .send(ClusterMessage::Store(update.clone()), *target, Delivery::Reliable)
                    .await;
            }
        }

        self.messenger.shutdown().await;
    }
}
