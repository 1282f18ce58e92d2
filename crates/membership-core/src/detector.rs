//! SWIM failure detection with Lifeguard extensions.
//!
//! One probe round per (awareness-scaled) probe interval:
//! 1. Ping the target directly
//! 2. If no ack within the (scaled) probe timeout, ask helpers to probe it
//! 3. If nothing arrives by the end of the round, suspect the target and
//!    raise our own awareness score
//! 4. If suspicion isn't refuted before its timeout, declare the target dead
//!
//! Suspicion timeouts shrink as independent suspectors confirm, and a
//! verdict never lands later than `suspicion_max_timeout_multiplier - 1`
//! probe intervals after we last heard from the target, so the remaining
//! interval is left to spread it. Members suspected by others are probed
//! once ahead of the regular rotation. Any envelope from the target at an incarnation at
//! least as new as the suspected one refutes the suspicion.
//!
//! Sans-IO: the caller supplies the clock, sends the messages and acts on
//! the returned [`DetectorEvent`]s.

use crate::HostEndpoint;
use crate::awareness::Awareness;
use crate::config::AgentHostOptions;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

/// Configuration for failure detection.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub indirect_probes: usize,
    pub suspicion_multiplier: u32,
    pub suspicion_max_timeout_multiplier: u32,
    pub awareness_max_multiplier: u32,
}

impl From<&AgentHostOptions> for DetectorConfig {
    fn from(options: &AgentHostOptions) -> Self {
        Self {
            probe_interval_ms: options.base_probe_interval_ms,
            probe_timeout_ms: options.base_probe_timeout_ms,
            indirect_probes: options.indirect_probes,
            suspicion_multiplier: options.suspicion_multiplier,
            suspicion_max_timeout_multiplier: options.suspicion_max_timeout_multiplier,
            awareness_max_multiplier: options.awareness_max_multiplier,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::from(&AgentHostOptions::default())
    }
}

/// A probe round we started.
#[derive(Debug, Clone)]
struct Probe {
    target: HostEndpoint,
    direct_deadline: u64,
    round_deadline: u64,
    indirect_started: bool,
    helpers: usize,
    nacks: usize,
}

/// A probe we run on behalf of another node (`PingReq`).
#[derive(Debug, Clone)]
struct Relay {
    origin_addr: SocketAddr,
    origin_seq: u64,
    target: HostEndpoint,
    deadline: u64,
}

/// State of a suspected node.
#[derive(Debug, Clone)]
pub struct Suspicion {
    pub started_at: u64,
    /// When we last heard from the target before suspecting it
    pub last_heard: u64,
    /// Incarnation the suspicion applies to
    pub incarnation: u64,
    pub suspectors: BTreeSet<HostEndpoint>,
    pub deadline: u64,
    /// When our own probe of the target last failed or started
    pub probed_at: Option<u64>,
}

/// Liveness of a member as seen locally. Dead members are evicted, so
/// they never show up here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Alive,
    Suspect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorEvent {
    /// Direct probe timed out; ask helpers to probe `target`
    ProbeIndirect { seq: u64, target: HostEndpoint },
    /// Answer a relayed probe back to its origin
    RelayResult {
        origin_addr: SocketAddr,
        origin_seq: u64,
        target: HostEndpoint,
        alive: bool,
    },
    /// We newly suspect `target`
    Suspected { target: HostEndpoint },
    /// Our own probe failed against a target others already suspect
    Confirmed { target: HostEndpoint },
    /// Suspicion cancelled by fresh evidence of life
    Refuted { target: HostEndpoint },
    /// Suspicion expired
    Dead { target: HostEndpoint },
}

pub struct FailureDetector {
    config: DetectorConfig,
    local: HostEndpoint,
    next_seq: u64,
    probes: HashMap<u64, Probe>,
    relays: HashMap<u64, Relay>,
    suspicions: HashMap<HostEndpoint, Suspicion>,
    last_heard: HashMap<HostEndpoint, u64>,
    awareness: Awareness,
    last_round: Option<u64>,
    cluster_size: usize,
}

impl FailureDetector {
    pub fn new(config: DetectorConfig, local: HostEndpoint) -> Self {
        let awareness = Awareness::new(config.awareness_max_multiplier);
        Self {
            config,
            local,
            next_seq: 1,
            probes: HashMap::new(),
            relays: HashMap::new(),
            suspicions: HashMap::new(),
            last_heard: HashMap::new(),
            awareness,
            last_round: None,
            cluster_size: 1,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn local(&self) -> &HostEndpoint {
        &self.local
    }

    /// Our endpoint changed (reincarnation).
    pub fn set_local(&mut self, local: HostEndpoint) {
        self.local = local;
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn set_cluster_size(&mut self, size: usize) {
        self.cluster_size = size.max(1);
    }

    /// Direct probe timeout, scaled by awareness.
    pub fn probe_timeout_ms(&self) -> u64 {
        self.awareness.scale(self.config.probe_timeout_ms)
    }

    /// Probe round length, scaled by awareness.
    pub fn probe_interval_ms(&self) -> u64 {
        self.awareness.scale(self.config.probe_interval_ms)
    }

    /// Lifeguard bounds `(min, max)` of the suspicion timeout.
    fn suspicion_bounds(&self) -> (f64, f64) {
        let max = self.config.suspicion_max_timeout_multiplier as f64
            * self.config.probe_interval_ms as f64;
        let scale = ((self.cluster_size as f64) + 1.0).log10().max(1.0);
        let min = (self.config.probe_timeout_ms as f64
            * self.config.suspicion_multiplier as f64
            * scale)
            .min(max);
        (min, max)
    }

    /// Suspicion timeout given `suspectors` independent suspectors.
    ///
    /// Starts at `suspicion_max_timeout_multiplier * probe_interval` for a
    /// single suspector and decays logarithmically towards
    /// `probe_timeout * suspicion_multiplier * log10(n + 1)` as the
    /// expected `indirect_probes` confirmations arrive.
    pub fn suspicion_timeout_ms(&self, suspectors: usize) -> u64 {
        let (min, max) = self.suspicion_bounds();
        let confirmations = suspectors.saturating_sub(1) as f64;
        let expected = self.config.indirect_probes.max(1) as f64;
        let decay = (confirmations + 1.0).ln() / (expected + 1.0).ln();
        let timeout = max - (max - min) * decay;

        timeout.max(min).ceil() as u64
    }

    /// Time from the last contact with a target to its verdict, at most.
    ///
    /// One probe interval short of the cap, which leaves that interval to
    /// disseminate the removal.
    pub fn verdict_budget_ms(&self) -> u64 {
        let cap = u64::from(self.config.suspicion_max_timeout_multiplier)
            .saturating_mul(self.config.probe_interval_ms);
        cap.saturating_sub(self.config.probe_interval_ms)
    }

    /// Deadline of a suspicion started at `started_at` with `suspectors`.
    ///
    /// The Lifeguard timeout, pulled in to the verdict budget counted from
    /// `last_heard`, but never shorter than the minimum timeout so the
    /// target always has a window to refute.
    fn suspicion_deadline(&self, started_at: u64, last_heard: u64, suspectors: usize) -> u64 {
        let (min, _) = self.suspicion_bounds();
        let floor = started_at + min.ceil() as u64;
        let decayed = started_at + self.suspicion_timeout_ms(suspectors);
        let budget = last_heard.saturating_add(self.verdict_budget_ms());
        decayed.min(budget).max(floor)
    }

    /// Check if it's time for a new probe round.
    pub fn should_probe(&self, now_ms: u64) -> bool {
        match self.last_round {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.probe_interval_ms(),
        }
    }

    /// Start a probe round against `target`. Returns the ping sequence number.
    pub fn start_probe(&mut self, target: HostEndpoint, now_ms: u64) -> u64 {
        let seq = self.next_seq();
        self.last_round = Some(now_ms);
        if let Some(suspicion) = self.suspicions.get_mut(&target) {
            suspicion.probed_at = Some(now_ms);
        }
        self.probes.insert(
            seq,
            Probe {
                target,
                direct_deadline: now_ms + self.probe_timeout_ms(),
                round_deadline: now_ms + self.probe_interval_ms(),
                indirect_started: false,
                helpers: 0,
                nacks: 0,
            },
        );
        seq
    }

    /// Record how many helpers were asked to probe for round `seq`.
    pub fn set_helpers(&mut self, seq: u64, helpers: usize) {
        if let Some(probe) = self.probes.get_mut(&seq) {
            probe.helpers = helpers;
        }
    }

    /// Start probing `target` on behalf of `origin_addr`. Returns our ping seq.
    pub fn start_relay(
        &mut self,
        origin_addr: SocketAddr,
        origin_seq: u64,
        target: HostEndpoint,
        now_ms: u64,
    ) -> u64 {
        let seq = self.next_seq();
        self.relays.insert(
            seq,
            Relay {
                origin_addr,
                origin_seq,
                target,
                deadline: now_ms + self.probe_timeout_ms(),
            },
        );
        seq
    }

    /// An `Ack` arrived for `seq`.
    pub fn receive_ack(&mut self, seq: u64) -> Vec<DetectorEvent> {
        let mut events = Vec::new();

        if self.probes.remove(&seq).is_some() {
            self.awareness.on_success();
        } else if let Some(relay) = self.relays.remove(&seq) {
            events.push(DetectorEvent::RelayResult {
                origin_addr: relay.origin_addr,
                origin_seq: relay.origin_seq,
                target: relay.target,
                alive: true,
            });
        }

        events
    }

    /// An `IndirectAck` arrived for probe round `seq`.
    pub fn receive_indirect_ack(
        &mut self,
        seq: u64,
        target: &HostEndpoint,
        alive: bool,
        now_ms: u64,
    ) -> Vec<DetectorEvent> {
        let mut events = Vec::new();

        let Some(probe) = self.probes.get_mut(&seq) else {
            return events;
        };
        if &probe.target != target {
            return events;
        }

        if alive {
            let target = probe.target.clone();
            self.probes.remove(&seq);
            self.awareness.on_success();
            self.last_heard.insert(target, now_ms);
            return events;
        }

        probe.nacks += 1;
        if probe.helpers > 0 && probe.nacks >= probe.helpers {
            let target = probe.target.clone();
            self.probes.remove(&seq);
            self.awareness.on_failure();
            let local = self.local.clone();
            events.extend(self.suspect(target, local, now_ms));
        }

        events
    }

    /// Check for timed-out probes, relays and suspicions.
    pub fn check_timeouts(&mut self, now_ms: u64) -> Vec<DetectorEvent> {
        let mut events = Vec::new();

        let mut failed = Vec::new();
        for (seq, probe) in self.probes.iter_mut() {
            if now_ms >= probe.round_deadline {
                failed.push(*seq);
            } else if !probe.indirect_started && now_ms >= probe.direct_deadline {
                probe.indirect_started = true;
                events.push(DetectorEvent::ProbeIndirect {
                    seq: *seq,
                    target: probe.target.clone(),
                });
            }
        }
        failed.sort_unstable();
        for seq in failed {
            if let Some(probe) = self.probes.remove(&seq) {
                self.awareness.on_failure();
                let local = self.local.clone();
                events.extend(self.suspect(probe.target, local, now_ms));
            }
        }

        let expired_relays: Vec<u64> = self
            .relays
            .iter()
            .filter(|(_, relay)| now_ms >= relay.deadline)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired_relays {
            if let Some(relay) = self.relays.remove(&seq) {
                events.push(DetectorEvent::RelayResult {
                    origin_addr: relay.origin_addr,
                    origin_seq: relay.origin_seq,
                    target: relay.target,
                    alive: false,
                });
            }
        }

        let mut dead: Vec<HostEndpoint> = self
            .suspicions
            .iter()
            .filter(|(_, suspicion)| now_ms >= suspicion.deadline)
            .map(|(target, _)| target.clone())
            .collect();
        dead.sort();
        for target in dead {
            self.suspicions.remove(&target);
            self.probes.retain(|_, probe| probe.target != target);
            events.push(DetectorEvent::Dead { target });
        }

        events
    }

    /// Record that `suspector` suspects `target`.
    ///
    /// Returns `Suspected` when we open a suspicion ourselves and
    /// `Confirmed` when we join one that others opened; both are worth
    /// gossiping. Suspectors heard about through gossip only move the
    /// deadline. Suspicion of ourselves is ignored (the caller refutes).
    pub fn suspect(
        &mut self,
        target: HostEndpoint,
        suspector: HostEndpoint,
        now_ms: u64,
    ) -> Option<DetectorEvent> {
        if target == self.local {
            return None;
        }
        let ours = suspector == self.local;

        if let Some(suspicion) = self.suspicions.get(&target) {
            if suspicion.suspectors.contains(&suspector) {
                return None;
            }
            let deadline = self.suspicion_deadline(
                suspicion.started_at,
                suspicion.last_heard,
                suspicion.suspectors.len() + 1,
            );
            if let Some(suspicion) = self.suspicions.get_mut(&target) {
                suspicion.suspectors.insert(suspector);
                suspicion.deadline = suspicion.deadline.min(deadline);
            }
            return ours.then_some(DetectorEvent::Confirmed { target });
        }

        let last_heard = self.last_heard.get(&target).copied().unwrap_or(now_ms);
        let deadline = self.suspicion_deadline(now_ms, last_heard, 1);
        self.suspicions.insert(
            target.clone(),
            Suspicion {
                started_at: now_ms,
                last_heard,
                incarnation: target.incarnation,
                suspectors: [suspector].into_iter().collect(),
                deadline,
                probed_at: ours.then_some(now_ms),
            },
        );
        ours.then_some(DetectorEvent::Suspected { target })
    }

    /// Evidence of life from `sender` (any envelope, or an `Alive` gossip).
    ///
    /// Cancels suspicion of the same host at an incarnation no newer than
    /// the sender's.
    pub fn observe(&mut self, sender: &HostEndpoint, now_ms: u64) -> Vec<DetectorEvent> {
        self.last_heard.insert(sender.clone(), now_ms);

        let refuted: Vec<HostEndpoint> = self
            .suspicions
            .iter()
            .filter(|(target, suspicion)| {
                target.same_host(sender) && sender.incarnation >= suspicion.incarnation
            })
            .map(|(target, _)| target.clone())
            .collect();

        refuted
            .into_iter()
            .map(|target| {
                self.suspicions.remove(&target);
                DetectorEvent::Refuted { target }
            })
            .collect()
    }

    /// A suspected member we haven't probed ourselves yet, if any.
    pub fn next_suspect(&self) -> Option<HostEndpoint> {
        self.suspicions
            .iter()
            .filter(|(_, suspicion)| suspicion.probed_at.is_none())
            .map(|(target, _)| target)
            .filter(|target| !self.probes.values().any(|p| &p.target == *target))
            .min()
            .cloned()
    }

    /// Drop all state about a node that left the membership.
    pub fn forget(&mut self, target: &HostEndpoint) {
        self.suspicions.remove(target);
        self.last_heard.remove(target);
        self.probes.retain(|_, probe| &probe.target != target);
        self.relays.retain(|_, relay| &relay.target != target);
    }

    /// Keep suspicions, contact times and probes only for members.
    ///
    /// Relays are kept; we may help probe a node we haven't merged yet.
    pub fn retain_members(&mut self, is_member: impl Fn(&HostEndpoint) -> bool) {
        self.suspicions.retain(|target, _| is_member(target));
        self.last_heard.retain(|target, _| is_member(target));
        self.probes.retain(|_, probe| is_member(&probe.target));
    }

    /// Abandon in-flight probes and relays without emitting anything.
    pub fn abandon(&mut self) {
        self.probes.clear();
        self.relays.clear();
    }

    pub fn is_suspected(&self, target: &HostEndpoint) -> bool {
        self.suspicions.contains_key(target)
    }

    pub fn status(&self, target: &HostEndpoint) -> MemberStatus {
        if self.is_suspected(target) {
            MemberStatus::Suspect
        } else {
            MemberStatus::Alive
        }
    }

    pub fn suspicion(&self, target: &HostEndpoint) -> Option<&Suspicion> {
        self.suspicions.get(target)
    }

    pub fn pending_probe_count(&self) -> usize {
        self.probes.len()
    }

    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    pub fn suspicion_count(&self) -> usize {
        self.suspicions.len()
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}
