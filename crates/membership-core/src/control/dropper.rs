//! AutoDropper: drives the probe cadence and evicts dead members.
//!
//! Owns the [`FailureDetector`]. Each tick it advances the detector's
//! timers, starts a new probe round when one is due (members others suspect
//! go first), and turns detector events into actions: suspicions and our
//! confirmations of them are gossiped, dead members are removed
//! from the member list (the removal names the exact incarnation that died,
//! so a restarted host is never affected).

use crate::HostEndpoint;
use crate::detector::{DetectorEvent, FailureDetector};
use crate::member_list::{HostMemberList, MemberListError};
use crate::selector::{HostAddressResolver, MemberSelector};
use std::collections::HashSet;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// I/O the scheduler performs on behalf of the dropper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropperAction {
    /// Send `Ping { seq, target }` to `addr`
    Probe {
        seq: u64,
        target: HostEndpoint,
        addr: SocketAddr,
    },
    /// Pick helpers and send them `PingReq { seq, target }`
    ProbeIndirect { seq: u64, target: HostEndpoint },
    /// Send `IndirectAck` back to the node that asked us to probe
    Relay {
        origin_addr: SocketAddr,
        origin_seq: u64,
        target: HostEndpoint,
        alive: bool,
    },
    /// Gossip that we suspect `target`
    Suspect { target: HostEndpoint },
    /// `target` proved alive; spread the word
    Refuted { target: HostEndpoint },
    /// `target` was removed from the member list
    Dropped { target: HostEndpoint },
}

pub struct AutoDropper {
    detector: FailureDetector,
    running: bool,
}

impl AutoDropper {
    pub fn new(detector: FailureDetector) -> Self {
        Self {
            detector,
            running: false,
        }
    }

    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    pub fn detector_mut(&mut self) -> &mut FailureDetector {
        &mut self.detector
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    /// Stop probing; in-flight probes are dropped without verdicts.
    pub fn stop(&mut self) {
        self.running = false;
        self.detector.abandon();
    }

    /// Advance timers and start a probe round if one is due.
    pub fn tick(
        &mut self,
        now_ms: u64,
        members: &mut HostMemberList,
        selector: &mut MemberSelector,
    ) -> Vec<DropperAction> {
        if !self.running {
            return Vec::new();
        }

        let events = self.detector.check_timeouts(now_ms);
        let mut actions = self.handle(events, members);

        if self.detector.should_probe(now_ms) {
            let target = self
                .next_suspect(members, selector.resolver().as_ref())
                .or_else(|| {
                    let excluding: HashSet<HostEndpoint> =
                        [members.local().clone()].into_iter().collect();
                    selector.select(1, &excluding).into_iter().next()
                });
            if let Some((target, addr)) = target {
                let seq = self.detector.start_probe(target.clone(), now_ms);
                actions.push(DropperAction::Probe { seq, target, addr });
            }
        }

        actions
    }

    /// A member suspected by others that we haven't probed yet.
    fn next_suspect(
        &self,
        members: &HostMemberList,
        resolver: &dyn HostAddressResolver,
    ) -> Option<(HostEndpoint, SocketAddr)> {
        let target = self.detector.next_suspect()?;
        if !members.contains(&target) {
            return None;
        }
        match resolver.resolve(&target) {
            Ok(addr) => Some((target, addr)),
            Err(e) => {
                debug!("Skipping suspect {}: {}", target, e);
                None
            }
        }
    }

    /// Turn detector events into actions, evicting dead members.
    pub fn handle(
        &mut self,
        events: Vec<DetectorEvent>,
        members: &mut HostMemberList,
    ) -> Vec<DropperAction> {
        let mut actions = Vec::new();

        for event in events {
            match event {
                DetectorEvent::ProbeIndirect { seq, target } => {
                    actions.push(DropperAction::ProbeIndirect { seq, target });
                }
                DetectorEvent::RelayResult {
                    origin_addr,
                    origin_seq,
                    target,
                    alive,
                } => {
                    actions.push(DropperAction::Relay {
                        origin_addr,
                        origin_seq,
                        target,
                        alive,
                    });
                }
                DetectorEvent::Suspected { target } => {
                    if !members.contains(&target) {
                        self.detector.forget(&target);
                        continue;
                    }
                    info!("Suspecting {}", target);
                    actions.push(DropperAction::Suspect { target });
                }
                DetectorEvent::Confirmed { target } => {
                    if !members.contains(&target) {
                        self.detector.forget(&target);
                        continue;
                    }
                    debug!("Confirmed suspicion of {}", target);
                    actions.push(DropperAction::Suspect { target });
                }
                DetectorEvent::Refuted { target } => {
                    info!("{} refuted suspicion", target);
                    actions.push(DropperAction::Refuted { target });
                }
                DetectorEvent::Dead { target } => match members.remove(&target) {
                    Ok(true) => {
                        info!("Dropped dead member {}", target);
                        self.detector.forget(&target);
                        actions.push(DropperAction::Dropped { target });
                    }
                    Ok(false) => {
                        debug!("Dead member {} already gone", target);
                        self.detector.forget(&target);
                    }
                    Err(MemberListError::Stopped) => {
                        debug!("Ignoring verdict on {} after stop", target);
                    }
                    Err(e) => {
                        warn!("Failed to drop {}: {}", target, e);
                    }
                },
            }
        }

        actions
    }
}
