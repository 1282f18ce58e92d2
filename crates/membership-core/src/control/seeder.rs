//! AutoSeeder: the join control loop.
//!
//! A join contacts every seed at once and succeeds on the first reply.
//! If nobody answers within the join timeout, the whole seed set is tried
//! again after the retry delay, until a seed answers or the seeder stops.
//! Concurrent joins share the one outstanding attempt.

use crate::config::AgentHostOptions;
use rand::seq::IteratorRandom;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeederState {
    Idle,
    Attempting { deadline: u64 },
    Waiting { retry_at: u64 },
    Joined,
    Stopped,
}

/// Result of asking the seeder to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinStart {
    /// Send a join request to these seeds
    Contact(Vec<SocketAddr>),
    /// Folded into the attempt already in flight
    Coalesced,
    /// Nothing to contact; the join is trivially complete
    Complete,
    /// The seeder has been stopped
    Stopped,
}

/// Something the scheduler must do after [`AutoSeeder::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeederEvent {
    /// Retry: send a join request to these seeds
    Contact(Vec<SocketAddr>),
    /// The attempt timed out; waiting to retry
    Retrying { retry_at: u64 },
}

pub struct AutoSeeder {
    local_addr: SocketAddr,
    join_timeout_ms: u64,
    retry_ms: u64,
    seeds: BTreeSet<SocketAddr>,
    state: SeederState,
}

impl AutoSeeder {
    pub fn new(local_addr: SocketAddr, options: &AgentHostOptions) -> Self {
        Self {
            local_addr,
            join_timeout_ms: options.join_timeout_ms,
            retry_ms: options.join_retry().as_millis() as u64,
            seeds: BTreeSet::new(),
            state: SeederState::Idle,
        }
    }

    /// Seeds seen so far (excluding our own address).
    pub fn seeds(&self) -> &BTreeSet<SocketAddr> {
        &self.seeds
    }

    pub fn random_seed(&self) -> Option<SocketAddr> {
        self.seeds.iter().copied().choose(&mut rand::rng())
    }

    /// An attempt is in flight or waiting to retry.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            SeederState::Attempting { .. } | SeederState::Waiting { .. }
        )
    }

    pub fn is_stopped(&self) -> bool {
        self.state == SeederState::Stopped
    }

    /// Begin (or join) a join attempt.
    pub fn join<I>(&mut self, seeds: I, now_ms: u64) -> JoinStart
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        if self.is_stopped() {
            return JoinStart::Stopped;
        }

        let requested: BTreeSet<SocketAddr> = seeds
            .into_iter()
            .filter(|seed| *seed != self.local_addr)
            .collect();
        let fresh: Vec<SocketAddr> = requested.difference(&self.seeds).copied().collect();
        self.seeds.extend(requested.iter().copied());

        if self.is_pending() {
            if fresh.is_empty() {
                return JoinStart::Coalesced;
            }
            debug!("Adding {} seed(s) to the pending join", fresh.len());
            return JoinStart::Contact(fresh);
        }

        if requested.is_empty() {
            return JoinStart::Complete;
        }

        self.state = SeederState::Attempting {
            deadline: now_ms + self.join_timeout_ms,
        };
        info!("Joining via {} seed(s)", requested.len());
        JoinStart::Contact(requested.into_iter().collect())
    }

    /// A seed answered. Returns true if this completes a pending join.
    pub fn on_response(&mut self) -> bool {
        if self.is_pending() {
            self.state = SeederState::Joined;
            info!("Joined cluster");
            true
        } else {
            false
        }
    }

    /// Advance timers.
    pub fn check(&mut self, now_ms: u64) -> Option<SeederEvent> {
        match self.state {
            SeederState::Attempting { deadline } if now_ms >= deadline => {
                let retry_at = now_ms + self.retry_ms;
                warn!(
                    "No seed answered within {}ms, retrying in {}ms",
                    self.join_timeout_ms, self.retry_ms
                );
                self.state = SeederState::Waiting { retry_at };
                Some(SeederEvent::Retrying { retry_at })
            }
            SeederState::Waiting { retry_at } if now_ms >= retry_at => {
                self.state = SeederState::Attempting {
                    deadline: now_ms + self.join_timeout_ms,
                };
                Some(SeederEvent::Contact(self.seeds.iter().copied().collect()))
            }
            _ => None,
        }
    }

    /// Stop for good. Returns true if a join was still pending.
    pub fn stop(&mut self) -> bool {
        let was_pending = self.is_pending();
        self.state = SeederState::Stopped;
        was_pending
    }
}
