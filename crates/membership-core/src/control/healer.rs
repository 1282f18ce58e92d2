//! AutoHealer: periodic anti-entropy.
//!
//! Every healing interval one random peer gets our version vectors and
//! answers with whatever we're missing (and asks for what it is missing).
//! At most one exchange is outstanding; an exchange that outlives the
//! healing timeout is abandoned and the loop simply carries on.

use crate::config::AgentHostOptions;
use std::net::SocketAddr;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingHeal {
    peer: SocketAddr,
    deadline: u64,
}

pub struct AutoHealer {
    interval_ms: u64,
    timeout_ms: u64,
    next_tick: Option<u64>,
    pending: Option<PendingHeal>,
    stopped: bool,
}

impl AutoHealer {
    pub fn new(options: &AgentHostOptions) -> Self {
        Self {
            interval_ms: options.auto_healing_interval_ms,
            timeout_ms: options.auto_healing_timeout_ms,
            next_tick: None,
            pending: None,
            stopped: false,
        }
    }

    /// Returns true when a new exchange should start now.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        if self.stopped {
            return false;
        }

        if let Some(pending) = self.pending {
            if now_ms >= pending.deadline {
                warn!(
                    "Healing exchange with {} timed out after {}ms",
                    pending.peer, self.timeout_ms
                );
                self.pending = None;
            }
        }

        let next_tick = *self.next_tick.get_or_insert(now_ms + self.interval_ms);
        if now_ms < next_tick {
            return false;
        }
        self.next_tick = Some(now_ms + self.interval_ms);

        if self.pending.is_some() {
            debug!("Skipping healing round, previous exchange still pending");
            return false;
        }
        true
    }

    /// An exchange with `peer` was sent.
    pub fn begin(&mut self, peer: SocketAddr, now_ms: u64) {
        self.pending = Some(PendingHeal {
            peer,
            deadline: now_ms + self.timeout_ms,
        });
    }

    /// `peer` answered. Returns true if it was the pending exchange.
    pub fn complete(&mut self, peer: SocketAddr) -> bool {
        match self.pending {
            Some(pending) if pending.peer == peer => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn stop(&mut self) {
        self.stopped = true;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7001))
    }

    #[test]
    fn test_first_tick_waits_one_interval() {
        let mut healer = AutoHealer::new(&AgentHostOptions::default());
        assert!(!healer.tick(0));
        assert!(!healer.tick(4_999));
        assert!(healer.tick(5_000));
        assert!(!healer.tick(5_001));
        assert!(healer.tick(10_000));
    }

    #[test]
    fn test_pending_exchange_blocks_next_round() {
        let mut healer = AutoHealer::new(&AgentHostOptions::default());
        healer.tick(0);
        assert!(healer.tick(5_000));
        healer.begin(peer(), 5_000);

        // Times out at 8_000, so the round at 10_000 runs
        assert!(!healer.tick(7_000));
        assert!(healer.tick(10_000));
    }

    #[test]
    fn test_complete_clears_pending() {
        let mut healer = AutoHealer::new(&AgentHostOptions::default());
        healer.begin(peer(), 0);
        assert!(!healer.complete(SocketAddr::from(([127, 0, 0, 1], 7002))));
        assert!(healer.complete(peer()));
        assert!(!healer.is_pending());
    }

    #[test]
    fn test_unanswered_exchange_skips_round() {
        let options = AgentHostOptions {
            auto_healing_interval_ms: 1_000,
            auto_healing_timeout_ms: 3_000,
            ..Default::default()
        };
        let mut healer = AutoHealer::new(&options);
        healer.tick(0);
        assert!(healer.tick(1_000));
        healer.begin(peer(), 1_000);

        assert!(!healer.tick(2_000));
        assert!(!healer.tick(3_000));
        assert!(healer.tick(4_000));
    }

    #[test]
    fn test_stop() {
        let mut healer = AutoHealer::new(&AgentHostOptions::default());
        healer.stop();
        assert!(!healer.tick(100_000));
    }
}
