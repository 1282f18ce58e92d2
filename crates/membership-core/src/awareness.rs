//! Local health score.
//!
//! Rises when our probes time out (we may be the slow one) and falls on
//! every successful round trip. Probe timeouts grow with the score and
//! gossip retransmissions shrink with it, so an overloaded node backs off
//! instead of amplifying congestion.

/// Bounded health score in `[0, max_multiplier - 1]`. 0 is healthy.
#[derive(Debug, Clone)]
pub struct Awareness {
    score: u32,
    max_multiplier: u32,
}

impl Awareness {
    pub fn new(max_multiplier: u32) -> Self {
        Self {
            score: 0,
            max_multiplier: max_multiplier.max(1),
        }
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn is_healthy(&self) -> bool {
        self.score == 0
    }

    /// A probe went unanswered.
    pub fn on_failure(&mut self) {
        self.score = (self.score + 1).min(self.max_multiplier - 1);
    }

    /// A probe round trip succeeded.
    pub fn on_success(&mut self) {
        self.score = self.score.saturating_sub(1);
    }

    /// Scale a base timeout: `base * (score + 1)`, at most `base * max_multiplier`.
    pub fn scale(&self, base_ms: u64) -> u64 {
        base_ms.saturating_mul(u64::from(self.score) + 1)
    }

    /// How many distinct peers one gossip item is sent to before it is retired.
    ///
    /// `min(max_transmits, multiplier * ceil(log10(cluster_size + 1)))`,
    /// reduced linearly as the score rises, never below 1.
    pub fn retransmit_limit(&self, max_transmits: usize, multiplier: u32, cluster_size: usize) -> usize {
        let log = ((cluster_size as f64) + 1.0).log10().ceil().max(1.0) as usize;
        let base = ((multiplier as usize).max(1) * log).min(max_transmits.max(1));
        let headroom = (self.max_multiplier - self.score) as usize;
        (base * headroom / self.max_multiplier as usize).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_is_clamped() {
        let mut awareness = Awareness::new(3);
        for _ in 0..10 {
            awareness.on_failure();
        }
        assert_eq!(awareness.score(), 2);

        for _ in 0..10 {
            awareness.on_success();
        }
        assert_eq!(awareness.score(), 0);
        assert!(awareness.is_healthy());
    }

    #[test]
    fn test_scale_grows_with_score() {
        let mut awareness = Awareness::new(8);
        assert_eq!(awareness.scale(500), 500);
        awareness.on_failure();
        assert_eq!(awareness.scale(500), 1000);
        for _ in 0..20 {
            awareness.on_failure();
        }
        assert_eq!(awareness.scale(500), 4000);
    }

    #[test]
    fn test_retransmit_limit_scales_with_cluster() {
        let awareness = Awareness::new(8);
        assert_eq!(awareness.retransmit_limit(16, 2, 0), 2);
        assert_eq!(awareness.retransmit_limit(16, 2, 5), 2);
        assert_eq!(awareness.retransmit_limit(16, 2, 10), 4);
        assert_eq!(awareness.retransmit_limit(16, 3, 150), 9);
    }

    #[test]
    fn test_retransmit_limit_clamped() {
        let awareness = Awareness::new(8);
        assert_eq!(awareness.retransmit_limit(4, 4, 5), 4);
        assert_eq!(awareness.retransmit_limit(4, 4, 16), 4);
        assert_eq!(awareness.retransmit_limit(0, 4, 16), 1);
    }

    #[test]
    fn test_retransmit_limit_shrinks_when_unhealthy() {
        let mut awareness = Awareness::new(4);
        let healthy = awareness.retransmit_limit(16, 4, 100);

        let mut previous = healthy;
        for _ in 0..3 {
            awareness.on_failure();
            let limit = awareness.retransmit_limit(16, 4, 100);
            assert!(limit <= previous);
            assert!(limit >= 1);
            previous = limit;
        }
        assert!(previous < healthy);
    }
}
