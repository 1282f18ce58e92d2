//! MemberSelector: picks gossip, probe and healing targets.
//!
//! Shuffled round-robin: members are visited in a random order, one pass
//! at a time, and the order is reshuffled at the end of every pass. New
//! members are inserted at a random point of the current pass, so every
//! member is chosen equally often in the long run.

use crate::HostEndpoint;
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Unknown endpoint: {0}")]
    Unknown(HostEndpoint),

    #[error("Unresolvable address for {endpoint}: {reason}")]
    Unresolvable {
        endpoint: HostEndpoint,
        reason: String,
    },
}

/// Maps logical endpoints to dialable network addresses.
pub trait HostAddressResolver: Send + Sync {
    fn resolve(&self, endpoint: &HostEndpoint) -> Result<SocketAddr, ResolveError>;
}

/// Resolves an endpoint by parsing its own `address:port`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointResolver;

impl HostAddressResolver for EndpointResolver {
    fn resolve(&self, endpoint: &HostEndpoint) -> Result<SocketAddr, ResolveError> {
        endpoint
            .socket_addr()
            .map_err(|e| ResolveError::Unresolvable {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })
    }
}

pub struct MemberSelector {
    rotation: Vec<HostEndpoint>,
    cursor: usize,
    resolver: Arc<dyn HostAddressResolver>,
}

impl MemberSelector {
    pub fn new(resolver: Arc<dyn HostAddressResolver>) -> Self {
        Self {
            rotation: Vec::new(),
            cursor: 0,
            resolver,
        }
    }

    pub fn resolver(&self) -> &Arc<dyn HostAddressResolver> {
        &self.resolver
    }

    pub fn len(&self) -> usize {
        self.rotation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rotation.is_empty()
    }

    /// Sync the rotation with the current membership.
    pub fn refresh<I>(&mut self, members: I)
    where
        I: IntoIterator<Item = HostEndpoint>,
    {
        let current: HashSet<HostEndpoint> = members.into_iter().collect();

        let mut index = 0;
        while index < self.rotation.len() {
            if current.contains(&self.rotation[index]) {
                index += 1;
            } else {
                self.rotation.remove(index);
                if index < self.cursor {
                    self.cursor -= 1;
                }
            }
        }

        let known: HashSet<HostEndpoint> = self.rotation.iter().cloned().collect();
        let mut rng = rand::rng();
        for member in current {
            if known.contains(&member) {
                continue;
            }
            let position = rng.random_range(self.cursor..=self.rotation.len());
            self.rotation.insert(position, member);
        }

        if self.cursor > self.rotation.len() {
            self.cursor = self.rotation.len();
        }
    }

    /// Up to `n` distinct members not in `excluding`, with their addresses.
    ///
    /// Members whose address can't be resolved are skipped this round.
    pub fn select(
        &mut self,
        n: usize,
        excluding: &HashSet<HostEndpoint>,
    ) -> Vec<(HostEndpoint, SocketAddr)> {
        let mut selected = Vec::new();
        if n == 0 || self.rotation.is_empty() {
            return selected;
        }

        let mut visited = HashSet::new();
        let mut steps = 0;
        while selected.len() < n && steps < self.rotation.len() * 2 {
            if self.cursor >= self.rotation.len() {
                self.rotation.shuffle(&mut rand::rng());
                self.cursor = 0;
            }
            let candidate = self.rotation[self.cursor].clone();
            self.cursor += 1;
            steps += 1;

            if excluding.contains(&candidate) || !visited.insert(candidate.clone()) {
                continue;
            }

            match self.resolver.resolve(&candidate) {
                Ok(addr) => selected.push((candidate, addr)),
                Err(e) => debug!("Skipping {}: {}", candidate, e),
            }
        }

        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn endpoint(port: u16) -> HostEndpoint {
        HostEndpoint::new("127.0.0.1", port, 1)
    }

    fn selector() -> MemberSelector {
        MemberSelector::new(Arc::new(EndpointResolver))
    }

    #[test]
    fn test_empty_view_selects_nothing() {
        let mut selector = selector();
        assert!(selector.select(3, &HashSet::new()).is_empty());
    }

    #[test]
    fn test_select_distinct_and_excluding() {
        let mut selector = selector();
        selector.refresh((7000..7005).map(endpoint));

        let excluding: HashSet<_> = [endpoint(7000)].into_iter().collect();
        for _ in 0..20 {
            let picked = selector.select(3, &excluding);
            assert_eq!(picked.len(), 3);
            let unique: HashSet<_> = picked.iter().map(|(e, _)| e.clone()).collect();
            assert_eq!(unique.len(), 3);
            assert!(!unique.contains(&endpoint(7000)));
        }
    }

    #[test]
    fn test_select_more_than_available() {
        let mut selector = selector();
        selector.refresh((7000..7003).map(endpoint));
        assert_eq!(selector.select(10, &HashSet::new()).len(), 3);
    }

    #[test]
    fn test_round_robin_is_fair() {
        let mut selector = selector();
        selector.refresh((7000..7004).map(endpoint));

        let mut counts: HashMap<HostEndpoint, usize> = HashMap::new();
        for _ in 0..400 {
            for (member, _) in selector.select(1, &HashSet::new()) {
                *counts.entry(member).or_default() += 1;
            }
        }

        assert_eq!(counts.len(), 4);
        for count in counts.values() {
            assert_eq!(*count, 100);
        }
    }

    #[test]
    fn test_refresh_drops_departed_members() {
        let mut selector = selector();
        selector.refresh((7000..7004).map(endpoint));
        selector.select(2, &HashSet::new());

        selector.refresh([endpoint(7001), endpoint(7009)]);
        assert_eq!(selector.len(), 2);

        let picked: HashSet<_> = selector
            .select(5, &HashSet::new())
            .into_iter()
            .map(|(e, _)| e)
            .collect();
        assert_eq!(picked, [endpoint(7001), endpoint(7009)].into_iter().collect());
    }

    #[test]
    fn test_unresolvable_members_are_skipped() {
        let mut selector = selector();
        selector.refresh([endpoint(7000), HostEndpoint::new("not-an-ip", 7001, 1)]);

        let picked = selector.select(2, &HashSet::new());
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].0, endpoint(7000));
        assert_eq!(picked[0].1, "127.0.0.1:7000".parse::<SocketAddr>().unwrap());
    }
}
