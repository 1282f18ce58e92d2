use membership_core::{HostEndpoint, Landscape};
use std::collections::BTreeSet;
use tokio::sync::watch;

/// Handle to an agent hosted on this node.
///
/// Tracks where else in the cluster the same agent is hosted.
pub struct Agent {
    id: String,
    local: watch::Receiver<HostEndpoint>,
    landscape: watch::Receiver<Landscape>,
    last_seen: BTreeSet<HostEndpoint>,
}

impl Agent {
    pub(crate) fn new(
        id: &str,
        local: watch::Receiver<HostEndpoint>,
        landscape: watch::Receiver<Landscape>,
    ) -> Self {
        let mut agent = Self {
            id: id.to_string(),
            local,
            landscape,
            last_seen: BTreeSet::new(),
        };
        agent.last_seen = agent.hosts();
        agent
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The endpoint hosting this handle.
    pub fn local(&self) -> HostEndpoint {
        self.local.borrow().clone()
    }

    /// Every endpoint currently hosting this agent.
    pub fn hosts(&self) -> BTreeSet<HostEndpoint> {
        self.landscape
            .borrow()
            .get(&self.id)
            .cloned()
            .unwrap_or_default()
    }

    /// Wait until the set of hosts changes. Returns `None` once the host
    /// has shut down.
    pub async fn changed(&mut self) -> Option<BTreeSet<HostEndpoint>> {
        loop {
            self.landscape.changed().await.ok()?;
            let hosts = self.hosts();
            if hosts != self.last_seen {
                self.last_seen = hosts.clone();
                return Some(hosts);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> HostEndpoint {
        HostEndpoint::new("127.0.0.1", port, 1)
    }

    fn landscape(entries: &[(&str, u16)]) -> Landscape {
        let mut landscape = Landscape::new();
        for (agent, port) in entries {
            landscape
                .entry(agent.to_string())
                .or_default()
                .insert(endpoint(*port));
        }
        landscape
    }

    #[tokio::test]
    async fn test_changed_ignores_other_agents() {
        let (_local_tx, local_rx) = watch::channel(endpoint(7000));
        let (landscape_tx, landscape_rx) = watch::channel(landscape(&[("a", 7000)]));
        let mut agent = Agent::new("a", local_rx, landscape_rx);
        assert_eq!(agent.local(), endpoint(7000));

        landscape_tx.send_replace(landscape(&[("a", 7000), ("b", 7001)]));
        landscape_tx.send_replace(landscape(&[("a", 7000), ("a", 7001)]));

        let hosts = agent.changed().await.unwrap();
        let expected: BTreeSet<HostEndpoint> = [endpoint(7000), endpoint(7001)].into_iter().collect();
        assert_eq!(hosts, expected);
    }

    #[tokio::test]
    async fn test_changed_ends_with_host() {
        let (_local_tx, local_rx) = watch::channel(endpoint(7000));
        let (landscape_tx, landscape_rx) = watch::channel(Landscape::new());
        let mut agent = Agent::new("a", local_rx, landscape_rx);

        drop(landscape_tx);
        assert!(agent.changed().await.is_none());
    }
}
