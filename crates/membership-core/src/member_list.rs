//! HostMemberList: the replicated membership and agent-hosting maps.
//!
//! Two replicated maps live in the store:
//! - `membership`: endpoint key -> JSON array of tags. Presence means the
//!   endpoint is a member; eviction deletes the key.
//! - `agent-hosts`: `"{agent}|{endpoint key}"` -> endpoint key, one entry per
//!   (agent, hosting endpoint) pair.
//!
//! Local edits are applied to the local replica immediately and their
//! deltas queued in an outbox for dissemination. The local node never
//! accepts its own eviction: if a merge removes it, it reincarnates with a
//! higher incarnation and re-hosts its agents under the new endpoint.

use crate::endpoint::next_incarnation;
use crate::protocol::{StoreDigest, StoreUpdate, StoreUpdates};
use crate::store::{MapOp, ReplicaStore, StoreError};
use crate::{HostEndpoint, ReplicaId};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MEMBERSHIP_URI: &str = "membership";
pub const AGENT_HOSTS_URI: &str = "agent-hosts";

/// Members and their tags.
pub type Members = BTreeMap<HostEndpoint, BTreeSet<String>>;

/// Agent id -> endpoints currently hosting it.
pub type Landscape = BTreeMap<String, BTreeSet<HostEndpoint>>;

#[derive(Debug, Error)]
pub enum MemberListError {
    #[error("Member list is stopped")]
    Stopped,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Unknown store uri: {0}")]
    UnknownUri(String),

    #[error("Failed to encode tags: {0}")]
    Tags(String),
}

pub type Result<T> = std::result::Result<T, MemberListError>;

/// What a merge did to the local view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Merged state changed
    pub changed: bool,
    /// We were evicted and came back under this endpoint
    pub reincarnated: Option<HostEndpoint>,
}

pub struct HostMemberList {
    local: HostEndpoint,
    tags: BTreeSet<String>,
    store: ReplicaStore,
    hosted: BTreeSet<String>,
    outbox: Vec<StoreUpdate>,
    stopped: bool,
}

impl HostMemberList {
    /// Create the list and announce the local endpoint.
    pub fn new(local: HostEndpoint, tags: BTreeSet<String>, replica: ReplicaId) -> Result<Self> {
        let mut list = Self {
            local,
            tags,
            store: ReplicaStore::new(replica),
            hosted: BTreeSet::new(),
            outbox: Vec::new(),
            stopped: false,
        };

        let announce = MapOp::put(list.local.key(), list.encoded_tags()?);
        list.apply(MEMBERSHIP_URI, &[announce])?;
        Ok(list)
    }

    pub fn local(&self) -> &HostEndpoint {
        &self.local
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn hosted_agents(&self) -> &BTreeSet<String> {
        &self.hosted
    }

    /// Register the local node as hosting `agent_id`. Idempotent.
    pub fn host(&mut self, agent_id: &str) -> Result<bool> {
        self.check_running()?;
        self.hosted.insert(agent_id.to_string());
        let op = MapOp::put(agent_key(agent_id, &self.local), self.local.key());
        self.apply(AGENT_HOSTS_URI, &[op])
    }

    /// Stop hosting `agent_id` locally. Idempotent.
    pub fn stop_hosting(&mut self, agent_id: &str) -> Result<bool> {
        self.check_running()?;
        self.hosted.remove(agent_id);
        let op = MapOp::delete(agent_key(agent_id, &self.local));
        self.apply(AGENT_HOSTS_URI, &[op])
    }

    /// Evict `endpoint` and every agent entry it holds.
    ///
    /// The local endpoint can't be removed this way.
    pub fn remove(&mut self, endpoint: &HostEndpoint) -> Result<bool> {
        self.check_running()?;
        if endpoint == &self.local {
            warn!("Refusing to remove local endpoint {}", endpoint);
            return Ok(false);
        }

        let removed = self.apply(MEMBERSHIP_URI, &[MapOp::delete(endpoint.key())])?;
        let agent_ops = self.agent_entry_deletes(endpoint);
        self.apply(AGENT_HOSTS_URI, &agent_ops)?;

        if removed {
            info!("Removed member {}", endpoint);
        }
        Ok(removed)
    }

    /// Merge a remote delta.
    pub fn apply_remote(&mut self, update: &StoreUpdate) -> Result<MergeOutcome> {
        self.check_running()?;
        if !is_known_uri(&update.uri) {
            return Err(MemberListError::UnknownUri(update.uri.clone()));
        }

        let changed = self.store.apply_remote(update)?;
        self.after_merge(changed)
    }

    /// Merge a batch of remote updates (anti-entropy). Unknown uris are skipped.
    pub fn merge(&mut self, updates: &StoreUpdates) -> Result<MergeOutcome> {
        self.check_running()?;

        let mut known = StoreUpdates::default();
        for (uri, bytes) in &updates.updates {
            if is_known_uri(uri) {
                known.updates.insert(uri.clone(), bytes.clone());
            } else {
                warn!("Ignoring updates for unknown uri {}", uri);
            }
        }

        let changed = !self.store.merge(&known)?.is_empty();
        self.after_merge(changed)
    }

    pub fn digest(&self) -> StoreDigest {
        self.store.digest()
    }

    pub fn updates_since(&self, digest: &StoreDigest) -> Result<StoreUpdates> {
        Ok(self.store.updates_since(digest)?)
    }

    pub fn full_state(&self) -> Result<StoreUpdates> {
        Ok(self.store.full_state()?)
    }

    /// Drain deltas produced by local edits, in order.
    pub fn take_outbound(&mut self) -> Vec<StoreUpdate> {
        std::mem::take(&mut self.outbox)
    }

    /// Current members and their tags.
    pub fn members(&self) -> Members {
        self.store
            .entries(MEMBERSHIP_URI)
            .into_iter()
            .filter_map(|(key, value)| {
                let endpoint = HostEndpoint::parse_key(&key).ok()?;
                let tags: BTreeSet<String> = serde_json::from_str(&value).unwrap_or_default();
                Some((endpoint, tags))
            })
            .collect()
    }

    /// Members other than the local node.
    pub fn peers(&self) -> Vec<HostEndpoint> {
        self.members()
            .into_keys()
            .filter(|endpoint| endpoint != &self.local)
            .collect()
    }

    pub fn contains(&self, endpoint: &HostEndpoint) -> bool {
        self.store
            .entries(MEMBERSHIP_URI)
            .contains_key(&endpoint.key())
    }

    /// Agents and the member endpoints hosting them.
    pub fn landscape(&self) -> Landscape {
        let members = self.members();
        let mut landscape = Landscape::new();

        for (key, value) in self.store.entries(AGENT_HOSTS_URI) {
            let Ok(endpoint) = HostEndpoint::parse_key(&value) else {
                continue;
            };
            let Some(agent_id) = key.strip_suffix(&format!("|{}", value)) else {
                continue;
            };
            if members.contains_key(&endpoint) {
                landscape
                    .entry(agent_id.to_string())
                    .or_default()
                    .insert(endpoint);
            }
        }

        landscape
    }

    /// Leave: withdraw the local entry and its agents, then stop.
    ///
    /// The leave deltas stay in the outbox for a best-effort flush.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }

        let local = self.local.clone();
        self.apply(MEMBERSHIP_URI, &[MapOp::delete(local.key())])?;
        let agent_ops = self.agent_entry_deletes(&local);
        self.apply(AGENT_HOSTS_URI, &agent_ops)?;

        self.store.stop();
        self.stopped = true;
        debug!("Member list stopped ({} pending deltas)", self.outbox.len());
        Ok(())
    }

    fn check_running(&self) -> Result<()> {
        if self.stopped {
            Err(MemberListError::Stopped)
        } else {
            Ok(())
        }
    }

    fn apply(&mut self, uri: &str, ops: &[MapOp]) -> Result<bool> {
        if ops.is_empty() {
            return Ok(false);
        }
        match self.store.apply_local(uri, ops)? {
            Some(update) => {
                self.outbox.push(update);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn encoded_tags(&self) -> Result<String> {
        serde_json::to_string(&self.tags).map_err(|e| MemberListError::Tags(e.to_string()))
    }

    fn agent_entry_deletes(&self, endpoint: &HostEndpoint) -> Vec<MapOp> {
        let key = endpoint.key();
        self.store
            .entries(AGENT_HOSTS_URI)
            .into_iter()
            .filter(|(_, value)| value == &key)
            .map(|(agent_key, _)| MapOp::delete(agent_key))
            .collect()
    }

    /// Keep the local node present after a merge.
    fn after_merge(&mut self, changed: bool) -> Result<MergeOutcome> {
        let mut outcome = MergeOutcome {
            changed,
            reincarnated: None,
        };
        if !changed {
            return Ok(outcome);
        }

        let members = self.members();

        // Older incarnations of our own address are us before a restart
        let stale: Vec<HostEndpoint> = members
            .keys()
            .filter(|m| self.local.supersedes(m))
            .cloned()
            .collect();
        for stale in stale {
            info!("Removing stale incarnation {} of local host", stale);
            self.apply(MEMBERSHIP_URI, &[MapOp::delete(stale.key())])?;
            let agent_ops = self.agent_entry_deletes(&stale);
            self.apply(AGENT_HOSTS_URI, &agent_ops)?;
        }

        if !members.contains_key(&self.local) {
            let previous = self.local.clone();
            let incarnation = next_incarnation(previous.incarnation + 1);
            self.local = previous.with_incarnation(incarnation);
            warn!(
                "Local endpoint {} was evicted, rejoining as {}",
                previous, self.local
            );

            let announce = MapOp::put(self.local.key(), self.encoded_tags()?);
            self.apply(MEMBERSHIP_URI, &[announce])?;
            let stale_agents = self.agent_entry_deletes(&previous);
            self.apply(AGENT_HOSTS_URI, &stale_agents)?;
            outcome.reincarnated = Some(self.local.clone());
        }

        let present = self.store.entries(AGENT_HOSTS_URI);
        let missing: Vec<MapOp> = self
            .hosted
            .iter()
            .map(|agent_id| agent_key(agent_id, &self.local))
            .filter(|key| !present.contains_key(key))
            .map(|key| MapOp::put(key, self.local.key()))
            .collect();
        self.apply(AGENT_HOSTS_URI, &missing)?;

        Ok(outcome)
    }
}

fn agent_key(agent_id: &str, endpoint: &HostEndpoint) -> String {
    format!("{}|{}", agent_id, endpoint.key())
}

fn is_known_uri(uri: &str) -> bool {
    uri == MEMBERSHIP_URI || uri == AGENT_HOSTS_URI
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> HostEndpoint {
        HostEndpoint::new("127.0.0.1", port, 100)
    }

    fn list(port: u16) -> HostMemberList {
        let tags = ["local".to_string()].into_iter().collect();
        HostMemberList::new(endpoint(port), tags, ReplicaId::from(port as u64)).unwrap()
    }

    /// Deliver every pending delta from `from` to `to`.
    fn deliver(from: &mut HostMemberList, to: &mut HostMemberList) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for update in from.take_outbound() {
            let result = to.apply_remote(&update).unwrap();
            outcome.changed |= result.changed;
            if result.reincarnated.is_some() {
                outcome.reincarnated = result.reincarnated;
            }
        }
        outcome
    }

    fn exchange(a: &mut HostMemberList, b: &mut HostMemberList) {
        let for_b = a.updates_since(&b.digest()).unwrap();
        let for_a = b.updates_since(&a.digest()).unwrap();
        b.merge(&for_b).unwrap();
        a.merge(&for_a).unwrap();
    }

    // ==================== Local State ====================

    #[test]
    fn test_new_announces_self() {
        let mut a = list(7000);
        assert_eq!(a.take_outbound().len(), 1);

        let members = a.members();
        assert_eq!(members.len(), 1);
        assert!(members[&endpoint(7000)].contains("local"));
        assert!(a.contains(&endpoint(7000)));
        assert!(a.peers().is_empty());
    }

    #[test]
    fn test_host_and_stop_hosting_are_idempotent() {
        let mut a = list(7000);
        assert!(a.host("agent-1").unwrap());
        assert!(!a.host("agent-1").unwrap());
        assert_eq!(
            a.landscape()["agent-1"],
            [endpoint(7000)].into_iter().collect()
        );

        assert!(a.stop_hosting("agent-1").unwrap());
        assert!(!a.stop_hosting("agent-1").unwrap());
        assert!(a.landscape().is_empty());
    }

    #[test]
    fn test_agent_ids_with_separator() {
        let mut a = list(7000);
        a.host("team|inbox").unwrap();
        assert!(a.landscape().contains_key("team|inbox"));
    }

    // ==================== Replication ====================

    #[test]
    fn test_deltas_converge_two_lists() {
        let mut a = list(7000);
        let mut b = list(7001);
        a.host("agent-1").unwrap();
        b.host("agent-1").unwrap();
        b.host("agent-2").unwrap();

        assert!(deliver(&mut a, &mut b).changed);
        assert!(deliver(&mut b, &mut a).changed);

        assert_eq!(a.members(), b.members());
        assert_eq!(a.landscape(), b.landscape());
        assert_eq!(a.landscape()["agent-1"].len(), 2);
        assert_eq!(a.peers(), vec![endpoint(7001)]);
    }

    #[test]
    fn test_anti_entropy_converges() {
        let mut a = list(7000);
        let mut b = list(7001);
        a.host("x").unwrap();
        a.take_outbound();
        b.take_outbound();

        exchange(&mut a, &mut b);
        assert_eq!(a.members(), b.members());
        assert_eq!(a.landscape(), b.landscape());
    }

    #[test]
    fn test_unknown_uri_rejected() {
        let mut a = list(7000);
        let update = StoreUpdate {
            uri: "sessions".to_string(),
            updates: vec![],
        };
        assert!(matches!(
            a.apply_remote(&update),
            Err(MemberListError::UnknownUri(_))
        ));
    }

    // ==================== Eviction ====================

    #[test]
    fn test_remove_drops_member_and_agents() {
        let mut a = list(7000);
        let mut b = list(7001);
        b.host("agent-1").unwrap();
        deliver(&mut b, &mut a);
        a.take_outbound();

        assert!(a.remove(&endpoint(7001)).unwrap());
        assert!(!a.contains(&endpoint(7001)));
        assert!(a.landscape().is_empty());
        assert_eq!(a.take_outbound().len(), 2);

        assert!(!a.remove(&endpoint(7001)).unwrap());
    }

    #[test]
    fn test_remove_local_refused() {
        let mut a = list(7000);
        assert!(!a.remove(&endpoint(7000)).unwrap());
        assert!(a.contains(&endpoint(7000)));
    }

    #[test]
    fn test_evicted_local_reincarnates_and_rehosts() {
        let mut a = list(7000);
        let mut b = list(7001);
        a.host("agent-1").unwrap();
        deliver(&mut a, &mut b);
        deliver(&mut b, &mut a);

        // b decides a is dead
        b.remove(&endpoint(7000)).unwrap();
        let outcome = deliver(&mut b, &mut a);

        let new_local = outcome.reincarnated.expect("should reincarnate");
        assert!(new_local.supersedes(&endpoint(7000)));
        assert_eq!(a.local(), &new_local);

        deliver(&mut a, &mut b);
        assert!(b.contains(&new_local));
        assert!(!b.contains(&endpoint(7000)));
        assert_eq!(
            b.landscape()["agent-1"],
            [new_local.clone()].into_iter().collect()
        );
    }

    #[test]
    fn test_stale_own_incarnation_removed_on_merge() {
        let mut old = list(7000);
        let mut peer = list(7001);
        deliver(&mut old, &mut peer);

        let tags = BTreeSet::new();
        let mut restarted =
            HostMemberList::new(endpoint(7000).with_incarnation(200), tags, ReplicaId::from(9))
                .unwrap();

        let state = peer.full_state().unwrap();
        restarted.merge(&state).unwrap();
        assert!(!restarted.contains(&endpoint(7000)));
        assert!(restarted.contains(&endpoint(7001)));

        deliver(&mut restarted, &mut peer);
        assert!(!peer.contains(&endpoint(7000)));
        assert!(peer.contains(&endpoint(7000).with_incarnation(200)));
    }

    #[test]
    fn test_landscape_ignores_non_members() {
        let mut a = list(7000);
        let mut b = list(7001);
        b.host("agent-1").unwrap();
        let updates = b.take_outbound();

        // Agent entry arrives without b's membership entry
        a.apply_remote(&updates[1]).unwrap();
        assert!(a.landscape().is_empty());
        a.apply_remote(&updates[0]).unwrap();
        assert_eq!(a.landscape()["agent-1"].len(), 1);
    }

    // ==================== Lifecycle ====================

    #[test]
    fn test_stop_leaves_and_rejects_operations() {
        let mut a = list(7000);
        let mut b = list(7001);
        a.host("agent-1").unwrap();
        deliver(&mut a, &mut b);

        a.stop().unwrap();
        assert!(matches!(a.host("agent-2"), Err(MemberListError::Stopped)));
        assert!(matches!(
            a.stop_hosting("agent-1"),
            Err(MemberListError::Stopped)
        ));
        assert!(a.stop().is_ok());

        deliver(&mut a, &mut b);
        assert!(!b.contains(&endpoint(7000)));
        assert!(b.landscape().is_empty());
    }
}
