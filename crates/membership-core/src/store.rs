//! ReplicaStore: named replicated string maps backed by Loro.
//!
//! Each uri owns one `LoroDoc` with a single root map of the same name.
//! Local edits are committed as a batch and exported as a delta
//! ([`StoreUpdate`]) for dissemination. Remote deltas are imported and
//! merged causally, so replicas converge regardless of delivery order.
//!
//! Anti-entropy works on version vectors: a peer sends its [`StoreDigest`]
//! and receives exactly the updates it is missing.

use crate::ReplicaId;
use crate::protocol::{StoreDigest, StoreUpdate, StoreUpdates};
use loro::{ExportMode, LoroDoc, LoroValue, VersionVector};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Store is stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One edit to a replicated map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapOp {
    Put { key: String, value: String },
    Delete { key: String },
}

impl MapOp {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        MapOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        MapOp::Delete { key: key.into() }
    }
}

pub struct ReplicaStore {
    replica: ReplicaId,
    docs: BTreeMap<String, LoroDoc>,
    stopped: bool,
}

impl ReplicaStore {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            docs: BTreeMap::new(),
            stopped: false,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stop accepting local and remote changes. Reads keep working.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    fn doc(&mut self, uri: &str) -> &LoroDoc {
        let replica = self.replica.as_u64();
        self.docs.entry(uri.to_string()).or_insert_with(|| {
            let doc = LoroDoc::new();
            doc.set_peer_id(replica).ok();
            doc
        })
    }

    /// Apply a batch of local edits to `uri`.
    ///
    /// Returns the delta to disseminate, or `None` if nothing changed.
    pub fn apply_local(&mut self, uri: &str, ops: &[MapOp]) -> Result<Option<StoreUpdate>> {
        if self.stopped {
            return Err(StoreError::Stopped);
        }

        let current = self.entries(uri);
        let doc = self.doc(uri);
        let map = doc.get_map(uri);
        let before = doc.oplog_vv();
        let mut changed = false;

        for op in ops {
            match op {
                MapOp::Put { key, value } => {
                    if current.get(key) != Some(value) {
                        map.insert(key, value.as_str())
                            .map_err(|e| StoreError::Loro(e.to_string()))?;
                        changed = true;
                    }
                }
                MapOp::Delete { key } => {
                    if current.contains_key(key) {
                        map.delete(key)
                            .map_err(|e| StoreError::Loro(e.to_string()))?;
                        changed = true;
                    }
                }
            }
        }

        if !changed {
            return Ok(None);
        }

        doc.commit();
        let updates = doc
            .export(ExportMode::updates(&before))
            .map_err(|e| StoreError::Loro(e.to_string()))?;

        Ok(Some(StoreUpdate {
            uri: uri.to_string(),
            updates,
        }))
    }

    /// Import a remote delta. Returns true if the local state advanced.
    pub fn apply_remote(&mut self, update: &StoreUpdate) -> Result<bool> {
        if self.stopped {
            return Err(StoreError::Stopped);
        }

        let doc = self.doc(&update.uri);
        let before = doc.oplog_vv();
        doc.import(&update.updates)
            .map_err(|e| StoreError::Loro(e.to_string()))?;
        Ok(!before.includes_vv(&doc.oplog_vv()))
    }

    /// Import a batch of remote updates. Returns the uris that changed.
    pub fn merge(&mut self, updates: &StoreUpdates) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        for (uri, bytes) in &updates.updates {
            let update = StoreUpdate {
                uri: uri.clone(),
                updates: bytes.clone(),
            };
            if self.apply_remote(&update)? {
                changed.push(uri.clone());
            }
        }
        Ok(changed)
    }

    /// Current contents of `uri` (empty if the map has never been touched).
    pub fn entries(&self, uri: &str) -> BTreeMap<String, String> {
        let Some(doc) = self.docs.get(uri) else {
            return BTreeMap::new();
        };

        match doc.get_map(uri).get_deep_value() {
            LoroValue::Map(map) => map
                .iter()
                .filter_map(|(key, value)| match value {
                    LoroValue::String(s) => Some((key.clone(), s.to_string())),
                    _ => None,
                })
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Version vectors of every map, for anti-entropy.
    pub fn digest(&self) -> StoreDigest {
        StoreDigest {
            versions: self
                .docs
                .iter()
                .map(|(uri, doc)| (uri.clone(), doc.oplog_vv().encode()))
                .collect(),
        }
    }

    /// Updates a peer with `digest` is missing.
    pub fn updates_since(&self, digest: &StoreDigest) -> Result<StoreUpdates> {
        let mut out = StoreUpdates::default();

        for (uri, doc) in &self.docs {
            let theirs = match digest.versions.get(uri) {
                Some(bytes) => VersionVector::decode(bytes)
                    .map_err(|e| StoreError::Loro(e.to_string()))?,
                None => VersionVector::default(),
            };

            if theirs.includes_vv(&doc.oplog_vv()) {
                continue;
            }

            let bytes = doc
                .export(ExportMode::updates(&theirs))
                .map_err(|e| StoreError::Loro(e.to_string()))?;
            out.updates.insert(uri.clone(), bytes);
        }

        Ok(out)
    }

    /// Everything this replica knows.
    pub fn full_state(&self) -> Result<StoreUpdates> {
        self.updates_since(&StoreDigest::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URI: &str = "membership";

    fn store(id: u64) -> ReplicaStore {
        ReplicaStore::new(ReplicaId::from(id))
    }

    // ==================== Local Edits ====================

    #[test]
    fn test_put_produces_delta() {
        let mut a = store(1);
        let update = a.apply_local(URI, &[MapOp::put("k", "v")]).unwrap();
        assert!(update.is_some());
        assert_eq!(a.entries(URI).get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn test_noop_put_returns_none() {
        let mut a = store(1);
        a.apply_local(URI, &[MapOp::put("k", "v")]).unwrap();
        assert!(a.apply_local(URI, &[MapOp::put("k", "v")]).unwrap().is_none());
        assert!(a.apply_local(URI, &[MapOp::delete("missing")]).unwrap().is_none());
    }

    #[test]
    fn test_stopped_rejects_changes() {
        let mut a = store(1);
        a.stop();
        assert!(matches!(
            a.apply_local(URI, &[MapOp::put("k", "v")]),
            Err(StoreError::Stopped)
        ));
    }

    // ==================== Replication ====================

    #[test]
    fn test_delta_replicates() {
        let mut a = store(1);
        let mut b = store(2);

        let put = a.apply_local(URI, &[MapOp::put("k", "v")]).unwrap().unwrap();
        assert!(b.apply_remote(&put).unwrap());
        assert_eq!(b.entries(URI), a.entries(URI));

        let delete = a.apply_local(URI, &[MapOp::delete("k")]).unwrap().unwrap();
        assert!(b.apply_remote(&delete).unwrap());
        assert!(b.entries(URI).is_empty());
    }

    #[test]
    fn test_duplicate_delta_is_not_a_change() {
        let mut a = store(1);
        let mut b = store(2);

        let put = a.apply_local(URI, &[MapOp::put("k", "v")]).unwrap().unwrap();
        assert!(b.apply_remote(&put).unwrap());
        assert!(!b.apply_remote(&put).unwrap());
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let mut a = store(1);
        let mut b = store(2);

        let from_a = a.apply_local(URI, &[MapOp::put("a", "1")]).unwrap().unwrap();
        let from_b = b.apply_local(URI, &[MapOp::put("b", "2")]).unwrap().unwrap();

        a.apply_remote(&from_b).unwrap();
        b.apply_remote(&from_a).unwrap();

        assert_eq!(a.entries(URI), b.entries(URI));
        assert_eq!(a.entries(URI).len(), 2);
    }

    // ==================== Anti-Entropy ====================

    #[test]
    fn test_digest_exchange_syncs_both_sides() {
        let mut a = store(1);
        let mut b = store(2);

        a.apply_local(URI, &[MapOp::put("a", "1")]).unwrap();
        a.apply_local("agents", &[MapOp::put("x", "y")]).unwrap();
        b.apply_local(URI, &[MapOp::put("b", "2")]).unwrap();

        let for_b = a.updates_since(&b.digest()).unwrap();
        let for_a = b.updates_since(&a.digest()).unwrap();
        b.merge(&for_b).unwrap();
        a.merge(&for_a).unwrap();

        assert_eq!(a.entries(URI), b.entries(URI));
        assert_eq!(a.entries("agents"), b.entries("agents"));
    }

    #[test]
    fn test_in_sync_peers_exchange_nothing() {
        let mut a = store(1);
        let mut b = store(2);

        a.apply_local(URI, &[MapOp::put("a", "1")]).unwrap();
        b.merge(&a.full_state().unwrap()).unwrap();

        assert!(a.updates_since(&b.digest()).unwrap().is_empty());
        assert!(b.updates_since(&a.digest()).unwrap().is_empty());
    }
}
