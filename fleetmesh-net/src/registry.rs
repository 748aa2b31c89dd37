//! The peer registry (spec §3 "Peer record", §4.C).

use std::sync::Arc;

use dashmap::DashMap;
use fleetmesh_identity::PublicKeyBytes;

use crate::envelope::{Millis, NodeId};

/// Liveness state a peer moves through as the failure detector observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Live,
    Suspect,
    Dead,
}

/// A known peer. Keyed by `node_id` once a HANDSHAKE has bound one; created
/// on first HANDSHAKE, mutated by the router (`last_seen`) and the failure
/// detector (`liveness`).
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub public_key: PublicKeyBytes,
    pub last_seen: Millis,
    pub liveness: Liveness,
}

/// Single-writer-per-key peer table. `DashMap` gives per-shard locking
/// without a central actor, matching the teacher's concurrent-map idiom; no
/// operation here ever needs a cross-entry invariant, so sharded locking is
/// safe (SPEC_FULL.md §5).
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<DashMap<NodeId, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or refreshes a peer record on receipt of a HANDSHAKE. At most
    /// one record exists per `node_id`; a second handshake from the same
    /// label simply refreshes `last_seen` and liveness rather than
    /// duplicating the entry.
    pub fn upsert_on_handshake(&self, node_id: NodeId, pk: PublicKeyBytes, ts: Millis) {
        self.peers
            .entry(node_id.clone())
            .and_modify(|p| {
                p.public_key = pk;
                p.last_seen = ts;
                p.liveness = Liveness::Live;
            })
            .or_insert(PeerRecord {
                node_id,
                public_key: pk,
                last_seen: ts,
                liveness: Liveness::Live,
            });
    }

    /// Refreshes `last_seen` on receipt of a HEARTBEAT, reviving a suspect
    /// peer back to live.
    pub fn touch(&self, node_id: &str, ts: Millis) {
        if let Some(mut p) = self.peers.get_mut(node_id) {
            if ts > p.last_seen {
                p.last_seen = ts;
            }
            p.liveness = Liveness::Live;
        }
    }

    pub fn mark_suspect(&self, node_id: &str) {
        if let Some(mut p) = self.peers.get_mut(node_id) {
            p.liveness = Liveness::Suspect;
        }
    }

    pub fn mark_dead(&self, node_id: &str) {
        if let Some(mut p) = self.peers.get_mut(node_id) {
            p.liveness = Liveness::Dead;
        }
    }

    pub fn remove(&self, node_id: &str) -> Option<PeerRecord> {
        self.peers.remove(node_id).map(|(_, v)| v)
    }

    pub fn get(&self, node_id: &str) -> Option<PeerRecord> {
        self.peers.get(node_id).map(|r| r.clone())
    }

    pub fn iter_live(&self) -> Vec<PeerRecord> {
        self.peers
            .iter()
            .filter(|r| r.liveness == Liveness::Live)
            .map(|r| r.clone())
            .collect()
    }

    /// (expansion) full snapshot for the failure detector's sweep, regardless
    /// of current liveness.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|r| r.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_then_heartbeat_refreshes_last_seen() {
        let reg = PeerRegistry::new();
        reg.upsert_on_handshake("a".into(), [1u8; 32], 100);
        reg.touch("a", 200);
        assert_eq!(reg.get("a").unwrap().last_seen, 200);
    }

    #[test]
    fn duplicate_handshake_does_not_duplicate_record() {
        let reg = PeerRegistry::new();
        reg.upsert_on_handshake("a".into(), [1u8; 32], 100);
        reg.upsert_on_handshake("a".into(), [1u8; 32], 150);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn suspect_then_heartbeat_revives_to_live() {
        let reg = PeerRegistry::new();
        reg.upsert_on_handshake("a".into(), [1u8; 32], 100);
        reg.mark_suspect("a");
        assert_eq!(reg.get("a").unwrap().liveness, Liveness::Suspect);
        reg.touch("a", 200);
        assert_eq!(reg.get("a").unwrap().liveness, Liveness::Live);
    }

    #[test]
    fn iter_live_excludes_suspect_and_dead() {
        let reg = PeerRegistry::new();
        reg.upsert_on_handshake("a".into(), [1u8; 32], 100);
        reg.upsert_on_handshake("b".into(), [2u8; 32], 100);
        reg.mark_suspect("b");
        let live: Vec<_> = reg.iter_live().into_iter().map(|p| p.node_id).collect();
        assert_eq!(live, vec!["a".to_string()]);
    }
}
