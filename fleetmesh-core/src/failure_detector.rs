//! The failure detector (spec §4.H): periodic sweep marking silent peers
//! suspect, then dead, proposing `FAIL_NODE` with a reassignment plan once a
//! peer has been suspect for a further grace period.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fleetmesh_consensus::ConsensusEngine;
use fleetmesh_net::{now_millis, Millis, NodeId, Operation, PeerRegistry};
use fleetmesh_store::TaskStore;
use tracing::{info, warn};

use crate::scheduling::SchedulingPolicy;

pub struct FailureDetector {
    self_node_id: NodeId,
    registry: PeerRegistry,
    consensus: Arc<ConsensusEngine>,
    store: Arc<TaskStore>,
    policy: Arc<dyn SchedulingPolicy>,
    suspect_after: Duration,
    suspect_grace: Duration,
    /// When each peer first went suspect, so the grace period is measured
    /// from suspicion rather than from the original silence.
    suspect_since: DashMap<NodeId, Millis>,
}

impl FailureDetector {
    pub fn new(
        self_node_id: NodeId,
        registry: PeerRegistry,
        consensus: Arc<ConsensusEngine>,
        store: Arc<TaskStore>,
        policy: Arc<dyn SchedulingPolicy>,
        suspect_after: Duration,
        suspect_grace: Duration,
    ) -> Self {
        Self {
            self_node_id,
            registry,
            consensus,
            store,
            policy,
            suspect_after,
            suspect_grace,
            suspect_since: DashMap::new(),
        }
    }

    /// Runs one sweep over every known peer (spec §4.H "every ~10s").
    pub fn sweep(&self) {
        let now = now_millis();
        let suspect_after_ms = self.suspect_after.as_millis() as Millis;
        let suspect_grace_ms = self.suspect_grace.as_millis() as Millis;

        for peer in self.registry.snapshot() {
            if peer.node_id == self.self_node_id {
                continue;
            }
            use fleetmesh_net::Liveness::*;
            match peer.liveness {
                Live => {
                    if now - peer.last_seen > suspect_after_ms {
                        warn!(node_id = %peer.node_id, "peer silent, marking suspect");
                        self.registry.mark_suspect(&peer.node_id);
                        self.suspect_since.insert(peer.node_id.clone(), now);
                    }
                }
                Suspect => {
                    let since = *self
                        .suspect_since
                        .entry(peer.node_id.clone())
                        .or_insert(now);
                    if now - since > suspect_grace_ms {
                        self.propose_fail_node(&peer.node_id);
                        self.registry.mark_dead(&peer.node_id);
                        self.suspect_since.remove(&peer.node_id);
                    }
                }
                Dead => {}
            }
        }
    }

    fn propose_fail_node(&self, failed_node_id: &str) {
        let open_tasks = self.store.range("");
        let reassignments = self
            .policy
            .reassign(failed_node_id, &self.self_node_id, &open_tasks);
        info!(
            failed_node_id,
            reassignment_count = reassignments.len(),
            "proposing FAIL_NODE"
        );
        let op = Operation::new_fail_node(
            self.self_node_id.clone(),
            failed_node_id.to_string(),
            reassignments,
        );
        self.consensus.propose(op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetmesh_consensus::ConsensusConfig;
    use fleetmesh_identity::Keypair;
    use fleetmesh_store::MemoryBackend;

    struct NullBroadcaster;
    impl fleetmesh_consensus::Broadcaster for NullBroadcaster {
        fn broadcast(&self, _bytes: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn harness() -> (
        Arc<ConsensusEngine>,
        Arc<TaskStore>,
        PeerRegistry,
        FailureDetector,
    ) {
        let store = Arc::new(TaskStore::new(Arc::new(MemoryBackend::new()), "a".into()));
        let consensus = Arc::new(ConsensusEngine::new(
            "a".into(),
            Keypair::generate(),
            ConsensusConfig::with_quorum(0, 1),
            Arc::new(NullBroadcaster),
            store.clone(),
        ));
        let registry = PeerRegistry::new();
        let detector = FailureDetector::new(
            "a".into(),
            registry.clone(),
            consensus.clone(),
            store.clone(),
            Arc::new(crate::scheduling::SelfAssignPolicy),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        (consensus, store, registry, detector)
    }

    #[test]
    fn silent_peer_is_marked_suspect_then_dead_and_proposes_fail_node() {
        let (consensus, store, registry, detector) = harness();
        store.apply(&Operation::new_assign_task(
            "a".into(),
            "t1".into(),
            "alpine".into(),
            vec!["echo".into()],
            "b".into(),
        ));
        registry.upsert_on_handshake("b".into(), [2u8; 32], now_millis() - 1000);

        detector.sweep();
        assert_eq!(registry.get("b").unwrap().liveness, fleetmesh_net::Liveness::Suspect);

        std::thread::sleep(Duration::from_millis(20));
        detector.sweep();
        assert_eq!(registry.get("b").unwrap().liveness, fleetmesh_net::Liveness::Dead);
        assert_eq!(consensus.decided_count(), 1);
        assert_eq!(store.get("t1").unwrap().assigned_node, "a");
    }

    #[test]
    fn live_peer_within_window_is_untouched() {
        let (_consensus, _store, registry, detector) = harness();
        registry.upsert_on_handshake("b".into(), [2u8; 32], now_millis());
        detector.sweep();
        assert_eq!(registry.get("b").unwrap().liveness, fleetmesh_net::Liveness::Live);
    }
}
