//! The message router (spec §4.D): parse, authenticate, dispatch.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;
use uuid::Uuid;

use crate::envelope::{Envelope, Millis, NodeId, Operation, Payload};
use crate::registry::PeerRegistry;

/// Dispatch target for authenticated PBFT payloads. Implemented by
/// `fleetmesh-consensus::ConsensusEngine`; kept as a trait here so the
/// transport/router layer has no dependency on the consensus crate.
pub trait ConsensusHandler: Send + Sync {
    fn on_propose(&self, op: Operation);
    fn on_prepare(&self, op_id: Uuid, voter: NodeId, ts: Millis);
    fn on_commit(&self, op_id: Uuid, voter: NodeId, ts: Millis);
}

/// (expansion) per-peer count of malformed/unauthenticated messages, for an
/// optional ban policy (spec §7.b). The reference policy only counts and
/// logs, consistent with the spec's framing.
#[derive(Default)]
pub struct SecurityEventCounter {
    counts: DashMap<String, u64>,
}

impl SecurityEventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, peer: &str) -> u64 {
        let mut entry = self.counts.entry(peer.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn get(&self, peer: &str) -> u64 {
        self.counts.get(peer).map(|v| *v).unwrap_or(0)
    }
}

pub struct Router {
    registry: PeerRegistry,
    consensus: Arc<dyn ConsensusHandler>,
    security_events: SecurityEventCounter,
}

impl Router {
    pub fn new(registry: PeerRegistry, consensus: Arc<dyn ConsensusHandler>) -> Self {
        Self {
            registry,
            consensus,
            security_events: SecurityEventCounter::new(),
        }
    }

    /// Processes one inbound frame. Never panics and never propagates an
    /// error past this call: malformed input and authentication failures are
    /// logged and dropped (spec §7.a/§7.b), exactly as the router's
    /// per-message error policy requires.
    pub fn handle_frame(&self, bytes: &[u8]) {
        let envelope = match Envelope::from_json(bytes) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "dropping malformed envelope");
                return;
            }
        };
        self.handle_envelope(envelope);
    }

    fn handle_envelope(&self, envelope: Envelope) {
        let sender_hex = hex::encode(envelope.sender);
        match envelope.verify() {
            Ok(true) => {}
            Ok(false) => {
                let count = self.security_events.record(&sender_hex);
                warn!(sender = %sender_hex, count, "dropping envelope with invalid signature");
                return;
            }
            Err(e) => {
                warn!(sender = %sender_hex, error = %e, "failed to canonicalize payload for verification");
                return;
            }
        }

        match envelope.payload {
            Payload::Handshake { node_id, timestamp } => {
                self.registry
                    .upsert_on_handshake(node_id, envelope.sender, timestamp);
            }
            Payload::Heartbeat { node_id, timestamp } => {
                self.registry.touch(&node_id, timestamp);
            }
            Payload::PbftPropose { op } => {
                self.consensus.on_propose(op);
            }
            Payload::PbftPrepare {
                op_id,
                voter_node_id,
                timestamp,
            } => {
                self.consensus.on_prepare(op_id, voter_node_id, timestamp);
            }
            Payload::PbftCommit {
                op_id,
                voter_node_id,
                timestamp,
            } => {
                self.consensus.on_commit(op_id, voter_node_id, timestamp);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetmesh_identity::Keypair;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        proposes: Mutex<Vec<Operation>>,
        prepares: Mutex<Vec<(Uuid, NodeId)>>,
        commits: Mutex<Vec<(Uuid, NodeId)>>,
    }

    impl ConsensusHandler for RecordingHandler {
        fn on_propose(&self, op: Operation) {
            self.proposes.lock().unwrap().push(op);
        }
        fn on_prepare(&self, op_id: Uuid, voter: NodeId, _ts: Millis) {
            self.prepares.lock().unwrap().push((op_id, voter));
        }
        fn on_commit(&self, op_id: Uuid, voter: NodeId, _ts: Millis) {
            self.commits.lock().unwrap().push((op_id, voter));
        }
    }

    #[test]
    fn malformed_json_is_dropped_without_panic() {
        let handler = Arc::new(RecordingHandler::default());
        let router = Router::new(PeerRegistry::new(), handler);
        router.handle_frame(b"not json");
    }

    #[test]
    fn bad_signature_does_not_reach_registry_or_consensus() {
        let kp = Keypair::generate();
        let mut env = Envelope::sign(
            &kp,
            Payload::Handshake {
                node_id: "a".into(),
                timestamp: 1,
            },
        )
        .unwrap();
        env.payload = Payload::Handshake {
            node_id: "attacker".into(),
            timestamp: 1,
        };
        let handler = Arc::new(RecordingHandler::default());
        let registry = PeerRegistry::new();
        let router = Router::new(registry.clone(), handler);
        router.handle_frame(&env.to_json().unwrap());
        assert!(registry.get("attacker").is_none());
    }

    #[test]
    fn valid_handshake_upserts_peer() {
        let kp = Keypair::generate();
        let env = Envelope::sign(
            &kp,
            Payload::Handshake {
                node_id: "a".into(),
                timestamp: 1,
            },
        )
        .unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let registry = PeerRegistry::new();
        let router = Router::new(registry.clone(), handler);
        router.handle_frame(&env.to_json().unwrap());
        assert!(registry.get("a").is_some());
    }

    #[test]
    fn valid_propose_dispatches_to_consensus_handler() {
        let kp = Keypair::generate();
        let op = Operation::new_assign_task(
            "a".into(),
            "t1".into(),
            "alpine".into(),
            vec!["echo".into()],
            "a".into(),
        );
        let env = Envelope::sign(&kp, Payload::PbftPropose { op }).unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let router = Router::new(PeerRegistry::new(), handler.clone());
        router.handle_frame(&env.to_json().unwrap());
        assert_eq!(handler.proposes.lock().unwrap().len(), 1);
    }
}
