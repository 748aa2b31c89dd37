//! The PBFT-lite consensus engine (spec §4.E): three-phase agreement with a
//! configurable quorum, out-of-order vote tolerance, and idempotent vote
//! sets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use fleetmesh_identity::Keypair;
use fleetmesh_net::{now_millis, ConsensusHandler, Envelope, NodeId, Operation, Payload};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{ConsensusConfig, ConsensusRecord, Phase};

/// Invoked exactly once per `op_id`, the moment it reaches DECIDED (spec §8
/// "Single decision"). Implemented by `fleetmesh_store::TaskStore` so the
/// engine never hard-depends on the store crate.
pub trait DecisionSink: Send + Sync {
    fn apply(&self, op: &Operation);
}

/// Anything the engine can hand signed envelopes to for broadcast.
/// Implemented by `fleetmesh_net::Transport`.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, bytes: Vec<u8>) -> anyhow::Result<()>;
}

/// The PBFT-lite engine. One instance per node.
pub struct ConsensusEngine {
    self_node_id: NodeId,
    keypair: Keypair,
    config: ConsensusConfig,
    broadcaster: Arc<dyn Broadcaster>,
    sink: Arc<dyn DecisionSink>,
    records: DashMap<Uuid, ConsensusRecord>,
    decisions_applied: AtomicU64,
}

impl ConsensusEngine {
    pub fn new(
        self_node_id: NodeId,
        keypair: Keypair,
        config: ConsensusConfig,
        broadcaster: Arc<dyn Broadcaster>,
        sink: Arc<dyn DecisionSink>,
    ) -> Self {
        Self {
            self_node_id,
            keypair,
            config,
            broadcaster,
            sink,
            records: DashMap::new(),
            decisions_applied: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Total number of operations this node has decided, for tests and
    /// diagnostics.
    pub fn decided_count(&self) -> u64 {
        self.decisions_applied.load(Ordering::Relaxed)
    }

    fn broadcast_payload(&self, payload: Payload) {
        match Envelope::sign(&self.keypair, payload) {
            Ok(envelope) => match envelope.to_json() {
                Ok(bytes) => {
                    if let Err(e) = self.broadcaster.broadcast(bytes) {
                        warn!(error = %e, "broadcast failed");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode envelope"),
            },
            Err(e) => warn!(error = %e, "failed to sign envelope"),
        }
    }

    /// **PROPOSE.** Any node may initiate. Stamps `proposer`/`timestamp`,
    /// creates the local record, inserts self into `prepares`, broadcasts
    /// `PBFT_PROPOSE`, then locally triggers its own PREPARE.
    pub fn propose(&self, op: Operation) -> Operation {
        let op_id = op.op_id;
        {
            let mut record = self.records.entry(op_id).or_default();
            if record.op.is_none() {
                record.op = Some(op.clone());
            }
            record.prepares.insert(self.self_node_id.clone());
        }
        self.broadcast_payload(Payload::PbftPropose { op: op.clone() });
        self.trigger_own_prepare(op_id);
        op
    }

    fn trigger_own_prepare(&self, op_id: Uuid) {
        self.broadcast_payload(Payload::PbftPrepare {
            op_id,
            voter_node_id: self.self_node_id.clone(),
            timestamp: now_millis(),
        });
        self.record_prepare(op_id, self.self_node_id.clone());
    }

    fn record_prepare(&self, op_id: Uuid, voter: NodeId) {
        let advance = {
            let mut record = self.records.entry(op_id).or_default();
            record.prepares.insert(voter);
            record.phase == Phase::Proposed
                && record.op.is_some()
                && record.prepares.len() >= self.config.quorum()
        };
        if advance {
            self.advance_to_prepared(op_id);
        }
    }

    fn advance_to_prepared(&self, op_id: Uuid) {
        let should_commit = {
            let mut record = self.records.entry(op_id).or_default();
            if record.phase != Phase::Proposed {
                false
            } else {
                record.phase = Phase::Prepared;
                true
            }
        };
        if should_commit {
            debug!(%op_id, "prepared, broadcasting commit vote");
            self.broadcast_payload(Payload::PbftCommit {
                op_id,
                voter_node_id: self.self_node_id.clone(),
                timestamp: now_millis(),
            });
            self.record_commit(op_id, self.self_node_id.clone());
        }
    }

    fn record_commit(&self, op_id: Uuid, voter: NodeId) {
        let decide = {
            let mut record = self.records.entry(op_id).or_default();
            record.commits.insert(voter);
            record.phase != Phase::Decided
                && record.op.is_some()
                && record.commits.len() >= self.config.quorum()
        };
        if decide {
            self.decide(op_id);
        }
    }

    /// Transitions to DECIDED and invokes the decision handler exactly once
    /// per `op_id` (spec §8 "Single decision"). The check-and-set happens
    /// under the same shard lock `DashMap::entry` holds, so concurrent
    /// `record_commit` calls for the same `op_id` can never both win.
    fn decide(&self, op_id: Uuid) {
        let op = {
            let mut record = match self.records.get_mut(&op_id) {
                Some(r) => r,
                None => return,
            };
            if record.phase == Phase::Decided {
                return;
            }
            record.phase = Phase::Committed;
            record.phase = Phase::Decided;
            match record.op.clone() {
                Some(op) => op,
                None => return,
            }
        };
        info!(%op_id, op_type = ?op.op_type, "operation decided");
        self.decisions_applied.fetch_add(1, Ordering::Relaxed);
        self.sink.apply(&op);
    }

    /// Snapshot of a record's phase, for tests.
    pub fn phase_of(&self, op_id: Uuid) -> Option<Phase> {
        self.records.get(&op_id).map(|r| r.phase)
    }

    pub fn prepares_of(&self, op_id: Uuid) -> usize {
        self.records.get(&op_id).map(|r| r.prepares.len()).unwrap_or(0)
    }

    pub fn commits_of(&self, op_id: Uuid) -> usize {
        self.records.get(&op_id).map(|r| r.commits.len()).unwrap_or(0)
    }
}

impl ConsensusHandler for ConsensusEngine {
    /// **PREPARE** on receipt of `PBFT_PROPOSE{op}`: store the proposal if
    /// this node doesn't already have one, then broadcast this node's own
    /// PREPARE vote, exactly as if it had self-proposed.
    fn on_propose(&self, op: Operation) {
        let op_id = op.op_id;
        {
            let mut record = self.records.entry(op_id).or_default();
            if record.op.is_none() {
                record.op = Some(op);
            }
        }
        self.trigger_own_prepare(op_id);
    }

    fn on_prepare(&self, op_id: Uuid, voter: NodeId, _ts: i64) {
        self.record_prepare(op_id, voter);
    }

    fn on_commit(&self, op_id: Uuid, voter: NodeId, _ts: i64) {
        self.record_commit(op_id, voter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    struct NullBroadcaster;
    impl Broadcaster for NullBroadcaster {
        fn broadcast(&self, _bytes: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        applied: Mutex<Vec<Operation>>,
    }
    impl DecisionSink for RecordingSink {
        fn apply(&self, op: &Operation) {
            self.applied.lock().unwrap().push(op.clone());
        }
    }

    fn engine(node_id: &str, f: usize) -> (Arc<ConsensusEngine>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(ConsensusEngine::new(
            node_id.to_string(),
            Keypair::generate(),
            ConsensusConfig::with_quorum(f, 2),
            Arc::new(NullBroadcaster),
            sink.clone(),
        ));
        (engine, sink)
    }

    fn sample_op(proposer: &str) -> Operation {
        Operation::new_assign_task(
            proposer.to_string(),
            "t1".into(),
            "alpine".into(),
            vec!["echo".into(), "hi".into()],
            proposer.to_string(),
        )
    }

    #[test]
    fn three_node_quorum_two_decides() {
        let (engine, sink) = engine("a", 0);
        let op = sample_op("a");
        let op_id = op.op_id;
        engine.propose(op.clone());
        assert_eq!(engine.phase_of(op_id), Some(Phase::Proposed));

        engine.on_prepare(op_id, "b".into(), 0);
        assert_eq!(engine.phase_of(op_id), Some(Phase::Prepared));

        engine.on_commit(op_id, "b".into(), 0);
        assert_eq!(engine.phase_of(op_id), Some(Phase::Decided));
        assert_eq!(sink.applied.lock().unwrap().len(), 1);
    }

    #[test]
    fn out_of_order_votes_are_held_until_propose_arrives() {
        let (engine, sink) = engine("c", 0);
        let op = sample_op("a");
        let op_id = op.op_id;

        engine.on_prepare(op_id, "a".into(), 0);
        engine.on_commit(op_id, "a".into(), 0);
        assert!(sink.applied.lock().unwrap().is_empty());

        engine.on_propose(op.clone());
        assert_eq!(engine.phase_of(op_id), Some(Phase::Decided));
        assert_eq!(sink.applied.lock().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_vote_from_same_voter_does_not_inflate_count() {
        let (engine, _sink) = engine("a", 1);
        let op = sample_op("a");
        let op_id = op.op_id;
        engine.propose(op);
        engine.on_prepare(op_id, "b".into(), 0);
        engine.on_prepare(op_id, "b".into(), 0);
        engine.on_prepare(op_id, "b".into(), 0);
        assert_eq!(engine.prepares_of(op_id), 2); // self + b
    }

    #[test]
    fn decision_handler_runs_exactly_once() {
        let (engine, sink) = engine("a", 0);
        let op = sample_op("a");
        let op_id = op.op_id;
        engine.propose(op);
        engine.on_prepare(op_id, "b".into(), 0);
        engine.on_commit(op_id, "b".into(), 0);
        // Redelivery after already decided must not re-apply.
        engine.on_commit(op_id, "c".into(), 0);
        engine.on_prepare(op_id, "c".into(), 0);
        assert_eq!(sink.applied.lock().unwrap().len(), 1);
    }

    #[test]
    fn insufficient_quorum_never_decides() {
        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(ConsensusEngine::new(
            "a".to_string(),
            Keypair::generate(),
            ConsensusConfig::new(1), // f=1 => quorum=3
            Arc::new(NullBroadcaster),
            sink.clone(),
        ));
        let op = sample_op("a");
        let op_id = op.op_id;
        engine.propose(op);
        // Only self + one other peer prepare/commit; quorum of 3 is never reached.
        engine.on_prepare(op_id, "b".into(), 0);
        engine.on_commit(op_id, "b".into(), 0);
        assert_ne!(engine.phase_of(op_id), Some(Phase::Decided));
        assert!(sink.applied.lock().unwrap().is_empty());
    }

    proptest! {
        /// Quorum safety holds for arbitrary `f` and arbitrary vote-arrival
        /// orderings (spec §8 property test expansion): decided iff the
        /// number of distinct voters (self plus whoever shows up in
        /// `voter_order`, duplicates and all) reaches `quorum()`. Also
        /// exercises vote-set idempotence, since `voter_order` routinely
        /// repeats the same voter.
        #[test]
        fn quorum_safety_holds_for_arbitrary_vote_orderings(
            f in 0usize..4,
            voter_order in proptest::collection::vec(0usize..8, 0..12),
        ) {
            let (engine, sink) = engine("self", f);
            let op = sample_op("self");
            let op_id = op.op_id;
            engine.propose(op);

            let mut distinct_others = std::collections::HashSet::new();
            for &v in &voter_order {
                let voter = format!("n{v}");
                engine.on_prepare(op_id, voter.clone(), 0);
                engine.on_commit(op_id, voter, 0);
                distinct_others.insert(v);
            }

            let total_distinct_voters = 1 + distinct_others.len(); // + self
            let expect_decided = total_distinct_voters >= engine.config().quorum();

            prop_assert_eq!(engine.phase_of(op_id) == Some(Phase::Decided), expect_decided);
            prop_assert_eq!(sink.applied.lock().unwrap().len(), if expect_decided { 1 } else { 0 });
        }
    }
}
