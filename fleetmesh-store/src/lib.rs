//! The replicated task store (spec §3 "Task record", "Replicated store",
//! §4.F): an ordered key→value mapping that accepts only decided mutations.

pub mod backends;

use std::sync::{Arc, Mutex};

use fleetmesh_consensus::DecisionSink;
use fleetmesh_net::{Millis, NodeId, OpDetails, OpType, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub use backends::{BackendError, MemoryBackend, SledBackend, StorageBackend};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid task status transition from {from:?} to {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("task record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// `assigned -> running -> completed|failed`; no backward transitions
    /// (spec §3 "Task record" invariant, §8 "Status monotonicity").
    fn can_advance_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Assigned, Running)
                | (Assigned, Completed)
                | (Assigned, Failed)
                | (Running, Completed)
                | (Running, Failed)
        ) || self == next
    }

    fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub assigned_node: NodeId,
    pub image: String,
    pub cmd: Vec<String>,
    pub created_at: Millis,
    pub completed_at: Option<Millis>,
    /// (expansion) the `(timestamp, op_id)` of the decided operation that
    /// last wrote this record, used for the deterministic last-writer-wins
    /// reconciliation spec §4.E requires because different nodes may decide
    /// operations in different orders.
    last_decision: (Millis, Uuid),
}

impl TaskRecord {
    /// Builds a record outside of decision application, for callers (e.g.
    /// `fleetmesh-core`'s scheduling policy tests) that need a `TaskRecord`
    /// value without going through `TaskStore::apply`. `last_decision` is
    /// seeded from `created_at` with a nil op id, which is never equal to a
    /// real decided operation's ordering key.
    pub fn new(
        status: TaskStatus,
        assigned_node: NodeId,
        image: String,
        cmd: Vec<String>,
        created_at: Millis,
        completed_at: Option<Millis>,
    ) -> Self {
        Self {
            status,
            assigned_node,
            image,
            cmd,
            created_at,
            completed_at,
            last_decision: (created_at, Uuid::nil()),
        }
    }
}

/// Invoked when a decided `ASSIGN_TASK` targets this node (spec §4.G step 1).
/// Implemented by `fleetmesh_worker::WorkerSupervisor`.
pub trait LocalAssignmentListener: Send + Sync {
    fn on_local_assignment(&self, task_id: String, image: String, cmd: Vec<String>);
}

pub struct TaskStore {
    backend: Arc<dyn StorageBackend>,
    self_node_id: NodeId,
    listener: Mutex<Option<Arc<dyn LocalAssignmentListener>>>,
}

impl TaskStore {
    pub fn new(backend: Arc<dyn StorageBackend>, self_node_id: NodeId) -> Self {
        Self {
            backend,
            self_node_id,
            listener: Mutex::new(None),
        }
    }

    pub fn set_local_assignment_listener(&self, listener: Arc<dyn LocalAssignmentListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn key(task_id: &str) -> String {
        format!("tasks/{task_id}")
    }

    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.backend
            .get(&Self::key(task_id))
            .ok()
            .flatten()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    /// Lists every task whose key starts with `prefix` (e.g. `""` for all
    /// tasks), in lexicographic key order.
    pub fn range(&self, prefix: &str) -> Vec<(String, TaskRecord)> {
        self.backend
            .range(&format!("tasks/{prefix}"))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(k, v)| {
                serde_json::from_slice::<TaskRecord>(&v)
                    .ok()
                    .map(|rec| (k, rec))
            })
            .collect()
    }

    fn write(&self, task_id: &str, record: &TaskRecord) {
        match serde_json::to_vec(record) {
            Ok(bytes) => {
                if let Err(e) = self.backend.put(Self::key(task_id), bytes) {
                    error!(task_id, error = %e, "store write failed; decision not replayed");
                }
            }
            Err(e) => error!(task_id, error = %e, "failed to serialize task record"),
        }
    }

    fn decision_order(op: &Operation) -> (Millis, Uuid) {
        (op.timestamp, op.op_id)
    }

    fn apply_assign_task(&self, op: &Operation) {
        let OpDetails::AssignTask {
            task_id,
            image,
            cmd,
            assigned_node,
        } = &op.details
        else {
            warn!(op_id = %op.op_id, "ASSIGN_TASK op carried mismatched details");
            return;
        };

        let order = Self::decision_order(op);
        if let Some(existing) = self.get(task_id) {
            if existing.last_decision >= order {
                return; // a fresher or equal decision already applied; no-op.
            }
        }

        let record = TaskRecord {
            status: TaskStatus::Assigned,
            assigned_node: assigned_node.clone(),
            image: image.clone(),
            cmd: cmd.clone(),
            created_at: op.timestamp,
            completed_at: None,
            last_decision: order,
        };
        self.write(task_id, &record);
        info!(task_id, assigned_node, "task assigned");

        if *assigned_node == self.self_node_id {
            if let Some(listener) = self.listener.lock().unwrap().clone() {
                listener.on_local_assignment(task_id.clone(), image.clone(), cmd.clone());
            }
        }
    }

    fn apply_update_status(&self, op: &Operation) {
        let OpDetails::UpdateStatus {
            task_id,
            status,
            completed_at,
        } = &op.details
        else {
            warn!(op_id = %op.op_id, "UPDATE_STATUS op carried mismatched details");
            return;
        };

        let next = match status.as_str() {
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            other => {
                warn!(task_id, status = other, "unknown task status in decided op");
                return;
            }
        };

        let Some(mut existing) = self.get(task_id) else {
            warn!(task_id, "status update decided for unknown task");
            return;
        };

        let order = Self::decision_order(op);
        if existing.last_decision >= order {
            return;
        }
        if !existing.status.can_advance_to(next) {
            warn!(
                task_id,
                from = ?existing.status,
                to = ?next,
                "rejecting backward task status transition"
            );
            return;
        }

        existing.status = next;
        existing.completed_at = *completed_at;
        existing.last_decision = order;
        self.write(task_id, &existing);
    }

    fn apply_fail_node(&self, op: &Operation) {
        let OpDetails::FailNode {
            failed_node_id,
            reassignments,
        } = &op.details
        else {
            warn!(op_id = %op.op_id, "FAIL_NODE op carried mismatched details");
            return;
        };

        let order = Self::decision_order(op);
        for reassignment in reassignments {
            let Some(mut existing) = self.get(&reassignment.task_id) else {
                continue;
            };
            // Only open (non-terminal) assignments to the failed node move;
            // a task that already completed or failed keeps its outcome.
            if existing.assigned_node != *failed_node_id || existing.status.is_terminal() {
                continue;
            }
            if existing.last_decision >= order {
                continue;
            }
            existing.assigned_node = reassignment.new_node.clone();
            existing.status = TaskStatus::Assigned;
            existing.last_decision = order;
            self.write(&reassignment.task_id, &existing);
            info!(
                task_id = reassignment.task_id,
                new_node = reassignment.new_node,
                "task reassigned away from failed node"
            );

            if reassignment.new_node == self.self_node_id {
                if let Some(listener) = self.listener.lock().unwrap().clone() {
                    listener.on_local_assignment(
                        reassignment.task_id.clone(),
                        existing.image.clone(),
                        existing.cmd.clone(),
                    );
                }
            }
        }
    }
}

impl DecisionSink for TaskStore {
    /// The only path by which the store is ever mutated (spec §4.F "direct
    /// writes are forbidden").
    fn apply(&self, op: &Operation) {
        match op.op_type {
            OpType::AssignTask => self.apply_assign_task(op),
            OpType::UpdateStatus => self.apply_update_status(op),
            OpType::FailNode => self.apply_fail_node(op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn op_assign(task_id: &str, assigned_node: &str, ts: Millis) -> Operation {
        let mut op = Operation::new_assign_task(
            "proposer".into(),
            task_id.into(),
            "alpine".into(),
            vec!["echo".into(), "hi".into()],
            assigned_node.into(),
        );
        op.timestamp = ts;
        op
    }

    fn op_status(task_id: &str, status: &str, ts: Millis, completed_at: Option<Millis>) -> Operation {
        let mut op =
            Operation::new_update_status("proposer".into(), task_id.into(), status.into(), completed_at);
        op.timestamp = ts;
        op
    }

    fn store(self_node: &str) -> TaskStore {
        TaskStore::new(Arc::new(MemoryBackend::new()), self_node.to_string())
    }

    #[test]
    fn assign_task_writes_record_and_notifies_local_listener() {
        let store = store("a");
        #[derive(Default)]
        struct Recorder(StdMutex<Vec<String>>);
        impl LocalAssignmentListener for Recorder {
            fn on_local_assignment(&self, task_id: String, _image: String, _cmd: Vec<String>) {
                self.0.lock().unwrap().push(task_id);
            }
        }
        let recorder = Arc::new(Recorder::default());
        store.set_local_assignment_listener(recorder.clone());

        store.apply(&op_assign("t1", "a", 100));
        let rec = store.get("t1").unwrap();
        assert_eq!(rec.status, TaskStatus::Assigned);
        assert_eq!(rec.assigned_node, "a");
        assert_eq!(recorder.0.lock().unwrap().as_slice(), ["t1"]);
    }

    #[test]
    fn assign_task_for_other_node_does_not_notify_listener() {
        let store = store("a");
        #[derive(Default)]
        struct Recorder(StdMutex<Vec<String>>);
        impl LocalAssignmentListener for Recorder {
            fn on_local_assignment(&self, task_id: String, _image: String, _cmd: Vec<String>) {
                self.0.lock().unwrap().push(task_id);
            }
        }
        let recorder = Arc::new(Recorder::default());
        store.set_local_assignment_listener(recorder.clone());

        store.apply(&op_assign("t1", "b", 100));
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn status_transitions_follow_assigned_running_completed() {
        let store = store("a");
        store.apply(&op_assign("t1", "a", 100));
        store.apply(&op_status("t1", "running", 101, None));
        assert_eq!(store.get("t1").unwrap().status, TaskStatus::Running);
        store.apply(&op_status("t1", "completed", 102, Some(102)));
        let rec = store.get("t1").unwrap();
        assert_eq!(rec.status, TaskStatus::Completed);
        assert_eq!(rec.completed_at, Some(102));
    }

    #[test]
    fn backward_status_transition_is_rejected() {
        let store = store("a");
        store.apply(&op_assign("t1", "a", 100));
        store.apply(&op_status("t1", "completed", 101, Some(101)));
        // A late, out-of-order "running" decision must not regress it.
        store.apply(&op_status("t1", "running", 200, None));
        assert_eq!(store.get("t1").unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn last_writer_wins_by_timestamp_then_op_id() {
        let store = store("a");
        store.apply(&op_assign("t1", "a", 100));
        // An ASSIGN_TASK decided locally out of timestamp order must not
        // clobber a fresher assignment already applied.
        let mut stale = op_assign("t1", "b", 50);
        stale.timestamp = 50;
        store.apply(&stale);
        assert_eq!(store.get("t1").unwrap().assigned_node, "a");
    }

    #[test]
    fn fail_node_reassigns_only_open_tasks_to_new_owner() {
        let store = store("a");
        store.apply(&op_assign("t1", "b", 100));
        store.apply(&op_assign("t2", "b", 100));
        store.apply(&op_status("t2", "completed", 101, Some(101)));

        let mut op = Operation::new_fail_node(
            "a".into(),
            "b".into(),
            vec![
                fleetmesh_net::Reassignment {
                    task_id: "t1".into(),
                    new_node: "a".into(),
                },
                fleetmesh_net::Reassignment {
                    task_id: "t2".into(),
                    new_node: "a".into(),
                },
            ],
        );
        op.timestamp = 200;
        store.apply(&op);

        assert_eq!(store.get("t1").unwrap().assigned_node, "a");
        assert_eq!(store.get("t1").unwrap().status, TaskStatus::Assigned);
        // t2 already completed before the node failed; it must not move.
        assert_eq!(store.get("t2").unwrap().assigned_node, "b");
    }

    #[test]
    fn range_lists_tasks_in_lexicographic_order() {
        let store = store("a");
        store.apply(&op_assign("b", "a", 100));
        store.apply(&op_assign("a", "a", 100));
        let keys: Vec<_> = store.range("").into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["tasks/a".to_string(), "tasks/b".to_string()]);
    }
}
