//! The worker supervisor (spec §4.G): translates a decided `ASSIGN_TASK`
//! targeting this node into a local container execution, and routes the
//! outcome back into consensus as an `UPDATE_STATUS` operation (spec §9 Open
//! Question (i), resolved in DESIGN.md in favor of preserving the "only
//! decided mutations mutate state" invariant).

pub mod runtime;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use fleetmesh_consensus::ConsensusEngine;
use fleetmesh_net::{now_millis, NodeId, Operation};
use fleetmesh_store::LocalAssignmentListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub use runtime::{ContainerRuntime, ExitStatus, FakeRuntime, ProcessRuntime};

/// Spawns and tracks local container executions for tasks this node has
/// been assigned, per spec §4.G. Holds a weak reference to itself
/// (constructed via `Arc::new_cyclic`) so the synchronous
/// `LocalAssignmentListener` callback can recover an owned `Arc` to keep
/// alive across the spawned carrier task.
pub struct WorkerSupervisor {
    self_weak: Weak<Self>,
    self_node_id: NodeId,
    runtime: Arc<dyn ContainerRuntime>,
    consensus: Arc<ConsensusEngine>,
    outstanding: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    pub fn new(
        self_node_id: NodeId,
        runtime: Arc<dyn ContainerRuntime>,
        consensus: Arc<ConsensusEngine>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            self_node_id,
            runtime,
            consensus,
            outstanding: Mutex::new(Vec::new()),
        })
    }

    /// Launches the carrier for one assignment (spec §4.G steps 2-4). Spawned
    /// rather than awaited inline: `on_local_assignment` is called from the
    /// consensus decision path and must not block it on container I/O.
    fn spawn_carrier(self: Arc<Self>, task_id: String, image: String, cmd: Vec<String>) {
        let carrier = self.clone();
        let handle = tokio::spawn(async move {
            carrier.propose_status(&task_id, "running", None);

            match carrier.runtime.run(&task_id, &image, &cmd).await {
                Ok(status) if status.success() => {
                    info!(task_id, "worker task completed");
                    carrier.propose_status(&task_id, "completed", Some(now_millis()));
                }
                Ok(status) => {
                    info!(task_id, exit_code = status.code, "worker task failed");
                    carrier.propose_status(&task_id, "failed", Some(now_millis()));
                }
                Err(e) => {
                    error!(task_id, error = %e, "worker task could not be launched");
                    carrier.propose_status(&task_id, "failed", Some(now_millis()));
                }
            }
        });
        self.outstanding.lock().unwrap().push(handle);
    }

    fn propose_status(&self, task_id: &str, status: &str, completed_at: Option<i64>) {
        let op = Operation::new_update_status(
            self.self_node_id.clone(),
            task_id.to_string(),
            status.to_string(),
            completed_at,
        );
        self.consensus.propose(op);
    }

    /// Awaits every outstanding worker with a bounded grace period, then
    /// abandons whatever is left (spec §5 "Cancellation & timeouts").
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<_> = self.outstanding.lock().unwrap().drain(..).collect();
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("worker shutdown grace period elapsed; abandoning outstanding tasks");
        }
    }
}

impl LocalAssignmentListener for WorkerSupervisor {
    fn on_local_assignment(&self, task_id: String, image: String, cmd: Vec<String>) {
        info!(task_id, image, "local assignment notified");
        match self.self_weak.upgrade() {
            Some(strong) => strong.spawn_carrier(task_id, image, cmd),
            None => error!(task_id, "worker supervisor dropped before assignment could launch"),
        }
    }
}
