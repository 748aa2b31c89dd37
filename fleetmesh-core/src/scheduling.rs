//! The pluggable reassignment strategy `FAIL_NODE` handling needs (spec §4.H,
//! §9 Open Question (iii): "the reassignment policy is unspecified; treat as
//! a pluggable strategy"). Resource-aware scheduling itself is an explicit
//! Non-goal (spec §1); this is the seam a real policy would plug into.

use fleetmesh_net::Reassignment;
use fleetmesh_store::{TaskRecord, TaskStatus};

/// Maps a failed node's open tasks to replacement assignees.
pub trait SchedulingPolicy: Send + Sync {
    fn reassign(
        &self,
        failed_node: &str,
        detecting_node: &str,
        open_tasks: &[(String, TaskRecord)],
    ) -> Vec<Reassignment>;
}

/// The reference policy (spec §1 Non-goals: "trivially 'assign to self' in
/// the reference"): every open task previously assigned to the failed node
/// moves to whichever node detected the failure.
pub struct SelfAssignPolicy;

impl SchedulingPolicy for SelfAssignPolicy {
    fn reassign(
        &self,
        failed_node: &str,
        detecting_node: &str,
        open_tasks: &[(String, TaskRecord)],
    ) -> Vec<Reassignment> {
        open_tasks
            .iter()
            .filter(|(_, rec)| {
                rec.assigned_node == failed_node
                    && !matches!(rec.status, TaskStatus::Completed | TaskStatus::Failed)
            })
            .map(|(key, _)| Reassignment {
                task_id: task_id_from_key(key),
                new_node: detecting_node.to_string(),
            })
            .collect()
    }
}

fn task_id_from_key(key: &str) -> String {
    key.strip_prefix("tasks/").unwrap_or(key).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(assigned_node: &str, status: TaskStatus) -> TaskRecord {
        TaskRecord::new(
            status,
            assigned_node.to_string(),
            "alpine".into(),
            vec!["echo".into()],
            0,
            None,
        )
    }

    #[test]
    fn reassigns_only_open_tasks_of_the_failed_node() {
        let tasks = vec![
            ("tasks/t1".to_string(), rec("b", TaskStatus::Assigned)),
            ("tasks/t2".to_string(), rec("b", TaskStatus::Completed)),
            ("tasks/t3".to_string(), rec("c", TaskStatus::Running)),
        ];
        let policy = SelfAssignPolicy;
        let out = policy.reassign("b", "a", &tasks);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].task_id, "t1");
        assert_eq!(out[0].new_node, "a");
    }
}
