//! Consensus record and quorum configuration (spec §3 "Consensus record", §4.E).

use std::collections::HashSet;

use fleetmesh_net::{NodeId, Operation};

/// Phase a consensus record passes through on its way to a decision.
/// Monotonic: never regresses (spec §3, §8 "Monotonic phase").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Proposed,
    Prepared,
    Committed,
    Decided,
}

/// Per-`op_id` consensus state. `op` may be absent if votes arrive before the
/// proposal (spec §4.E "out-of-order tolerance").
#[derive(Debug, Clone)]
pub struct ConsensusRecord {
    pub op: Option<Operation>,
    pub prepares: HashSet<NodeId>,
    pub commits: HashSet<NodeId>,
    pub phase: Phase,
}

impl Default for ConsensusRecord {
    fn default() -> Self {
        Self {
            op: None,
            prepares: HashSet::new(),
            commits: HashSet::new(),
            phase: Phase::Proposed,
        }
    }
}

/// Quorum configuration. `Q` is cluster-size-parameterized: `Q = 2f+1` for a
/// tolerated Byzantine fault count `f`, with cluster size `N >= 3f+1` (spec
/// §4.E). Implementers MUST make this configurable rather than hard-coding
/// `Q=2` as the reference prototype does (spec §9 Open Question (ii)).
#[derive(Debug, Clone, Copy)]
pub struct ConsensusConfig {
    /// Tolerated Byzantine fault count.
    pub f: usize,
    /// Explicit quorum override. When `None`, `quorum()` derives `2f+1`.
    pub quorum_override: Option<usize>,
}

impl ConsensusConfig {
    pub fn new(f: usize) -> Self {
        Self {
            f,
            quorum_override: None,
        }
    }

    pub fn with_quorum(f: usize, quorum: usize) -> Self {
        Self {
            f,
            quorum_override: Some(quorum),
        }
    }

    /// The minimum distinct voter count required to advance a phase.
    pub fn quorum(&self) -> usize {
        self.quorum_override.unwrap_or(2 * self.f + 1)
    }

    /// Minimum cluster size this configuration tolerates safely (`3f+1`).
    pub fn min_cluster_size(&self) -> usize {
        3 * self.f + 1
    }
}

impl Default for ConsensusConfig {
    /// `f=1` (`Q=3`), safe up to the classical `N=4` Byzantine cluster.
    /// Deployments of three nodes that only need the demo-scale behavior
    /// from the original prototype should construct
    /// `ConsensusConfig::with_quorum(0, 2)` explicitly; see DESIGN.md for the
    /// worked justification (spec §9 Open Question (ii)).
    fn default() -> Self {
        Self::new(1)
    }
}
