//! Peer transport, registry, and message routing for fleetmesh (spec §4.B–D).

pub mod envelope;
pub mod registry;
pub mod router;
pub mod transport;

pub use envelope::{
    now_millis, Envelope, Millis, NodeId, OpDetails, OpType, Operation, Payload, Reassignment,
};
pub use registry::{Liveness, PeerRecord, PeerRegistry};
pub use router::{ConsensusHandler, Router, SecurityEventCounter};
pub use transport::{libp2p_keypair_from, Transport, TransportEvent};

use sha2::{Digest, Sha256};

/// Derives the 32-byte cluster topic from the cluster name (spec §6):
/// `topic = SHA-256(utf8(cluster_name))`.
pub fn cluster_topic(cluster_name: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(cluster_name.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_topic_is_deterministic() {
        assert_eq!(cluster_topic("default-swarm"), cluster_topic("default-swarm"));
        assert_ne!(cluster_topic("a"), cluster_topic("b"));
    }
}
