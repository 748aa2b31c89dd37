//! Local node identity metadata (spec §3 "Node identity"). The cryptographic
//! half (the Ed25519 keypair) lives in `fleetmesh-identity`; this is just the
//! orthogonal `node_id` label plus a couple of diagnostics fields every
//! ticker and log line wants.

use chrono::{DateTime, Utc};
use fleetmesh_identity::PublicKeyBytes;

use crate::config::FleetMeshConfig;

/// Everything the rest of the node needs to know about itself, gathered in
/// one place at startup and passed explicitly into every component (spec §9
/// "Global process state ... initialize once, pass explicitly").
#[derive(Debug, Clone)]
pub struct NodeMeta {
    pub node_id: String,
    pub public_key: PublicKeyBytes,
    pub started_at: DateTime<Utc>,
}

impl NodeMeta {
    pub fn new(config: &FleetMeshConfig, public_key: PublicKeyBytes) -> Self {
        Self {
            node_id: config.node_id.clone(),
            public_key,
            started_at: Utc::now(),
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }
}
