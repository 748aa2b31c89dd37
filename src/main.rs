//! fleetmesh - leaderless, decentralized container orchestration node.
//!
//! Every process started from this binary is a peer: it joins the overlay,
//! proposes and votes on operations, and executes whatever it is assigned,
//! with no distinguished leader and no external control plane (spec §1).

use anyhow::Result;
use fleetmesh_core::FleetMesh;
use tracing::{error, info};

/// Brings one node up and runs it until a shutdown signal arrives.
///
/// A failure during [`FleetMesh::bootstrap`] (keypair load, overlay join,
/// storage backend open) is the only fatal-init path (spec §7.f): it is
/// logged and the process exits non-zero without attempting to run.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("fleetmesh=info".parse()?),
        )
        .json()
        .init();

    info!("starting fleetmesh node");

    let node = match FleetMesh::bootstrap().await {
        Ok(node) => {
            info!(node_id = %node.node_id(), "fleetmesh node bootstrapped");
            node
        }
        Err(e) => {
            error!(error = %e, "fatal error during node bootstrap");
            std::process::exit(1);
        }
    };

    if let Err(e) = node.run().await {
        error!(error = %e, "fleetmesh node exited with an error");
        return Err(e);
    }

    info!("fleetmesh node stopped");
    Ok(())
}
