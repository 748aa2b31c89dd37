//! Environment-variable configuration (spec §6 "Environment configuration",
//! SPEC_FULL.md §6 expansion). There is no CLI surface and no config file;
//! every setting is an env var with a coded default, a `load()` precedence
//! pattern collapsed to the one source spec.md actually allows.

use std::path::PathBuf;
use std::time::Duration;

use rand::RngCore;

/// All tunables fleetmesh reads from the environment. Every field has a
/// `FLEETMESH_<FIELD>` override; defaults match spec §6 except where noted.
#[derive(Debug, Clone)]
pub struct FleetMeshConfig {
    /// Human-readable cluster label (spec §6 `NODE_ID`). Default: random
    /// 4-byte hex, matching spec.md's documented default exactly.
    pub node_id: String,
    /// Directory holding `keypair.json` and the store backing (spec §6
    /// `STORAGE_PATH`). Default is derived from `node_id`.
    pub storage_path: PathBuf,
    /// Cluster topic input, `SHA-256`'d into the overlay topic (spec §6
    /// `SWARM_NAME`). Default `"default-swarm"`.
    pub swarm_name: String,
    /// Reserved for future external APIs; parsed and stored but unused by
    /// the core (spec §6). Not dead code; an intentional placeholder.
    pub http_port: u16,
    /// As above.
    pub ws_port: u16,
    /// TCP port the overlay transport listens on. Not named in spec.md's env
    /// var list (the spec treats the overlay as an opaque capability with no
    /// exposed bind port), but a concrete libp2p transport needs one, so it
    /// is added here as an `(expansion)` with a demo-friendly default.
    pub listen_port: u16,
    /// Tolerated Byzantine fault count `f`; `Q = 2f+1` unless
    /// `quorum_override` is set (spec §4.E, §9 Open Question (ii)).
    pub consensus_f: usize,
    /// Explicit quorum override, for demo-scale clusters smaller than
    /// `3f+1` would otherwise require (see DESIGN.md).
    pub quorum_override: Option<usize>,
    pub heartbeat_interval: Duration,
    pub failure_sweep_interval: Duration,
    /// Silence after which a peer is marked suspect (spec §4.H, §8
    /// "Heartbeat liveness").
    pub suspect_after: Duration,
    /// Further silence, once suspect, before a `FAIL_NODE` is proposed.
    pub suspect_grace: Duration,
    /// Interval of the simulated self-proposer ticker (spec §5, §1
    /// "task submission is simulated internally by periodic
    /// self-proposals").
    pub self_propose_interval: Duration,
    /// Bounded grace period shutdown waits for outstanding workers before
    /// abandoning them (spec §5 "Cancellation & timeouts").
    pub shutdown_grace: Duration,
    /// Container CLI to shell out to (`docker` or `podman`); not a named
    /// spec env var, an `(expansion)` knob for the worker supervisor.
    pub container_runtime_bin: String,
    /// Which `StorageBackend` to construct the task store with (spec §4.F:
    /// "the reference uses volatile in-memory backing; implementers SHOULD
    /// provide a file-backed alternative"). fleetmesh defaults to the
    /// file-backed one since `STORAGE_PATH` is always available.
    pub store_backend: StoreBackendKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackendKind {
    Memory,
    Sled,
}

impl FleetMeshConfig {
    /// Loads configuration from the environment, falling back to spec.md's
    /// documented defaults for anything unset. Never fails: malformed
    /// numeric overrides fall back to the default rather than becoming a
    /// fatal init error, since env misconfiguration here is a demo-scale
    /// concern, not a safety one.
    pub fn load() -> Self {
        let node_id = std::env::var("NODE_ID").unwrap_or_else(|_| random_node_id());
        let storage_path = std::env::var("STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(format!("./data/{node_id}")));
        let swarm_name =
            std::env::var("SWARM_NAME").unwrap_or_else(|_| "default-swarm".to_string());
        let http_port = env_parse("HTTP_PORT", 8080);
        let ws_port = env_parse("WS_PORT", 8081);
        let listen_port = env_parse("FLEETMESH_LISTEN_PORT", 4001);
        let consensus_f = env_parse("FLEETMESH_CONSENSUS_F", 1usize);
        let quorum_override = std::env::var("FLEETMESH_QUORUM")
            .ok()
            .and_then(|v| v.parse::<usize>().ok());
        let heartbeat_interval = Duration::from_secs(env_parse("FLEETMESH_HEARTBEAT_SECS", 5));
        let failure_sweep_interval =
            Duration::from_secs(env_parse("FLEETMESH_FAILURE_SWEEP_SECS", 10));
        let suspect_after = Duration::from_secs(env_parse("FLEETMESH_SUSPECT_AFTER_SECS", 15));
        let suspect_grace = Duration::from_secs(env_parse("FLEETMESH_SUSPECT_GRACE_SECS", 15));
        let self_propose_interval =
            Duration::from_secs(env_parse("FLEETMESH_SELF_PROPOSE_SECS", 15));
        let shutdown_grace = Duration::from_secs(env_parse("FLEETMESH_SHUTDOWN_GRACE_SECS", 10));
        let container_runtime_bin =
            std::env::var("FLEETMESH_CONTAINER_RUNTIME").unwrap_or_else(|_| "docker".to_string());
        let store_backend = match std::env::var("FLEETMESH_STORE_BACKEND").as_deref() {
            Ok("memory") => StoreBackendKind::Memory,
            _ => StoreBackendKind::Sled,
        };

        Self {
            node_id,
            storage_path,
            swarm_name,
            http_port,
            ws_port,
            listen_port,
            consensus_f,
            quorum_override,
            heartbeat_interval,
            failure_sweep_interval,
            suspect_after,
            suspect_grace,
            self_propose_interval,
            shutdown_grace,
            container_runtime_bin,
            store_backend,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn random_node_id() -> String {
    let mut bytes = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_on_missing_var() {
        std::env::remove_var("FLEETMESH_DOES_NOT_EXIST");
        assert_eq!(env_parse::<u16>("FLEETMESH_DOES_NOT_EXIST", 9), 9);
    }

    #[test]
    fn random_node_id_is_eight_hex_chars() {
        let id = random_node_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
