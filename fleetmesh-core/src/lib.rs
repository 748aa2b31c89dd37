//! The `FleetMesh` orchestrator (SPEC_FULL.md §2): owns configuration, node
//! identity metadata, and wires every subsystem crate together: transport,
//! peer registry, router, consensus engine, replicated store, worker
//! supervisor, failure detector. Then drives the node's periodic tickers
//! (heartbeat, failure-detector sweep, simulated self-proposer) until a
//! shutdown signal arrives (spec §5).

mod config;
mod failure_detector;
mod node;
mod scheduling;

pub use config::{FleetMeshConfig, StoreBackendKind};
pub use failure_detector::FailureDetector;
pub use node::NodeMeta;
pub use scheduling::{SchedulingPolicy, SelfAssignPolicy};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetmesh_consensus::{Broadcaster, ConsensusConfig, ConsensusEngine};
use fleetmesh_identity::Keypair;
use fleetmesh_net::{
    cluster_topic, libp2p_keypair_from, now_millis, ConsensusHandler, Envelope, Operation,
    Payload, PeerRegistry, Router, Transport, TransportEvent,
};
use fleetmesh_store::{MemoryBackend, SledBackend, StorageBackend, TaskStore};
use fleetmesh_worker::{ProcessRuntime, WorkerSupervisor};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Bridges the engine's `Broadcaster` seam onto the concrete overlay
/// transport, keeping `fleetmesh-consensus` free of a `libp2p` dependency.
struct TransportBroadcaster(Arc<Transport>);

impl Broadcaster for TransportBroadcaster {
    fn broadcast(&self, bytes: Vec<u8>) -> Result<()> {
        self.0.broadcast(bytes)
    }
}

/// The fully wired node. One instance per process (spec §1: "every node
/// proposes, votes, decides, and executes").
pub struct FleetMesh {
    config: FleetMeshConfig,
    node_meta: NodeMeta,
    keypair: Keypair,
    transport: Arc<Transport>,
    registry: PeerRegistry,
    router: Arc<Router>,
    consensus: Arc<ConsensusEngine>,
    store: Arc<TaskStore>,
    worker: Arc<WorkerSupervisor>,
    failure_detector: Arc<FailureDetector>,
    inbound: AsyncMutex<Option<tokio::sync::mpsc::UnboundedReceiver<TransportEvent>>>,
    cancel: CancellationToken,
}

impl FleetMesh {
    /// Performs every fallible init step (spec §7.f "fatal init"): keypair
    /// load/generate and overlay bootstrap. A failure here is the only path
    /// that should set the process exit code to 1.
    pub async fn bootstrap() -> Result<Arc<Self>> {
        let config = FleetMeshConfig::load();
        info!(
            node_id = %config.node_id,
            swarm_name = %config.swarm_name,
            "loaded configuration"
        );

        std::fs::create_dir_all(&config.storage_path)
            .with_context(|| format!("creating storage dir {}", config.storage_path.display()))?;
        let keypair = Keypair::load_or_generate(&config.storage_path)
            .context("loading or generating node keypair")?;
        let node_meta = NodeMeta::new(&config, keypair.public_key());
        info!(public_key = %node_meta.public_key_hex(), "node identity ready");

        let topic = cluster_topic(&config.swarm_name);
        let libp2p_keypair =
            libp2p_keypair_from(&keypair).context("deriving overlay transport identity")?;
        let (transport, inbound) = Transport::join(libp2p_keypair, topic, config.listen_port)
            .await
            .context("joining peer overlay")?;
        let transport = Arc::new(transport);

        let backend: Arc<dyn StorageBackend> = match config.store_backend {
            StoreBackendKind::Memory => Arc::new(MemoryBackend::new()),
            StoreBackendKind::Sled => {
                let path = config.storage_path.join("store");
                Arc::new(
                    SledBackend::open(&path)
                        .with_context(|| format!("opening sled store at {}", path.display()))?,
                )
            }
        };
        let store = Arc::new(TaskStore::new(backend, node_meta.node_id.clone()));

        let consensus_config = match config.quorum_override {
            Some(q) => ConsensusConfig::with_quorum(config.consensus_f, q),
            None => ConsensusConfig::new(config.consensus_f),
        };
        let broadcaster = Arc::new(TransportBroadcaster(transport.clone()));
        let consensus = Arc::new(ConsensusEngine::new(
            node_meta.node_id.clone(),
            keypair.clone(),
            consensus_config,
            broadcaster,
            store.clone(),
        ));

        let runtime = Arc::new(ProcessRuntime::new(config.container_runtime_bin.clone()));
        let worker = WorkerSupervisor::new(node_meta.node_id.clone(), runtime, consensus.clone());
        store.set_local_assignment_listener(worker.clone());

        let registry = PeerRegistry::new();
        let router = Arc::new(Router::new(
            registry.clone(),
            consensus.clone() as Arc<dyn ConsensusHandler>,
        ));

        let failure_detector = Arc::new(FailureDetector::new(
            node_meta.node_id.clone(),
            registry.clone(),
            consensus.clone(),
            store.clone(),
            Arc::new(SelfAssignPolicy),
            config.suspect_after,
            config.suspect_grace,
        ));

        Ok(Arc::new(Self {
            config,
            node_meta,
            keypair,
            transport,
            registry,
            router,
            consensus,
            store,
            worker,
            failure_detector,
            inbound: AsyncMutex::new(Some(inbound)),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn store(&self) -> Arc<TaskStore> {
        self.store.clone()
    }

    pub fn node_id(&self) -> &str {
        &self.node_meta.node_id
    }

    /// Snapshot of every known peer, for diagnostics/tests.
    pub fn peers(&self) -> Vec<fleetmesh_net::PeerRecord> {
        self.registry.snapshot()
    }

    fn broadcast_payload(&self, payload: Payload) {
        match Envelope::sign(&self.keypair, payload) {
            Ok(envelope) => match envelope.to_json() {
                Ok(bytes) => {
                    if let Err(e) = self.transport.broadcast(bytes) {
                        warn!(error = %e, "broadcast failed");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode envelope"),
            },
            Err(e) => warn!(error = %e, "failed to sign envelope"),
        }
    }

    /// Runs the node until a shutdown signal arrives (spec §5). Spawns one
    /// task per logical concurrent activity named in spec §5: the inbound
    /// overlay reader, the heartbeat ticker, the failure-detector sweep, and
    /// the simulated self-proposer.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.broadcast_payload(Payload::Handshake {
            node_id: self.node_meta.node_id.clone(),
            timestamp: now_millis(),
        });

        let inbound_task = {
            let this = self.clone();
            tokio::spawn(async move { this.inbound_loop().await })
        };
        let heartbeat_task = {
            let this = self.clone();
            tokio::spawn(async move { this.heartbeat_loop().await })
        };
        let failure_task = {
            let this = self.clone();
            tokio::spawn(async move { this.failure_detector_loop().await })
        };
        let propose_task = {
            let this = self.clone();
            tokio::spawn(async move { this.self_propose_loop().await })
        };

        self.await_shutdown_signal().await;
        info!("shutdown signal received, stopping");
        self.cancel.cancel();

        self.transport.shutdown();
        self.worker.shutdown(self.config.shutdown_grace).await;

        for task in [inbound_task, heartbeat_task, failure_task, propose_task] {
            let _ = task.await;
        }

        Ok(())
    }

    async fn await_shutdown_signal(&self) {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
                _ = self.cancel.cancelled() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    async fn inbound_loop(self: Arc<Self>) {
        let mut rx = match self.inbound.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => {
                    match event {
                        Some(TransportEvent::Message(bytes)) => self.router.handle_frame(&bytes),
                        Some(TransportEvent::Connected(peer)) => {
                            info!(%peer, "overlay peer connected");
                            // Gossipsub does not replay history, so a peer
                            // that joined after our one-shot startup
                            // handshake would otherwise never see it
                            // (spec §4.B on_connect, §4.H/§8 scenario 5).
                            self.broadcast_payload(Payload::Handshake {
                                node_id: self.node_meta.node_id.clone(),
                                timestamp: now_millis(),
                            });
                        }
                        Some(TransportEvent::Disconnected(peer)) => info!(%peer, "overlay peer disconnected"),
                        None => break,
                    }
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.broadcast_payload(Payload::Heartbeat {
                        node_id: self.node_meta.node_id.clone(),
                        timestamp: now_millis(),
                    });
                }
            }
        }
    }

    async fn failure_detector_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.failure_sweep_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.failure_detector.sweep(),
            }
        }
    }

    /// Simulates external task submission via periodic self-proposals (spec
    /// §1 Non-goals: "external client APIs ... task submission is simulated
    /// internally by periodic self-proposals").
    async fn self_propose_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.self_propose_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let task_id = Uuid::new_v4().to_string();
                    let op = Operation::new_assign_task(
                        self.node_meta.node_id.clone(),
                        task_id.clone(),
                        "alpine".to_string(),
                        vec!["echo".to_string(), format!("hello from {}", self.node_meta.node_id)],
                        self.node_meta.node_id.clone(),
                    );
                    info!(task_id, "self-proposing demo task assignment");
                    self.consensus.propose(op);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consensus_config_defaults_to_f_derived_quorum() {
        let cfg = ConsensusConfig::new(1);
        assert_eq!(cfg.quorum(), 3);
    }
}
