//! The peer transport (spec §4.B, §6): an authenticated, full-duplex
//! broadcast channel per cluster, built on libp2p's TCP+Noise+Yamux stack
//! with a single gossipsub topic standing in for the "server and client at
//! once" overlay contract. Gossipsub has no unicast primitive, so
//! peer-addressed sends are approximated by broadcasting and letting the
//! router at the application layer ignore envelopes not meant for it (every
//! envelope the core sends is either a broadcast by nature (PROPOSE,
//! PREPARE, COMMIT, HEARTBEAT) or tolerates being seen by bystanders).

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use libp2p::gossipsub::{self, MessageAuthenticity};
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, identity, noise, ping, tcp, yamux, PeerId, Swarm, SwarmBuilder};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Derives the libp2p transport identity from this node's Ed25519 consensus
/// keypair, so the overlay's authenticated peer identity and the envelope
/// `sender` key are the same public key (spec §4.B: peers are "keyed by a
/// long-lived public key").
pub fn libp2p_keypair_from(node_keypair: &fleetmesh_identity::Keypair) -> Result<identity::Keypair> {
    let mut bytes = node_keypair.to_keypair_bytes();
    let kp = identity::ed25519::Keypair::try_from_bytes(&mut bytes)
        .context("deriving libp2p identity from node keypair")?;
    Ok(identity::Keypair::from(kp))
}

/// Events the transport surfaces to the router.
#[derive(Debug)]
pub enum TransportEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    Message(Vec<u8>),
}

#[derive(NetworkBehaviour)]
struct FleetMeshBehaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

/// Handle to the running swarm. Owns the outbound side; inbound events
/// arrive on the channel returned by [`Transport::join`].
pub struct Transport {
    swarm_tx: mpsc::UnboundedSender<SwarmCommand>,
}

enum SwarmCommand {
    Broadcast(Vec<u8>),
    Shutdown,
}

impl Transport {
    /// Joins the cluster topic derived as `SHA-256(cluster_name)` (spec §6),
    /// acting simultaneously as publisher and subscriber. Returns the handle
    /// plus a receiver for inbound transport events.
    pub async fn join(
        local_key: identity::Keypair,
        topic: [u8; 32],
        listen_port: u16,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let local_peer_id = PeerId::from(local_key.public());
        info!(%local_peer_id, "joining fleetmesh overlay");

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(Duration::from_secs(1))
            .validation_mode(gossipsub::ValidationMode::Permissive)
            .build()
            .context("building gossipsub config")?;
        let mut gossipsub = gossipsub::Behaviour::new(
            MessageAuthenticity::Signed(local_key.clone()),
            gossipsub_config,
        )
        .map_err(|e| anyhow::anyhow!("gossipsub init failed: {e}"))?;

        let topic_handle = gossipsub::IdentTopic::new(hex::encode(topic));
        gossipsub
            .subscribe(&topic_handle)
            .context("subscribing to cluster topic")?;

        let identify = identify::Behaviour::new(identify::Config::new(
            "/fleetmesh/1.0.0".into(),
            local_key.public(),
        ));
        let ping = ping::Behaviour::new(ping::Config::new());

        let mut swarm = SwarmBuilder::with_existing_identity(local_key)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .context("configuring tcp transport")?
            .with_behaviour(|_| FleetMeshBehaviour {
                gossipsub,
                identify,
                ping,
            })
            .context("composing swarm behaviour")?
            .build();

        swarm
            .listen_on(format!("/ip4/0.0.0.0/tcp/{listen_port}").parse()?)
            .context("binding listen address")?;

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<SwarmCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(SwarmCommand::Broadcast(bytes)) => {
                                if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic_handle.clone(), bytes) {
                                    warn!(error = %e, "broadcast publish failed");
                                }
                            }
                            Some(SwarmCommand::Shutdown) | None => break,
                        }
                    }
                    event = swarm.select_next_some() => {
                        if let Some(out) = handle_swarm_event(event) {
                            if event_tx.send(out).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            info!("transport event loop stopped");
        });

        Ok((Self { swarm_tx: cmd_tx }, event_rx))
    }

    /// Broadcasts `bytes` to every subscriber of the cluster topic.
    pub fn broadcast(&self, bytes: Vec<u8>) -> Result<()> {
        self.swarm_tx
            .send(SwarmCommand::Broadcast(bytes))
            .map_err(|_| anyhow::anyhow!("transport event loop has shut down"))
    }

    /// Best-effort peer-addressed send: the router has no unicast primitive
    /// over gossipsub, so this degrades to a broadcast (see module docs).
    pub fn send(&self, _peer: PeerId, bytes: Vec<u8>) -> Result<()> {
        self.broadcast(bytes)
    }

    pub fn shutdown(&self) {
        let _ = self.swarm_tx.send(SwarmCommand::Shutdown);
    }
}

fn handle_swarm_event(
    event: libp2p::swarm::SwarmEvent<FleetMeshBehaviourEvent>,
) -> Option<TransportEvent> {
    use libp2p::swarm::SwarmEvent;
    match event {
        SwarmEvent::Behaviour(FleetMeshBehaviourEvent::Gossipsub(gossipsub::Event::Message {
            message,
            ..
        })) => Some(TransportEvent::Message(message.data)),
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            Some(TransportEvent::Connected(peer_id))
        }
        SwarmEvent::ConnectionClosed { peer_id, .. } => Some(TransportEvent::Disconnected(peer_id)),
        other => {
            debug!(?other, "unhandled swarm event");
            None
        }
    }
}
