//! Wire types: the signed envelope, its payload kinds, and the consensus
//! operation they carry (spec §3, §4.A, §6).

use fleetmesh_identity::{canonical_bytes, verify, IdentityError, Keypair, PublicKeyBytes};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A node's cluster-wide label. Orthogonal to its public key: two nodes can
/// never share a public key, but a `node_id` is just metadata until a
/// HANDSHAKE binds it to one.
pub type NodeId = String;

/// Milliseconds since the Unix epoch, used for every wire timestamp so
/// envelopes stay plain old data with no platform-specific clock type.
pub type Millis = i64;

pub fn now_millis() -> Millis {
    chrono::Utc::now().timestamp_millis()
}

/// The kind of change being proposed to consensus (spec §3 "Operation").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    AssignTask,
    FailNode,
    /// (expansion) worker-completion status update, routed through consensus
    /// per the Open Question (i) resolution recorded in DESIGN.md.
    UpdateStatus,
}

/// Type-specific fields of an [`Operation`]. `serde(untagged)` keeps the
/// wire shape flat and matches whichever `OpType` tag is present, rather than
/// nesting an extra discriminated union inside an already-discriminated one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpDetails {
    AssignTask {
        task_id: String,
        image: String,
        cmd: Vec<String>,
        assigned_node: NodeId,
    },
    FailNode {
        failed_node_id: NodeId,
        reassignments: Vec<Reassignment>,
    },
    UpdateStatus {
        task_id: String,
        status: String,
        completed_at: Option<Millis>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reassignment {
    pub task_id: String,
    pub new_node: NodeId,
}

/// A candidate state change proposed to consensus. Once DECIDED, `op_id`
/// becomes immutable (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op_id: Uuid,
    #[serde(rename = "type")]
    pub op_type: OpType,
    pub proposer: NodeId,
    pub timestamp: Millis,
    pub details: OpDetails,
}

impl Operation {
    pub fn new_assign_task(
        proposer: NodeId,
        task_id: String,
        image: String,
        cmd: Vec<String>,
        assigned_node: NodeId,
    ) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            op_type: OpType::AssignTask,
            proposer,
            timestamp: now_millis(),
            details: OpDetails::AssignTask {
                task_id,
                image,
                cmd,
                assigned_node,
            },
        }
    }

    pub fn new_fail_node(
        proposer: NodeId,
        failed_node_id: NodeId,
        reassignments: Vec<Reassignment>,
    ) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            op_type: OpType::FailNode,
            proposer,
            timestamp: now_millis(),
            details: OpDetails::FailNode {
                failed_node_id,
                reassignments,
            },
        }
    }

    pub fn new_update_status(
        proposer: NodeId,
        task_id: String,
        status: String,
        completed_at: Option<Millis>,
    ) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            op_type: OpType::UpdateStatus,
            proposer,
            timestamp: now_millis(),
            details: OpDetails::UpdateStatus {
                task_id,
                status,
                completed_at,
            },
        }
    }
}

/// The body of a signed envelope (spec §3 "Payload kinds").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    #[serde(rename = "HANDSHAKE")]
    Handshake { node_id: NodeId, timestamp: Millis },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat { node_id: NodeId, timestamp: Millis },
    #[serde(rename = "PBFT_PROPOSE")]
    PbftPropose { op: Operation },
    #[serde(rename = "PBFT_PREPARE")]
    PbftPrepare {
        op_id: Uuid,
        voter_node_id: NodeId,
        timestamp: Millis,
    },
    #[serde(rename = "PBFT_COMMIT")]
    PbftCommit {
        op_id: Uuid,
        voter_node_id: NodeId,
        timestamp: Millis,
    },
}

/// A fully signed wire message: `{ sender, payload, signature }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "hex_pk")]
    pub sender: PublicKeyBytes,
    pub payload: Payload,
    #[serde(with = "hex_sig")]
    pub signature: [u8; 64],
}

impl Envelope {
    /// Signs `payload` with `keypair`, producing a ready-to-send envelope.
    pub fn sign(keypair: &Keypair, payload: Payload) -> Result<Self, IdentityError> {
        let bytes = canonical_bytes(&payload)?;
        let sig = keypair.sign(&bytes);
        Ok(Self {
            sender: keypair.public_key(),
            payload,
            signature: sig.to_bytes(),
        })
    }

    /// Verifies the embedded signature over the embedded payload. This is the
    /// single gate spec §3/§8 require: an envelope that fails this check
    /// MUST NOT affect consensus or registry state.
    pub fn verify(&self) -> Result<bool, IdentityError> {
        let bytes = canonical_bytes(&self.payload)?;
        let sig = ed25519_dalek::Signature::from_bytes(&self.signature);
        Ok(verify(&self.sender, &bytes, &sig))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod hex_pk {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(pk: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(pk))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("public key must be 32 bytes"))
    }
}

mod hex_sig {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(sig))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips_through_json() {
        let kp = Keypair::generate();
        let env = Envelope::sign(
            &kp,
            Payload::Heartbeat {
                node_id: "n1".into(),
                timestamp: 42,
            },
        )
        .unwrap();
        let json = env.to_json().unwrap();
        let decoded = Envelope::from_json(&json).unwrap();
        assert!(decoded.verify().unwrap());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let kp = Keypair::generate();
        let mut env = Envelope::sign(
            &kp,
            Payload::Heartbeat {
                node_id: "n1".into(),
                timestamp: 42,
            },
        )
        .unwrap();
        env.payload = Payload::Heartbeat {
            node_id: "attacker".into(),
            timestamp: 42,
        };
        assert!(!env.verify().unwrap());
    }

    #[test]
    fn wrong_sender_key_fails_verification() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let mut env = Envelope::sign(
            &kp,
            Payload::Heartbeat {
                node_id: "n1".into(),
                timestamp: 42,
            },
        )
        .unwrap();
        env.sender = other.public_key();
        assert!(!env.verify().unwrap());
    }
}
