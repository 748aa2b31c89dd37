//! The PBFT-lite consensus engine (spec §4.E): propose / prepare / commit
//! with a configurable quorum, out-of-order vote tolerance, and idempotent
//! vote sets. No view-change or leader election; an explicit non-goal
//! (spec §1).

pub mod engine;
pub mod types;

pub use engine::{Broadcaster, ConsensusEngine, DecisionSink};
pub use types::{ConsensusConfig, ConsensusRecord, Phase};
