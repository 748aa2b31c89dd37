//! Node identity and message signing.
//!
//! Every fleetmesh node is permanently identified by an Ed25519 keypair. The
//! public key is the cluster identity used as `sender` in every signed
//! envelope (see `fleetmesh-net`); the private key never leaves this crate.

use std::fs;
use std::path::Path;

use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read keypair file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write keypair file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("keypair file {0} is corrupt")]
    Corrupt(String),
    #[error("canonical encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A 32-byte Ed25519 public key, the node's permanent cluster identity.
pub type PublicKeyBytes = [u8; 32];

/// On-disk representation of a node's keypair, written once under
/// `STORAGE_PATH/keypair.json`. Keys are hex-encoded PKCS#8 (private) / SPKI
/// (public) DER, matching §6 of the spec.
#[derive(Debug, Serialize, Deserialize)]
struct KeypairFile {
    public_key_spki_hex: String,
    private_key_pkcs8_hex: String,
}

/// An Ed25519 keypair identifying this node.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generates a fresh random keypair. Does not persist it.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Loads the keypair from `dir/keypair.json`, generating and persisting
    /// one if the file is absent. This is the only fallible init path that is
    /// allowed to bubble up to `main` and exit the process (spec §6/§7.f).
    pub fn load_or_generate(dir: &Path) -> Result<Self, IdentityError> {
        let path = dir.join("keypair.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| IdentityError::Read {
                path: path.display().to_string(),
                source: e,
            })?;
            let file: KeypairFile = serde_json::from_str(&raw)
                .map_err(|_| IdentityError::Corrupt(path.display().to_string()))?;
            let priv_der = hex::decode(&file.private_key_pkcs8_hex)
                .map_err(|_| IdentityError::Corrupt(path.display().to_string()))?;
            let signing_key = SigningKey::from_pkcs8_der(&priv_der)
                .map_err(|_| IdentityError::Corrupt(path.display().to_string()))?;
            info!(path = %path.display(), "loaded existing node keypair");
            Ok(Self { signing_key })
        } else {
            fs::create_dir_all(dir).map_err(|e| IdentityError::Write {
                path: dir.display().to_string(),
                source: e,
            })?;
            let keypair = Self::generate();
            keypair.persist(&path)?;
            info!(path = %path.display(), "generated new node keypair");
            Ok(keypair)
        }
    }

    fn persist(&self, path: &Path) -> Result<(), IdentityError> {
        let priv_der = self
            .signing_key
            .to_pkcs8_der()
            .map_err(|_| IdentityError::Corrupt(path.display().to_string()))?;
        let pub_der = self
            .signing_key
            .verifying_key()
            .to_public_key_der()
            .map_err(|_| IdentityError::Corrupt(path.display().to_string()))?;
        let file = KeypairFile {
            public_key_spki_hex: hex::encode(pub_der.as_bytes()),
            private_key_pkcs8_hex: hex::encode(priv_der.as_bytes()),
        };
        let raw = serde_json::to_string_pretty(&file)?;
        fs::write(path, raw).map_err(|e| IdentityError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// This node's public key, the value placed in `sender` on every envelope.
    pub fn public_key(&self) -> PublicKeyBytes {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Raw `secret || public` key bytes, in the layout `ed25519-dalek` and
    /// libp2p's own `identity::ed25519::Keypair` both use. Exists solely so
    /// `fleetmesh-net` can drive the overlay transport off the same identity
    /// this node signs consensus messages with, rather than minting a second,
    /// unrelated libp2p keypair (spec §9 "Global process state ... initialize
    /// once at startup, pass explicitly into each component").
    pub fn to_keypair_bytes(&self) -> [u8; 64] {
        self.signing_key.to_keypair_bytes()
    }

    /// Signs raw bytes, which callers MUST have already canonicalized via
    /// [`canonical_bytes`].
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing_key.sign(bytes)
    }
}

/// Verifies `sig` over `bytes` against `pk`. Never panics: a malformed public
/// key is simply treated as a failed verification.
pub fn verify(pk: &PublicKeyBytes, bytes: &[u8], sig: &Signature) -> bool {
    match VerifyingKey::from_bytes(pk) {
        Ok(vk) => vk.verify(bytes, sig).is_ok(),
        Err(_) => false,
    }
}

/// Serializes `payload` to a deterministic byte string both the signer and
/// every verifier agree on bit-for-bit. `serde_json` preserves struct field
/// declaration order and never reorders maps on its own, so this is
/// deterministic as long as no signed payload embeds a `HashMap` (see
/// SPEC_FULL.md §3).
pub fn canonical_bytes<T: Serialize>(payload: &T) -> Result<Vec<u8>, IdentityError> {
    Ok(serde_json::to_vec(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = Keypair::generate();
        let payload = Sample {
            a: 7,
            b: "hello".into(),
        };
        let bytes = canonical_bytes(&payload).unwrap();
        let sig = kp.sign(&bytes);
        assert!(verify(&kp.public_key(), &bytes, &sig));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let bytes = canonical_bytes(&Sample {
            a: 1,
            b: "x".into(),
        })
        .unwrap();
        let sig = kp.sign(&bytes);
        assert!(!verify(&other.public_key(), &bytes, &sig));
    }

    #[test]
    fn verify_rejects_tampered_bytes() {
        let kp = Keypair::generate();
        let bytes = canonical_bytes(&Sample {
            a: 1,
            b: "x".into(),
        })
        .unwrap();
        let sig = kp.sign(&bytes);
        let mut tampered = bytes.clone();
        tampered[0] ^= 0xFF;
        assert!(!verify(&kp.public_key(), &tampered, &sig));
    }

    #[test]
    fn load_or_generate_persists_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let first = Keypair::load_or_generate(dir.path()).unwrap();
        let second = Keypair::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn corrupt_keypair_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keypair.json"), "not json").unwrap();
        assert!(Keypair::load_or_generate(dir.path()).is_err());
    }
}
