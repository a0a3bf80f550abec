//! Long-lived node identity.
//!
//! A node is known to the mesh by its session id: the unpadded base64 of the
//! SHA-256 digest of its public key. The key pair can be exported to and
//! imported from a small JSON credentials file so the id survives restarts.

use crate::protocol::SessionId;
use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to access credentials file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed credentials file: {0}")]
    Format(#[from] serde_json::Error),

    #[error("invalid key encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("invalid key: {0}")]
    Key(String),

    #[error("public key does not match private key")]
    KeyMismatch,
}

#[derive(Serialize, Deserialize)]
struct Credentials {
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "privateKey")]
    private_key: String,
}

pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn session_id(&self) -> SessionId {
        session_id_for(&self.verifying_key())
    }

    pub fn to_json(&self) -> Result<String, IdentityError> {
        let credentials = Credentials {
            public_key: general_purpose::STANDARD.encode(self.verifying_key().to_bytes()),
            private_key: general_purpose::STANDARD.encode(self.signing_key.to_bytes()),
        };
        Ok(serde_json::to_string_pretty(&credentials)?)
    }

    pub fn from_json(text: &str) -> Result<Self, IdentityError> {
        let credentials: Credentials = serde_json::from_str(text)?;

        let secret: [u8; 32] = general_purpose::STANDARD
            .decode(credentials.private_key.trim())?
            .try_into()
            .map_err(|_| IdentityError::Key("private key must be 32 bytes".to_string()))?;
        let signing_key = SigningKey::from_bytes(&secret);

        let public = general_purpose::STANDARD.decode(credentials.public_key.trim())?;
        if public.as_slice() != signing_key.verifying_key().as_bytes() {
            return Err(IdentityError::KeyMismatch);
        }

        Ok(Self { signing_key })
    }

    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Loads the identity at `path`, or creates and saves a fresh one.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let identity = Self::load(path)?;
            info!(path = %path.display(), id = %identity.session_id(), "identity loaded");
            return Ok(identity);
        }

        let identity = Self::generate();
        identity.save(path)?;
        info!(path = %path.display(), id = %identity.session_id(), "identity generated");
        Ok(identity)
    }
}

pub fn session_id_for(key: &VerifyingKey) -> SessionId {
    let digest = Sha256::digest(key.as_bytes());
    SessionId::new(general_purpose::STANDARD_NO_PAD.encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_is_stable_across_export() {
        let identity = Identity::generate();
        let restored = Identity::from_json(&identity.to_json().unwrap()).unwrap();

        assert_eq!(identity.session_id(), restored.session_id());
        // 32 digest bytes, unpadded base64.
        assert_eq!(identity.session_id().as_str().len(), 43);
        assert!(!identity.session_id().as_str().ends_with('='));

        assert_eq!(identity.verifying_key(), restored.verifying_key());
    }

    #[test]
    fn test_rejects_mismatched_keys() {
        let a = Identity::generate();
        let b = Identity::generate();
        let mut credentials: Credentials = serde_json::from_str(&a.to_json().unwrap()).unwrap();
        credentials.public_key = general_purpose::STANDARD.encode(b.verifying_key().to_bytes());

        let text = serde_json::to_string(&credentials).unwrap();
        assert!(matches!(Identity::from_json(&text), Err(IdentityError::KeyMismatch)));
        assert!(matches!(Identity::from_json("{}"), Err(IdentityError::Format(_))));
    }

    #[test]
    fn test_load_or_generate_persists() {
        let path = std::env::temp_dir().join(format!("synapse-identity-{}.json", uuid::Uuid::new_v4()));
        let first = Identity::load_or_generate(&path).unwrap();
        let second = Identity::load_or_generate(&path).unwrap();
        assert_eq!(first.session_id(), second.session_id());
        let _ = std::fs::remove_file(&path);
    }
}
