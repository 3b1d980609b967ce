// Role keys: generation, signing and the provisioning operation that gives a
// collection its four standard keys.
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

use crate::error::Error;
use crate::metadata::{self, Role, Signature};
use crate::repo::Repo;

const KEY_TYPE: &str = "ed25519";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub public: String,
}

/// Public half of a role key, as listed in `root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub keytype: String,
    pub keyval: KeyValue,
}

impl PublicKey {
    /// Lowercase hex SHA-256 of the canonical encoding of the key.
    pub fn key_id(&self) -> Result<String, String> {
        metadata::canonical(self).map(|bytes| metadata::sha256_hex(&bytes))
    }

    /// Checks `sig` over `payload` against this key.
    pub fn verify(&self, payload: &[u8], sig: &Signature) -> bool {
        let public = match decode_32(&self.keyval.public) {
            Some(bytes) => bytes,
            None => return false,
        };
        let key = match VerifyingKey::from_bytes(&public) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let sig_bytes = match hex::decode(&sig.sig) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        match ed25519_dalek::Signature::from_slice(&sig_bytes) {
            Ok(sig) => key.verify(payload, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

/// A role key as held by the store, private half included.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub role: Role,
    pub keyid: String,
    pub public: PublicKey,
    private: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("role", &self.role)
            .field("keyid", &self.keyid)
            .finish()
    }
}

impl KeyPair {
    pub fn generate(role: Role) -> Result<KeyPair, Error> {
        let keygen_err = |reason: String| Error::KeyGen { role, reason };
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| keygen_err(e.to_string()))?;
        let signing = SigningKey::from_bytes(&seed);
        let public = PublicKey {
            keytype: KEY_TYPE.to_string(),
            keyval: KeyValue {
                public: hex::encode(signing.verifying_key().to_bytes()),
            },
        };
        let keyid = public.key_id().map_err(keygen_err)?;
        Ok(KeyPair {
            role,
            keyid,
            public,
            private: hex::encode(seed),
        })
    }

    pub fn sign(&self, payload: &[u8]) -> Result<Signature, Error> {
        let seed = decode_32(&self.private)
            .ok_or_else(|| Error::signing(self.role, format!("unusable key {}", self.keyid)))?;
        let sig = SigningKey::from_bytes(&seed).sign(payload);
        Ok(Signature {
            keyid: self.keyid.clone(),
            method: KEY_TYPE.to_string(),
            sig: hex::encode(sig.to_bytes()),
        })
    }
}

fn decode_32(encoded: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(encoded).ok()?;
    <[u8; 32]>::try_from(bytes.as_slice()).ok()
}

/// Generates a key for every standard role of `repo` that has none and
/// re-signs `root` to list them. Existing keys are never replaced.
///
/// Returns whether anything was generated; the changes are only staged on
/// `repo` and become visible once its transaction is committed.
pub fn provision(repo: &mut Repo) -> Result<bool, Error> {
    provision_with(repo, KeyPair::generate)
}

/// Keys come from `generate`; either every missing role gets one or none does.
fn provision_with(
    repo: &mut Repo,
    mut generate: impl FnMut(Role) -> Result<KeyPair, Error>,
) -> Result<bool, Error> {
    let mut generated = Vec::new();
    for role in Role::ALL.iter() {
        if repo.keys_for(*role).next().is_none() {
            generated.push(generate(*role)?);
        }
    }
    if generated.is_empty() {
        return Ok(false);
    }
    for key in generated {
        debug!("{}: generated {} key {}", repo.collection(), key.role, key.keyid);
        repo.add_key(key);
    }
    repo.sign_root()?;
    Ok(true)
}
