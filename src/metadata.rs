// The four signed documents of a collection and the pieces they are made of.
// Everything that gets signed or persisted goes through `canonical` so the
// bytes a signature covers are the bytes a client recomputes.
use chrono::{DateTime, Duration, SubsecRound, Utc};
use crypto::digest::Digest;
use crypto::sha2::{Sha256, Sha512};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::Error;
use crate::keys::PublicKey;

/// Hash algorithms recorded for every snapshot/timestamp reference.
const REFERENCE_HASHES: [&str; 2] = ["sha256", "sha512"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Root,
    Targets,
    Snapshot,
    Timestamp,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Root, Role::Targets, Role::Snapshot, Role::Timestamp];

    pub fn name(self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Targets => "targets",
            Role::Snapshot => "snapshot",
            Role::Timestamp => "timestamp",
        }
    }

    /// Name under which the signed document is stored and served.
    pub fn file_name(self) -> &'static str {
        match self {
            Role::Root => "root.json",
            Role::Targets => "targets.json",
            Role::Snapshot => "snapshot.json",
            Role::Timestamp => "timestamp.json",
        }
    }

    /// Expiry of a document of this role signed at `now`.
    pub fn expires_from(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lifetime = match self {
            Role::Root => Duration::days(365),
            Role::Targets => Duration::days(90),
            Role::Snapshot => Duration::days(7),
            Role::Timestamp => Duration::days(1),
        };
        now.trunc_subsecs(0) + lifetime
    }

    fn type_name(self) -> &'static str {
        match self {
            Role::Root => "Root",
            Role::Targets => "Targets",
            Role::Snapshot => "Snapshot",
            Role::Timestamp => "Timestamp",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Description of a target artifact: its size and content digests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub length: u64,
    pub hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Value>,
}

impl FileMeta {
    /// Decode and validate a request body.
    pub fn parse(body: &[u8]) -> Result<FileMeta, Error> {
        let meta: FileMeta = serde_json::from_slice(body)
            .map_err(|e| Error::Validation(format!("malformed file metadata: {}", e)))?;
        meta.validate()?;
        Ok(meta)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.hashes.is_empty() {
            return Err(Error::Validation(
                "file metadata needs at least one hash".to_string(),
            ));
        }
        for (algorithm, digest) in &self.hashes {
            let algorithm_ok = !algorithm.is_empty()
                && algorithm
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
            if !algorithm_ok {
                return Err(Error::Validation(format!(
                    "invalid hash algorithm {:?}",
                    algorithm
                )));
            }
            let expected_len = match algorithm.as_str() {
                "sha256" => Some(64),
                "sha512" => Some(128),
                _ => None,
            };
            let digest_ok = !digest.is_empty()
                && digest.len() % 2 == 0
                && digest
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
                && expected_len.map_or(true, |len| digest.len() == len);
            if !digest_ok {
                return Err(Error::Validation(format!(
                    "invalid {} digest {:?}",
                    algorithm, digest
                )));
            }
        }
        Ok(())
    }
}

/// Pin on another signed blob, as recorded in snapshot and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRef {
    pub length: u64,
    pub hashes: BTreeMap<String, String>,
    pub version: u64,
}

impl MetaRef {
    pub fn of(blob: &[u8], version: u64) -> MetaRef {
        let mut hashes = BTreeMap::new();
        for algorithm in REFERENCE_HASHES.iter() {
            hashes.insert(algorithm.to_string(), hex_digest(algorithm, blob));
        }
        MetaRef {
            length: blob.len() as u64,
            hashes,
            version,
        }
    }

    /// Whether `blob` at `version` is the document this reference pins.
    pub fn matches(&self, blob: &[u8], version: u64) -> bool {
        *self == MetaRef::of(blob, version)
    }
}

fn hex_digest(algorithm: &str, blob: &[u8]) -> String {
    match algorithm {
        "sha512" => {
            let mut digest = Sha512::new();
            digest.input(blob);
            digest.result_str()
        }
        _ => {
            let mut digest = Sha256::new();
            digest.input(blob);
            digest.result_str()
        }
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex_digest("sha256", bytes)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: String,
    pub method: String,
    pub sig: String,
}

/// A document together with the signatures over its canonical encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signed<T> {
    pub signed: T,
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleKeys {
    pub keyids: Vec<String>,
    pub threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    #[serde(rename = "_type")]
    pub type_: String,
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub keys: BTreeMap<String, PublicKey>,
    pub roles: BTreeMap<String, RoleKeys>,
    pub consistent_snapshot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Targets {
    #[serde(rename = "_type")]
    pub type_: String,
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub targets: BTreeMap<String, FileMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "_type")]
    pub type_: String,
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, MetaRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timestamp {
    #[serde(rename = "_type")]
    pub type_: String,
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, MetaRef>,
}

/// Value of the `_type` field for documents of `role`.
pub fn type_field(role: Role) -> String {
    role.type_name().to_string()
}

/// Enough of any document to read its version back.
#[derive(Debug, Deserialize)]
pub struct Header {
    pub version: u64,
}

/// Canonical JSON (RFC 8785) encoding used for signing and for persisted blobs.
pub fn canonical<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
    serde_jcs::to_vec(value).map_err(|e| e.to_string())
}

pub fn decode<T: DeserializeOwned>(blob: &[u8]) -> Result<Signed<T>, serde_json::Error> {
    serde_json::from_slice(blob)
}
