// In-memory view of one collection's trust metadata. Every change made through
// a Repo is mirrored into its staged Transaction; nothing reaches the store
// until the caller commits that transaction.
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::str::FromStr;

use crate::error::{Error, StoreError};
use crate::keys::KeyPair;
use crate::metadata::{
    self, FileMeta, Header, MetaRef, Role, RoleKeys, Root, Signed, Snapshot, Targets, Timestamp,
};
use crate::store::{CollectionState, Transaction};

/// Compressed copy of the targets document stored when snapshots are gzip'd.
pub const TARGETS_GZ: &str = "targets.json.gz";

/// Encoding of the targets document referenced by the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Default for Compression {
    fn default() -> Compression {
        Compression::None
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Compression, String> {
        match s {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            other => Err(format!("unknown compression mode {:?}", other)),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => f.write_str("none"),
            Compression::Gzip => f.write_str("gzip"),
        }
    }
}

pub struct Repo {
    collection: String,
    targets: BTreeMap<String, FileMeta>,
    keys: Vec<KeyPair>,
    metadata: BTreeMap<String, Vec<u8>>,
    staged: Transaction,
    now: DateTime<Utc>,
}

impl Repo {
    pub fn open(collection: &str, state: Option<CollectionState>) -> Result<Repo, Error> {
        let state = state.unwrap_or_default();
        Ok(Repo {
            collection: collection.to_string(),
            targets: state.targets,
            keys: state.keys,
            metadata: state.metadata,
            staged: Transaction::default(),
            now: Utc::now(),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn targets(&self) -> &BTreeMap<String, FileMeta> {
        &self.targets
    }

    pub fn has_keys(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn keys_for(&self, role: Role) -> impl Iterator<Item = &KeyPair> {
        self.keys.iter().filter(move |key| key.role == role)
    }

    /// Current signed blob for `file_name`, including blobs signed in this run.
    pub fn blob(&self, file_name: &str) -> Option<&[u8]> {
        self.metadata.get(file_name).map(Vec::as_slice)
    }

    pub fn add_key(&mut self, key: KeyPair) {
        self.keys.push(key.clone());
        self.staged.put_key(key);
    }

    pub fn add_target(&mut self, tag: &str, meta: FileMeta) {
        self.targets.insert(tag.to_string(), meta.clone());
        self.staged.put_target(tag, meta);
    }

    /// Returns whether `tag` was present.
    pub fn remove_target(&mut self, tag: &str) -> bool {
        let removed = self.targets.remove(tag).is_some();
        if removed {
            self.staged.delete_target(tag);
        }
        removed
    }

    /// Version of the persisted (or just signed) document of `role`, 0 if none.
    pub fn version(&self, role: Role) -> Result<u64, Error> {
        match self.blob(role.file_name()) {
            Some(blob) => Ok(self.header(role.file_name(), blob)?.version),
            None => Ok(0),
        }
    }

    fn header(&self, file_name: &str, blob: &[u8]) -> Result<Header, StoreError> {
        metadata::decode::<Header>(blob)
            .map(|signed| signed.signed)
            .map_err(|e| StoreError::Corrupt {
                collection: self.collection.clone(),
                reason: format!("{}: {}", file_name, e),
            })
    }

    pub fn sign_root(&mut self) -> Result<Vec<u8>, Error> {
        let mut keys = BTreeMap::new();
        let mut roles = BTreeMap::new();
        for role in Role::ALL.iter() {
            let mut keyids = Vec::new();
            for key in self.keys_for(*role) {
                keys.insert(key.keyid.clone(), key.public.clone());
                keyids.push(key.keyid.clone());
            }
            if !keyids.is_empty() {
                roles.insert(
                    role.name().to_string(),
                    RoleKeys {
                        keyids,
                        threshold: 1,
                    },
                );
            }
        }
        let root = Root {
            type_: metadata::type_field(Role::Root),
            version: self.version(Role::Root)? + 1,
            expires: Role::Root.expires_from(self.now),
            keys,
            roles,
            consistent_snapshot: false,
        };
        self.sign_and_stage(Role::Root, &root)
    }

    pub fn sign_targets(&mut self) -> Result<Vec<u8>, Error> {
        let targets = Targets {
            type_: metadata::type_field(Role::Targets),
            version: self.version(Role::Targets)? + 1,
            expires: Role::Targets.expires_from(self.now),
            targets: self.targets.clone(),
        };
        self.sign_and_stage(Role::Targets, &targets)
    }

    /// Builds and signs a snapshot pinning the current `targets` (and `root`).
    pub fn snapshot(&mut self, compression: Compression) -> Result<Vec<u8>, Error> {
        let mut meta = BTreeMap::new();
        for role in [Role::Root, Role::Targets].iter() {
            if let Some(blob) = self.blob(role.file_name()) {
                let version = self.version(*role)?;
                meta.insert(role.file_name().to_string(), MetaRef::of(blob, version));
            }
        }
        let targets_blob = self
            .blob(Role::Targets.file_name())
            .ok_or_else(|| Error::signing(Role::Snapshot, "targets have not been signed"))?
            .to_vec();
        if compression == Compression::Gzip {
            let compressed = gzip(&targets_blob)
                .map_err(|e| Error::signing(Role::Snapshot, format!("compressing targets: {}", e)))?;
            let version = self.version(Role::Targets)?;
            meta.insert(TARGETS_GZ.to_string(), MetaRef::of(&compressed, version));
            self.metadata.insert(TARGETS_GZ.to_string(), compressed.clone());
            self.staged.put_metadata(TARGETS_GZ, compressed);
        } else if self.metadata.remove(TARGETS_GZ).is_some() {
            // no longer pinned by any snapshot
            self.staged.delete_metadata(TARGETS_GZ);
        }
        let snapshot = Snapshot {
            type_: metadata::type_field(Role::Snapshot),
            version: self.version(Role::Snapshot)? + 1,
            expires: Role::Snapshot.expires_from(self.now),
            meta,
        };
        self.sign_and_stage(Role::Snapshot, &snapshot)
    }

    /// Builds and signs a timestamp pinning the current `snapshot`.
    pub fn timestamp(&mut self) -> Result<Vec<u8>, Error> {
        let snapshot_blob = self
            .blob(Role::Snapshot.file_name())
            .ok_or_else(|| Error::signing(Role::Timestamp, "snapshot has not been signed"))?;
        let mut meta = BTreeMap::new();
        meta.insert(
            Role::Snapshot.file_name().to_string(),
            MetaRef::of(snapshot_blob, self.version(Role::Snapshot)?),
        );
        let timestamp = Timestamp {
            type_: metadata::type_field(Role::Timestamp),
            version: self.version(Role::Timestamp)? + 1,
            expires: Role::Timestamp.expires_from(self.now),
            meta,
        };
        self.sign_and_stage(Role::Timestamp, &timestamp)
    }

    /// Signs `document` with every key of `role` and stages the signed blob.
    fn sign_and_stage<T: Serialize>(&mut self, role: Role, document: &T) -> Result<Vec<u8>, Error> {
        let payload = metadata::canonical(document).map_err(|e| Error::signing(role, e))?;
        let signatures = self
            .keys_for(role)
            .map(|key| key.sign(&payload))
            .collect::<Result<Vec<_>, Error>>()?;
        if signatures.is_empty() {
            return Err(Error::signing(
                role,
                format!("no {} key for {}", role, self.collection),
            ));
        }
        let blob = metadata::canonical(&Signed {
            signed: document,
            signatures,
        })
        .map_err(|e| Error::signing(role, e))?;
        self.metadata
            .insert(role.file_name().to_string(), blob.clone());
        self.staged.put_metadata(role.file_name(), blob.clone());
        Ok(blob)
    }

    /// Everything changed through this repo since the last call, ready to
    /// commit.
    pub fn take_transaction(&mut self) -> Transaction {
        std::mem::take(&mut self.staged)
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}
