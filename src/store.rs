// Store is responsible for:
// keeping, per collection, the target entries, the role keys and the
// current signed metadata blobs
// applying a staged Transaction so that readers see either all of it or
// none of it
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::StoreError;
use crate::keys::KeyPair;
use crate::metadata::{self, FileMeta};

/// Everything persisted for one collection, read in one consistent piece.
#[derive(Debug, Clone, Default)]
pub struct CollectionState {
    pub targets: BTreeMap<String, FileMeta>,
    pub keys: Vec<KeyPair>,
    /// Signed blobs keyed by file name (`targets.json`, ...).
    pub metadata: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
enum Op {
    PutTarget(String, FileMeta),
    DeleteTarget(String),
    PutMetadata(String, Vec<u8>),
    DeleteMetadata(String),
    PutKey(KeyPair),
}

/// Writes staged against one collection and committed together.
#[derive(Debug, Default)]
pub struct Transaction {
    ops: Vec<Op>,
}

impl Transaction {
    pub fn put_target(&mut self, tag: &str, meta: FileMeta) {
        self.ops.push(Op::PutTarget(tag.to_string(), meta));
    }

    pub fn delete_target(&mut self, tag: &str) {
        self.ops.push(Op::DeleteTarget(tag.to_string()));
    }

    pub fn put_metadata(&mut self, file_name: &str, blob: Vec<u8>) {
        self.ops.push(Op::PutMetadata(file_name.to_string(), blob));
    }

    pub fn delete_metadata(&mut self, file_name: &str) {
        self.ops.push(Op::DeleteMetadata(file_name.to_string()));
    }

    pub fn put_key(&mut self, key: KeyPair) {
        self.ops.push(Op::PutKey(key));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn apply_to(self, state: &mut CollectionState) {
        for op in self.ops {
            match op {
                Op::PutTarget(tag, meta) => {
                    state.targets.insert(tag, meta);
                }
                Op::DeleteTarget(tag) => {
                    state.targets.remove(&tag);
                }
                Op::PutMetadata(name, blob) => {
                    state.metadata.insert(name, blob);
                }
                Op::DeleteMetadata(name) => {
                    state.metadata.remove(&name);
                }
                Op::PutKey(key) => {
                    if !state.keys.iter().any(|k| k.keyid == key.keyid) {
                        state.keys.push(key);
                    }
                }
            }
        }
    }
}

pub trait BlobStore: Send + Sync {
    /// Current state of `collection`, or `None` if nothing was ever committed.
    fn load(&self, collection: &str) -> Result<Option<CollectionState>, StoreError>;

    /// Applies all of `tx` atomically.
    fn commit(&self, collection: &str, tx: Transaction) -> Result<(), StoreError>;

    fn get_all_metadata(
        &self,
        collection: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, StoreError> {
        Ok(self.load(collection)?.map(|state| state.metadata))
    }
}

/// Process-local store. Commits swap in a whole new state.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Arc<CollectionState>>>,
}

impl BlobStore for MemoryStore {
    fn load(&self, collection: &str) -> Result<Option<CollectionState>, StoreError> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(collections.get(collection).map(|state| (**state).clone()))
    }

    fn commit(&self, collection: &str, tx: Transaction) -> Result<(), StoreError> {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = collections
            .get(collection)
            .map(|state| (**state).clone())
            .unwrap_or_default();
        tx.apply_to(&mut next);
        collections.insert(collection.to_string(), Arc::new(next));
        Ok(())
    }
}

const CURRENT: &str = "CURRENT";
const TARGETS_FILE: &str = "targets.db.json";
const KEYS_FILE: &str = "keys.json";
const META_DIR: &str = "meta";

/// Directory-backed store.
///
/// Layout per collection: `<root>/<sha256(collection)>/gen-<n>/` holds one
/// immutable generation (target entries, keys and the signed blobs under
/// `meta/`). `CURRENT` names the published generation and is only ever
/// replaced by rename, so a reader that resolved it sees a complete
/// generation and a crashed commit leaves the previous one in place.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<FileStore, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(FileStore { root })
    }

    /// Hashed so arbitrary collection names map to one safe directory each.
    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(metadata::sha256_hex(collection.as_bytes()))
    }

    /// Generation currently published for `collection`.
    pub fn generation(&self, collection: &str) -> Result<Option<u64>, StoreError> {
        let path = self.collection_dir(collection).join(CURRENT);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        contents
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| StoreError::Corrupt {
                collection: collection.to_string(),
                reason: format!("unreadable {} pointer {:?}", CURRENT, contents),
            })
    }

    fn read_generation(&self, dir: &Path) -> Result<CollectionState, StoreError> {
        let targets = serde_json::from_slice(&std::fs::read(dir.join(TARGETS_FILE))?)?;
        let keys = serde_json::from_slice(&std::fs::read(dir.join(KEYS_FILE))?)?;
        let mut metadata = BTreeMap::new();
        for entry in std::fs::read_dir(dir.join(META_DIR))? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                metadata.insert(name.to_string(), std::fs::read(entry.path())?);
            }
        }
        Ok(CollectionState {
            targets,
            keys,
            metadata,
        })
    }

    fn write_generation(&self, dir: &Path, state: &CollectionState) -> Result<(), StoreError> {
        if dir.exists() {
            // left behind by a commit that never got published
            std::fs::remove_dir_all(dir)?;
        }
        let meta_dir = dir.join(META_DIR);
        std::fs::create_dir_all(&meta_dir)?;
        write_synced(&dir.join(TARGETS_FILE), &serde_json::to_vec(&state.targets)?)?;
        write_synced(&dir.join(KEYS_FILE), &serde_json::to_vec(&state.keys)?)?;
        for (name, blob) in &state.metadata {
            write_synced(&meta_dir.join(name), blob)?;
        }
        sync_dir(&meta_dir)?;
        sync_dir(dir)?;
        Ok(())
    }
}

/// Writes `bytes` to `path` and waits until they are on disk.
fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Makes the entries created in `dir` durable.
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

impl BlobStore for FileStore {
    fn load(&self, collection: &str) -> Result<Option<CollectionState>, StoreError> {
        match self.generation(collection)? {
            Some(generation) => {
                let dir = self
                    .collection_dir(collection)
                    .join(format!("gen-{}", generation));
                self.read_generation(&dir).map(Some)
            }
            None => Ok(None),
        }
    }

    fn commit(&self, collection: &str, tx: Transaction) -> Result<(), StoreError> {
        let collection_dir = self.collection_dir(collection);
        std::fs::create_dir_all(&collection_dir)?;
        let current = self.generation(collection)?;
        let mut state = self.load(collection)?.unwrap_or_default();
        tx.apply_to(&mut state);

        let next = current.map_or(1, |generation| generation + 1);
        self.write_generation(&collection_dir.join(format!("gen-{}", next)), &state)?;

        let mut pointer = tempfile::NamedTempFile::new_in(&collection_dir)?;
        write!(pointer, "{}", next)?;
        pointer.as_file().sync_all()?;
        // the generation is fully on disk before CURRENT can name it
        pointer
            .persist(collection_dir.join(CURRENT))
            .map_err(|e| e.error)?;
        sync_dir(&collection_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Role;

    fn meta(length: u64) -> FileMeta {
        FileMeta {
            length,
            hashes: vec![("sha256".to_string(), "ab".repeat(32))]
                .into_iter()
                .collect(),
            custom: None,
        }
    }

    fn exercise(store: &dyn BlobStore) {
        assert!(store.load("app").unwrap().is_none());
        assert!(store.get_all_metadata("app").unwrap().is_none());

        let key = KeyPair::generate(Role::Targets).unwrap();
        let mut tx = Transaction::default();
        tx.put_target("v1", meta(1));
        tx.put_target("v2", meta(2));
        tx.put_metadata("targets.json", b"one".to_vec());
        tx.put_key(key.clone());
        store.commit("app", tx).unwrap();

        let mut tx = Transaction::default();
        tx.delete_target("v1");
        tx.delete_target("missing");
        tx.put_target("v2", meta(3));
        tx.put_metadata("snapshot.json", b"two".to_vec());
        tx.put_key(key.clone());
        store.commit("app", tx).unwrap();

        let state = store.load("app").unwrap().unwrap();
        assert_eq!(state.targets.len(), 1);
        assert_eq!(state.targets["v2"].length, 3);
        assert_eq!(state.keys.len(), 1);
        assert_eq!(state.keys[0].keyid, key.keyid);
        assert_eq!(state.metadata["targets.json"], b"one".to_vec());
        assert_eq!(state.metadata["snapshot.json"], b"two".to_vec());

        assert!(store.load("other").unwrap().is_none());
    }

    #[test]
    fn memory_store_applies_transactions() {
        exercise(&MemoryStore::default());
    }

    #[test]
    fn file_store_applies_transactions() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileStore::open(dir.path()).unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            let mut tx = Transaction::default();
            tx.put_target("v1", meta(7));
            tx.put_metadata("targets.json", b"blob".to_vec());
            store.commit("library/app", tx).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        let state = store.load("library/app").unwrap().unwrap();
        assert_eq!(state.targets["v1"].length, 7);
        assert_eq!(state.metadata["targets.json"], b"blob".to_vec());
    }

    #[test]
    fn file_store_publishes_new_generations() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.generation("app").unwrap(), None);
        for i in 1..=3u64 {
            let mut tx = Transaction::default();
            tx.put_metadata("timestamp.json", i.to_string().into_bytes());
            store.commit("app", tx).unwrap();
            assert_eq!(store.generation("app").unwrap(), Some(i));
        }
        // earlier generations are kept untouched
        let first = store.collection_dir("app").join("gen-1").join(META_DIR);
        assert_eq!(std::fs::read(first.join("timestamp.json")).unwrap(), b"1");
    }

    #[test]
    fn file_store_ignores_unpublished_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let mut tx = Transaction::default();
        tx.put_metadata("targets.json", b"published".to_vec());
        store.commit("app", tx).unwrap();

        // a half-written generation from an interrupted commit
        let stale = store.collection_dir("app").join("gen-2");
        std::fs::create_dir_all(stale.join(META_DIR)).unwrap();
        std::fs::write(stale.join(META_DIR).join("targets.json"), b"partial").unwrap();

        let state = store.load("app").unwrap().unwrap();
        assert_eq!(state.metadata["targets.json"], b"published".to_vec());

        let mut tx = Transaction::default();
        tx.put_metadata("snapshot.json", b"next".to_vec());
        store.commit("app", tx).unwrap();
        let state = store.load("app").unwrap().unwrap();
        assert_eq!(state.metadata.len(), 2);
        assert_eq!(state.metadata["targets.json"], b"published".to_vec());
    }

    #[test]
    fn deleted_metadata_disappears() {
        let dir = tempfile::tempdir().unwrap();
        let file_store = FileStore::open(dir.path()).unwrap();
        let memory_store = MemoryStore::default();
        let stores: [&dyn BlobStore; 2] = [&memory_store, &file_store];
        for store in stores.iter() {
            let mut tx = Transaction::default();
            tx.put_metadata("targets.json", b"plain".to_vec());
            tx.put_metadata("targets.json.gz", b"packed".to_vec());
            store.commit("app", tx).unwrap();

            let mut tx = Transaction::default();
            tx.delete_metadata("targets.json.gz");
            tx.delete_metadata("never-written.json");
            store.commit("app", tx).unwrap();

            let blobs = store.get_all_metadata("app").unwrap().unwrap();
            assert_eq!(blobs.keys().cloned().collect::<Vec<_>>(), vec!["targets.json".to_string()]);
        }
    }

    #[test]
    fn file_store_generation_is_complete_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let blob = vec![7u8; 64 * 1024];
        let mut tx = Transaction::default();
        tx.put_target("v1", meta(1));
        tx.put_metadata("targets.json", blob.clone());
        tx.put_metadata("snapshot.json", b"snap".to_vec());
        store.commit("app", tx).unwrap();

        let published = store.collection_dir("app").join("gen-1");
        assert_eq!(std::fs::read(published.join(META_DIR).join("targets.json")).unwrap(), blob);
        let on_disk = store.read_generation(&published).unwrap();
        assert_eq!(on_disk.metadata.len(), 2);
        assert_eq!(on_disk.targets["v1"].length, 1);
        // no pointer temp files are left next to CURRENT
        let leftovers: Vec<_> = std::fs::read_dir(store.collection_dir("app"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 2);
    }

    #[test]
    fn file_store_reports_corrupt_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let collection_dir = store.collection_dir("app");
        std::fs::create_dir_all(&collection_dir).unwrap();
        std::fs::write(collection_dir.join(CURRENT), "garbage").unwrap();
        match store.load("app") {
            Err(StoreError::Corrupt { collection, .. }) => assert_eq!(collection, "app"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
