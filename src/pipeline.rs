// Update pipeline: the ordered re-signing of a collection's metadata after a
// change to its targets, plus the read and key provisioning paths that share
// its store and locks.
//
// A run moves through Stages strictly in order:
//
//   MutatePending -> TargetsSigned -> SnapshotSigned -> TimestampSigned -> Committed
//          \______________\_______________\__________________\______> Aborted
//
// Each signed document is staged on the run's Repo; only the final step hands
// the whole batch to the store, in one transaction. An aborted run therefore
// leaves the store exactly as it found it.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, ErrorKind};
use crate::keys;
use crate::metadata::FileMeta;
use crate::repo::{Compression, Repo};
use crate::store::BlobStore;

/// A change to a collection's target set.
#[derive(Debug, Clone)]
pub enum Mutation {
    Add { tag: String, meta: FileMeta },
    Remove { tag: String },
}

impl Mutation {
    pub fn tag(&self) -> &str {
        match self {
            Mutation::Add { tag, .. } | Mutation::Remove { tag } => tag,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        validate_tag(self.tag())?;
        if let Mutation::Add { meta, .. } = self {
            meta.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    MutatePending,
    TargetsSigned,
    SnapshotSigned,
    TimestampSigned,
    Committed,
    Aborted(ErrorKind),
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Committed | Stage::Aborted(_))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    /// Passed through to snapshot generation.
    pub compression: Compression,
    /// Generate keys for a collection that has none on its first mutation.
    pub auto_provision: bool,
}

/// One pass of the signing cascade over one collection.
///
/// The caller must hold the collection's lock for the lifetime of the run.
pub struct Run<'a> {
    store: &'a dyn BlobStore,
    repo: Repo,
    mutation: Mutation,
    compression: Compression,
    stage: Stage,
}

impl<'a> Run<'a> {
    /// Reads the collection's committed state and prepares a run against it.
    pub fn start(
        store: &'a dyn BlobStore,
        collection: &str,
        mutation: Mutation,
        settings: Settings,
    ) -> Result<Run<'a>, Error> {
        let mut repo = Repo::open(collection, store.load(collection)?)?;
        // a remove never creates a collection
        let is_add = matches!(mutation, Mutation::Add { .. });
        if settings.auto_provision && is_add && !repo.has_keys() {
            info!("{}: no keys yet, provisioning", collection);
            keys::provision(&mut repo)?;
        }
        Ok(Run {
            store,
            repo,
            mutation,
            compression: settings.compression,
            stage: Stage::MutatePending,
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Advances by one stage. On error the run is `Aborted` for good.
    pub fn step(&mut self) -> Result<Stage, Error> {
        let next = match self.stage {
            Stage::MutatePending => self.mutate_and_sign_targets(),
            Stage::TargetsSigned => self.sign_snapshot(),
            Stage::SnapshotSigned => self.sign_timestamp(),
            Stage::TimestampSigned => self.commit(),
            terminal => return Ok(terminal),
        };
        match next {
            Ok(stage) => {
                debug!("{}: {:?} -> {:?}", self.collection(), self.stage, stage);
                self.stage = stage;
                Ok(stage)
            }
            Err(e) => {
                warn!(
                    "{}: aborted at {:?} applying {:?}: {}",
                    self.collection(),
                    self.stage,
                    self.mutation.tag(),
                    e
                );
                self.stage = Stage::Aborted(e.kind());
                Err(e)
            }
        }
    }

    /// Steps until the run is committed or aborted.
    pub fn finish(mut self) -> Result<(), Error> {
        while !self.stage.is_terminal() {
            self.step()?;
        }
        Ok(())
    }

    fn collection(&self) -> &str {
        self.repo.collection()
    }

    fn mutate_and_sign_targets(&mut self) -> Result<Stage, Error> {
        match self.mutation.clone() {
            Mutation::Add { tag, meta } => self.repo.add_target(&tag, meta),
            Mutation::Remove { tag } => {
                if !self.repo.remove_target(&tag) {
                    debug!("{}: {} not present, nothing to do", self.collection(), tag);
                    return self.commit();
                }
            }
        }
        self.repo.sign_targets()?;
        Ok(Stage::TargetsSigned)
    }

    fn sign_snapshot(&mut self) -> Result<Stage, Error> {
        self.repo.snapshot(self.compression)?;
        Ok(Stage::SnapshotSigned)
    }

    fn sign_timestamp(&mut self) -> Result<Stage, Error> {
        self.repo.timestamp()?;
        Ok(Stage::TimestampSigned)
    }

    fn commit(&mut self) -> Result<Stage, Error> {
        let tx = self.repo.take_transaction();
        if !tx.is_empty() {
            self.store.commit(self.repo.collection(), tx)?;
            info!("{}: committed {:?}", self.repo.collection(), self.mutation);
        }
        Ok(Stage::Committed)
    }
}

/// One mutex per collection; different collections never share one.
#[derive(Default)]
struct CollectionLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CollectionLocks {
    fn get(&self, collection: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(collection.to_string()).or_default().clone()
    }

    /// Runs `f` holding the lock of `collection`. The entry is dropped again
    /// once nobody else holds or waits for it.
    fn with<T>(&self, collection: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.get(collection);
        let result = {
            // the mutex guards no data; every run re-reads the store
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // held by the map and by us only
        if Arc::strong_count(&lock) == 2 {
            locks.remove(collection);
        }
        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub struct Pipeline {
    store: Arc<dyn BlobStore>,
    locks: CollectionLocks,
    settings: Settings,
}

impl Pipeline {
    pub fn new(store: Arc<dyn BlobStore>, settings: Settings) -> Pipeline {
        Pipeline {
            store,
            locks: CollectionLocks::default(),
            settings,
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    /// Applies `mutation` and re-signs targets, snapshot and timestamp, or
    /// changes nothing at all.
    pub fn apply(&self, collection: &str, mutation: Mutation) -> Result<(), Error> {
        validate_collection(collection)?;
        mutation.validate()?;
        self.locks.with(collection, || -> Result<(), Error> {
            Run::start(&*self.store, collection, mutation, self.settings)?.finish()
        })
    }

    pub fn add_target(&self, collection: &str, tag: &str, meta: FileMeta) -> Result<(), Error> {
        self.apply(
            collection,
            Mutation::Add {
                tag: tag.to_string(),
                meta,
            },
        )
    }

    /// Removing a tag that is not present succeeds without touching anything.
    pub fn remove_target(&self, collection: &str, tag: &str) -> Result<(), Error> {
        self.apply(
            collection,
            Mutation::Remove {
                tag: tag.to_string(),
            },
        )
    }

    /// Signed bytes of `file_name` exactly as last committed.
    pub fn get_document(&self, collection: &str, file_name: &str) -> Result<Vec<u8>, Error> {
        validate_collection(collection)?;
        let not_found = || Error::NotFound {
            collection: collection.to_string(),
            file: file_name.to_string(),
        };
        let mut metadata = self.store.get_all_metadata(collection)?.ok_or_else(not_found)?;
        metadata.remove(file_name).ok_or_else(not_found)
    }

    /// Makes sure `collection` has a key for every standard role and a root
    /// listing them. Roles that already have keys keep them.
    pub fn provision_keys(&self, collection: &str) -> Result<(), Error> {
        validate_collection(collection)?;
        self.locks.with(collection, || -> Result<(), Error> {
            let mut repo = Repo::open(collection, self.store.load(collection)?)?;
            if !keys::provision(&mut repo)? {
                info!("{}: keys already provisioned", collection);
                return Ok(());
            }
            self.store.commit(collection, repo.take_transaction())?;
            info!("{}: provisioned keys", collection);
            Ok(())
        })
    }
}

static COLLECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:[._/-][a-z0-9]+)*$").unwrap());
static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").unwrap());

pub fn validate_collection(collection: &str) -> Result<(), Error> {
    if collection.len() > 255 || !COLLECTION_RE.is_match(collection) {
        return Err(Error::Validation(format!(
            "invalid collection name {:?}",
            collection
        )));
    }
    Ok(())
}

pub fn validate_tag(tag: &str) -> Result<(), Error> {
    if !TAG_RE.is_match(tag) {
        return Err(Error::Validation(format!("invalid tag {:?}", tag)));
    }
    Ok(())
}
