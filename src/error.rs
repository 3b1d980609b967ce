use crate::metadata::Role;

/// Failures of the underlying blob store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted entry exists but cannot be understood.
    #[error("corrupt store entry for {collection}: {reason}")]
    Corrupt { collection: String, reason: String },
}

/// Everything the pipeline, retrieval path and key provisioning can fail with.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input, rejected before any mutation.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A role key is missing or producing a signature failed.
    #[error("cannot sign {role}: {reason}")]
    Signing { role: Role, reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("key generation failed for {role}: {reason}")]
    KeyGen { role: Role, reason: String },

    #[error("{file} not found for {collection}")]
    NotFound { collection: String, file: String },
}

/// Taxonomy of [`Error`] without the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Signing,
    Store,
    KeyGen,
    NotFound,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Signing { .. } => ErrorKind::Signing,
            Error::Store(_) => ErrorKind::Store,
            Error::KeyGen { .. } => ErrorKind::KeyGen,
            Error::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    pub(crate) fn signing(role: Role, reason: impl Into<String>) -> Error {
        Error::Signing {
            role,
            reason: reason.into(),
        }
    }
}
