use std::path::PathBuf;

use crate::digest::Digest;

/// error type for ocimod operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("image layout not found at {0}")]
    NoLayout(PathBuf),

    #[error("invalid image layout at {path}: {message}")]
    InvalidLayout { path: PathBuf, message: String },

    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    #[error("reference {name} is ambiguous: {count} descriptors match")]
    AmbiguousReference { name: String, count: usize },

    #[error("invalid reference name: {0}")]
    InvalidReference(String),

    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    #[error("corrupt blob {digest}: {message}")]
    CorruptBlob { digest: Digest, message: String },

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("{kind} {id} is not covered by any configured mapping")]
    IdOutOfRange { kind: &'static str, id: u32 },

    #[error("invalid id mapping: {0}")]
    InvalidMapping(String),

    #[error("invalid layer entry {path}: {message}")]
    InvalidEntry { path: PathBuf, message: String },

    #[error("invalid snapshot at line {line}: {message}")]
    InvalidSnapshot { line: usize, message: String },

    #[error("invalid bundle at {path}: {message}")]
    InvalidBundle { path: PathBuf, message: String },

    #[error("cannot create device node without privileges: {0}")]
    DeviceNodePermission(PathBuf),

    #[error("invalid image config: {0}")]
    InvalidImageConfig(String),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("lock contention on image layout")]
    LockContention,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("xattr error on {path}: {message}")]
    Xattr { path: PathBuf, message: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
