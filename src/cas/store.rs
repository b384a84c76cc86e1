use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};

use crate::digest::ALGORITHM;
use crate::error::{Error, IoResultExt, Result};
use crate::types::Index;

/// layout version written to and accepted from `oci-layout`
pub const LAYOUT_VERSION: &str = "1.0.0";

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";
const TMP_DIR: &str = ".tmp";
const LOCK_FILE: &str = ".lock";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutMarker {
    image_layout_version: String,
}

/// an opened OCI image layout directory
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// create a new, empty image layout at the given path
    pub fn create(path: &Path) -> Result<Self> {
        let layout_path = path.join(LAYOUT_FILE);
        if layout_path.exists() {
            return Err(Error::AlreadyExists(path.to_path_buf()));
        }

        let store = Self {
            path: path.to_path_buf(),
        };
        fs::create_dir_all(store.blobs_path()).with_path(path)?;
        fs::create_dir_all(store.tmp_path()).with_path(path)?;

        let marker = LayoutMarker {
            image_layout_version: LAYOUT_VERSION.to_string(),
        };
        store.write_atomic(&layout_path, &serde_json::to_vec(&marker)?)?;
        store.write_atomic(&store.index_path(), &serde_json::to_vec_pretty(&Index::new())?)?;

        tracing::info!(path = %path.display(), "created image layout");
        Ok(store)
    }

    /// open an existing image layout, checking its structure
    pub fn open(path: &Path) -> Result<Self> {
        let layout_path = path.join(LAYOUT_FILE);
        let content = match fs::read(&layout_path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NoLayout(path.to_path_buf()))
            }
            Err(e) => {
                return Err(Error::Io {
                    path: layout_path,
                    source: e,
                })
            }
        };

        let invalid = |message: String| Error::InvalidLayout {
            path: path.to_path_buf(),
            message,
        };
        let marker: LayoutMarker = serde_json::from_slice(&content)
            .map_err(|e| invalid(format!("unreadable {}: {}", LAYOUT_FILE, e)))?;
        if marker.image_layout_version != LAYOUT_VERSION {
            return Err(invalid(format!(
                "unsupported layout version {}",
                marker.image_layout_version
            )));
        }

        let store = Self {
            path: path.to_path_buf(),
        };
        if !store.blobs_path().is_dir() {
            return Err(invalid(format!("missing {}/{}", BLOBS_DIR, ALGORITHM)));
        }
        let index = fs::read(store.index_path()).map_err(|e| invalid(format!("{}: {}", INDEX_FILE, e)))?;
        serde_json::from_slice::<Index>(&index)
            .map_err(|e| invalid(format!("unreadable {}: {}", INDEX_FILE, e)))?;

        tracing::debug!(path = %path.display(), "opened image layout");
        Ok(store)
    }

    /// release the store; nothing is held open between calls
    pub fn close(self) {
        tracing::debug!(path = %self.path.display(), "closed image layout");
    }

    /// layout root path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// path to index.json
    pub fn index_path(&self) -> PathBuf {
        self.path.join(INDEX_FILE)
    }

    /// directory holding sha256 blobs
    pub fn blobs_path(&self) -> PathBuf {
        self.path.join(BLOBS_DIR).join(ALGORITHM)
    }

    /// path to tmp directory (for atomic writes)
    pub fn tmp_path(&self) -> PathBuf {
        self.path.join(TMP_DIR)
    }

    /// fresh, unused path inside the tmp directory
    pub fn new_tmp_file(&self) -> Result<PathBuf> {
        let tmp = self.tmp_path();
        fs::create_dir_all(&tmp).with_path(&tmp)?;
        Ok(tmp.join(uuid::Uuid::new_v4().to_string()))
    }

    /// path to lock file
    pub fn lock_path(&self) -> PathBuf {
        self.path.join(LOCK_FILE)
    }

    /// acquire exclusive lock on the layout
    /// returns a guard that releases the lock on drop
    pub fn lock(&self) -> Result<StoreLock> {
        let lock_path = self.lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;

        let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|_| Error::LockContention)?;

        Ok(StoreLock { flock })
    }

    /// atomic write: temp -> fsync -> rename -> fsync dir
    pub(crate) fn write_atomic(&self, dest: &Path, content: &[u8]) -> Result<()> {
        let tmp_path = self.new_tmp_file()?;
        {
            let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
            tmp_file.write_all(content).with_path(&tmp_path)?;
            tmp_file.sync_all().with_path(&tmp_path)?;
        }
        self.commit_tmp(&tmp_path, dest)
    }

    /// move a finished temp file into place
    pub(crate) fn commit_tmp(&self, tmp_path: &Path, dest: &Path) -> Result<()> {
        fs::rename(tmp_path, dest).with_path(dest)?;
        if let Some(parent) = dest.parent() {
            crate::fs::fsync_dir(parent)?;
        }
        Ok(())
    }
}

/// guard that holds the layout lock until dropped
pub struct StoreLock {
    #[allow(dead_code)]
    flock: Flock<File>,
}
// lock is released automatically when Flock is dropped
