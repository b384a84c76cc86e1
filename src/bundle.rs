//! runtime bundle layout and the metadata recorded when it was unpacked
//!
//! ```text
//! <bundle>/
//!   rootfs/                 the extracted filesystem
//!   umoci.json              BundleMeta
//!   sha256_<hex>.mtree      snapshot taken right after unpacking
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::fsync_dir;
use crate::idmap::MapOptions;
use crate::types::Descriptor;

/// directory holding the extracted filesystem
pub const ROOTFS_NAME: &str = "rootfs";

/// bundle metadata file
pub const META_NAME: &str = "umoci.json";

const MTREE_EXTENSION: &str = "mtree";

/// snapshot file name for the manifest a bundle was unpacked from
pub fn mtree_file_name(digest: &Digest) -> String {
    format!("{}.{}", digest.to_file_stem(), MTREE_EXTENSION)
}

pub fn rootfs_path(bundle: &Path) -> PathBuf {
    bundle.join(ROOTFS_NAME)
}

pub fn meta_path(bundle: &Path) -> PathBuf {
    bundle.join(META_NAME)
}

pub fn mtree_path(bundle: &Path, digest: &Digest) -> PathBuf {
    bundle.join(mtree_file_name(digest))
}

/// what a bundle was unpacked from and how
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMeta {
    /// version of the tool that wrote the bundle
    #[serde(rename = "umoci_version")]
    pub version: String,
    /// manifest the rootfs was extracted from
    #[serde(rename = "from_descriptor")]
    pub from: Descriptor,
    #[serde(rename = "map_options")]
    pub map_options: MapOptions,
}

impl BundleMeta {
    pub fn new(from: Descriptor, map_options: MapOptions) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            from,
            map_options,
        }
    }

    /// read the metadata of the bundle at `bundle`
    pub fn read(bundle: &Path) -> Result<Self> {
        let path = meta_path(bundle);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::InvalidBundle {
                    path: bundle.to_path_buf(),
                    message: format!("missing {}", META_NAME),
                })
            }
            Err(e) => return Err(Error::Io { path, source: e }),
        };
        serde_json::from_slice(&content).map_err(|e| Error::InvalidBundle {
            path: bundle.to_path_buf(),
            message: format!("{}: {}", META_NAME, e),
        })
    }

    /// write the metadata of a fresh bundle; fails if it already exists
    pub fn write_new(&self, bundle: &Path) -> Result<()> {
        let path = meta_path(bundle);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    Error::AlreadyExists(path.clone())
                } else {
                    Error::Io {
                        path: path.clone(),
                        source: e,
                    }
                }
            })?;
        file.write_all(&serde_json::to_vec(self)?).with_path(&path)?;
        file.sync_all().with_path(&path)
    }

    /// atomically replace the metadata of an existing bundle
    pub fn replace(&self, bundle: &Path) -> Result<()> {
        let path = meta_path(bundle);
        let tmp = bundle.join(format!(".{}.tmp", META_NAME));
        {
            let mut file = fs::File::create(&tmp).with_path(&tmp)?;
            file.write_all(&serde_json::to_vec(self)?).with_path(&tmp)?;
            file.sync_all().with_path(&tmp)?;
        }
        fs::rename(&tmp, &path).with_path(&path)?;
        fsync_dir(bundle)
    }
}
