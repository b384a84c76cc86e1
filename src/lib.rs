//! ocimod - OCI image unpack and repack
//!
//! unpacks images stored in an OCI image layout into runtime bundles and
//! turns the changes made to a bundle's rootfs back into new image layers.
//!
//! # Core concepts
//!
//! - **Store**: an OCI image layout directory; blobs are addressed by sha256
//!   digest and tags live in `index.json`
//! - **Layer**: a tar changeset, optionally gzip or zstd compressed, with
//!   `.wh.` whiteouts marking deletions
//! - **Bundle**: a directory holding the extracted `rootfs/`, the metadata it
//!   was unpacked with (`umoci.json`) and a snapshot of the rootfs taken right
//!   after unpacking (`sha256_<hex>.mtree`)
//! - **Snapshot**: a path-ordered record of every file's metadata and content
//!   digest; diffing two snapshots yields the changes a new layer carries
//!
//! # Id mapping
//!
//! container ids are translated to host ids on unpack and back on repack.
//! an empty mapping list is the identity; an id outside every configured
//! range is an error.
//!
//! # Example usage
//!
//! ```no_run
//! use ocimod::cas::Store;
//! use ocimod::idmap::MapOptions;
//! use ocimod::ops::{self, RepackOptions};
//! use std::path::Path;
//!
//! let store = Store::open(Path::new("/srv/images/base")).unwrap();
//!
//! // unpack without privileges, container root mapped to the current user
//! let options = MapOptions::rootless(vec![], vec![]);
//! ops::unpack(&store, "latest", Path::new("/tmp/bundle"), &options).unwrap();
//!
//! // ...edit /tmp/bundle/rootfs...
//!
//! ops::repack(&store, Path::new("/tmp/bundle"), "edited", &RepackOptions::default()).unwrap();
//! ```

mod config;
mod error;

pub mod bundle;
pub mod cas;
pub mod compress;
pub mod digest;
pub mod fs;
pub mod idmap;
pub mod layer;
pub mod ops;
pub mod snapshot;
pub mod types;

#[cfg(test)]
mod testutil;

pub use bundle::BundleMeta;
pub use config::{CompressionConfig, Config, DEFAULT_TAG};
pub use digest::Digest;
pub use error::{Error, Result};
pub use types::{ChangeKind, Descriptor, DiffEntry, Manifest, Xattr};
