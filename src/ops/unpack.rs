use std::fs;
use std::path::Path;

use tracing::info;

use crate::bundle::{meta_path, mtree_path, rootfs_path, BundleMeta};
use crate::cas::{fetch_manifest, resolve_reference, Store};
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{fs_eval_for, FsEval};
use crate::idmap::MapOptions;
use crate::layer::{unpack_rootfs, UnpackOptions};
use crate::snapshot::{walk, Snapshot};
use crate::types::Descriptor;

/// unpack the image tagged `tag` into a runtime bundle at `bundle`
///
/// the filesystem access strategy follows `map_options.rootless`.
pub fn unpack(store: &Store, tag: &str, bundle: &Path, map_options: &MapOptions) -> Result<Descriptor> {
    unpack_with(store, tag, bundle, map_options, fs_eval_for(map_options))
}

/// like [`unpack`], with an explicit filesystem access strategy
pub fn unpack_with(
    store: &Store,
    tag: &str,
    bundle: &Path,
    map_options: &MapOptions,
    eval: &dyn FsEval,
) -> Result<Descriptor> {
    map_options.validate()?;
    let from = resolve_reference(store, tag)?;
    let manifest = fetch_manifest(store, &from)?;

    fs::create_dir_all(bundle).with_path(bundle)?;
    let meta = meta_path(bundle);
    let mtree = mtree_path(bundle, &from.digest);
    for existing in [&meta, &mtree] {
        if fs::symlink_metadata(existing).is_ok() {
            return Err(Error::AlreadyExists(existing.clone()));
        }
    }

    let rootfs = rootfs_path(bundle);
    info!(
        tag,
        digest = %from.digest,
        layers = manifest.layers.len(),
        strategy = eval.name(),
        bundle = %bundle.display(),
        "unpacking image"
    );
    let opts = UnpackOptions {
        map_options,
        fs_eval: eval,
    };
    unpack_rootfs(store, &manifest, &rootfs, &opts)?;

    let snapshot = walk(&rootfs, eval)?;
    snapshot.write_new(&mtree)?;
    BundleMeta::new(from.clone(), map_options.clone()).write_new(bundle)?;

    info!(entries = snapshot.len(), "unpack complete");
    Ok(from)
}

/// snapshot a bundle's rootfs as it is now
pub fn snapshot_bundle(bundle: &Path) -> Result<Snapshot> {
    let meta = BundleMeta::read(bundle)?;
    walk(&rootfs_path(bundle), fs_eval_for(&meta.map_options))
}
