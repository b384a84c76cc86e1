use std::collections::HashSet;
use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use crate::cas::{blob_exists, read_blob, read_index, Store};
use crate::digest::Digest;
use crate::error::{Error, IoResultExt, Result};
use crate::types::{media_type, Descriptor, Index, Manifest};

/// gc statistics
#[derive(Debug, Default)]
pub struct GcStats {
    pub blobs_removed: usize,
    pub temp_files_removed: usize,
    pub bytes_freed: u64,
}

/// remove blobs no tag can reach, and leftover temporary files
pub fn gc(store: &Store, dry_run: bool) -> Result<GcStats> {
    let _lock = store.lock()?;

    // mark phase: everything reachable from the index
    let mut reachable = HashSet::new();
    for desc in read_index(store)?.manifests {
        mark(store, &desc, &mut reachable)?;
    }

    // sweep phase
    let mut stats = GcStats::default();
    sweep_blobs(&store.blobs_path(), &reachable, dry_run, &mut stats)?;
    sweep_temp(&store.tmp_path(), dry_run, &mut stats)?;

    tracing::info!(
        blobs = stats.blobs_removed,
        temp_files = stats.temp_files_removed,
        bytes = stats.bytes_freed,
        dry_run,
        "garbage collected"
    );
    Ok(stats)
}

/// mark a descriptor and, for manifests and indexes, everything below it
fn mark(store: &Store, desc: &Descriptor, reachable: &mut HashSet<Digest>) -> Result<()> {
    // avoid re-processing
    if !reachable.insert(desc.digest) {
        return Ok(());
    }
    // a dangling reference keeps nothing else alive
    if !blob_exists(store, &desc.digest) {
        tracing::warn!(digest = %desc.digest, "referenced blob is missing");
        return Ok(());
    }

    if media_type::is_manifest(&desc.media_type) {
        let manifest: Manifest = serde_json::from_slice(&read_blob(store, desc)?)?;
        reachable.insert(manifest.config.digest);
        for layer in &manifest.layers {
            reachable.insert(layer.digest);
        }
    } else if media_type::is_index(&desc.media_type) {
        let index: Index = serde_json::from_slice(&read_blob(store, desc)?)?;
        for child in &index.manifests {
            mark(store, child, reachable)?;
        }
    }
    Ok(())
}

fn sweep_blobs(dir: &Path, reachable: &HashSet<Digest>, dry_run: bool, stats: &mut GcStats) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| walk_error(dir, e))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        // files that are not blobs are left alone
        let Ok(digest) = Digest::from_hex(name) else {
            continue;
        };
        if reachable.contains(&digest) {
            continue;
        }

        let meta = fs::metadata(path).with_path(path)?;
        stats.bytes_freed += meta.len();
        stats.blobs_removed += 1;
        tracing::debug!(digest = %digest, dry_run, "unreachable blob");
        if !dry_run {
            fs::remove_file(path).with_path(path)?;
        }
    }
    Ok(())
}

fn sweep_temp(dir: &Path, dry_run: bool, stats: &mut GcStats) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| walk_error(dir, e))?;
        let path = entry.path();
        if entry.file_type().is_file() {
            stats.bytes_freed += fs::metadata(path).with_path(path)?.len();
        }
        stats.temp_files_removed += 1;
        if !dry_run {
            crate::fs::remove_all(path)?;
        }
    }
    Ok(())
}

fn walk_error(dir: &Path, e: walkdir::Error) -> Error {
    Error::Io {
        path: e.path().unwrap_or(dir).to_path_buf(),
        source: e
            .into_io_error()
            .unwrap_or_else(|| std::io::Error::other("walkdir error")),
    }
}
