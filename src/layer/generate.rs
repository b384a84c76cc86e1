use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::io::{self, Write};
use std::path::Path;

use tar::{Builder, EntryType, Header};
use tracing::{debug, warn};

use crate::compress::PipeWriter;
use crate::digest::{Digest, DigestingWriter};
use crate::error::{IoResultExt, Result};
use crate::fs::{read_symlink_target, read_xattrs, FileMetadata, FileType, FsEval};
use crate::idmap::MapOptions;
use crate::layer::{whiteout_path, PAX_XATTR_PREFIX};
use crate::snapshot::{parent_key, rel_for, Snapshot, ROOT_KEY};
use crate::types::{ChangeKind, DiffEntry};

/// write an uncompressed tar layer for `changes` into `writer`
///
/// `new` is the snapshot the changes lead to. the writer is closed when the
/// layer is complete, or closed with the error that stopped it, so the
/// reading side always terminates. returns the digest of the tar stream.
pub fn write_layer(
    mut writer: PipeWriter,
    rootfs: &Path,
    changes: &[DiffEntry],
    new: &Snapshot,
    map: &MapOptions,
    eval: &dyn FsEval,
) -> Result<Digest> {
    match generate(&mut writer, rootfs, changes, new, map, eval) {
        Ok(digest) => {
            writer.close();
            Ok(digest)
        }
        Err(e) => {
            writer.close_with_error(io::Error::other(e.to_string()));
            Err(e)
        }
    }
}

fn generate<W: Write>(
    writer: W,
    rootfs: &Path,
    changes: &[DiffEntry],
    new: &Snapshot,
    map: &MapOptions,
    eval: &dyn FsEval,
) -> Result<Digest> {
    let mut generator = Generator {
        builder: Builder::new(DigestingWriter::new(writer)),
        rootfs,
        map,
        eval,
        hardlinks: HashMap::new(),
        deleted: BTreeSet::new(),
    };

    for change in changes {
        if change.path == ROOT_KEY.as_bytes() {
            continue;
        }
        match change.kind {
            ChangeKind::Deleted => generator.add_whiteout(&change.path, new)?,
            _ => generator.add_path(&change.path)?,
        }
    }

    let digesting = generator.builder.into_inner().with_path(rootfs)?;
    let (_, digest, size) = digesting.finish();
    debug!(digest = %digest, size, entries = changes.len(), "generated layer");
    Ok(digest)
}

struct Generator<'a, W: Write> {
    builder: Builder<DigestingWriter<W>>,
    rootfs: &'a Path,
    map: &'a MapOptions,
    eval: &'a dyn FsEval,
    /// first key archived for each (dev, ino) with more than one link
    hardlinks: HashMap<(u64, u64), Vec<u8>>,
    /// keys already whited out, so their descendants need no marker
    deleted: BTreeSet<Vec<u8>>,
}

impl<W: Write> Generator<'_, W> {
    fn add_whiteout(&mut self, key: &[u8], new: &Snapshot) -> Result<()> {
        if self.covered_by_deletion(key) {
            return Ok(());
        }
        // a parent that became a non-directory replaces everything below it
        if let Some(parent) = parent_key(key) {
            if new.get(parent).is_some_and(|node| !node.is_dir()) {
                return Ok(());
            }
        }
        self.deleted.insert(key.to_vec());

        let path = whiteout_path(&rel_for(key));
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(0);
        header.set_mode(0o644);
        header.set_mtime(0);
        self.builder
            .append_data(&mut header, &path, io::empty())
            .with_path(&path)
    }

    fn covered_by_deletion(&self, key: &[u8]) -> bool {
        let mut cursor = key;
        while let Some(parent) = parent_key(cursor) {
            if self.deleted.contains(parent) {
                return true;
            }
            cursor = parent;
        }
        false
    }

    fn add_path(&mut self, key: &[u8]) -> Result<()> {
        let rel = rel_for(key);
        let path = self.rootfs.join(&rel);
        let meta = FileMetadata::from_path(&path)?;

        let Some(kind) = meta.file_type.entry_type() else {
            warn!(path = %rel.display(), "sockets cannot be archived, skipping");
            return Ok(());
        };

        let mut header = Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(meta.mode);
        header.set_mtime(meta.mtime.sec.max(0) as u64);
        header.set_uid(self.map.container_uid(meta.uid)? as u64);
        header.set_gid(self.map.container_gid(meta.gid)? as u64);
        header.set_size(0);

        let xattrs = read_xattrs(&path)?;
        if !xattrs.is_empty() {
            let records: Vec<(String, &[u8])> = xattrs
                .iter()
                .map(|x| (format!("{}{}", PAX_XATTR_PREFIX, x.name), x.value.as_slice()))
                .collect();
            self.builder
                .append_pax_extensions(records.iter().map(|(k, v)| (k.as_str(), *v)))
                .with_path(&path)?;
        }

        let appended = match meta.file_type {
            FileType::Regular => {
                if meta.has_other_links() {
                    match self.hardlinks.entry((meta.dev, meta.ino)) {
                        Entry::Occupied(first) => {
                            header.set_entry_type(EntryType::Link);
                            return self
                                .builder
                                .append_link(&mut header, &rel, rel_for(first.get()))
                                .with_path(&path);
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(key.to_vec());
                        }
                    }
                }
                header.set_size(meta.size);
                let file = self.eval.open(&path)?;
                self.builder.append_data(&mut header, &rel, file)
            }
            FileType::Symlink => {
                let target = read_symlink_target(&path)?;
                self.builder.append_link(&mut header, &rel, &target)
            }
            FileType::CharDevice | FileType::BlockDevice => {
                let (major, minor) = meta.rdev.unwrap_or((0, 0));
                header.set_device_major(major).with_path(&path)?;
                header.set_device_minor(minor).with_path(&path)?;
                self.builder.append_data(&mut header, &rel, io::empty())
            }
            FileType::Directory | FileType::Fifo | FileType::Socket => {
                self.builder.append_data(&mut header, &rel, io::empty())
            }
        };
        appended.with_path(&path)
    }
}
