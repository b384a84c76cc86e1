use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{symlink, OpenOptionsExt};
use std::path::{Path, PathBuf};

use tar::{Archive, Entry, EntryType};
use tracing::{debug, info, warn};

use crate::cas::{blob_path, fetch_blob, Store};
use crate::compress::Compression;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{
    apply_xattrs, clean, remove_all, resolve_in_root, set_mode, set_times, FileType, FsEval,
    ParentGuard, Timestamp,
};
use crate::idmap::MapOptions;
use crate::layer::{whiteout, Whiteout, PAX_XATTR_PREFIX};
use crate::types::{Manifest, Xattr};

/// how layer entries are written to disk
pub struct UnpackOptions<'a> {
    pub map_options: &'a MapOptions,
    pub fs_eval: &'a dyn FsEval,
}

/// extract every layer of `manifest`, in order, into `rootfs`
///
/// `rootfs` must be absent or empty. its own mode is 0755 and its mtime the
/// epoch unless a layer carries an entry for the root.
pub fn unpack_rootfs(
    store: &Store,
    manifest: &Manifest,
    rootfs: &Path,
    opts: &UnpackOptions<'_>,
) -> Result<()> {
    prepare_rootfs(rootfs)?;

    for (idx, layer) in manifest.layers.iter().enumerate() {
        info!(layer = idx, digest = %layer.digest, media_type = %layer.media_type, "unpacking layer");
        let compression = Compression::from_media_type(&layer.media_type)?;
        let blob = fetch_blob(store, layer)?;
        let layer_path = blob_path(store, &layer.digest);
        let mut reader = compression.decompress(blob).with_path(&layer_path)?;
        apply_layer(&mut reader, rootfs, opts).inspect_err(|e| {
            warn!(layer = idx, digest = %layer.digest, error = %e, "layer extraction failed");
        })?;
        // the blob is only verified once read to its end
        io::copy(&mut reader, &mut io::sink()).with_path(&layer_path)?;
    }

    Ok(())
}

fn prepare_rootfs(rootfs: &Path) -> Result<()> {
    match fs::read_dir(rootfs) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(Error::AlreadyExists(rootfs.to_path_buf()));
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(rootfs).with_path(rootfs)?;
        }
        Err(e) => {
            return Err(Error::Io {
                path: rootfs.to_path_buf(),
                source: e,
            })
        }
    }
    set_mode(rootfs, 0o755)?;
    set_times(rootfs, Timestamp::EPOCH)
}

/// apply one uncompressed tar layer on top of `rootfs`
pub fn apply_layer<R: Read>(reader: R, rootfs: &Path, opts: &UnpackOptions<'_>) -> Result<()> {
    let mut archive = Archive::new(reader);
    let mut extractor = Extractor::new(rootfs, opts);

    for entry in archive.entries().with_path(rootfs)? {
        let mut entry = entry.with_path(rootfs)?;
        extractor.apply(&mut entry)?;
    }

    extractor.finish()
}

/// header fields of one entry, read before its content
struct EntryHeader {
    kind: EntryType,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: Timestamp,
    link_name: Option<PathBuf>,
    device: (u32, u32),
    xattrs: Vec<Xattr>,
}

/// directory metadata held back until the layer is complete
struct DeferredDir {
    path: PathBuf,
    mode: u32,
    mtime: Timestamp,
}

struct Extractor<'a> {
    root: &'a Path,
    opts: &'a UnpackOptions<'a>,
    /// root-relative paths this layer has written
    touched: HashSet<PathBuf>,
    deferred: Vec<DeferredDir>,
}

impl<'a> Extractor<'a> {
    fn new(root: &'a Path, opts: &'a UnpackOptions<'a>) -> Self {
        Self {
            root,
            opts,
            touched: HashSet::new(),
            deferred: Vec::new(),
        }
    }

    fn apply<R: Read>(&mut self, entry: &mut Entry<'_, R>) -> Result<()> {
        let raw = entry.path().with_path(self.root)?.into_owned();
        let rel = clean(&raw);

        match whiteout(&rel)? {
            Some(Whiteout::Opaque(dir)) => return self.apply_opaque(&dir),
            Some(Whiteout::Path(target)) => return self.apply_whiteout(&target),
            None => {}
        }

        let header = read_header(entry, &raw)?;
        match header.kind {
            // global pax headers carry nothing we apply
            EntryType::XGlobalHeader => return Ok(()),
            EntryType::GNUSparse => {
                return Err(Error::InvalidEntry {
                    path: raw,
                    message: "sparse entries are not supported".to_string(),
                })
            }
            _ => {}
        }

        if rel.as_os_str().is_empty() {
            return self.apply_root(&header, &raw);
        }

        let parent_rel = rel.parent().unwrap_or(Path::new(""));
        let parent = resolve_in_root(self.root, parent_rel, true)?;
        self.ensure_dir(&parent)?;

        let name = rel.file_name().ok_or_else(|| Error::InvalidEntry {
            path: raw.clone(),
            message: "entry has no file name".to_string(),
        })?;
        let path = parent.join(name);

        let guard = ParentGuard::capture(&parent)?;
        let result = self.write_entry(&path, &header, entry, &raw);
        guard.restore()?;
        result?;

        self.touch(&rel);
        Ok(())
    }

    /// record `rel` and every directory above it as written by this layer
    fn touch(&mut self, rel: &Path) {
        for path in rel.ancestors() {
            if path.as_os_str().is_empty() || !self.touched.insert(path.to_path_buf()) {
                break;
            }
        }
    }

    fn write_entry<R: Read>(
        &mut self,
        path: &Path,
        header: &EntryHeader,
        content: &mut R,
        raw: &Path,
    ) -> Result<()> {
        let existing = match fs::symlink_metadata(path) {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(Error::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let merge_dir = header.kind == EntryType::Directory
            && existing.as_ref().is_some_and(|m| m.is_dir());
        if existing.is_some() && !merge_dir {
            remove_all(path)?;
        }

        match header.kind {
            EntryType::Regular | EntryType::Continuous => {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(path)
                    .with_path(path)?;
                io::copy(content, &mut file).with_path(path)?;
            }
            EntryType::Directory => {
                if !merge_dir {
                    fs::create_dir(path).with_path(path)?;
                }
            }
            EntryType::Symlink => {
                let target = header.link_name.as_ref().ok_or_else(|| missing_link(raw))?;
                symlink(target, path).with_path(path)?;
            }
            EntryType::Link => {
                let target = header.link_name.as_ref().ok_or_else(|| missing_link(raw))?;
                let source = resolve_in_root(self.root, &clean(target), false)?;
                fs::hard_link(&source, path).with_path(path)?;
                // a hardlink shares the target's inode and metadata
                return Ok(());
            }
            EntryType::Char | EntryType::Block | EntryType::Fifo => {
                let kind = match header.kind {
                    EntryType::Char => FileType::CharDevice,
                    EntryType::Block => FileType::BlockDevice,
                    _ => FileType::Fifo,
                };
                let (major, minor) = header.device;
                match self.opts.fs_eval.mknod(path, kind, header.mode, major, minor) {
                    Ok(()) => {}
                    Err(Error::DeviceNodePermission(_)) => {
                        warn!(path = %raw.display(), "skipping device node we may not create");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            other => {
                return Err(Error::InvalidEntry {
                    path: raw.to_path_buf(),
                    message: format!("unsupported entry type {:?}", other),
                })
            }
        }

        self.apply_metadata(path, header)
    }

    /// ownership, xattrs, then mode and times (deferred for directories)
    fn apply_metadata(&mut self, path: &Path, header: &EntryHeader) -> Result<()> {
        let uid = self.opts.map_options.host_uid(header.uid)?;
        let gid = self.opts.map_options.host_gid(header.gid)?;
        self.opts.fs_eval.lchown(path, uid, gid)?;
        apply_xattrs(path, &header.xattrs, self.opts.fs_eval)?;

        match header.kind {
            EntryType::Directory => self.deferred.push(DeferredDir {
                path: path.to_path_buf(),
                mode: header.mode,
                mtime: header.mtime,
            }),
            EntryType::Symlink => set_times(path, header.mtime)?,
            _ => {
                set_mode(path, header.mode)?;
                set_times(path, header.mtime)?;
            }
        }
        Ok(())
    }

    fn apply_root(&mut self, header: &EntryHeader, raw: &Path) -> Result<()> {
        if header.kind != EntryType::Directory {
            return Err(Error::InvalidEntry {
                path: raw.to_path_buf(),
                message: "the root entry must be a directory".to_string(),
            });
        }
        let root = self.root.to_path_buf();
        self.apply_metadata(&root, header)
    }

    /// create missing directories leading to `dir`
    ///
    /// implicit directories get mode 0755 and an epoch mtime, and the
    /// nearest existing ancestor keeps its own mtime.
    fn ensure_dir(&mut self, dir: &Path) -> Result<()> {
        if dir.is_dir() {
            return Ok(());
        }

        let mut missing = Vec::new();
        let mut cursor = dir;
        while fs::symlink_metadata(cursor).is_err() {
            missing.push(cursor.to_path_buf());
            cursor = match cursor.parent() {
                Some(parent) => parent,
                None => break,
            };
        }

        let guard = ParentGuard::capture(cursor)?;
        for path in missing.iter().rev() {
            debug!(path = %path.display(), "creating implicit directory");
            fs::create_dir(path).with_path(path)?;
            set_mode(path, 0o755)?;
        }
        for path in &missing {
            set_times(path, Timestamp::EPOCH)?;
        }
        guard.restore()
    }

    fn apply_whiteout(&mut self, target: &Path) -> Result<()> {
        let parent_rel = target.parent().unwrap_or(Path::new(""));
        let parent = resolve_in_root(self.root, parent_rel, true)?;
        let Some(name) = target.file_name() else {
            return Ok(());
        };
        let path = parent.join(name);
        if fs::symlink_metadata(&path).is_err() {
            return Ok(());
        }

        debug!(path = %target.display(), "whiteout");
        let guard = ParentGuard::capture(&parent)?;
        let result = remove_all(&path);
        guard.restore()?;
        result
    }

    fn apply_opaque(&mut self, dir_rel: &Path) -> Result<()> {
        let dir = resolve_in_root(self.root, dir_rel, true)?;
        if !dir.is_dir() {
            return Ok(());
        }

        debug!(path = %dir_rel.display(), "opaque whiteout");
        let guard = ParentGuard::capture(&dir)?;
        let result = self.clear_untouched(&dir, dir_rel);
        guard.restore()?;
        result
    }

    /// remove everything under `dir` this layer has not written
    fn clear_untouched(&self, dir: &Path, dir_rel: &Path) -> Result<()> {
        for name in self.opts.fs_eval.read_dir(dir)? {
            let child = dir.join(&name);
            let child_rel = dir_rel.join(&name);
            if !self.touched.contains(&child_rel) {
                remove_all(&child)?;
                continue;
            }
            let is_dir = fs::symlink_metadata(&child).with_path(&child)?.is_dir();
            if is_dir {
                let guard = ParentGuard::capture(&child)?;
                let result = self.clear_untouched(&child, &child_rel);
                guard.restore()?;
                result?;
            }
        }
        Ok(())
    }

    /// apply held back directory metadata, deepest entries first
    fn finish(self) -> Result<()> {
        for dir in self.deferred.iter().rev() {
            set_mode(&dir.path, dir.mode)?;
            set_times(&dir.path, dir.mtime)?;
        }
        Ok(())
    }
}

fn read_header<R: Read>(entry: &mut Entry<'_, R>, raw: &Path) -> Result<EntryHeader> {
    let invalid = |message: String| Error::InvalidEntry {
        path: raw.to_path_buf(),
        message,
    };

    let mut xattrs = Vec::new();
    let mut pax_mtime = None;
    if let Some(extensions) = entry.pax_extensions().map_err(|e| invalid(e.to_string()))? {
        for extension in extensions {
            let extension = extension.map_err(|e| invalid(e.to_string()))?;
            let key = extension
                .key()
                .map_err(|_| invalid("pax key is not utf-8".to_string()))?;
            if let Some(name) = key.strip_prefix(PAX_XATTR_PREFIX) {
                xattrs.push(Xattr::new(name, extension.value_bytes()));
            } else if key == "mtime" {
                pax_mtime = extension.value().ok().and_then(parse_pax_time);
            }
        }
    }

    let header = entry.header();
    let malformed = |e: io::Error| invalid(e.to_string());
    let uid = u32::try_from(header.uid().map_err(malformed)?)
        .map_err(|_| invalid("uid does not fit 32 bits".to_string()))?;
    let gid = u32::try_from(header.gid().map_err(malformed)?)
        .map_err(|_| invalid("gid does not fit 32 bits".to_string()))?;
    let mtime = match pax_mtime {
        Some(mtime) => mtime,
        None => Timestamp::new(header.mtime().map_err(malformed)? as i64, 0),
    };
    let kind = header.entry_type();
    // only device entries fill in the device fields
    let device = match kind {
        EntryType::Char | EntryType::Block => (
            header.device_major().map_err(malformed)?.unwrap_or(0),
            header.device_minor().map_err(malformed)?.unwrap_or(0),
        ),
        _ => (0, 0),
    };
    let mode = header.mode().map_err(malformed)? & 0o7777;
    let link_name = entry.link_name().map_err(malformed)?.map(|l| l.into_owned());

    Ok(EntryHeader {
        kind,
        mode,
        uid,
        gid,
        mtime,
        link_name,
        device,
        xattrs,
    })
}

/// parse a pax `mtime` record, `<seconds>[.<fraction>]`
fn parse_pax_time(value: &str) -> Option<Timestamp> {
    let (sec, frac) = match value.split_once('.') {
        Some((sec, frac)) => (sec, frac),
        None => (value, ""),
    };
    let sec: i64 = sec.parse().ok()?;
    let mut digits: String = frac.chars().take(9).collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    while digits.len() < 9 {
        digits.push('0');
    }
    let nsec: i64 = digits.parse().ok()?;
    Some(Timestamp::new(sec, if sec < 0 { -nsec } else { nsec }))
}

fn missing_link(raw: &Path) -> Error {
    Error::InvalidEntry {
        path: raw.to_path_buf(),
        message: "link entry without a target".to_string(),
    }
}
