use std::fs::{self, Metadata};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::{major, minor};
use tar::EntryType;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::xattr as sysxattr;
use crate::fs::Timestamp;
use crate::types::Xattr;

/// kinds of filesystem entries a rootfs can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileType {
    pub fn of(ft: fs::FileType) -> Self {
        if ft.is_dir() {
            FileType::Directory
        } else if ft.is_symlink() {
            FileType::Symlink
        } else if ft.is_block_device() {
            FileType::BlockDevice
        } else if ft.is_char_device() {
            FileType::CharDevice
        } else if ft.is_fifo() {
            FileType::Fifo
        } else if ft.is_socket() {
            FileType::Socket
        } else {
            FileType::Regular
        }
    }

    /// tar entry type for this kind; sockets have none
    pub fn entry_type(self) -> Option<EntryType> {
        match self {
            FileType::Regular => Some(EntryType::Regular),
            FileType::Directory => Some(EntryType::Directory),
            FileType::Symlink => Some(EntryType::Symlink),
            FileType::BlockDevice => Some(EntryType::Block),
            FileType::CharDevice => Some(EntryType::Char),
            FileType::Fifo => Some(EntryType::Fifo),
            FileType::Socket => None,
        }
    }

    pub fn is_device(self) -> bool {
        matches!(self, FileType::BlockDevice | FileType::CharDevice)
    }
}

/// the lstat fields unpack, snapshot and repack look at
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub file_type: FileType,
    pub uid: u32,
    pub gid: u32,
    /// permission bits, setuid/setgid/sticky included
    pub mode: u32,
    pub size: u64,
    pub mtime: Timestamp,
    /// (major, minor) of block and character devices
    pub rdev: Option<(u32, u32)>,
    pub ino: u64,
    pub dev: u64,
    pub nlink: u64,
}

impl FileMetadata {
    /// lstat `path`
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path).with_path(path)?;
        Ok(Self::from_metadata(&meta))
    }

    pub fn from_metadata(meta: &Metadata) -> Self {
        let file_type = FileType::of(meta.file_type());
        let rdev = file_type
            .is_device()
            .then(|| (major(meta.rdev()) as u32, minor(meta.rdev()) as u32));

        Self {
            file_type,
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode() & 0o7777,
            size: meta.len(),
            mtime: Timestamp::new(meta.mtime(), meta.mtime_nsec()),
            rdev,
            ino: meta.ino(),
            dev: meta.dev(),
            nlink: meta.nlink(),
        }
    }

    /// a regular file reachable under more than one name
    pub fn has_other_links(&self) -> bool {
        self.file_type == FileType::Regular && self.nlink > 1
    }
}

/// extended attributes of `path`, without following symlinks, by name
///
/// a filesystem without xattr support has none.
pub fn read_xattrs(path: &Path) -> Result<Vec<Xattr>> {
    let names = match sysxattr::list_names(path) {
        Ok(names) => names,
        Err(Error::Io { source, .. }) if sysxattr::is_unsupported(&source) => return Ok(vec![]),
        Err(e) => return Err(e),
    };

    let mut xattrs = Vec::with_capacity(names.len());
    for name in names {
        match sysxattr::get_value(path, &name) {
            Ok(value) => xattrs.push(Xattr::new(name, value)),
            // removed between list and get
            Err(Error::Io { source, .. }) if source.raw_os_error() == Some(nix::libc::ENODATA) => {}
            Err(e) => return Err(e),
        }
    }

    xattrs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(xattrs)
}

/// target of the symlink at `path`, byte for byte
pub fn read_symlink_target(path: &Path) -> Result<PathBuf> {
    fs::read_link(path).with_path(path)
}
