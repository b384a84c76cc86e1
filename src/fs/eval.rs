//! filesystem operations whose behaviour depends on privilege
//!
//! unpack, snapshot and repack take a `&dyn FsEval` instead of calling the
//! privileged syscalls directly. the default strategy performs them as-is;
//! the rootless strategy degrades the ones an unprivileged user cannot do.

use std::ffi::{CString, OsString};
use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::libc;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};

use crate::error::{Error, IoResultExt, Result};
use crate::fs::write::set_mode;
use crate::fs::{FileMetadata, FileType};
use crate::idmap::MapOptions;

/// privilege-sensitive filesystem operations
pub trait FsEval: Send + Sync {
    /// short name for logging
    fn name(&self) -> &'static str;

    fn is_rootless(&self) -> bool;

    /// change ownership without following symlinks
    fn lchown(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;

    /// create a device node or fifo
    fn mknod(&self, path: &Path, kind: FileType, mode: u32, major: u32, minor: u32) -> Result<()>;

    /// set an extended attribute without following symlinks
    fn lsetxattr(&self, path: &Path, name: &str, value: &[u8]) -> Result<()>;

    /// open a regular file for reading
    fn open(&self, path: &Path) -> Result<File>;

    /// names of the entries in a directory, sorted
    fn read_dir(&self, path: &Path) -> Result<Vec<OsString>>;
}

/// performs every operation directly
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultFsEval;

/// emulates what it can for an unprivileged user
///
/// ownership changes are skipped, device nodes are refused, xattrs the
/// kernel will not let us set are dropped, and unreadable files and
/// directories are temporarily made readable.
#[derive(Clone, Copy, Debug, Default)]
pub struct RootlessFsEval;

/// strategy matching the options a bundle was unpacked with
pub fn fs_eval_for(options: &MapOptions) -> &'static dyn FsEval {
    if options.rootless {
        &RootlessFsEval
    } else {
        &DefaultFsEval
    }
}

impl FsEval for DefaultFsEval {
    fn name(&self) -> &'static str {
        "default"
    }

    fn is_rootless(&self) -> bool {
        false
    }

    fn lchown(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Io {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "invalid path"),
        })?;
        let ret = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
        if ret != 0 {
            return Err(Error::Io {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn mknod(&self, path: &Path, kind: FileType, mode: u32, major: u32, minor: u32) -> Result<()> {
        let sflag = match kind {
            FileType::BlockDevice => SFlag::S_IFBLK,
            FileType::CharDevice => SFlag::S_IFCHR,
            FileType::Fifo => SFlag::S_IFIFO,
            other => {
                return Err(Error::InvalidEntry {
                    path: path.to_path_buf(),
                    message: format!("mknod cannot create {:?}", other),
                })
            }
        };
        let dev = makedev(major as u64, minor as u64);

        mknod(path, sflag, Mode::from_bits_truncate(mode), dev).map_err(|e| {
            if e == nix::errno::Errno::EPERM {
                Error::DeviceNodePermission(path.to_path_buf())
            } else {
                Error::Io {
                    path: path.to_path_buf(),
                    source: io::Error::from(e),
                }
            }
        })
    }

    fn lsetxattr(&self, path: &Path, name: &str, value: &[u8]) -> Result<()> {
        xattr::set(path, name, value).map_err(|e| Error::Xattr {
            path: path.to_path_buf(),
            message: format!("failed to set {}: {}", name, e),
        })
    }

    fn open(&self, path: &Path) -> Result<File> {
        File::open(path).with_path(path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<OsString>> {
        list_dir(path)
    }
}

impl FsEval for RootlessFsEval {
    fn name(&self) -> &'static str {
        "rootless"
    }

    fn is_rootless(&self) -> bool {
        true
    }

    fn lchown(&self, _path: &Path, _uid: u32, _gid: u32) -> Result<()> {
        // everything we create is owned by us already
        Ok(())
    }

    fn mknod(&self, path: &Path, kind: FileType, mode: u32, major: u32, minor: u32) -> Result<()> {
        match kind {
            FileType::Fifo => DefaultFsEval.mknod(path, kind, mode, major, minor),
            _ => Err(Error::DeviceNodePermission(path.to_path_buf())),
        }
    }

    fn lsetxattr(&self, path: &Path, name: &str, value: &[u8]) -> Result<()> {
        match xattr::set(path, name, value) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                tracing::warn!(path = %path.display(), xattr = %name, "rootless: ignoring xattr we may not set");
                Ok(())
            }
            Err(e) => Err(Error::Xattr {
                path: path.to_path_buf(),
                message: format!("failed to set {}: {}", name, e),
            }),
        }
    }

    fn open(&self, path: &Path) -> Result<File> {
        match File::open(path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                with_relaxed_mode(path, 0o400, || File::open(path).with_path(path))
            }
            Err(e) => Err(Error::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<OsString>> {
        match list_dir(path) {
            Ok(names) => Ok(names),
            Err(Error::Io { source, .. }) if source.kind() == io::ErrorKind::PermissionDenied => {
                with_relaxed_mode(path, 0o500, || list_dir(path))
            }
            Err(e) => Err(e),
        }
    }
}

/// run `f` with `extra` owner bits added to `path`, then put the mode back
fn with_relaxed_mode<T>(path: &Path, extra: u32, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let meta = FileMetadata::from_path(path)?;
    set_mode(path, meta.mode | extra)?;
    let result = f();
    set_mode(path, meta.mode)?;
    result
}

fn list_dir(path: &Path) -> Result<Vec<OsString>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(path).with_path(path)? {
        names.push(entry.with_path(path)?.file_name());
    }
    names.sort();
    Ok(names)
}
