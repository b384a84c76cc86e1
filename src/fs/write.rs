use std::collections::HashSet;
use std::ffi::CString;
use std::fs::{self, File, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::libc;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::eval::FsEval;
use crate::fs::xattr as sysxattr;
use crate::types::Xattr;

/// a seconds + nanoseconds modification time
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: i64,
}

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp { sec: 0, nsec: 0 };

    pub fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    fn to_timespec(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.sec as libc::time_t,
            tv_nsec: self.nsec as _,
        }
    }
}

/// set access and modification time without following symlinks
pub fn set_times(path: &Path, mtime: Timestamp) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "invalid path"),
    })?;
    let times = [mtime.to_timespec(), mtime.to_timespec()];
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret != 0 {
        return Err(Error::Io {
            path: path.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// set permission bits (never call on a symlink, chmod follows them)
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, Permissions::from_mode(mode & 0o7777)).with_path(path)
}

/// replace the xattrs on `path` with exactly `xattrs`
pub fn apply_xattrs(path: &Path, xattrs: &[Xattr], eval: &dyn FsEval) -> Result<()> {
    match sysxattr::clear_all(path, &HashSet::new()) {
        Ok(()) => {}
        // nothing to clear on a filesystem without xattrs
        Err(Error::Io { source, .. }) if sysxattr::is_unsupported(&source) => {}
        Err(e) => return Err(e),
    }
    for xattr in xattrs {
        eval.lsetxattr(path, &xattr.name, &xattr.value)?;
    }
    Ok(())
}

/// remove a path of any type, making directories writable as needed
pub fn remove_all(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    };

    if !meta.is_dir() {
        return fs::remove_file(path).with_path(path);
    }

    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        set_mode(path, mode | 0o700)?;
    }
    for entry in fs::read_dir(path).with_path(path)? {
        let entry = entry.with_path(path)?;
        remove_all(&entry.path())?;
    }
    fs::remove_dir(path).with_path(path)
}

/// keeps a directory writable while its children change, then puts back
/// its original mode and mtime
pub struct ParentGuard {
    path: PathBuf,
    mode: u32,
    mtime: Timestamp,
    relaxed: bool,
}

impl ParentGuard {
    pub fn capture(path: &Path) -> Result<Self> {
        let meta = crate::fs::FileMetadata::from_path(path)?;
        let relaxed = meta.mode & 0o300 != 0o300;
        if relaxed {
            set_mode(path, meta.mode | 0o300)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            mode: meta.mode,
            mtime: meta.mtime,
            relaxed,
        })
    }

    pub fn restore(self) -> Result<()> {
        if self.relaxed {
            set_mode(&self.path, self.mode)?;
        }
        set_times(&self.path, self.mtime)
    }
}

/// sync a directory to disk
pub fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}
