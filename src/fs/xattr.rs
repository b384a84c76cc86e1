//! extended attribute access that tolerates concurrent modification
//!
//! the list and get calls are two-step (query size, then fetch). another
//! process may grow the attribute set between the two syscalls, in which case
//! the kernel answers ERANGE and the whole sequence starts over.
//!
//! none of these functions follow symlinks.

use std::collections::HashSet;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::libc;

use crate::error::{Error, IoResultExt, Result};

/// names of all extended attributes on `path`
pub fn list_names(path: &Path) -> Result<Vec<String>> {
    let c_path = c_path(path)?;
    let buffer = fetch_sized(|buf| {
        let ret = unsafe { libc::llistxattr(c_path.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        syscall_len(ret)
    })
    .with_path(path)?;
    Ok(split_names(&buffer))
}

/// value of a single extended attribute
pub fn get_value(path: &Path, name: &str) -> Result<Vec<u8>> {
    let c_path = c_path(path)?;
    let c_name = c_name(path, name)?;
    fetch_sized(|buf| {
        let ret = unsafe {
            libc::lgetxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        syscall_len(ret)
    })
    .with_path(path)
}

/// set a single extended attribute
pub fn set_value(path: &Path, name: &str, value: &[u8]) -> Result<()> {
    xattr::set(path, name, value).with_path(path)
}

/// remove every extended attribute not named in `except`
///
/// permission errors are skipped: they come from security labels the caller
/// is not allowed to drop. anything else aborts.
pub fn clear_all(path: &Path, except: &HashSet<String>) -> Result<()> {
    for name in list_names(path)? {
        if except.contains(&name) {
            continue;
        }
        if let Err(e) = xattr::remove(path, &name) {
            if e.kind() == io::ErrorKind::PermissionDenied {
                tracing::debug!(path = %path.display(), xattr = %name, "leaving xattr we may not remove");
                continue;
            }
            return Err(Error::Xattr {
                path: path.to_path_buf(),
                message: format!("failed to remove {}: {}", name, e),
            });
        }
    }
    Ok(())
}

/// true for errors meaning the filesystem has no xattr support at all
pub fn is_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOTSUP) | Some(libc::EOPNOTSUPP) | Some(libc::ENODATA)
    )
}

/// size query followed by fetch, restarted while the kernel reports ERANGE
///
/// `query` is called with an empty buffer to learn the size, then with a
/// buffer of that size. it returns the number of bytes the kernel reported.
fn fetch_sized<F>(mut query: F) -> io::Result<Vec<u8>>
where
    F: FnMut(&mut [u8]) -> io::Result<usize>,
{
    loop {
        let mut empty: [u8; 0] = [];
        let size = query(&mut empty)?;
        let mut buffer = vec![0u8; size];
        if size == 0 {
            return Ok(buffer);
        }

        match query(&mut buffer) {
            Ok(n) => {
                // the set may also have shrunk in between
                buffer.truncate(n);
                return Ok(buffer);
            }
            Err(e) if e.raw_os_error() == Some(libc::ERANGE) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// split a NUL separated name list, dropping empty names
fn split_names(buffer: &[u8]) -> Vec<String> {
    buffer
        .split(|b| *b == 0)
        .filter(|name| !name.is_empty())
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .collect()
}

fn syscall_len(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"),
    })
}

fn c_name(path: &Path, name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::Xattr {
        path: path.to_path_buf(),
        message: format!("attribute name {:?} contains a NUL byte", name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fs;
    use tempfile::tempdir;

    /// user xattrs are not available on every test filesystem
    fn supports_user_xattrs(path: &Path) -> bool {
        xattr::set(path, "user.probe", b"1").is_ok() && xattr::remove(path, "user.probe").is_ok()
    }

    #[test]
    fn test_fetch_sized_retries_on_erange() {
        let attempts = Cell::new(0);
        let result = fetch_sized(|buf| {
            attempts.set(attempts.get() + 1);
            match attempts.get() {
                // first round: size 3, then someone grows the list
                1 => Ok(3),
                2 => Err(io::Error::from_raw_os_error(libc::ERANGE)),
                // second round succeeds with the new size
                3 => Ok(6),
                _ => {
                    buf.copy_from_slice(b"a\0bcd\0");
                    Ok(6)
                }
            }
        })
        .unwrap();
        assert_eq!(attempts.get(), 4);
        assert_eq!(split_names(&result), vec!["a", "bcd"]);
    }

    #[test]
    fn test_fetch_sized_surfaces_other_errors() {
        let err = fetch_sized(|buf| {
            if buf.is_empty() {
                Ok(4)
            } else {
                Err(io::Error::from_raw_os_error(libc::EIO))
            }
        })
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
    }

    #[test]
    fn test_fetch_sized_handles_shrink() {
        let result = fetch_sized(|buf| {
            if buf.is_empty() {
                Ok(8)
            } else {
                buf[..2].copy_from_slice(b"x\0");
                Ok(2)
            }
        })
        .unwrap();
        assert_eq!(result, b"x\0");
    }

    #[test]
    fn test_split_names_skips_empty() {
        assert_eq!(split_names(b"\0user.a\0\0user.b\0"), vec!["user.a", "user.b"]);
        assert!(split_names(b"").is_empty());
    }

    #[test]
    fn test_list_get_clear() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, "content").unwrap();
        if !supports_user_xattrs(&path) {
            return;
        }

        set_value(&path, "user.one", b"1").unwrap();
        set_value(&path, "user.two", b"").unwrap();
        set_value(&path, "user.keep", b"kept").unwrap();

        let mut names = list_names(&path).unwrap();
        names.sort();
        assert_eq!(names, vec!["user.keep", "user.one", "user.two"]);
        assert_eq!(get_value(&path, "user.one").unwrap(), b"1");
        assert!(get_value(&path, "user.two").unwrap().is_empty());

        let except: HashSet<String> = ["user.keep".to_string()].into_iter().collect();
        clear_all(&path, &except).unwrap();
        assert_eq!(list_names(&path).unwrap(), vec!["user.keep"]);

        clear_all(&path, &HashSet::new()).unwrap();
        assert!(list_names(&path).unwrap().is_empty());

        // idempotent
        clear_all(&path, &HashSet::new()).unwrap();
    }

    #[test]
    fn test_get_missing_path() {
        let dir = tempdir().unwrap();
        let result = list_names(&dir.path().join("missing"));
        assert!(matches!(result, Err(Error::Io { .. })));
    }
}
