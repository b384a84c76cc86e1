//! tar layers: applying them to a rootfs and generating them from a diff

mod generate;
mod unpack;

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub use generate::write_layer;
pub use unpack::{apply_layer, unpack_rootfs, UnpackOptions};

/// name prefix marking a deleted path
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// entry name marking a directory whose lower contents are hidden
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// pax record prefix carrying extended attributes
pub(crate) const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";

/// deletion markers found in a layer
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Whiteout {
    /// remove this path
    Path(PathBuf),
    /// remove lower-layer contents of this directory
    Opaque(PathBuf),
}

/// classify a cleaned entry path as a whiteout, if it is one
///
/// a whiteout must hide a real name; `.wh.`, `.wh..` and `.wh...` are
/// rejected rather than read as the parent directory.
pub(crate) fn whiteout(path: &Path) -> Result<Option<Whiteout>> {
    let Some(name) = path.file_name() else {
        return Ok(None);
    };
    let name = name.as_bytes();
    if name == OPAQUE_WHITEOUT.as_bytes() {
        let parent = path.parent().unwrap_or(Path::new(""));
        return Ok(Some(Whiteout::Opaque(parent.to_path_buf())));
    }
    let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX.as_bytes()) else {
        return Ok(None);
    };
    if matches!(hidden, b"" | b"." | b"..") {
        return Err(Error::InvalidEntry {
            path: path.to_path_buf(),
            message: "whiteout names no file".to_string(),
        });
    }
    Ok(Some(Whiteout::Path(path.with_file_name(OsStr::from_bytes(hidden)))))
}

/// archive path of the whiteout hiding `rel`
pub(crate) fn whiteout_path(rel: &Path) -> PathBuf {
    let mut name = WHITEOUT_PREFIX.as_bytes().to_vec();
    name.extend_from_slice(rel.file_name().unwrap_or_default().as_bytes());
    rel.with_file_name(OsStr::from_bytes(&name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whiteout_recognition() {
        let classify = |p: &str| whiteout(Path::new(p)).unwrap();
        assert_eq!(classify("etc/passwd"), None);
        assert_eq!(classify(""), None);
        assert_eq!(classify(".wh.foo"), Some(Whiteout::Path(PathBuf::from("foo"))));
        assert_eq!(
            classify("dir/.wh.foo"),
            Some(Whiteout::Path(PathBuf::from("dir/foo")))
        );
        assert_eq!(
            classify("dir1/dir2/.wh..wh..opq"),
            Some(Whiteout::Opaque(PathBuf::from("dir1/dir2")))
        );
        assert_eq!(classify(".wh..wh..opq"), Some(Whiteout::Opaque(PathBuf::new())));
        assert_eq!(classify("d/.wh..hidden"), Some(Whiteout::Path(PathBuf::from("d/.hidden"))));
    }

    #[test]
    fn test_whiteout_without_name_is_rejected() {
        for path in ["d/.wh.", "d/.wh..", "d/.wh...", ".wh."] {
            assert!(
                matches!(whiteout(Path::new(path)), Err(Error::InvalidEntry { .. })),
                "{} should be rejected",
                path
            );
        }
    }

    #[test]
    fn test_whiteout_path() {
        assert_eq!(whiteout_path(Path::new("a/b")), PathBuf::from("a/.wh.b"));
        assert_eq!(whiteout_path(Path::new("top")), PathBuf::from(".wh.top"));
    }
}
