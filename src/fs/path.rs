//! confinement of archive paths to a root directory
//!
//! layer entries name paths that are meant to be interpreted with the rootfs
//! as `/`. both `..` components and symlinks planted by earlier entries can
//! point outside of it, so every path is resolved component by component
//! with symlinks evaluated relative to the root.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// symlink expansions allowed while resolving a single path
const MAX_SYMLINKS: usize = 255;

enum Step {
    Up,
    Name(OsString),
}

/// lexically clean an archive path into a root-relative path
///
/// leading `/`, `.` components and `..` components that would climb above
/// the root are dropped. the root itself is the empty path.
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => out.push(name),
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// resolve `path` inside `root`, treating `root` as `/`
///
/// symlinks are evaluated in every component; the final component is only
/// followed when `follow_final` is set. the result always lies within
/// `root`. components that do not exist are taken as-is.
pub fn resolve_in_root(root: &Path, path: &Path, follow_final: bool) -> Result<PathBuf> {
    let mut pending: VecDeque<Step> = steps(path).collect();
    let mut resolved = PathBuf::new();
    let mut expansions = 0;

    while let Some(step) = pending.pop_front() {
        let name = match step {
            Step::Up => {
                resolved.pop();
                continue;
            }
            Step::Name(name) => name,
        };

        let candidate = resolved.join(&name);
        if pending.is_empty() && !follow_final {
            resolved = candidate;
            break;
        }

        let full = root.join(&candidate);
        match fs::symlink_metadata(&full) {
            Ok(meta) if meta.file_type().is_symlink() => {
                expansions += 1;
                if expansions > MAX_SYMLINKS {
                    return Err(Error::InvalidEntry {
                        path: path.to_path_buf(),
                        message: "too many levels of symbolic links".to_string(),
                    });
                }
                let target = fs::read_link(&full).map_err(|source| Error::Io {
                    path: full.clone(),
                    source,
                })?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                let mut expanded: VecDeque<Step> = steps(&target).collect();
                expanded.extend(pending);
                pending = expanded;
            }
            Ok(_) => resolved = candidate,
            Err(e) if e.kind() == io::ErrorKind::NotFound => resolved = candidate,
            Err(e) => {
                return Err(Error::Io {
                    path: full,
                    source: e,
                })
            }
        }
    }

    Ok(root.join(resolved))
}

fn steps(path: &Path) -> impl Iterator<Item = Step> + '_ {
    path.components().filter_map(|component| match component {
        Component::Normal(name) => Some(Step::Name(name.to_os_string())),
        Component::ParentDir => Some(Step::Up),
        Component::CurDir | Component::RootDir | Component::Prefix(_) => None,
    })
}
