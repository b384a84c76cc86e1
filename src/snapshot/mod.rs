//! filesystem snapshots in mtree form
//!
//! a snapshot records, for every path under a rootfs, the attributes a
//! later diff needs: type, size, ownership, mode, link target, link count,
//! modification time, device numbers, content digest and xattrs. paths are
//! keyed by their raw bytes, `.` for the root and `./<relative path>` below
//! it, and iterate in byte order.

mod diff;
mod mtree;
mod walk;

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use crate::digest::Digest;
use crate::fs::FileType;

pub use diff::diff;
pub use walk::walk;

/// key of the rootfs itself
pub const ROOT_KEY: &str = ".";

/// attributes recorded per path, in output order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Keyword {
    Type,
    Size,
    Uid,
    Gid,
    Mode,
    Link,
    Nlink,
    TarTime,
    Device,
    Sha256Digest,
    Xattr,
}

impl Keyword {
    pub const ALL: [Keyword; 11] = [
        Keyword::Type,
        Keyword::Size,
        Keyword::Uid,
        Keyword::Gid,
        Keyword::Mode,
        Keyword::Link,
        Keyword::Nlink,
        Keyword::TarTime,
        Keyword::Device,
        Keyword::Sha256Digest,
        Keyword::Xattr,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Type => "type",
            Keyword::Size => "size",
            Keyword::Uid => "uid",
            Keyword::Gid => "gid",
            Keyword::Mode => "mode",
            Keyword::Link => "link",
            Keyword::Nlink => "nlink",
            Keyword::TarTime => "tar_time",
            Keyword::Device => "device",
            Keyword::Sha256Digest => "sha256digest",
            Keyword::Xattr => "xattr",
        }
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// node type as written in the snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeType {
    File,
    Dir,
    Link,
    Char,
    Block,
    Fifo,
    Socket,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::File => "file",
            NodeType::Dir => "dir",
            NodeType::Link => "link",
            NodeType::Char => "char",
            NodeType::Block => "block",
            NodeType::Fifo => "fifo",
            NodeType::Socket => "socket",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "file" => NodeType::File,
            "dir" => NodeType::Dir,
            "link" => NodeType::Link,
            "char" => NodeType::Char,
            "block" => NodeType::Block,
            "fifo" => NodeType::Fifo,
            "socket" => NodeType::Socket,
            _ => return None,
        })
    }
}

impl From<FileType> for NodeType {
    fn from(ft: FileType) -> Self {
        match ft {
            FileType::Regular => NodeType::File,
            FileType::Directory => NodeType::Dir,
            FileType::Symlink => NodeType::Link,
            FileType::CharDevice => NodeType::Char,
            FileType::BlockDevice => NodeType::Block,
            FileType::Fifo => NodeType::Fifo,
            FileType::Socket => NodeType::Socket,
        }
    }
}

/// recorded attributes of one path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub node_type: NodeType,
    /// content length, regular files only
    pub size: Option<u64>,
    pub uid: u32,
    pub gid: u32,
    /// permission bits
    pub mode: u32,
    /// symlink target
    pub link: Option<PathBuf>,
    /// link count, non-directories only
    pub nlink: Option<u64>,
    /// modification time in whole seconds
    pub tar_time: i64,
    /// major, minor for device nodes
    pub device: Option<(u32, u32)>,
    /// content digest, regular files only
    pub digest: Option<Digest>,
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Dir
    }

    /// true when the content (not just metadata) differs from `other`
    pub fn content_differs(&self, other: &Node) -> bool {
        self.node_type != other.node_type
            || self.size != other.size
            || self.digest != other.digest
            || self.link != other.link
            || self.device != other.device
    }
}

/// an ordered set of recorded paths
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    nodes: BTreeMap<Vec<u8>, Node>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<Vec<u8>>, node: Node) {
        self.nodes.insert(key.into(), node);
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<&Node> {
        self.nodes.get(key.as_ref())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// nodes in key order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &Node)> {
        self.nodes.iter().map(|(k, v)| (k.as_slice(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.nodes.keys().map(|k| k.as_slice())
    }
}

/// key for a path relative to the rootfs
pub fn key_for(rel: &Path) -> Vec<u8> {
    if rel.as_os_str().is_empty() {
        ROOT_KEY.as_bytes().to_vec()
    } else {
        let mut key = b"./".to_vec();
        key.extend_from_slice(rel.as_os_str().as_bytes());
        key
    }
}

/// key of `name` inside the directory keyed `parent`
pub fn child_key(parent: &[u8], name: &OsStr) -> Vec<u8> {
    let mut key = Vec::with_capacity(parent.len() + 1 + name.len());
    key.extend_from_slice(parent);
    key.push(b'/');
    key.extend_from_slice(name.as_bytes());
    key
}

/// key of the directory holding `key`; the root has none
pub fn parent_key(key: &[u8]) -> Option<&[u8]> {
    let slash = key.iter().rposition(|&b| b == b'/')?;
    Some(&key[..slash])
}

/// relative path for a key; the root maps to the empty path
pub fn rel_for(key: &[u8]) -> PathBuf {
    match key.strip_prefix(b"./") {
        Some(rel) => PathBuf::from(OsString::from_vec(rel.to_vec())),
        None => PathBuf::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_mapping() {
        assert_eq!(key_for(Path::new("")), b".");
        assert_eq!(key_for(Path::new("etc/passwd")), b"./etc/passwd");
        assert_eq!(rel_for(b"."), PathBuf::new());
        assert_eq!(rel_for(b"./etc/passwd"), PathBuf::from("etc/passwd"));
        assert_eq!(child_key(b".", OsStr::new("etc")), b"./etc");
        assert_eq!(parent_key(b"./etc/passwd"), Some(&b"./etc"[..]));
        assert_eq!(parent_key(b"./etc"), Some(&b"."[..]));
        assert_eq!(parent_key(b"."), None);
    }

    #[test]
    fn test_non_utf8_keys_stay_distinct() {
        let ff = key_for(Path::new(OsStr::from_bytes(b"a\xff")));
        let fe = key_for(Path::new(OsStr::from_bytes(b"a\xfe")));
        assert_ne!(ff, fe);
        assert_eq!(rel_for(&ff).as_os_str().as_bytes(), b"a\xff");
    }

    #[test]
    fn test_keyword_order() {
        let names: Vec<&str> = Keyword::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "type",
                "size",
                "uid",
                "gid",
                "mode",
                "link",
                "nlink",
                "tar_time",
                "device",
                "sha256digest",
                "xattr"
            ]
        );
    }

    #[test]
    fn test_node_type_names() {
        for t in [
            NodeType::File,
            NodeType::Dir,
            NodeType::Link,
            NodeType::Char,
            NodeType::Block,
            NodeType::Fifo,
            NodeType::Socket,
        ] {
            assert_eq!(NodeType::parse(t.as_str()), Some(t));
        }
        assert_eq!(NodeType::parse("door"), None);
    }
}
