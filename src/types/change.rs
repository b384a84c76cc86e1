use std::fmt;

use serde::{Deserialize, Serialize};

/// an extended attribute
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Xattr {
    pub name: String,
    pub value: Vec<u8>,
}

impl Xattr {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// how a path differs between two snapshots
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    /// type, content, link target or device changed
    Modified,
    Deleted,
    /// only ownership, mode, mtime, link count or xattrs changed
    MetadataOnly,
}

impl ChangeKind {
    /// single-letter code used when listing changes
    pub fn code(self) -> char {
        match self {
            ChangeKind::Added => 'A',
            ChangeKind::Modified => 'M',
            ChangeKind::Deleted => 'D',
            ChangeKind::MetadataOnly => 'm',
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// one changed path, keyed like a snapshot (`./etc/hostname`)
///
/// the path holds the raw name bytes; display is lossy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: Vec<u8>,
    pub kind: ChangeKind,
}

impl fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, String::from_utf8_lossy(&self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_format() {
        let entry = DiffEntry {
            path: b"./etc/hostname".to_vec(),
            kind: ChangeKind::MetadataOnly,
        };
        assert_eq!(entry.to_string(), "m ./etc/hostname");
        assert_eq!(ChangeKind::Deleted.to_string(), "D");
    }

    #[test]
    fn test_xattr_json_keeps_raw_bytes() {
        let xattr = Xattr::new("security.capability", vec![0, 1, 255]);
        let json = serde_json::to_string(&xattr).unwrap();
        assert_eq!(serde_json::from_str::<Xattr>(&json).unwrap(), xattr);
    }
}
