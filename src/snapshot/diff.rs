use crate::snapshot::Snapshot;
use crate::types::{ChangeKind, DiffEntry};

/// compare two snapshots and return the changes, ordered by path
///
/// a path whose type, size, digest, link target or device changed is
/// `Modified`; one where only ownership, mode, time, link count or xattrs
/// changed is `MetadataOnly`.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Vec<DiffEntry> {
    let mut changes = Vec::new();

    // collect all keys
    let mut all_keys: Vec<&[u8]> = old.keys().chain(new.keys()).collect();
    all_keys.sort();
    all_keys.dedup();

    for key in all_keys {
        let kind = match (old.get(key), new.get(key)) {
            (None, Some(_)) => ChangeKind::Added,
            (Some(_), None) => ChangeKind::Deleted,
            (Some(a), Some(b)) if a.content_differs(b) => ChangeKind::Modified,
            (Some(a), Some(b)) if a != b => ChangeKind::MetadataOnly,
            _ => continue,
        };
        changes.push(DiffEntry {
            path: key.to_vec(),
            kind,
        });
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::snapshot::{Node, NodeType};
    use std::collections::BTreeMap;

    fn file(content: &[u8]) -> Node {
        Node {
            node_type: NodeType::File,
            size: Some(content.len() as u64),
            uid: 0,
            gid: 0,
            mode: 0o644,
            link: None,
            nlink: Some(1),
            tar_time: 100,
            device: None,
            digest: Some(Digest::of(content)),
            xattrs: BTreeMap::new(),
        }
    }

    fn kinds(changes: &[DiffEntry]) -> Vec<(&str, ChangeKind)> {
        changes
            .iter()
            .map(|c| (std::str::from_utf8(&c.path).unwrap(), c.kind))
            .collect()
    }

    #[test]
    fn test_diff_no_changes() {
        let mut snap = Snapshot::new();
        snap.insert("./a", file(b"a"));
        assert!(diff(&snap, &snap.clone()).is_empty());
    }

    #[test]
    fn test_diff_kinds() {
        let mut old = Snapshot::new();
        old.insert("./same", file(b"same"));
        old.insert("./edited", file(b"v1"));
        old.insert("./chmod", file(b"x"));
        old.insert("./removed", file(b"gone"));

        let mut new = Snapshot::new();
        new.insert("./same", file(b"same"));
        new.insert("./edited", file(b"v2"));
        new.insert(
            "./chmod",
            Node {
                mode: 0o600,
                ..file(b"x")
            },
        );
        new.insert("./added", file(b"new"));

        assert_eq!(
            kinds(&diff(&old, &new)),
            vec![
                ("./added", ChangeKind::Added),
                ("./chmod", ChangeKind::MetadataOnly),
                ("./edited", ChangeKind::Modified),
                ("./removed", ChangeKind::Deleted),
            ]
        );
    }

    #[test]
    fn test_type_change_is_modified() {
        let mut old = Snapshot::new();
        old.insert("./p", file(b""));
        let mut new = Snapshot::new();
        new.insert(
            "./p",
            Node {
                node_type: NodeType::Link,
                link: Some("target".into()),
                size: None,
                digest: None,
                ..file(b"")
            },
        );
        assert_eq!(kinds(&diff(&old, &new)), vec![("./p", ChangeKind::Modified)]);
    }

    #[test]
    fn test_xattr_change_is_metadata_only() {
        let mut old = Snapshot::new();
        old.insert("./f", file(b"x"));
        let mut with_xattr = file(b"x");
        with_xattr.xattrs.insert("user.k".to_string(), b"v".to_vec());
        let mut new = Snapshot::new();
        new.insert("./f", with_xattr);
        assert_eq!(kinds(&diff(&old, &new)), vec![("./f", ChangeKind::MetadataOnly)]);
    }
}
