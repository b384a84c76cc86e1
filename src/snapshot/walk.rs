use std::collections::BTreeMap;
use std::path::Path;

use crate::digest::digest_reader;
use crate::error::{IoResultExt, Result};
use crate::fs::{read_symlink_target, read_xattrs, FileMetadata, FileType, FsEval};
use crate::snapshot::{child_key, Node, NodeType, Snapshot, ROOT_KEY};

/// record every path under `root`
pub fn walk(root: &Path, eval: &dyn FsEval) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    let node = record(root, eval)?;
    let is_dir = node.is_dir();
    snapshot.insert(ROOT_KEY, node);
    if is_dir {
        walk_dir(root, ROOT_KEY.as_bytes(), eval, &mut snapshot)?;
    }
    tracing::debug!(root = %root.display(), entries = snapshot.len(), "walked rootfs");
    Ok(snapshot)
}

fn walk_dir(dir: &Path, key: &[u8], eval: &dyn FsEval, snapshot: &mut Snapshot) -> Result<()> {
    for name in eval.read_dir(dir)? {
        let path = dir.join(&name);
        let key = child_key(key, &name);
        let node = record(&path, eval)?;
        let is_dir = node.is_dir();
        if is_dir {
            walk_dir(&path, &key, eval, snapshot)?;
        }
        snapshot.insert(key, node);
    }
    Ok(())
}

fn record(path: &Path, eval: &dyn FsEval) -> Result<Node> {
    let meta = FileMetadata::from_path(path)?;
    let xattrs: BTreeMap<String, Vec<u8>> = read_xattrs(path)?
        .into_iter()
        .map(|x| (x.name, x.value))
        .collect();

    let (size, digest) = if meta.file_type == FileType::Regular {
        let mut file = eval.open(path)?;
        let (digest, size) = digest_reader(&mut file).with_path(path)?;
        (Some(size), Some(digest))
    } else {
        (None, None)
    };

    let link = if meta.file_type == FileType::Symlink {
        Some(read_symlink_target(path)?)
    } else {
        None
    };

    let nlink = if meta.file_type == FileType::Directory {
        None
    } else {
        Some(meta.nlink)
    };

    Ok(Node {
        node_type: NodeType::from(meta.file_type),
        size,
        uid: meta.uid,
        gid: meta.gid,
        mode: meta.mode,
        link,
        nlink,
        tar_time: meta.mtime.sec,
        device: meta.rdev,
        digest,
        xattrs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::fs::{set_mode, DefaultFsEval};
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    #[test]
    fn test_walk_records_tree() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("etc")).unwrap();
        fs::write(root.join("etc/hostname"), "box\n").unwrap();
        set_mode(&root.join("etc/hostname"), 0o640).unwrap();
        symlink("hostname", root.join("etc/name")).unwrap();

        let snapshot = walk(root, &DefaultFsEval).unwrap();
        let keys: Vec<&[u8]> = snapshot.keys().collect();
        assert_eq!(
            keys,
            vec![&b"."[..], b"./etc", b"./etc/hostname", b"./etc/name"]
        );

        let file = snapshot.get("./etc/hostname").unwrap();
        assert_eq!(file.node_type, NodeType::File);
        assert_eq!(file.size, Some(4));
        assert_eq!(file.mode, 0o640);
        assert_eq!(file.digest, Some(Digest::of(b"box\n")));
        assert_eq!(file.nlink, Some(1));

        let link = snapshot.get("./etc/name").unwrap();
        assert_eq!(link.node_type, NodeType::Link);
        assert_eq!(link.link.as_deref(), Some(Path::new("hostname")));

        let etc = snapshot.get("./etc").unwrap();
        assert!(etc.is_dir());
        assert_eq!(etc.nlink, None);
        assert_eq!(etc.size, None);
    }

    #[test]
    fn test_walk_keeps_non_utf8_names_apart() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join(OsStr::from_bytes(b"a\xff")), "ff").unwrap();
        fs::write(root.join(OsStr::from_bytes(b"a\xfe")), "fe").unwrap();
        symlink(OsStr::from_bytes(b"a\xff"), root.join("link")).unwrap();

        let snapshot = walk(root, &DefaultFsEval).unwrap();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(
            snapshot.get(b"./a\xff").unwrap().digest,
            Some(Digest::of(b"ff"))
        );
        assert_eq!(
            snapshot.get(b"./a\xfe").unwrap().digest,
            Some(Digest::of(b"fe"))
        );
        let link = snapshot.get("./link").unwrap();
        assert_eq!(
            link.link.as_ref().unwrap().as_os_str().as_bytes(),
            b"a\xff"
        );
    }

    #[test]
    fn test_walk_is_stable() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for name in ["b", "a", "c"] {
            fs::write(root.join(name), name).unwrap();
        }
        assert_eq!(
            walk(root, &DefaultFsEval).unwrap(),
            walk(root, &DefaultFsEval).unwrap()
        );
    }
}
