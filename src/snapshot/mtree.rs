//! text form of a snapshot
//!
//! ```text
//! #mtree v2.0
//! # keywords: type,size,uid,gid,mode,link,nlink,tar_time,device,sha256digest,xattr
//! . type=dir uid=0 gid=0 mode=0755 tar_time=0.000000000
//! ./etc/hostname type=file size=4 uid=0 gid=0 mode=0644 nlink=1 tar_time=... sha256digest=...
//! ```
//!
//! paths, link targets and xattr names escape every byte outside printable
//! ascii, and `\`, `#` and `=`, as a three digit octal `\ooo`. xattr values
//! are hex encoded.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use crate::digest::Digest;
use crate::error::{Error, IoResultExt, Result};
use crate::snapshot::{Keyword, Node, NodeType, Snapshot};

const HEADER: &str = "#mtree v2.0";

impl Snapshot {
    /// render as mtree text
    pub fn to_mtree(&self) -> String {
        let keywords: Vec<&str> = Keyword::ALL.iter().map(|k| k.as_str()).collect();
        let mut out = format!("{}\n# keywords: {}\n", HEADER, keywords.join(","));
        for (key, node) in self.iter() {
            out.push_str(&escape(key));
            for keyword in Keyword::ALL {
                write_keyword(&mut out, keyword, node);
            }
            out.push('\n');
        }
        out
    }

    /// parse mtree text produced by [`Snapshot::to_mtree`]
    pub fn parse_mtree(text: &str) -> Result<Self> {
        let mut snapshot = Snapshot::new();
        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, node) = parse_line(line).map_err(|message| Error::InvalidSnapshot {
                line: line_no,
                message,
            })?;
            snapshot.insert(key, node);
        }
        Ok(snapshot)
    }

    /// read a snapshot file
    pub fn read_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_path(path)?;
        Self::parse_mtree(&text)
    }

    /// write a snapshot file that must not exist yet
    pub fn write_new(&self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    Error::AlreadyExists(path.to_path_buf())
                } else {
                    Error::Io {
                        path: path.to_path_buf(),
                        source: e,
                    }
                }
            })?;
        file.write_all(self.to_mtree().as_bytes()).with_path(path)?;
        file.sync_all().with_path(path)
    }
}

fn write_keyword(out: &mut String, keyword: Keyword, node: &Node) {
    // writing into a String cannot fail
    let _ = match keyword {
        Keyword::Type => write!(out, " type={}", node.node_type.as_str()),
        Keyword::Size => match node.size {
            Some(size) => write!(out, " size={}", size),
            None => Ok(()),
        },
        Keyword::Uid => write!(out, " uid={}", node.uid),
        Keyword::Gid => write!(out, " gid={}", node.gid),
        Keyword::Mode => write!(out, " mode={:04o}", node.mode),
        Keyword::Link => match &node.link {
            Some(link) => write!(out, " link={}", escape(link.as_os_str().as_bytes())),
            None => Ok(()),
        },
        Keyword::Nlink => match node.nlink {
            Some(nlink) => write!(out, " nlink={}", nlink),
            None => Ok(()),
        },
        Keyword::TarTime => write!(out, " tar_time={}.000000000", node.tar_time),
        Keyword::Device => match node.device {
            Some((major, minor)) => write!(out, " device={},{}", major, minor),
            None => Ok(()),
        },
        Keyword::Sha256Digest => match &node.digest {
            Some(digest) => write!(out, " sha256digest={}", digest.hex()),
            None => Ok(()),
        },
        Keyword::Xattr => {
            for (name, value) in &node.xattrs {
                let _ = write!(out, " xattr.{}={}", escape(name.as_bytes()), hex::encode(value));
            }
            Ok(())
        }
    };
}

fn parse_line(line: &str) -> std::result::Result<(Vec<u8>, Node), String> {
    let mut fields = line.split_whitespace();
    let key = unescape(fields.next().ok_or("missing path")?)?;

    let mut node_type = None;
    let mut node = Node {
        node_type: NodeType::File,
        size: None,
        uid: 0,
        gid: 0,
        mode: 0,
        link: None,
        nlink: None,
        tar_time: 0,
        device: None,
        digest: None,
        xattrs: Default::default(),
    };

    for field in fields {
        let (name, value) = field
            .split_once('=')
            .ok_or_else(|| format!("malformed field {:?}", field))?;
        let bad = |what: &str| format!("bad {} {:?}", what, value);
        match name {
            "type" => node_type = Some(NodeType::parse(value).ok_or_else(|| bad("type"))?),
            "size" => node.size = Some(value.parse().map_err(|_| bad("size"))?),
            "uid" => node.uid = value.parse().map_err(|_| bad("uid"))?,
            "gid" => node.gid = value.parse().map_err(|_| bad("gid"))?,
            "mode" => node.mode = u32::from_str_radix(value, 8).map_err(|_| bad("mode"))?,
            "link" => node.link = Some(PathBuf::from(OsString::from_vec(unescape(value)?))),
            "nlink" => node.nlink = Some(value.parse().map_err(|_| bad("nlink"))?),
            "tar_time" => {
                let secs = value.split('.').next().unwrap_or(value);
                node.tar_time = secs.parse().map_err(|_| bad("tar_time"))?;
            }
            "device" => {
                let (major, minor) = value.split_once(',').ok_or_else(|| bad("device"))?;
                node.device = Some((
                    major.parse().map_err(|_| bad("device"))?,
                    minor.parse().map_err(|_| bad("device"))?,
                ));
            }
            "sha256digest" => {
                node.digest = Some(Digest::from_hex(value).map_err(|_| bad("sha256digest"))?)
            }
            other => match other.strip_prefix("xattr.") {
                Some(xattr) => {
                    let decoded = hex::decode(value).map_err(|_| bad("xattr value"))?;
                    let name = String::from_utf8(unescape(xattr)?).map_err(|_| bad("xattr name"))?;
                    node.xattrs.insert(name, decoded);
                }
                None => return Err(format!("unknown keyword {:?}", other)),
            },
        }
    }

    node.node_type = node_type.ok_or("missing type")?;
    Ok((key, node))
}

/// octal-escape bytes that would break the line format
pub(crate) fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if b.is_ascii_graphic() && !matches!(b, b'\\' | b'#' | b'=') {
            out.push(b as char);
        } else {
            let _ = write!(out, "\\{:03o}", b);
        }
    }
    out
}

pub(crate) fn unescape(s: &str) -> std::result::Result<Vec<u8>, String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let digits = bytes
                .get(i + 1..i + 4)
                .and_then(|d| std::str::from_utf8(d).ok())
                .and_then(|d| u8::from_str_radix(d, 8).ok())
                .ok_or_else(|| format!("bad escape in {:?}", s))?;
            out.push(digits);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn file_node() -> Node {
        let mut xattrs = BTreeMap::new();
        xattrs.insert("user.key".to_string(), b"va lue".to_vec());
        Node {
            node_type: NodeType::File,
            size: Some(4),
            uid: 1000,
            gid: 100,
            mode: 0o4755,
            link: None,
            nlink: Some(2),
            tar_time: 1_600_000_000,
            device: None,
            digest: Some(Digest::of(b"data")),
            xattrs,
        }
    }

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            ".",
            Node {
                node_type: NodeType::Dir,
                size: None,
                uid: 0,
                gid: 0,
                mode: 0o755,
                link: None,
                nlink: None,
                tar_time: 0,
                device: None,
                digest: None,
                xattrs: BTreeMap::new(),
            },
        );
        snapshot.insert("./bin/has space=and#hash", file_node());
        snapshot.insert(b"./bin/raw\xff".to_vec(), file_node());
        snapshot.insert(
            "./dev/null",
            Node {
                node_type: NodeType::Char,
                device: Some((1, 3)),
                size: None,
                digest: None,
                xattrs: BTreeMap::new(),
                ..file_node()
            },
        );
        snapshot.insert(
            "./lib",
            Node {
                node_type: NodeType::Link,
                link: Some(PathBuf::from("usr/lib wéird")),
                size: None,
                digest: None,
                xattrs: BTreeMap::new(),
                ..file_node()
            },
        );
        snapshot
    }

    #[test]
    fn test_format_header_and_order() {
        let text = sample().to_mtree();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "#mtree v2.0");
        assert!(lines[1].starts_with("# keywords: type,size,uid,gid,mode"));
        assert!(lines[2].starts_with(". type=dir"));
        assert!(lines[3].starts_with("./bin/has\\040space\\075and\\043hash type=file size=4"));
        assert!(lines[3].contains(" mode=4755 "));
        assert!(lines[3].contains(" xattr.user.key=7661206c7565"));
        assert!(lines[4].starts_with("./bin/raw\\377 type=file"));
        assert!(lines[5].contains(" device=1,3"));
    }

    #[test]
    fn test_parse_inverts_format() {
        let snapshot = sample();
        let parsed = Snapshot::parse_mtree(&snapshot.to_mtree()).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_parse_errors_carry_line() {
        let text = "#mtree v2.0\n. type=dir\n./x type=file bogus=1\n";
        match Snapshot::parse_mtree(text) {
            Err(Error::InvalidSnapshot { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected {:?}", other),
        }

        assert!(Snapshot::parse_mtree("./x uid=0\n").is_err());
        assert!(Snapshot::parse_mtree("./x type=file mode=999\n").is_err());
        assert!(Snapshot::parse_mtree("./bad\\09 type=file\n").is_err());
    }

    #[test]
    fn test_write_new_refuses_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snap.mtree");
        sample().write_new(&path).unwrap();
        assert_eq!(Snapshot::read_from(&path).unwrap(), sample());
        assert!(matches!(
            sample().write_new(&path),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape(b"plain/path"), "plain/path");
        assert_eq!(escape(b"a b"), "a\\040b");
        assert_eq!(escape(b"back\\slash"), "back\\134slash");
        assert_eq!(escape(b"\xfe"), "\\376");
        assert_eq!(unescape("a\\040b").unwrap(), b"a b");
        assert_eq!(unescape(&escape(b"tab\there")).unwrap(), b"tab\there");
        assert_eq!(unescape("\\376").unwrap(), b"\xfe");
    }
}
