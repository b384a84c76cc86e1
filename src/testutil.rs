//! builders shared by the unit tests

use std::io::{self, Cursor};
use std::path::Path;

use serde_json::json;
use tar::{Builder, EntryType, Header};

use crate::cas::{put_blob, put_json, update_reference, Store};
use crate::compress::Compression;
use crate::config::CompressionConfig;
use crate::digest::Digest;
use crate::idmap::{MapEntry, MapOptions};
use crate::layer::OPAQUE_WHITEOUT;
use crate::types::{media_type, Descriptor, Manifest};

/// mtime stamped on every entry a [`LayerBuilder`] writes
pub const MTIME: i64 = 1_600_000_000;

/// fluent builder for uncompressed tar layers
pub struct LayerBuilder {
    builder: Builder<Vec<u8>>,
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self {
            builder: Builder::new(Vec::new()),
        }
    }

    fn header(kind: EntryType, mode: u32) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(mode);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(MTIME as u64);
        header.set_size(0);
        header
    }

    fn append(mut self, mut header: Header, path: impl AsRef<Path>, content: &[u8]) -> Self {
        header.set_size(content.len() as u64);
        self.builder
            .append_data(&mut header, path, content)
            .unwrap();
        self
    }

    pub fn dir(self, path: &str, mode: u32) -> Self {
        self.append(Self::header(EntryType::Directory, mode), path, b"")
    }

    pub fn file(self, path: &str, content: &[u8], mode: u32) -> Self {
        self.append(Self::header(EntryType::Regular, mode), path, content)
    }

    pub fn file_owned(self, path: &str, content: &[u8], uid: u64, gid: u64) -> Self {
        let mut header = Self::header(EntryType::Regular, 0o644);
        header.set_uid(uid);
        header.set_gid(gid);
        self.append(header, path, content)
    }

    pub fn file_with_xattrs(mut self, path: &str, content: &[u8], xattrs: &[(&str, &[u8])]) -> Self {
        let records: Vec<(String, &[u8])> = xattrs
            .iter()
            .map(|(name, value)| (format!("SCHILY.xattr.{}", name), *value))
            .collect();
        self.builder
            .append_pax_extensions(records.iter().map(|(k, v)| (k.as_str(), *v)))
            .unwrap();
        self.file(path, content, 0o644)
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let mut header = Self::header(EntryType::Symlink, 0o777);
        self.builder.append_link(&mut header, path, target).unwrap();
        self
    }

    pub fn hardlink(mut self, path: &str, target: &str) -> Self {
        let mut header = Self::header(EntryType::Link, 0o644);
        self.builder.append_link(&mut header, path, target).unwrap();
        self
    }

    pub fn char_device(mut self, path: &str, major: u32, minor: u32) -> Self {
        let mut header = Self::header(EntryType::Char, 0o666);
        header.set_device_major(major).unwrap();
        header.set_device_minor(minor).unwrap();
        self.builder
            .append_data(&mut header, path, io::empty())
            .unwrap();
        self
    }

    pub fn whiteout(self, path: &str) -> Self {
        let marker = crate::layer::whiteout_path(Path::new(path));
        self.append(Self::header(EntryType::Regular, 0o644), marker, b"")
    }

    pub fn opaque(self, dir: &str) -> Self {
        let marker = Path::new(dir).join(OPAQUE_WHITEOUT);
        self.append(Self::header(EntryType::Regular, 0o644), marker, b"")
    }

    /// a regular file whose name is written verbatim, bypassing the
    /// builder's path checks
    pub fn raw_file(mut self, name: &[u8], content: &[u8]) -> Self {
        let mut header = Self::header(EntryType::Regular, 0o644);
        header.set_size(content.len() as u64);
        if let Some(gnu) = header.as_gnu_mut() {
            gnu.name[..name.len()].copy_from_slice(name);
        }
        header.set_cksum();
        self.builder.append(&header, content).unwrap();
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }
}

/// rootless options mapping container root to the current user
pub fn rootless_map() -> MapOptions {
    MapOptions {
        rootless: true,
        uid_mappings: vec![MapEntry::new(0, nix::unistd::geteuid().as_raw(), 1)],
        gid_mappings: vec![MapEntry::new(0, nix::unistd::getegid().as_raw(), 1)],
    }
}

/// store `layers` as an image tagged `tag` and return its manifest descriptor
pub fn build_image(store: &Store, tag: &str, layers: &[Vec<u8>], compression: Compression) -> Descriptor {
    let mut descriptors = Vec::new();
    let mut diff_ids = Vec::new();
    for layer in layers {
        diff_ids.push(Digest::of(layer).to_string());
        let compressor = compression.compressor(&CompressionConfig::default());
        let mut stream = compressor.compress(Cursor::new(layer.clone())).unwrap();
        descriptors.push(put_blob(store, &compression.layer_media_type(), &mut stream).unwrap());
    }

    let config = json!({
        "architecture": "amd64",
        "os": "linux",
        "rootfs": { "type": "layers", "diff_ids": diff_ids },
        "history": [],
    });
    let config = put_json(store, media_type::IMAGE_CONFIG, &config).unwrap();

    let manifest = Manifest {
        schema_version: 2,
        media_type: Some(media_type::IMAGE_MANIFEST.to_string()),
        config,
        layers: descriptors,
        annotations: Default::default(),
    };
    let desc = put_json(store, media_type::IMAGE_MANIFEST, &manifest).unwrap();
    update_reference(store, tag, &desc).unwrap();
    desc
}
