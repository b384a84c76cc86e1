use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::PathBuf;

use serde::Serialize;

use crate::cas::Store;
use crate::digest::{digest_reader, Digest, Digester, DigestingWriter};
use crate::error::{Error, IoResultExt, Result};
use crate::types::{media_type, Descriptor, Index, Manifest};

/// get filesystem path for a blob
pub fn blob_path(store: &Store, digest: &Digest) -> PathBuf {
    store.blobs_path().join(digest.hex())
}

/// check if a blob exists
pub fn blob_exists(store: &Store, digest: &Digest) -> bool {
    blob_path(store, digest).exists()
}

/// stream a blob into the store, returning its descriptor
///
/// the content is digested while it is written to a temp file, then renamed
/// into place. storing content that is already present is a no-op.
pub fn put_blob<R: Read + ?Sized>(store: &Store, media_type: &str, reader: &mut R) -> Result<Descriptor> {
    let tmp_path = store.new_tmp_file()?;

    let (digest, size) = {
        let tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
        let mut writer = DigestingWriter::new(tmp_file);
        if let Err(e) = io::copy(reader, &mut writer) {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::Io {
                path: tmp_path,
                source: e,
            });
        }
        let (tmp_file, digest, size) = writer.finish();
        tmp_file.sync_all().with_path(&tmp_path)?;
        (digest, size)
    };

    let dest = blob_path(store, &digest);
    if dest.exists() {
        // deduplication: identical content is already stored
        fs::remove_file(&tmp_path).with_path(&tmp_path)?;
    } else {
        store.commit_tmp(&tmp_path, &dest)?;
    }

    tracing::debug!(digest = %digest, size, media_type, "stored blob");
    Ok(Descriptor::new(media_type, digest, size as i64))
}

/// serialize `value` as json and store it
pub fn put_json<T: Serialize>(store: &Store, media_type: &str, value: &T) -> Result<Descriptor> {
    let content = serde_json::to_vec(value)?;
    put_blob(store, media_type, &mut content.as_slice())
}

/// check a stored blob against the size and digest in its descriptor
pub fn verify_blob(store: &Store, desc: &Descriptor) -> Result<()> {
    let mut file = open_raw(store, &desc.digest)?;
    let path = blob_path(store, &desc.digest);
    let (digest, size) = digest_reader(&mut file).with_path(&path)?;
    check(desc, &digest, size)
}

/// read a whole blob into memory, verified
pub fn read_blob(store: &Store, desc: &Descriptor) -> Result<Vec<u8>> {
    let path = blob_path(store, &desc.digest);
    let content = fs::read(&path).map_err(|e| not_found_or_io(e, desc.digest, &path))?;
    check(desc, &Digest::of(&content), content.len() as u64)?;
    Ok(content)
}

/// decoded content of a fetched blob
#[derive(Debug)]
pub enum BlobData {
    Manifest(Manifest),
    Index(Index),
    /// image configuration, kept as raw json so unknown fields survive
    Config(serde_json::Value),
    /// anything else, layers included; read it through the blob
    Opaque,
}

/// a fetched blob: its descriptor, decoded data and a reader over the
/// content
///
/// structured blobs are verified before they are decoded. other blobs are
/// verified as they stream; reading one that does not match its descriptor
/// fails with `InvalidData` once the mismatch shows.
pub struct Blob {
    pub descriptor: Descriptor,
    pub data: BlobData,
    reader: Box<dyn Read + Send>,
}

impl Blob {
    pub fn media_type(&self) -> &str {
        &self.descriptor.media_type
    }

    /// release the underlying file
    pub fn close(self) {}
}

impl Read for Blob {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// fetch a blob, decoding the structured media types
pub fn fetch_blob(store: &Store, desc: &Descriptor) -> Result<Blob> {
    let mt = desc.media_type.as_str();
    let structured = media_type::is_manifest(mt) || media_type::is_index(mt) || media_type::is_config(mt);

    if !structured {
        let file = open_raw(store, &desc.digest)?;
        return Ok(Blob {
            descriptor: desc.clone(),
            data: BlobData::Opaque,
            reader: Box::new(VerifyingReader::new(file, desc)),
        });
    }

    let content = read_blob(store, desc)?;
    let data = if media_type::is_manifest(mt) {
        BlobData::Manifest(serde_json::from_slice(&content)?)
    } else if media_type::is_index(mt) {
        BlobData::Index(serde_json::from_slice(&content)?)
    } else {
        BlobData::Config(serde_json::from_slice(&content)?)
    };

    Ok(Blob {
        descriptor: desc.clone(),
        data,
        reader: Box::new(Cursor::new(content)),
    })
}

/// fetch a descriptor that must name a single-platform manifest
pub fn fetch_manifest(store: &Store, desc: &Descriptor) -> Result<Manifest> {
    if !media_type::is_manifest(&desc.media_type) {
        return Err(Error::UnsupportedMediaType(desc.media_type.clone()));
    }
    match fetch_blob(store, desc)?.data {
        BlobData::Manifest(manifest) => Ok(manifest),
        _ => Err(Error::UnsupportedMediaType(desc.media_type.clone())),
    }
}

/// fetch an image configuration
pub fn fetch_config(store: &Store, desc: &Descriptor) -> Result<serde_json::Value> {
    match fetch_blob(store, desc)?.data {
        BlobData::Config(config) => Ok(config),
        _ => Err(Error::UnsupportedMediaType(desc.media_type.clone())),
    }
}

/// passes content through, checking it against a descriptor
struct VerifyingReader<R> {
    inner: R,
    expected: Descriptor,
    digester: Option<Digester>,
    /// set once a mismatch was reported, so later reads fail too
    mismatch: Option<String>,
}

impl<R: Read> VerifyingReader<R> {
    fn new(inner: R, expected: &Descriptor) -> Self {
        Self {
            inner,
            expected: expected.clone(),
            digester: Some(Digester::new()),
            mismatch: None,
        }
    }

    fn fail(&mut self, err: Error) -> io::Error {
        let message = err.to_string();
        self.mismatch = Some(message.clone());
        io::Error::new(io::ErrorKind::InvalidData, message)
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(message) = &self.mismatch {
            return Err(io::Error::new(io::ErrorKind::InvalidData, message.clone()));
        }
        let n = self.inner.read(buf)?;
        let Some(digester) = self.digester.as_mut() else {
            return Ok(n);
        };

        if n > 0 || buf.is_empty() {
            digester.update(&buf[..n]);
            let len = digester.len();
            if len as i64 > self.expected.size {
                let err = Error::CorruptBlob {
                    digest: self.expected.digest,
                    message: format!("longer than descriptor size {}", self.expected.size),
                };
                return Err(self.fail(err));
            }
            return Ok(n);
        }

        // end of content
        let Some(digester) = self.digester.take() else {
            return Ok(0);
        };
        let len = digester.len();
        match check(&self.expected, &digester.finalize(), len) {
            Ok(()) => Ok(0),
            Err(e) => Err(self.fail(e)),
        }
    }
}

fn open_raw(store: &Store, digest: &Digest) -> Result<File> {
    let path = blob_path(store, digest);
    File::open(&path).map_err(|e| not_found_or_io(e, *digest, &path))
}

fn not_found_or_io(e: io::Error, digest: Digest, path: &std::path::Path) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::BlobNotFound(digest)
    } else {
        Error::Io {
            path: path.to_path_buf(),
            source: e,
        }
    }
}

fn check(desc: &Descriptor, actual: &Digest, size: u64) -> Result<()> {
    if size as i64 != desc.size {
        return Err(Error::CorruptBlob {
            digest: desc.digest,
            message: format!("size {} does not match descriptor size {}", size, desc.size),
        });
    }
    if *actual != desc.digest {
        return Err(Error::CorruptBlob {
            digest: desc.digest,
            message: format!("content hashes to {}", actual),
        });
    }
    Ok(())
}
