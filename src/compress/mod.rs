//! layer compression
//!
//! compression runs on a background thread feeding an in-memory pipe, so a
//! layer can be generated, compressed and hashed into the store as one
//! stream. the uncompressed byte count is published once the input has been
//! drained; until then [`Compressor::bytes_read`] reports
//! [`BYTES_READ_UNKNOWN`].

mod gzip;
mod pipe;

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::config::CompressionConfig;
use crate::error::{Error, Result};
use crate::types::media_type;

pub use pipe::{pipe, PipeReader, PipeWriter};

/// value of [`Compressor::bytes_read`] before the input is exhausted
pub const BYTES_READ_UNKNOWN: i64 = -1;

/// chunks buffered between the compression thread and its consumer
pub const PIPE_CAPACITY: usize = 16;

/// supported layer compressions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Zstd,
}

impl Compression {
    /// suffix appended to the layer media type, without the `+`
    pub fn media_type_suffix(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        }
    }

    /// full layer media type for this compression
    pub fn layer_media_type(self) -> String {
        match self {
            Compression::None => media_type::IMAGE_LAYER.to_string(),
            other => format!("{}+{}", media_type::IMAGE_LAYER, other.media_type_suffix()),
        }
    }

    /// compression named by a media type suffix
    pub fn from_suffix(suffix: &str) -> Result<Self> {
        match suffix {
            "" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            other => Err(Error::UnsupportedMediaType(format!(
                "unknown layer compression {:?}",
                other
            ))),
        }
    }

    /// compression of a layer with the given media type
    pub fn from_media_type(media_type: &str) -> Result<Self> {
        if media_type == media_type::DOCKER_LAYER_GZIP {
            return Ok(Compression::Gzip);
        }
        let rest = media_type
            .strip_prefix(media_type::IMAGE_LAYER)
            .ok_or_else(|| Error::UnsupportedMediaType(media_type.to_string()))?;
        match rest {
            "" => Ok(Compression::None),
            _ => match rest.strip_prefix('+') {
                Some(suffix) => Self::from_suffix(suffix)
                    .map_err(|_| Error::UnsupportedMediaType(media_type.to_string())),
                None => Err(Error::UnsupportedMediaType(media_type.to_string())),
            },
        }
    }

    /// compressor using `settings` for the tunables
    pub fn compressor(self, settings: &CompressionConfig) -> Compressor {
        Compressor::new(self, settings)
    }

    /// wrap a compressed stream in the matching decoder
    pub fn decompress<'a, R: Read + Send + 'a>(self, reader: R) -> io::Result<Box<dyn Read + Send + 'a>> {
        Ok(match self {
            Compression::None => Box::new(reader),
            Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(reader)),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
        })
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Compression::None),
            other => Self::from_suffix(other),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            other => write!(f, "{}", other.media_type_suffix()),
        }
    }
}

/// turns an uncompressed stream into a compressed one
pub struct Compressor {
    kind: Compression,
    gzip_block_size: usize,
    gzip_concurrency: usize,
    zstd_level: i32,
    bytes_read: Arc<AtomicI64>,
}

impl Compressor {
    pub fn new(kind: Compression, settings: &CompressionConfig) -> Self {
        Self {
            kind,
            gzip_block_size: settings.gzip_block_size,
            gzip_concurrency: settings.gzip_concurrency(),
            zstd_level: settings.zstd_level,
            bytes_read: Arc::new(AtomicI64::new(BYTES_READ_UNKNOWN)),
        }
    }

    pub fn kind(&self) -> Compression {
        self.kind
    }

    pub fn media_type_suffix(&self) -> &'static str {
        self.kind.media_type_suffix()
    }

    /// uncompressed bytes consumed by the last stream, once it has ended
    pub fn bytes_read(&self) -> i64 {
        self.bytes_read.load(Ordering::Acquire)
    }

    /// start compressing `input`, returning the compressed stream
    ///
    /// errors from the input or the encoder surface as read errors on the
    /// returned stream.
    pub fn compress<R: Read + Send + 'static>(&self, input: R) -> Result<Box<dyn Read + Send>> {
        self.bytes_read.store(BYTES_READ_UNKNOWN, Ordering::Release);
        let bytes_read = Arc::clone(&self.bytes_read);

        match self.kind {
            Compression::None => Ok(Box::new(CountingReader {
                inner: input,
                count: 0,
                published: bytes_read,
            })),
            Compression::Gzip => {
                let block_size = self.gzip_block_size;
                let concurrency = self.gzip_concurrency;
                spawn_encoder("gzip-compress", move |mut writer| {
                    let mut input = input;
                    match gzip::compress_blocks(
                        &mut input,
                        &mut writer,
                        block_size,
                        concurrency,
                        flate2::Compression::default(),
                    ) {
                        Ok(n) => {
                            bytes_read.store(n as i64, Ordering::Release);
                            writer.close();
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "gzip compression failed");
                            writer.close_with_error(e);
                        }
                    }
                })
            }
            Compression::Zstd => {
                let level = self.zstd_level;
                spawn_encoder("zstd-compress", move |mut writer| {
                    let mut input = input;
                    match zstd_encode(&mut input, &mut writer, level) {
                        Ok(n) => {
                            bytes_read.store(n as i64, Ordering::Release);
                            writer.close();
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "zstd compression failed");
                            writer.close_with_error(e);
                        }
                    }
                })
            }
        }
    }
}

/// zstd-compress all of `input` into `writer`, returning the bytes consumed
///
/// the writer is borrowed so the caller still holds it to report a failure,
/// encoder setup included.
fn zstd_encode<R: Read, W: Write>(input: &mut R, writer: W, level: i32) -> io::Result<u64> {
    let mut encoder = zstd::stream::write::Encoder::new(writer, level)?;
    let n = io::copy(input, &mut encoder)?;
    encoder.finish()?;
    Ok(n)
}

/// run `encode` on its own thread, handing it the write end of a new pipe
fn spawn_encoder<F>(name: &'static str, encode: F) -> Result<Box<dyn Read + Send>>
where
    F: FnOnce(PipeWriter) + Send + 'static,
{
    let (writer, reader) = pipe(PIPE_CAPACITY);
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || encode(writer))
        .map_err(|source| Error::Spawn { name, source })?;
    Ok(Box::new(reader))
}

/// passthrough that publishes its byte count at EOF
struct CountingReader<R> {
    inner: R,
    count: i64,
    published: Arc<AtomicI64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.published.store(self.count, Ordering::Release);
        }
        self.count += n as i64;
        Ok(n)
    }
}
