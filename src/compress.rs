//! Payload compression.
//!
//! Entries may ask for their contents to be compressed with the `compress`
//! property. The stored form is a 4-byte little-endian length of the
//! compressed stream followed by the stream itself, so trailing padding in the
//! image never reaches the decoder. CBFS files use the bare stream instead.

use std::fmt;
use std::io::{Cursor, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{ConfigError, ContentError, Result};

/// Supported compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Lzma,
    Gzip,
}

impl Compression {
    pub fn from_name(path: &str, name: &str) -> Result<Compression> {
        match name {
            "none" => Ok(Compression::None),
            "lzma" => Ok(Compression::Lzma),
            "gzip" => Ok(Compression::Gzip),
            other => Err(ConfigError::Invalid {
                path: path.to_string(),
                message: format!("Unknown compression algorithm '{other}'"),
            }
            .into()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lzma => "lzma",
            Compression::Gzip => "gzip",
        }
    }

    pub fn is_none(&self) -> bool {
        *self == Compression::None
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn failed(path: &str, algo: Compression, err: impl fmt::Display) -> crate::error::Error {
    ContentError::Compression {
        path: path.to_string(),
        algo: algo.name().to_string(),
        message: err.to_string(),
    }
    .into()
}

/// Compresses `data` into a bare stream.
pub fn compress_raw(path: &str, algo: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match algo {
        Compression::None => Ok(data.to_vec()),
        Compression::Lzma => {
            let options = lzma_rs::compress::Options {
                unpacked_size: lzma_rs::compress::UnpackedSize::WriteToHeader(Some(data.len() as u64)),
            };
            let mut out = Vec::new();
            lzma_rs::lzma_compress_with_options(&mut Cursor::new(data), &mut out, &options)
                .map_err(|e| failed(path, algo, e))?;
            Ok(out)
        }
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::best());
            encoder.write_all(data).map_err(|e| failed(path, algo, e))?;
            encoder.finish().map_err(|e| failed(path, algo, e))
        }
    }
}

/// Decompresses a bare stream.
pub fn decompress_raw(path: &str, algo: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match algo {
        Compression::None => Ok(data.to_vec()),
        Compression::Lzma => {
            let mut out = Vec::new();
            lzma_rs::lzma_decompress(&mut Cursor::new(data), &mut out).map_err(|e| failed(path, algo, e))?;
            Ok(out)
        }
        Compression::Gzip => {
            let mut out = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| failed(path, algo, e))?;
            Ok(out)
        }
    }
}

/// Compresses `data` and prefixes the stream with its length.
pub fn compress(path: &str, algo: Compression, data: &[u8]) -> Result<Vec<u8>> {
    if algo.is_none() {
        return Ok(data.to_vec());
    }
    let stream = compress_raw(path, algo, data)?;
    let mut out = Vec::with_capacity(stream.len() + 4);
    out.extend_from_slice(&(stream.len() as u32).to_le_bytes());
    out.extend_from_slice(&stream);
    Ok(out)
}

/// Reverses [`compress`]. Bytes after the recorded stream length are ignored.
pub fn decompress(path: &str, algo: Compression, data: &[u8]) -> Result<Vec<u8>> {
    if algo.is_none() {
        return Ok(data.to_vec());
    }
    let len = data
        .get(..4)
        .map(|h| u32::from_le_bytes([h[0], h[1], h[2], h[3]]) as usize)
        .ok_or_else(|| failed(path, algo, "missing length header"))?;
    let stream = data
        .get(4..4 + len)
        .ok_or_else(|| failed(path, algo, format!("stream length {len:#x} exceeds the data")))?;
    decompress_raw(path, algo, stream)
}
