// src/format/mod.rs

//! Source stream classification
//!
//! The import pipeline consults this exactly once, right after opening the
//! HTTP reader: peek the head of the stream, classify compression from magic
//! bytes, and keep the reader around so `close()` can release the connection
//! later. Decompression itself is not done here; a detected format only
//! selects the matching nbdkit filter stage downstream.

use crate::error::{Error, Result};
use std::io::Read;
use tracing::debug;

/// Bytes peeked from the head of the stream for classification.
const PEEK_LEN: usize = 6;

/// A readable resource with an explicit, fallible release step.
///
/// Dropping a reader releases it too, but close errors would be lost; the
/// pipeline's `close()` contract needs to surface them.
pub trait ReadCloser: Read {
    fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Compression formats recognized at the head of a source stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    /// No compression (raw data)
    None,
    /// Gzip compression (.gz)
    Gzip,
    /// XZ/LZMA compression (.xz)
    Xz,
    /// Zstandard compression (.zst)
    Zstd,
}

impl CompressionFormat {
    /// Detect compression format from magic bytes
    ///
    /// Magic bytes:
    /// - Gzip: `1f 8b`
    /// - XZ: `fd 37 7a 58 5a 00` (FD + "7zXZ" + NUL)
    /// - Zstd: `28 b5 2f fd`
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
            Self::Gzip
        } else if data.len() >= 6
            && data[0] == 0xfd
            && data[1] == 0x37
            && data[2] == 0x7a
            && data[3] == 0x58
            && data[4] == 0x5a
            && data[5] == 0x00
        {
            Self::Xz
        } else if data.len() >= 4
            && data[0] == 0x28
            && data[1] == 0xb5
            && data[2] == 0x2f
            && data[3] == 0xfd
        {
            Self::Zstd
        } else {
            Self::None
        }
    }

    /// Get a human-readable name for this format
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Reader stack built by the pipeline's `info()` step.
///
/// Holds the classification result and the underlying reader until the
/// pipeline is closed.
pub struct FormatReaders {
    reader: Option<Box<dyn ReadCloser + Send>>,
    compression: CompressionFormat,
    total_size: u64,
}

impl FormatReaders {
    /// Peek the head of `reader` and record the classification.
    ///
    /// `total_size` is the length declared by the remote endpoint; it is
    /// advisory only and kept as a sizing hint.
    pub fn new(mut reader: Box<dyn ReadCloser + Send>, total_size: u64) -> Result<Self> {
        let mut head = [0u8; PEEK_LEN];
        let mut filled = 0;
        while filled < PEEK_LEN {
            match reader.read(&mut head[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::ClassificationFailed(e)),
            }
        }
        let compression = CompressionFormat::from_magic_bytes(&head[..filled]);
        debug!(
            "Classified source stream as {} ({} bytes declared)",
            compression, total_size
        );
        Ok(Self {
            reader: Some(reader),
            compression,
            total_size,
        })
    }

    /// The compression format detected at the head of the stream.
    pub fn compression(&self) -> CompressionFormat {
        self.compression
    }

    /// True when the stream needs an xz decompression stage.
    pub fn is_xz(&self) -> bool {
        self.compression == CompressionFormat::Xz
    }

    /// Byte length declared by the remote endpoint (advisory).
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Release the underlying reader.
    ///
    /// Safe to call more than once; a release error is reported only on the
    /// call that actually released the reader.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut reader) = self.reader.take() {
            reader.close().map_err(Error::ResourceReleaseFailed)?;
        }
        Ok(())
    }
}
