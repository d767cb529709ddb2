//! Chunk codec: snapshot → size-bounded, compressed, checksummed chunks
//!
//! Chapters are packed greedily in document order. The running chunk is
//! sealed only when adding the next chapter would push it strictly past the
//! threshold and it already holds at least one chapter; reaching the
//! threshold exactly does not seal. A chapter larger than the threshold is
//! emitted alone and never split, so every chunk renders on its own.
//!
//! Payloads are the canonical JSON encoding of the chunk's chapters, gzip
//! compressed with a fixed level and a zeroed header timestamp. Checksums are
//! SHA-256 over the compressed bytes, which makes them a pure function of
//! content: the same chapters produce the same checksum in every bundle
//! version.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::ops::Range;

use crate::config::DEFAULT_CHUNK_THRESHOLD;
use crate::error::{BundlecastError, Result};
use crate::snapshot::{Chapter, DocumentSnapshot};

/// One sealed chunk ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub index: u32,
    /// gzip-compressed payload
    pub payload: Vec<u8>,
    pub checksum: String,
    pub size: u64,
    pub compressed_size: u64,
    pub chapter_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkCodec {
    threshold: usize,
    level: u32,
}

impl Default for ChunkCodec {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_THRESHOLD, 6)
    }
}

impl ChunkCodec {
    pub fn new(threshold: usize, level: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            level: level.min(9),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Group unit sizes into chunk ranges
    pub fn plan(&self, sizes: &[usize]) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut start = 0;
        let mut current = 0usize;

        for (i, &size) in sizes.iter().enumerate() {
            if i > start && current.saturating_add(size) > self.threshold {
                ranges.push(start..i);
                start = i;
                current = 0;
            }
            current = current.saturating_add(size);
        }

        if start < sizes.len() {
            ranges.push(start..sizes.len());
        }

        ranges
    }

    /// Split a snapshot into compressed chunks
    pub fn encode(&self, snapshot: &DocumentSnapshot) -> Result<Vec<EncodedChunk>> {
        let encoded: Vec<Vec<u8>> = snapshot
            .chapters
            .iter()
            .map(serde_json::to_vec)
            .collect::<std::result::Result<_, _>>()?;
        let sizes: Vec<usize> = encoded.iter().map(Vec::len).collect();

        self.plan(&sizes)
            .into_iter()
            .enumerate()
            .map(|(index, range)| {
                let chapters = &snapshot.chapters[range];
                let raw = serde_json::to_vec(chapters)?;
                let payload = compress(&raw, self.level)?;
                Ok(EncodedChunk {
                    index: index as u32,
                    checksum: checksum(&payload),
                    size: raw.len() as u64,
                    compressed_size: payload.len() as u64,
                    payload,
                    chapter_ids: chapters.iter().map(|c| c.id.clone()).collect(),
                })
            })
            .collect()
    }
}

/// Decompress and parse a chunk payload
pub fn decode_chunk(payload: &[u8]) -> Result<Vec<Chapter>> {
    let mut raw = Vec::new();
    GzDecoder::new(payload)
        .read_to_end(&mut raw)
        .map_err(|e| BundlecastError::InvalidInput(format!("Corrupt chunk payload: {}", e)))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Hex SHA-256 of a byte slice
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest over the ordered concatenation of chunk checksums
pub fn manifest_checksum<S: AsRef<str>>(checksums: &[S]) -> String {
    let mut hasher = Sha256::new();
    for c in checksums {
        hasher.update(c.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn compress(raw: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::new(level));
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}
