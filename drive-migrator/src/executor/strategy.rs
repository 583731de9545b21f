//! Upload strategy selection and chunk framing.

use crate::drive::ByteStream;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;

/// How one file is sent to the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// One PUT carrying the whole content
    Direct,
    /// Upload session with fixed-size, strictly ordered chunks
    Chunked { chunk_size: usize },
}

impl UploadStrategy {
    /// Files of at least `threshold` bytes go through an upload session
    pub fn select(size: u64, threshold: u64, chunk_size: usize) -> Self {
        if size >= threshold {
            UploadStrategy::Chunked { chunk_size }
        } else {
            UploadStrategy::Direct
        }
    }
}

/// Number of chunk requests needed for `size` bytes
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size as u64)
}

/// Re-frames a download stream into chunks of exactly `chunk_size` bytes
/// (the last one may be shorter).
pub struct ChunkReader {
    inner: ByteStream,
    buf: BytesMut,
    chunk_size: usize,
    exhausted: bool,
}

impl ChunkReader {
    pub fn new(inner: ByteStream, chunk_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(chunk_size),
            chunk_size,
            exhausted: false,
        }
    }

    /// Next chunk, or `None` once the source is drained
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        while !self.exhausted && self.buf.len() < self.chunk_size {
            match self.inner.next().await {
                Some(piece) => self.buf.extend_from_slice(&piece?),
                None => self.exhausted = true,
            }
        }

        if self.buf.is_empty() {
            return Ok(None);
        }
        let take = self.buf.len().min(self.chunk_size);
        Ok(Some(self.buf.split_to(take).freeze()))
    }
}
