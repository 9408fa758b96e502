//! Fixed-size chunking of a streaming byte source.
//!
//! Input buffers may have any size. At most one partial chunk is held in
//! memory; input that already spans whole chunks is sliced without copying.

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

use crate::TransferError;

/// An indexed slice of the source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    /// Byte offset of this chunk within the source.
    pub offset: u64,
    pub data: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Number of chunks needed for `len` bytes: ceil(len / chunk_size),
/// saturating at `u32::MAX`.
pub fn chunk_count(len: u64, chunk_size: u64) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    u32::try_from(len.div_ceil(chunk_size)).unwrap_or(u32::MAX)
}

/// Incremental chunker. Feed buffers with [`push`](Self::push), then call
/// [`finish`](Self::finish) once the source is exhausted.
pub struct Chunker {
    chunk_size: usize,
    buf: BytesMut,
    next_index: u32,
    offset: u64,
}

impl Chunker {
    /// Creates a chunker. A `chunk_size` of 0 falls back to [`crate::DEFAULT_CHUNK_SIZE`].
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            crate::DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            chunk_size,
            buf: BytesMut::new(),
            next_index: 0,
            offset: 0,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Chunks produced so far.
    pub fn emitted(&self) -> u32 {
        self.next_index
    }

    /// Bytes currently held back waiting for a full chunk.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feeds one buffer and returns every chunk it completed.
    pub fn push(&mut self, mut data: Bytes) -> Vec<Chunk> {
        let mut out = Vec::new();
        while !data.is_empty() {
            if self.buf.is_empty() && data.len() >= self.chunk_size {
                // Whole chunk available in the input: hand out a zero-copy slice.
                let piece = data.split_to(self.chunk_size);
                out.push(self.emit(piece));
                continue;
            }

            let want = self.chunk_size - self.buf.len();
            let take = want.min(data.len());
            if self.buf.capacity() < self.chunk_size {
                self.buf.reserve(self.chunk_size - self.buf.len());
            }
            self.buf.extend_from_slice(&data.split_to(take));

            if self.buf.len() == self.chunk_size {
                let piece = self.buf.split().freeze();
                out.push(self.emit(piece));
            }
        }
        out
    }

    /// Flushes the trailing short chunk, if any.
    pub fn finish(&mut self) -> Option<Chunk> {
        if self.buf.is_empty() {
            return None;
        }
        let piece = self.buf.split().freeze();
        Some(self.emit(piece))
    }

    fn emit(&mut self, data: Bytes) -> Chunk {
        let chunk = Chunk {
            index: self.next_index,
            offset: self.offset,
            data,
        };
        self.next_index += 1;
        self.offset += chunk.data.len() as u64;
        chunk
    }
}

/// Lazily chunks `source`.
///
/// A source that produces no bytes at all ends the stream with
/// [`TransferError::EmptyUpload`] instead of finishing cleanly.
pub fn chunk_stream<S>(source: S, chunk_size: usize) -> impl Stream<Item = Result<Chunk, TransferError>>
where
    S: Stream<Item = Result<Bytes, TransferError>>,
{
    async_stream::try_stream! {
        let mut chunker = Chunker::new(chunk_size);
        let mut source = std::pin::pin!(source);

        while let Some(buf) = source.next().await {
            let buf = buf?;
            for chunk in chunker.push(buf) {
                yield chunk;
            }
        }

        if let Some(chunk) = chunker.finish() {
            yield chunk;
        }

        if chunker.emitted() == 0 {
            Err::<(), TransferError>(TransferError::EmptyUpload)?;
        }
    }
}
