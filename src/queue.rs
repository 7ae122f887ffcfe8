//! Ordered queue of received or pending byte chunks.
//!
//! Chunks are `Bytes` handed over by the socket layer; consuming a prefix
//! splits at most one chunk and never copies the rest of the queue.

use crate::error::{Error, Result};
use crate::scanner::{self, ScanIndex};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Remembered scan progress for a delimiter that has not been found yet.
#[derive(Debug)]
struct PendingScan {
    delimiter: Vec<u8>,
    index: ScanIndex,
}

#[derive(Debug, Default)]
pub struct ChunkQueue {
    chunks: VecDeque<Bytes>,
    len: usize,
    /// Bytes consumed since `mark()`, oldest first. `None` if no mark is set.
    marked: Option<Vec<Bytes>>,
    pending_scan: Option<PendingScan>,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of chunks currently held.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Append a chunk at the tail. Empty chunks are dropped.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Put chunks back at the head, preserving their order.
    pub fn push_front_all(&mut self, chunks: Vec<Bytes>) {
        for chunk in chunks.into_iter().rev() {
            if !chunk.is_empty() {
                self.len += chunk.len();
                self.chunks.push_front(chunk);
            }
        }
        self.pending_scan = None;
    }

    /// Front chunk, if any, without removing it.
    pub fn front(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Drop `n` bytes from the head (used after a partial socket write).
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.len);
        scanner::drop_front(&mut self.chunks, n);
        self.len -= n;
        self.pending_scan = None;
    }

    /// Remove and return every chunk.
    pub fn drain_all(&mut self) -> Vec<Bytes> {
        let len = self.len;
        self.take(len)
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
        self.pending_scan = None;
    }

    /// Iterate the buffered chunks in order.
    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.chunks.iter()
    }

    /// Remove exactly `n` bytes from the head.
    pub fn read_by_length(&mut self, n: usize) -> Result<Vec<Bytes>> {
        if self.len < n {
            return Err(Error::InsufficientData);
        }
        Ok(self.take(n))
    }

    /// Remove exactly `n` bytes from the head as one contiguous buffer.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        let chunks = self.read_by_length(n)?;
        Ok(join(chunks))
    }

    /// Remove everything up to `delimiter`, dropping the delimiter itself.
    /// Fails with `MaxReadSizeExceeded` when the content is, or would have
    /// to be, longer than `max_len`.
    pub fn read_by_delimiter(&mut self, delimiter: &[u8], max_len: usize) -> Result<Vec<Bytes>> {
        let index = self.scan(delimiter);
        if !index.is_found() {
            if index.content_len() > max_len {
                return Err(Error::MaxReadSizeExceeded { max: max_len });
            }
            return Err(Error::InsufficientData);
        }
        if index.content_len() > max_len {
            return Err(Error::MaxReadSizeExceeded { max: max_len });
        }

        self.pending_scan = None;
        let content = self.take(index.content_len());
        self.discard(delimiter.len());
        Ok(content)
    }

    /// Position of `delimiter` relative to the head, if buffered.
    pub fn index_of(&mut self, delimiter: &[u8]) -> Option<usize> {
        let index = self.scan(delimiter);
        index.is_found().then(|| index.content_len())
    }

    /// Scan for `delimiter`, resuming the previous unsuccessful scan for the
    /// same delimiter when nothing was consumed in between.
    fn scan(&mut self, delimiter: &[u8]) -> ScanIndex {
        let prior = match &self.pending_scan {
            Some(pending) if pending.delimiter == delimiter => pending.index,
            _ => ScanIndex::default(),
        };
        let index = scanner::scan_from(&self.chunks, delimiter, prior);
        if index.is_found() {
            self.pending_scan = None;
        } else {
            self.pending_scan = Some(PendingScan {
                delimiter: delimiter.to_vec(),
                index,
            });
        }
        index
    }

    /// Start recording consumed bytes so they can be restored.
    pub fn mark(&mut self) {
        self.marked = Some(Vec::new());
    }

    /// Restore every byte consumed since `mark()`. The mark stays set.
    /// Returns false if no mark was set.
    pub fn reset_to_mark(&mut self) -> bool {
        match self.marked.as_mut() {
            Some(consumed) => {
                let consumed = std::mem::take(consumed);
                self.push_front_all(consumed);
                true
            }
            None => false,
        }
    }

    pub fn remove_mark(&mut self) {
        self.marked = None;
    }

    pub fn has_mark(&self) -> bool {
        self.marked.is_some()
    }

    fn take(&mut self, n: usize) -> Vec<Bytes> {
        let taken = scanner::take_front(&mut self.chunks, n);
        self.len -= n;
        self.pending_scan = None;
        if let Some(consumed) = self.marked.as_mut() {
            consumed.extend(taken.iter().cloned());
        }
        taken
    }

    fn discard(&mut self, n: usize) {
        let dropped = scanner::take_front(&mut self.chunks, n);
        self.len -= n;
        if let Some(consumed) = self.marked.as_mut() {
            consumed.extend(dropped);
        }
    }
}

/// Join chunks into one buffer. A single chunk is returned without copying.
pub fn join(mut chunks: Vec<Bytes>) -> Bytes {
    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.pop().unwrap_or_default(),
        _ => {
            let total = chunks.iter().map(Bytes::len).sum();
            let mut buf = BytesMut::with_capacity(total);
            for chunk in &chunks {
                buf.extend_from_slice(chunk);
            }
            buf.freeze()
        }
    }
}
