//! Receive buffer allocation.
//!
//! Each dispatcher owns one `ReadAllocator`. In preallocating mode a large
//! zeroed `BytesMut` region is carved into per-read chunks with
//! `split_to(n).freeze()`, so every chunk handed to a receive queue shares
//! one allocation and no bytes are copied. When the unused tail drops below
//! `min_size` a fresh region is allocated; chunks still referencing the old
//! region keep it alive until they are consumed.
//!
//! Without preallocation every read goes through a reusable scratch buffer
//! and produces an exact-size copy, trading a memcpy for tight memory usage
//! on many mostly-idle connections.

use crate::config::ReadBufferConfig;
use bytes::{Bytes, BytesMut};
use std::io::{self, Read};

/// Outcome of a single read attempt.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Bytes were read.
    Data(Bytes),
    /// The peer closed its write side.
    Eof,
    /// Nothing available right now.
    WouldBlock,
}

pub struct ReadAllocator {
    /// Unused part of the current preallocated region (zero-filled).
    region: BytesMut,
    /// Scratch space for non-preallocating mode.
    scratch: Vec<u8>,
    size: usize,
    min_size: usize,
    preallocate: bool,
    /// Number of regions allocated so far.
    allocations: u64,
}

impl ReadAllocator {
    pub fn new(config: &ReadBufferConfig) -> Self {
        let size = config.size.max(1);
        Self {
            region: BytesMut::new(),
            scratch: Vec::new(),
            size,
            min_size: config.min_size.clamp(1, size),
            preallocate: config.preallocate,
            allocations: 0,
        }
    }

    /// Read once from `reader`, retrying on `Interrupted`.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<ReadOutcome> {
        if self.preallocate {
            self.read_preallocated(reader)
        } else {
            self.read_exact_size(reader)
        }
    }

    fn read_preallocated<R: Read>(&mut self, reader: &mut R) -> io::Result<ReadOutcome> {
        if self.region.len() < self.min_size {
            self.region = BytesMut::zeroed(self.size);
            self.allocations += 1;
        }

        loop {
            match reader.read(&mut self.region[..]) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => return Ok(ReadOutcome::Data(self.region.split_to(n).freeze())),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn read_exact_size<R: Read>(&mut self, reader: &mut R) -> io::Result<ReadOutcome> {
        if self.scratch.len() != self.size {
            self.scratch = vec![0u8; self.size];
            self.allocations += 1;
        }

        loop {
            match reader.read(&mut self.scratch) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => return Ok(ReadOutcome::Data(Bytes::copy_from_slice(&self.scratch[..n]))),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Unused bytes left in the current region.
    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        self.region.len()
    }

    /// Number of backing regions (or scratch buffers) allocated so far.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    #[cfg(test)]
    pub fn is_preallocating(&self) -> bool {
        self.preallocate
    }
}
