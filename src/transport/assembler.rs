//! Out-of-order reassembly of CRYPTO and STREAM data (RFC 9000 §2.2).
//!
//! Fragments are kept in an ordered map keyed by offset and trimmed on
//! insert so stored fragments never overlap. Missing bytes stay missing:
//! `read` only returns data contiguous with what was already read.

use std::collections::BTreeMap;
use std::ops::Range;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result, TransportError};

#[derive(Debug, Default)]
pub struct Assembler {
    chunks: BTreeMap<u64, Bytes>,
    /// Everything below this offset was handed to the reader.
    read_offset: u64,
    /// One past the highest byte received.
    highest: u64,
    final_size: Option<u64>,
    buffered: usize,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` received at `offset`. Duplicate bytes are ignored; the
    /// first copy wins.
    ///
    /// Returns by how much the highest received offset grew, which is what
    /// flow control accounts for.
    pub fn insert(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<u64> {
        let end = offset + data.len() as u64;
        if let Some(size) = self.final_size {
            if end > size || (fin && end != size) {
                return Err(Error::Transport(TransportError::FinalSizeError));
            }
        } else if fin {
            if end < self.highest {
                return Err(Error::Transport(TransportError::FinalSizeError));
            }
            self.final_size = Some(end);
        }

        let grown = end.saturating_sub(self.highest);
        self.highest = self.highest.max(end);

        let mut start = offset.max(self.read_offset);
        while start < end {
            if let Some((&k, chunk)) = self.chunks.range(..=start).next_back() {
                let chunk_end = k + chunk.len() as u64;
                if chunk_end > start {
                    start = chunk_end;
                    continue;
                }
            }
            let next = self
                .chunks
                .range(start..end)
                .next()
                .map_or(end, |(&k, _)| k);
            let piece = &data[(start - offset) as usize..(next - offset) as usize];
            self.buffered += piece.len();
            self.chunks.insert(start, Bytes::copy_from_slice(piece));
            start = next;
        }
        Ok(grown)
    }

    /// Whether bytes are ready at the read offset.
    pub fn has_contiguous(&self) -> bool {
        self.chunks.keys().next() == Some(&self.read_offset)
    }

    /// Take up to `max` contiguous bytes.
    pub fn read(&mut self, max: usize) -> Bytes {
        let mut out = BytesMut::new();
        while out.len() < max {
            let Some(mut entry) = self.chunks.first_entry() else {
                break;
            };
            if *entry.key() != self.read_offset {
                break;
            }
            let want = max - out.len();
            let chunk = entry.get_mut();
            if chunk.len() <= want {
                let chunk = entry.remove();
                self.read_offset += chunk.len() as u64;
                self.buffered -= chunk.len();
                if out.is_empty() && chunk.len() == max {
                    return chunk;
                }
                out.extend_from_slice(&chunk);
            } else {
                let head = chunk.split_to(want);
                let rest = entry.remove();
                self.read_offset += head.len() as u64;
                self.buffered -= head.len();
                out.extend_from_slice(&head);
                self.chunks.insert(self.read_offset, rest);
            }
        }
        out.freeze()
    }

    /// Byte ranges still missing between the read offset and the highest
    /// byte received (or the final size once known).
    pub fn pending_ranges(&self) -> Vec<Range<u64>> {
        let limit = self.final_size.unwrap_or(self.highest);
        let mut gaps = Vec::new();
        let mut cursor = self.read_offset;
        for (&k, chunk) in &self.chunks {
            if k > cursor {
                gaps.push(cursor..k);
            }
            cursor = cursor.max(k + chunk.len() as u64);
        }
        if cursor < limit {
            gaps.push(cursor..limit);
        }
        gaps
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    pub fn highest(&self) -> u64 {
        self.highest
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    /// All bytes up to the final size have been received.
    pub fn is_complete(&self) -> bool {
        self.final_size
            .is_some_and(|size| self.pending_ranges().is_empty() && self.highest == size)
    }

    /// The reader consumed everything up to the final size.
    pub fn is_finished(&self) -> bool {
        self.final_size == Some(self.read_offset)
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Drop buffered data (stream reset).
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.buffered = 0;
    }
}
