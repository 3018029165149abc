//! Packet accumulator
//!
//! [`MemoryPacket`] holds the bytes an unpacker has received but not yet
//! resolved into frames, as an ordered queue of [`MemoryBlock`]s. Searching,
//! indexing and copying work on the logical concatenation of the block
//! segments without ever materializing it.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::error::{BytesIoError, BytesIoResult};
use crate::pool::MemoryBlock;

/// Blocks at most this long are copied into the spare room of the tail
/// block instead of being queued, so a trickle of small reads does not pin
/// one receive block each.
pub const COMPACT_THRESHOLD: usize = 1024;

/// Ordered sequence of blocks forming one logical byte string.
#[derive(Debug, Default)]
pub struct MemoryPacket {
    blocks: VecDeque<MemoryBlock>,
    len: usize,
}

impl MemoryPacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_block(block: MemoryBlock) -> Self {
        let mut packet = Self::new();
        packet.append(block);
        packet
    }

    /// Enqueue a block at the end. Empty blocks are released immediately,
    /// small ones are merged into the tail block when it has room.
    pub fn append(&mut self, block: MemoryBlock) {
        if block.is_empty() {
            return;
        }
        self.len += block.len();
        if block.len() <= COMPACT_THRESHOLD {
            if let Some(tail) = self.blocks.back_mut() {
                if tail.try_extend(&block) {
                    return;
                }
            }
        }
        self.blocks.push_back(block);
    }

    /// Total number of buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Segments in order, one per block.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.blocks.iter().map(MemoryBlock::as_slice)
    }

    /// Bytes in order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.segments().flat_map(|segment| segment.iter().copied())
    }

    /// Byte at a logical position.
    pub fn byte_at(&self, mut index: usize) -> Option<u8> {
        for segment in self.segments() {
            if index < segment.len() {
                return Some(segment[index]);
            }
            index -= segment.len();
        }
        None
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        prefix.len() <= self.len && self.iter().zip(prefix).all(|(a, &b)| a == b)
    }

    /// Position of the first occurrence of `needle`, searching across block
    /// boundaries (Knuth-Morris-Pratt). An empty needle matches at 0.
    pub fn index_of(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        if needle.len() > self.len {
            return None;
        }

        let failure = failure_table(needle);
        let mut matched = 0;
        for (position, byte) in self.iter().enumerate() {
            while matched > 0 && needle[matched] != byte {
                matched = failure[matched - 1];
            }
            if needle[matched] == byte {
                matched += 1;
                if matched == needle.len() {
                    return Some(position + 1 - matched);
                }
            }
        }
        None
    }

    /// Copy `count` bytes starting at logical `offset`.
    pub fn read(&self, count: usize, offset: usize) -> BytesIoResult<Bytes> {
        let end = offset.checked_add(count).filter(|&end| end <= self.len);
        if end.is_none() {
            return Err(BytesIoError::OutOfRange {
                offset,
                count,
                available: self.len,
            });
        }

        let mut out = BytesMut::with_capacity(count);
        let mut skip = offset;
        for segment in self.segments() {
            if out.len() == count {
                break;
            }
            if skip >= segment.len() {
                skip -= segment.len();
                continue;
            }
            let take = (segment.len() - skip).min(count - out.len());
            out.extend_from_slice(&segment[skip..skip + take]);
            skip = 0;
        }
        Ok(out.freeze())
    }

    /// Copy out everything.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for segment in self.segments() {
            out.extend_from_slice(segment);
        }
        out
    }

    /// Drop `n` bytes from the front.
    ///
    /// Fully covered blocks are released; a partially covered block has its
    /// segment advanced in place.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`len`](Self::len).
    pub fn skip(&mut self, n: usize) {
        assert!(
            n <= self.len,
            "skip {} exceeds packet length {}",
            n,
            self.len
        );

        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.blocks.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.blocks.pop_front();
            } else {
                front.advance(remaining);
                remaining = 0;
            }
        }
        self.len -= n;
    }

    /// Release every block.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.len = 0;
    }
}

fn failure_table(needle: &[u8]) -> Vec<usize> {
    let mut table = vec![0; needle.len()];
    let mut k = 0;
    for i in 1..needle.len() {
        while k > 0 && needle[i] != needle[k] {
            k = table[k - 1];
        }
        if needle[i] == needle[k] {
            k += 1;
        }
        table[i] = k;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryBlockPool;

    fn packet_of(chunks: &[&[u8]]) -> MemoryPacket {
        let mut packet = MemoryPacket::new();
        for chunk in chunks {
            packet.append(MemoryBlock::copy_from_slice(chunk));
        }
        packet
    }

    #[test]
    fn test_length_is_sum_of_segments() {
        let packet = packet_of(&[b"ab", b"", b"cde"]);
        assert_eq!(packet.len(), 5);
        assert_eq!(packet.block_count(), 2);
        assert_eq!(packet.to_vec(), b"abcde");
    }

    #[test]
    fn test_index_of_spans_blocks() {
        let packet = packet_of(&[b"xxA", b"B", b"Cyy"]);
        assert_eq!(packet.index_of(b"ABC"), Some(2));
        assert_eq!(packet.index_of(b"yy"), Some(5));
        assert_eq!(packet.index_of(b"CA"), None);
        assert_eq!(packet.index_of(b""), Some(0));
    }

    #[test]
    fn test_index_of_finds_first_occurrence_after_partial_match() {
        // "AAB" inside "AAAB" needs the failure table to restart correctly
        let packet = packet_of(&[b"AA", b"AB", b"AAB"]);
        assert_eq!(packet.index_of(b"AAB"), Some(1));
    }

    #[test]
    fn test_byte_at_and_starts_with() {
        let packet = packet_of(&[b"ab", b"cd"]);
        assert_eq!(packet.byte_at(0), Some(b'a'));
        assert_eq!(packet.byte_at(3), Some(b'd'));
        assert_eq!(packet.byte_at(4), None);
        assert!(packet.starts_with(b"abc"));
        assert!(!packet.starts_with(b"abcde"));
    }

    #[test]
    fn test_read_across_blocks() {
        let packet = packet_of(&[b"hel", b"lo ", b"world"]);
        assert_eq!(&packet.read(5, 0).unwrap()[..], b"hello");
        assert_eq!(&packet.read(7, 4).unwrap()[..], b"o world");
        assert_eq!(&packet.read(0, 11).unwrap()[..], b"");
    }

    #[test]
    fn test_read_out_of_range_is_an_error() {
        let packet = packet_of(&[b"abc"]);
        let err = packet.read(2, 2).unwrap_err();
        assert_eq!(
            err,
            BytesIoError::OutOfRange {
                offset: 2,
                count: 2,
                available: 3
            }
        );
        assert!(packet.read(usize::MAX, 1).is_err());
    }

    #[test]
    fn test_skip_advances_partial_block_in_place() {
        let mut packet = packet_of(&[b"abc", b"defg"]);
        packet.skip(4);
        assert_eq!(packet.len(), 3);
        assert_eq!(packet.block_count(), 1);
        assert_eq!(packet.to_vec(), b"efg");
        let front = packet.blocks.front().unwrap();
        assert_eq!(front.offset(), 1);
    }

    #[test]
    fn test_skip_releases_blocks_to_pool() {
        let pool = MemoryBlockPool::new(4, 8);
        let mut packet = MemoryPacket::new();
        for _ in 0..3 {
            packet.append(pool.get());
        }
        assert_eq!(pool.on_loan_count(), 3);

        packet.skip(9);
        assert_eq!(pool.on_loan_count(), 1);
        assert_eq!(pool.idle_count(), 2);

        packet.clear();
        assert_eq!(pool.on_loan_count(), 0);
        assert!(packet.is_empty());
    }

    #[test]
    fn test_small_appends_merge_into_tail_block() {
        let pool = MemoryBlockPool::new(64, 8);
        let mut packet = MemoryPacket::new();
        for chunk in [&b"ab"[..], b"cd", b"e"] {
            let mut block = pool.get();
            block.buffer_mut()[..chunk.len()].copy_from_slice(chunk);
            block.set_segment(0, chunk.len());
            packet.append(block);
        }

        assert_eq!(packet.block_count(), 1);
        assert_eq!(packet.len(), 5);
        assert_eq!(packet.to_vec(), b"abcde");
        assert_eq!(pool.on_loan_count(), 1);

        // No room left after the segment: queued as its own block
        let mut full = pool.get();
        full.buffer_mut().fill(b'z');
        let mut tail = MemoryBlock::copy_from_slice(b"!");
        assert!(!tail.try_extend(b"?"));
        packet.append(full);
        packet.append(MemoryBlock::copy_from_slice(b"!"));
        assert_eq!(packet.block_count(), 3);
        assert_eq!(packet.len(), 5 + 64 + 1);
    }

    #[test]
    #[should_panic(expected = "exceeds packet length")]
    fn test_skip_past_end_panics() {
        let mut packet = packet_of(&[b"abc"]);
        packet.skip(4);
    }
}
