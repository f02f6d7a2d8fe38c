// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Segment arenas: the read-side view over borrowed segments and the
//! write-side bump allocator that owns a message's memory.

use core::cell::Cell;

use crate::message::{AllocationStrategy, ReaderOptions, ReaderSegments};
use crate::{Error, ErrorKind, OutputSegments, Result, BYTES_PER_WORD};

/// Charges words read against the traversal budget.
///
/// The budget exists for security reasons: an attacker can construct a message
/// in which multiple pointers point at the same location, making a small
/// message appear enormous when traversed.
#[derive(Debug)]
pub struct ReadLimiter {
    limit: Cell<Option<usize>>,
}

impl ReadLimiter {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit: Cell::new(limit),
        }
    }

    pub fn can_read(&self, amount: usize) -> Result<()> {
        match self.limit.get() {
            None => Ok(()),
            Some(remaining) if amount <= remaining => {
                self.limit.set(Some(remaining - amount));
                Ok(())
            }
            Some(_) => Err(Error::from_kind(ErrorKind::TraversalLimitExceeded)),
        }
    }
}

/// Read-side access to a message's segments, plus the resource limits that
/// bound traversal of untrusted input.
pub trait ReaderArena {
    fn get_segment(&self, id: u32) -> Result<&[u8]>;

    /// Charges `words` against the traversal budget.
    fn amplified_read(&self, words: u64) -> Result<()>;

    fn nesting_limit(&self) -> i32;
}

#[derive(Debug)]
pub struct ReaderArenaImpl<S> {
    segments: S,
    read_limiter: ReadLimiter,
    nesting_limit: i32,
}

impl<S> ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        Self {
            segments,
            read_limiter: ReadLimiter::new(options.traversal_limit_in_words),
            nesting_limit: options.nesting_limit,
        }
    }

    pub fn into_segments(self) -> S {
        self.segments
    }
}

impl<S> ReaderArena for ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    fn get_segment(&self, id: u32) -> Result<&[u8]> {
        match self.segments.get_segment(id) {
            Some(seg) => {
                if seg.len() % BYTES_PER_WORD != 0 {
                    return Err(Error::from_kind(ErrorKind::InvalidSegmentId)
                        .context(format!("segment {id} is not a whole number of words")));
                }
                Ok(seg)
            }
            None => Err(Error::from_kind(ErrorKind::InvalidSegmentId)
                .context(format!("no segment with id {id}"))),
        }
    }

    fn amplified_read(&self, words: u64) -> Result<()> {
        let words = usize::try_from(words)
            .map_err(|_| Error::from_kind(ErrorKind::TraversalLimitExceeded))?;
        self.read_limiter.can_read(words)
    }

    fn nesting_limit(&self) -> i32 {
        self.nesting_limit
    }
}

#[derive(Debug)]
struct BuilderSegment {
    /// Zeroed backing memory, `capacity * 8` bytes.
    data: Vec<u8>,

    /// Watermark, in words, of the allocated prefix.
    allocated: u32,

    /// Capacity in words.
    capacity: u32,
}

/// Owns a message's segments while it is being built. Allocation is a bump
/// watermark per segment; when a request does not fit, a new segment is
/// created and the caller emits a far pointer at the original slot.
#[derive(Debug)]
pub struct BuilderArena {
    segments: Vec<BuilderSegment>,
    next_size: u32,
    allocation_strategy: AllocationStrategy,
    max_segment_words: u32,
}

pub const SUGGESTED_FIRST_SEGMENT_WORDS: u32 = 1024;
pub const MAX_SEGMENT_WORDS: u32 = 1 << 29;

impl BuilderArena {
    pub fn new(first_segment_words: u32, allocation_strategy: AllocationStrategy) -> Self {
        Self {
            segments: Vec::new(),
            next_size: first_segment_words.clamp(1, MAX_SEGMENT_WORDS),
            allocation_strategy,
            max_segment_words: MAX_SEGMENT_WORDS,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Creates a new segment of at least `minimum_size` words and returns its
    /// id.
    pub fn create_segment(&mut self, minimum_size: u32) -> Result<u32> {
        if minimum_size > self.max_segment_words {
            return Err(Error::from_kind(ErrorKind::ArithmeticOverflow)
                .context(format!("segment of {minimum_size} words exceeds maximum")));
        }
        let size = core::cmp::max(minimum_size, self.next_size);
        let byte_len = size as usize * BYTES_PER_WORD;
        let mut data = Vec::new();
        data.try_reserve_exact(byte_len)
            .map_err(|_| Error::from_kind(ErrorKind::OutOfMemory))?;
        data.resize(byte_len, 0);

        if let AllocationStrategy::GrowHeuristically = self.allocation_strategy {
            if size < self.max_segment_words - self.next_size {
                self.next_size += size;
            } else {
                self.next_size = self.max_segment_words;
            }
        }

        let id = self.segments.len() as u32;
        self.segments.push(BuilderSegment {
            data,
            allocated: 0,
            capacity: size,
        });
        Ok(id)
    }

    /// Bump-allocates `words` in the given segment, returning the word offset
    /// of the allocation, or `None` if it does not fit.
    pub fn allocate(&mut self, segment_id: u32, words: u32) -> Option<u32> {
        let seg = &mut self.segments[segment_id as usize];
        let offset = seg.allocated;
        match offset.checked_add(words) {
            Some(end) if end <= seg.capacity => {
                seg.allocated = end;
                Some(offset)
            }
            _ => None,
        }
    }

    /// Allocates `words` wherever they fit, creating a new segment if
    /// necessary. Returns (segment id, word offset).
    pub fn allocate_anywhere(&mut self, words: u32) -> Result<(u32, u32)> {
        if !self.segments.is_empty() {
            let last = self.segments.len() as u32 - 1;
            if let Some(offset) = self.allocate(last, words) {
                return Ok((last, offset));
            }
        }
        let id = self.create_segment(words)?;
        let offset = self
            .allocate(id, words)
            .expect("fresh segment must fit its minimum size");
        Ok((id, offset))
    }

    pub fn get_segment(&self, id: u32) -> Result<&[u8]> {
        match self.segments.get(id as usize) {
            Some(seg) => Ok(&seg.data),
            None => Err(Error::from_kind(ErrorKind::InvalidSegmentId)
                .context(format!("no segment with id {id}"))),
        }
    }

    pub fn get_segment_mut(&mut self, id: u32) -> &mut [u8] {
        let seg = &mut self.segments[id as usize];
        &mut seg.data
    }

    /// The allocated prefix of each segment, as it will be written out.
    pub fn get_segments_for_output(&self) -> OutputSegments<'_> {
        if self.segments.len() == 1 {
            let seg = &self.segments[0];
            OutputSegments::SingleSegment([&seg.data[..seg.allocated as usize * BYTES_PER_WORD]])
        } else {
            OutputSegments::MultiSegment(
                self.segments
                    .iter()
                    .map(|seg| &seg.data[..seg.allocated as usize * BYTES_PER_WORD])
                    .collect(),
            )
        }
    }
}

/// Reading back out of a partially built message. Builders enforce their own
/// invariants, so no limits apply.
impl ReaderArena for BuilderArena {
    fn get_segment(&self, id: u32) -> Result<&[u8]> {
        BuilderArena::get_segment(self, id)
    }

    fn amplified_read(&self, _words: u64) -> Result<()> {
        Ok(())
    }

    fn nesting_limit(&self) -> i32 {
        i32::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_limiter_charges_and_trips() {
        let limiter = ReadLimiter::new(Some(10));
        assert!(limiter.can_read(4).is_ok());
        assert!(limiter.can_read(6).is_ok());
        let err = limiter.can_read(1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TraversalLimitExceeded);

        let unlimited = ReadLimiter::new(None);
        assert!(unlimited.can_read(usize::MAX).is_ok());
    }

    #[test]
    fn bump_allocation_spills_to_new_segment() {
        let mut arena = BuilderArena::new(2, AllocationStrategy::FixedSize);
        let seg = arena.create_segment(2).unwrap();
        assert_eq!(seg, 0);
        assert_eq!(arena.allocate(0, 1), Some(0));
        assert_eq!(arena.allocate(0, 1), Some(1));
        assert_eq!(arena.allocate(0, 1), None);

        let (seg, offset) = arena.allocate_anywhere(3).unwrap();
        assert_eq!(seg, 1);
        assert_eq!(offset, 0);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn output_segments_trim_to_watermark() {
        let mut arena = BuilderArena::new(8, AllocationStrategy::FixedSize);
        arena.create_segment(1).unwrap();
        arena.allocate(0, 3);
        let output = arena.get_segments_for_output();
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].len(), 3 * BYTES_PER_WORD);
    }

    #[test]
    fn oversized_segment_request_is_rejected() {
        let mut arena = BuilderArena::new(1, AllocationStrategy::FixedSize);
        let err = arena.create_segment(MAX_SEGMENT_WORDS + 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ArithmeticOverflow);
    }
}
