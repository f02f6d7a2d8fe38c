// Copyright (c) 2013-2016 Sandstorm Development Group, Inc. and contributors
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

//! Reading and writing of messages using the
//! [standard stream framing](https://capnproto.org/encoding.html#serialization-over-a-stream):
//! the segment count minus one as a little-endian u32, the size in words of
//! each segment, padding to the next word boundary, then the segments
//! themselves.
//!
//! [Framer] incrementally reassembles messages from arbitrarily chopped byte
//! input, which is how a transport feeds an RPC connection.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::message::{self, ReaderOptions, ReaderSegments};
use crate::{Error, ErrorKind, Result, BYTES_PER_WORD};

/// Byte ranges of each segment. Single-segment messages are the common case
/// and stay off the heap.
type SegmentSlices = SmallVec<[(usize, usize); 1]>;

/// Limits applied while parsing a frame header, before any allocation
/// happens.
#[derive(Clone, Copy, Debug)]
pub struct FrameLimits {
    pub max_segment_count: u32,

    /// Maximum total words across all of a frame's segments.
    pub max_total_words: u64,
}

pub const DEFAULT_FRAME_LIMITS: FrameLimits = FrameLimits {
    max_segment_count: 512,
    max_total_words: 8 * 1024 * 1024,
};

impl Default for FrameLimits {
    fn default() -> Self {
        DEFAULT_FRAME_LIMITS
    }
}

/// Segments owned by the message that contains them.
#[derive(Debug)]
pub struct OwnedSegments {
    /// Byte ranges into `owned_space`, one per segment.
    segment_slices: SegmentSlices,
    owned_space: Vec<u8>,
}

impl OwnedSegments {
    /// Assembles segments from a table of per-segment word counts and the
    /// concatenated segment bytes, as read off a stream.
    pub fn from_segment_words(lengths: &[u32], owned_space: Vec<u8>) -> Result<Self> {
        let mut segment_slices = SegmentSlices::with_capacity(lengths.len());
        let mut offset: usize = 0;
        for &words in lengths {
            let bytes = words as usize * BYTES_PER_WORD;
            let end = offset
                .checked_add(bytes)
                .ok_or_else(|| Error::from_kind(ErrorKind::ArithmeticOverflow))?;
            segment_slices.push((offset, end));
            offset = end;
        }
        if offset != owned_space.len() {
            return Err(Error::from_kind(ErrorKind::TruncatedMessage)
                .context("segment contents do not match the declared lengths".into()));
        }
        Ok(Self {
            segment_slices,
            owned_space,
        })
    }
}

impl ReaderSegments for OwnedSegments {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        if (id as usize) < self.segment_slices.len() {
            let (a, b) = self.segment_slices[id as usize];
            Some(&self.owned_space[a..b])
        } else {
            None
        }
    }

    fn len(&self) -> usize {
        self.segment_slices.len()
    }
}

/// Segments borrowed from a contiguous flat buffer.
#[derive(Debug)]
pub struct SliceSegments<'a> {
    segment_slices: SegmentSlices,
    slice: &'a [u8],
}

impl<'a> ReaderSegments for SliceSegments<'a> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        if (id as usize) < self.segment_slices.len() {
            let (a, b) = self.segment_slices[id as usize];
            Some(&self.slice[a..b])
        } else {
            None
        }
    }

    fn len(&self) -> usize {
        self.segment_slices.len()
    }
}

fn read_u32_le(slice: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&slice[..4]);
    u32::from_le_bytes(bytes)
}

/// Parses the first word of a frame: the segment count.
fn parse_segment_count(word: &[u8], limits: FrameLimits) -> Result<u32> {
    let segment_count_minus_one = read_u32_le(word);
    let segment_count = segment_count_minus_one
        .checked_add(1)
        .ok_or_else(|| Error::from_kind(ErrorKind::SegmentCountLimitExceeded))?;
    if segment_count > limits.max_segment_count {
        return Err(Error::from_kind(ErrorKind::SegmentCountLimitExceeded)
            .context(format!("frame declares {segment_count} segments")));
    }
    Ok(segment_count)
}

/// The number of bytes occupied by the size entries and padding that follow
/// the count word's first size slot. The count shares its word with the
/// first segment size.
fn segment_table_bytes(segment_count: u32) -> usize {
    // 4 bytes for the count, 4 per size, padded to a word boundary.
    let unpadded = 4 + segment_count as usize * 4;
    unpadded.div_ceil(BYTES_PER_WORD) * BYTES_PER_WORD
}

fn parse_segment_sizes(
    table: &[u8],
    segment_count: u32,
    limits: FrameLimits,
) -> Result<(u64, SegmentSlices)> {
    let mut slices = SegmentSlices::with_capacity(segment_count as usize);
    let mut total_words: u64 = 0;
    for i in 0..segment_count as usize {
        let words = read_u32_le(&table[4 + i * 4..]) as u64;
        let start = total_words as usize * BYTES_PER_WORD;
        total_words = total_words
            .checked_add(words)
            .ok_or_else(|| Error::from_kind(ErrorKind::ArithmeticOverflow))?;
        if total_words > limits.max_total_words {
            return Err(Error::from_kind(ErrorKind::FrameTooLarge).context(format!(
                "frame declares at least {total_words} words; the limit is {}",
                limits.max_total_words
            )));
        }
        slices.push((start, total_words as usize * BYTES_PER_WORD));
    }
    Ok((total_words, slices))
}

/// Reads a message from a flat buffer that begins with a frame header.
pub fn read_message_from_flat_slice(
    slice: &[u8],
    options: ReaderOptions,
) -> Result<message::Reader<SliceSegments<'_>>> {
    read_message_from_flat_slice_with_limits(slice, options, FrameLimits::default())
}

pub fn read_message_from_flat_slice_with_limits(
    slice: &[u8],
    options: ReaderOptions,
    limits: FrameLimits,
) -> Result<message::Reader<SliceSegments<'_>>> {
    if slice.len() < 4 {
        return Err(Error::from_kind(ErrorKind::TruncatedMessage));
    }
    let segment_count = parse_segment_count(slice, limits)?;
    let table_len = segment_table_bytes(segment_count);
    if slice.len() < table_len {
        return Err(Error::from_kind(ErrorKind::TruncatedMessage));
    }
    let (total_words, segment_slices) =
        parse_segment_sizes(&slice[..table_len], segment_count, limits)?;
    let body = &slice[table_len..];
    if (body.len() as u64) < total_words * BYTES_PER_WORD as u64 {
        return Err(Error::from_kind(ErrorKind::TruncatedMessage));
    }
    Ok(message::Reader::new(
        SliceSegments {
            segment_slices,
            slice: &body[..total_words as usize * BYTES_PER_WORD],
        },
        options,
    ))
}

/// Reads a message from an owned flat buffer that begins with a frame
/// header, taking ownership of the segment content.
pub fn read_message_from_owned_bytes(
    bytes: Vec<u8>,
    options: ReaderOptions,
    limits: FrameLimits,
) -> Result<message::Reader<OwnedSegments>> {
    if bytes.len() < 4 {
        return Err(Error::from_kind(ErrorKind::TruncatedMessage));
    }
    let segment_count = parse_segment_count(&bytes, limits)?;
    let table_len = segment_table_bytes(segment_count);
    if bytes.len() < table_len {
        return Err(Error::from_kind(ErrorKind::TruncatedMessage));
    }
    let (total_words, segment_slices) =
        parse_segment_sizes(&bytes[..table_len], segment_count, limits)?;
    let body_len = total_words as usize * BYTES_PER_WORD;
    if bytes.len() - table_len < body_len {
        return Err(Error::from_kind(ErrorKind::TruncatedMessage));
    }
    let mut owned_space = bytes;
    owned_space.drain(..table_len);
    owned_space.truncate(body_len);
    Ok(message::Reader::new(
        OwnedSegments {
            segment_slices,
            owned_space,
        },
        options,
    ))
}

/// Writes the segment table for `segments` to `write`.
pub fn write_segment_table<W>(write: &mut W, segments: &[&[u8]]) -> std::io::Result<()>
where
    W: std::io::Write,
{
    let segment_count = segments.len();
    let mut table = Vec::with_capacity(segment_table_bytes(segment_count as u32));
    table.extend_from_slice(&(segment_count as u32 - 1).to_le_bytes());
    for segment in segments {
        table.extend_from_slice(&((segment.len() / BYTES_PER_WORD) as u32).to_le_bytes());
    }
    while table.len() % BYTES_PER_WORD != 0 {
        table.push(0);
    }
    write.write_all(&table)
}

/// Writes the provided message to `write`. Does not call `flush()`.
pub fn write_message<W>(write: &mut W, message: &message::Builder) -> Result<()>
where
    W: std::io::Write,
{
    let segments = message.get_segments_for_output();
    write_segment_table(write, &segments)?;
    for segment in &*segments {
        write.write_all(segment)?;
    }
    Ok(())
}

/// Frames the message into a fresh byte vector.
pub fn write_message_to_bytes(message: &message::Builder) -> Vec<u8> {
    let mut bytes = Vec::new();
    write_message(&mut bytes, message).expect("writing to a Vec cannot fail");
    bytes
}

enum FramerState {
    AwaitingHeader,
    AwaitingSegmentSizes {
        segment_count: u32,
    },
    AwaitingPayload {
        total_words: u64,
        segment_slices: SegmentSlices,
    },
}

/// Incremental frame reassembly. Push byte chunks of any size; pop complete
/// messages.
pub struct Framer {
    state: FramerState,
    buf: Vec<u8>,
    options: ReaderOptions,
    limits: FrameLimits,
    complete: VecDeque<message::Reader<OwnedSegments>>,
}

impl Framer {
    pub fn new(options: ReaderOptions, limits: FrameLimits) -> Self {
        Self {
            state: FramerState::AwaitingHeader,
            buf: Vec::new(),
            options,
            limits,
            complete: VecDeque::new(),
        }
    }

    /// Consumes as much of the accumulated input as possible, queuing each
    /// completed message. An error poisons the current frame; the connection
    /// that owns this framer is expected to abort.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(bytes);
        loop {
            match &self.state {
                FramerState::AwaitingHeader => {
                    if self.buf.len() < 4 {
                        return Ok(());
                    }
                    let segment_count = parse_segment_count(&self.buf, self.limits)?;
                    self.state = FramerState::AwaitingSegmentSizes { segment_count };
                }
                FramerState::AwaitingSegmentSizes { segment_count } => {
                    let segment_count = *segment_count;
                    let table_len = segment_table_bytes(segment_count);
                    if self.buf.len() < table_len {
                        return Ok(());
                    }
                    let (total_words, segment_slices) =
                        parse_segment_sizes(&self.buf[..table_len], segment_count, self.limits)?;
                    self.buf.drain(..table_len);
                    self.state = FramerState::AwaitingPayload {
                        total_words,
                        segment_slices,
                    };
                }
                FramerState::AwaitingPayload {
                    total_words,
                    segment_slices,
                } => {
                    let body_len = *total_words as usize * BYTES_PER_WORD;
                    if self.buf.len() < body_len {
                        return Ok(());
                    }
                    let owned_space: Vec<u8> = self.buf.drain(..body_len).collect();
                    let segments = OwnedSegments {
                        segment_slices: segment_slices.clone(),
                        owned_space,
                    };
                    self.complete
                        .push_back(message::Reader::new(segments, self.options));
                    self.state = FramerState::AwaitingHeader;
                }
            }
        }
    }

    /// Pops the next completed message, in arrival order.
    pub fn next_message(&mut self) -> Option<message::Reader<OwnedSegments>> {
        self.complete.pop_front()
    }

    /// Bytes buffered but not yet part of a completed message.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Builder;

    fn sample_message() -> Builder {
        let mut message = Builder::new_default();
        message.set_root("hello").unwrap();
        message
    }

    #[test]
    fn segment_table_layout() {
        let segment_0 = [0u8; 0];
        let segment_1 = [1u8; 8];
        let segment_199 = [199u8; 199 * 8];

        let mut buf = vec![];
        write_segment_table(&mut buf, &[&segment_0]).unwrap();
        assert_eq!(
            &[
                0, 0, 0, 0, // 1 segment
                0, 0, 0, 0, // 0 length
            ],
            &buf[..]
        );
        buf.clear();

        write_segment_table(&mut buf, &[&segment_199, &segment_1, &segment_199, &segment_0])
            .unwrap();
        assert_eq!(
            &[
                3, 0, 0, 0, // 4 segments
                199, 0, 0, 0, // 199 length
                1, 0, 0, 0, // 1 length
                199, 0, 0, 0, // 199 length
                0, 0, 0, 0, // 0 length
                0, 0, 0, 0, // padding
            ],
            &buf[..]
        );
    }

    #[test]
    fn flat_round_trip() {
        let message = sample_message();
        let bytes = write_message_to_bytes(&message);
        let reader = read_message_from_flat_slice(&bytes, ReaderOptions::new()).unwrap();
        let root: crate::text::Reader = reader.get_root().unwrap();
        assert_eq!(root.to_str().unwrap(), "hello");
    }

    #[test]
    fn framer_handles_chopped_input() {
        let message = sample_message();
        let mut bytes = write_message_to_bytes(&message);
        let second_copy = bytes.clone();
        bytes.extend_from_slice(&second_copy);

        let mut framer = Framer::new(ReaderOptions::new(), FrameLimits::default());
        for chunk in bytes.chunks(3) {
            framer.push(chunk).unwrap();
        }
        let mut count = 0;
        while let Some(reader) = framer.next_message() {
            let root: crate::text::Reader = reader.get_root().unwrap();
            assert_eq!(root.to_str().unwrap(), "hello");
            count += 1;
        }
        assert_eq!(count, 2);
        assert_eq!(framer.pending_bytes(), 0);
    }

    #[test]
    fn segment_count_overflow_is_rejected() {
        // segment_count_minus_one == 0xFFFFFFFF must not wrap to zero.
        let mut framer = Framer::new(ReaderOptions::new(), FrameLimits::default());
        let err = framer.push(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SegmentCountLimitExceeded);
    }

    #[test]
    fn too_many_segments_is_rejected() {
        let mut framer = Framer::new(ReaderOptions::new(), FrameLimits::default());
        let err = framer.push(&1024u32.to_le_bytes()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SegmentCountLimitExceeded);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&0u32.to_le_bytes()); // 1 segment
        bytes.extend_from_slice(&u32::MAX.to_le_bytes()); // enormous
        let mut framer = Framer::new(ReaderOptions::new(), FrameLimits::default());
        let err = framer.push(&bytes).unwrap_err();
        assert_eq!(err.kind, ErrorKind::FrameTooLarge);
    }

    #[test]
    fn truncated_flat_slice_is_rejected() {
        let message = sample_message();
        let bytes = write_message_to_bytes(&message);
        let err =
            read_message_from_flat_slice(&bytes[..bytes.len() - 1], ReaderOptions::new())
                .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TruncatedMessage);
    }
}
