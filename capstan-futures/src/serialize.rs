// Copyright (c) 2013-2016 Sandstorm Development Group, Inc. and contributors
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

//! Asynchronous reading and writing of messages using the
//! [standard stream framing](https://capnproto.org/encoding.html#serialization-over-a-stream).

use capstan::message::{self, ReaderOptions};
use capstan::serialize::{FrameLimits, OwnedSegments};
use capstan::{Error, ErrorKind, OutputSegments, Result, BYTES_PER_WORD};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Begins an asynchronous read of a message from `reader`. Returns `None`
/// on a clean end of stream.
pub async fn read_message<R>(
    reader: R,
    options: ReaderOptions,
) -> Result<Option<message::Reader<OwnedSegments>>>
where
    R: AsyncRead + Unpin,
{
    read_message_with_limits(reader, options, FrameLimits::default()).await
}

pub async fn read_message_with_limits<R>(
    mut reader: R,
    options: ReaderOptions,
    limits: FrameLimits,
) -> Result<Option<message::Reader<OwnedSegments>>>
where
    R: AsyncRead + Unpin,
{
    let Some((total_words, lengths)) = read_segment_table(&mut reader, limits).await? else {
        return Ok(None);
    };
    let mut owned_space = vec![0u8; total_words as usize * BYTES_PER_WORD];
    reader.read_exact(&mut owned_space).await?;
    let segments = OwnedSegments::from_segment_words(&lengths, owned_space)?;
    Ok(Some(message::Reader::new(segments, options)))
}

async fn read_segment_table<R>(
    reader: &mut R,
    limits: FrameLimits,
) -> Result<Option<(u64, Vec<u32>)>>
where
    R: AsyncRead + Unpin,
{
    let mut first_word = [0u8; 8];
    {
        let n = reader.read(&mut first_word[..]).await?;
        if n == 0 {
            return Ok(None);
        } else if n < 8 {
            reader.read_exact(&mut first_word[n..]).await?;
        }
    }

    let segment_count = u32::from_le_bytes(first_word[0..4].try_into().expect("4 bytes"))
        .checked_add(1)
        .ok_or_else(|| Error::from_kind(ErrorKind::SegmentCountLimitExceeded))?;
    if segment_count > limits.max_segment_count {
        return Err(Error::from_kind(ErrorKind::SegmentCountLimitExceeded)
            .context(format!("frame declares {segment_count} segments")));
    }

    let mut lengths = Vec::with_capacity(segment_count as usize);
    lengths.push(u32::from_le_bytes(
        first_word[4..8].try_into().expect("4 bytes"),
    ));

    if segment_count > 1 {
        // Remaining sizes, padded to the word boundary.
        let remaining = (segment_count as usize & !1) * 4;
        let mut table = vec![0u8; remaining];
        reader.read_exact(&mut table).await?;
        for i in 0..(segment_count as usize - 1) {
            lengths.push(u32::from_le_bytes(
                table[i * 4..(i + 1) * 4].try_into().expect("4 bytes"),
            ));
        }
    }

    let mut total_words: u64 = 0;
    for &words in &lengths {
        total_words = total_words
            .checked_add(words as u64)
            .ok_or_else(|| Error::from_kind(ErrorKind::ArithmeticOverflow))?;
    }
    if total_words > limits.max_total_words {
        return Err(Error::from_kind(ErrorKind::FrameTooLarge).context(format!(
            "frame declares {total_words} words; the limit is {}",
            limits.max_total_words
        )));
    }
    Ok(Some((total_words, lengths)))
}

/// Something that contains segments ready to be written out.
pub trait AsOutputSegments {
    fn as_output_segments(&self) -> OutputSegments<'_>;
}

impl<M> AsOutputSegments for &M
where
    M: AsOutputSegments,
{
    fn as_output_segments(&self) -> OutputSegments<'_> {
        (*self).as_output_segments()
    }
}

impl AsOutputSegments for message::Builder {
    fn as_output_segments(&self) -> OutputSegments<'_> {
        self.get_segments_for_output()
    }
}

impl AsOutputSegments for std::rc::Rc<message::Builder> {
    fn as_output_segments(&self) -> OutputSegments<'_> {
        self.get_segments_for_output()
    }
}

/// Writes the provided message to `writer`. Does not call `flush()`.
pub async fn write_message<W, M>(mut writer: W, message: M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: AsOutputSegments,
{
    let segments = message.as_output_segments();
    write_segment_table(&mut writer, &segments[..]).await?;
    for segment in &segments[..] {
        writer.write_all(segment).await?;
    }
    Ok(())
}

async fn write_segment_table<W>(writer: &mut W, segments: &[&[u8]]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let segment_count = segments.len();
    let mut table = Vec::with_capacity(8 + segment_count * 4);
    table.extend_from_slice(&(segment_count as u32 - 1).to_le_bytes());
    for segment in segments {
        table.extend_from_slice(&((segment.len() / BYTES_PER_WORD) as u32).to_le_bytes());
    }
    while table.len() % 8 != 0 {
        table.push(0);
    }
    writer.write_all(&table).await
}

#[cfg(test)]
pub mod test {
    use std::io::Cursor;

    use quickcheck::{quickcheck, TestResult};

    use capstan::message::ReaderSegments;

    use super::*;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("build a single-threaded runtime")
            .block_on(future)
    }

    #[test]
    fn read_segment_table_layouts() {
        let mut buf = vec![];

        buf.extend(
            [
                0, 0, 0, 0, // 1 segment
                0, 0, 0, 0, // 0 length
            ]
            .iter()
            .cloned(),
        );
        let (words, lengths) = block_on(read_segment_table(
            &mut Cursor::new(&buf[..]),
            FrameLimits::default(),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(0, words);
        assert_eq!(vec![0], lengths);
        buf.clear();

        buf.extend(
            [
                1, 0, 0, 0, // 2 segments
                1, 0, 0, 0, // 1 length
                1, 0, 0, 0, // 1 length
                0, 0, 0, 0, // padding
            ]
            .iter()
            .cloned(),
        );
        let (words, lengths) = block_on(read_segment_table(
            &mut Cursor::new(&buf[..]),
            FrameLimits::default(),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(2, words);
        assert_eq!(vec![1, 1], lengths);
        buf.clear();

        buf.extend(
            [
                3, 0, 0, 0, // 4 segments
                77, 0, 0, 0, // 77 length
                23, 0, 0, 0, // 23 length
                1, 0, 0, 0, // 1 length
                99, 0, 0, 0, // 99 length
                0, 0, 0, 0, // padding
            ]
            .iter()
            .cloned(),
        );
        let (words, lengths) = block_on(read_segment_table(
            &mut Cursor::new(&buf[..]),
            FrameLimits::default(),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(200, words);
        assert_eq!(vec![77, 23, 1, 99], lengths);
    }

    #[test]
    fn read_invalid_segment_tables() {
        // Too many segments.
        let mut buf = vec![0, 2, 0, 0];
        buf.extend([0; 513 * 4].iter().cloned());
        assert!(block_on(read_segment_table(
            &mut Cursor::new(&buf[..]),
            FrameLimits::default()
        ))
        .is_err());

        // Segment count wraps.
        let buf = vec![255, 255, 255, 255];
        assert!(block_on(read_segment_table(
            &mut Cursor::new(&buf[..]),
            FrameLimits::default()
        ))
        .is_err());

        // Truncated header.
        let buf = vec![0, 0, 0, 0, 0, 0, 0];
        assert!(block_on(read_segment_table(
            &mut Cursor::new(&buf[..]),
            FrameLimits::default()
        ))
        .is_err());
    }

    #[test]
    fn round_trip_through_async_io() {
        let mut message = message::Builder::new_default();
        message.set_root("async hello").unwrap();

        let mut cursor = Cursor::new(Vec::new());
        block_on(write_message(&mut cursor, &message)).unwrap();
        let buf = cursor.into_inner();

        let reader = block_on(read_message(Cursor::new(&buf[..]), ReaderOptions::new()))
            .unwrap()
            .unwrap();
        let root: capstan::text::Reader = reader.get_root().unwrap();
        assert_eq!(root.to_str().unwrap(), "async hello");

        // A clean end of stream reads as None.
        let end = block_on(read_message(Cursor::new(&[][..]), ReaderOptions::new())).unwrap();
        assert!(end.is_none());
    }

    quickcheck! {
        fn round_trip_arbitrary_roots(text: String) -> TestResult {
            let mut message = message::Builder::new_default();
            if message.set_root(text.as_str()).is_err() {
                return TestResult::discard();
            }
            let mut cursor = Cursor::new(Vec::new());
            block_on(write_message(&mut cursor, &message)).unwrap();
            let buf = cursor.into_inner();
            let reader = block_on(read_message(Cursor::new(&buf[..]), ReaderOptions::new()))
                .unwrap()
                .unwrap();
            let segments = reader.into_segments();
            TestResult::from_bool(segments.get_segment(0).is_some())
        }
    }
}
