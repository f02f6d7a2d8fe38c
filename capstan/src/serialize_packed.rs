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

//! Reading and writing of messages using the
//! [packed stream encoding](https://capnproto.org/encoding.html#packing):
//! each word is preceded by a tag byte with one bit per nonzero byte. An
//! all-zero tag is followed by a count of additional zero words; an all-ones
//! tag is followed by a count of words transmitted verbatim.

use crate::message::{self, ReaderOptions};
use crate::serialize::{self, FrameLimits};
use crate::{Error, ErrorKind, Result, BYTES_PER_WORD};

/// Packs `unpacked`, which must be a whole number of words.
pub fn pack(unpacked: &[u8]) -> Vec<u8> {
    assert!(
        unpacked.len() % BYTES_PER_WORD == 0,
        "packed encoding operates on whole words"
    );
    let words: Vec<&[u8]> = unpacked.chunks(BYTES_PER_WORD).collect();
    let mut out = Vec::with_capacity(unpacked.len() / 4);

    let mut i = 0;
    while i < words.len() {
        let word = words[i];
        let mut tag = 0u8;
        for (bit, &byte) in word.iter().enumerate() {
            if byte != 0 {
                tag |= 1 << bit;
            }
        }
        out.push(tag);
        for &byte in word {
            if byte != 0 {
                out.push(byte);
            }
        }
        i += 1;

        if tag == 0 {
            // Count additional all-zero words.
            let mut run = 0u8;
            while run < u8::MAX && i < words.len() && words[i].iter().all(|&b| b == 0) {
                run += 1;
                i += 1;
            }
            out.push(run);
        } else if tag == 0xff {
            // Count following words dense enough to transmit verbatim: fewer
            // than two zero bytes each.
            let start = i;
            let limit = core::cmp::min(words.len(), i + u8::MAX as usize);
            while i < limit && words[i].iter().filter(|&&b| b == 0).count() < 2 {
                i += 1;
            }
            let run = (i - start) as u8;
            out.push(run);
            for word in &words[start..i] {
                out.extend_from_slice(word);
            }
        }
    }
    out
}

struct PackedCursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> PackedCursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.input.len() - self.pos < n {
            return Err(Error::from_kind(ErrorKind::TruncatedMessage)
                .context("packed input ends mid-word".into()));
        }
        let slice = &self.input[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn at_end(&self) -> bool {
        self.pos == self.input.len()
    }
}

/// Walks one tag group, returning the number of words it expands to.
/// `out`, when present, receives the unpacked bytes.
fn unpack_group(cursor: &mut PackedCursor, out: Option<&mut Vec<u8>>) -> Result<u64> {
    let tag = cursor.take_byte()?;
    match tag {
        0 => {
            let run = cursor.take_byte()? as u64;
            if let Some(out) = out {
                out.resize(out.len() + (1 + run as usize) * BYTES_PER_WORD, 0);
            }
            Ok(1 + run)
        }
        0xff => {
            let word = cursor.take(BYTES_PER_WORD)?;
            let run = cursor.take_byte()? as usize;
            let raw = cursor.take(run * BYTES_PER_WORD)?;
            if let Some(out) = out {
                out.extend_from_slice(word);
                out.extend_from_slice(raw);
            }
            Ok(1 + run as u64)
        }
        tag => {
            let literal_count = tag.count_ones() as usize;
            let literals = cursor.take(literal_count)?;
            if let Some(out) = out {
                let mut next = 0;
                for bit in 0..8 {
                    if tag & (1 << bit) != 0 {
                        out.push(literals[next]);
                        next += 1;
                    } else {
                        out.push(0);
                    }
                }
            }
            Ok(1)
        }
    }
}

/// Unpacks a complete packed stream. Truncated input is rejected.
pub fn unpack(packed: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = PackedCursor {
        input: packed,
        pos: 0,
    };
    let mut out = Vec::with_capacity(packed.len() * 2);
    while !cursor.at_end() {
        unpack_group(&mut cursor, Some(&mut out))?;
    }
    Ok(out)
}

/// Returns the exact unpacked size of a packed stream, in bytes, without
/// materializing it. Truncated input is rejected.
pub fn estimate_unpacked_size(packed: &[u8]) -> Result<usize> {
    let mut cursor = PackedCursor {
        input: packed,
        pos: 0,
    };
    let mut words: u64 = 0;
    while !cursor.at_end() {
        words = words
            .checked_add(unpack_group(&mut cursor, None)?)
            .ok_or_else(|| Error::from_kind(ErrorKind::ArithmeticOverflow))?;
    }
    usize::try_from(words * BYTES_PER_WORD as u64)
        .map_err(|_| Error::from_kind(ErrorKind::ArithmeticOverflow))
}

/// Writes the message to `write` in packed form.
pub fn write_packed_message<W>(write: &mut W, message: &message::Builder) -> Result<()>
where
    W: std::io::Write,
{
    let framed = serialize::write_message_to_bytes(message);
    write.write_all(&pack(&framed))?;
    Ok(())
}

/// Frames and packs the message into a fresh byte vector.
pub fn write_packed_message_to_bytes(message: &message::Builder) -> Vec<u8> {
    pack(&serialize::write_message_to_bytes(message))
}

/// Reads a message from a complete packed stream.
pub fn read_packed_message(
    packed: &[u8],
    options: ReaderOptions,
) -> Result<message::Reader<serialize::OwnedSegments>> {
    let unpacked = unpack(packed)?;
    serialize::read_message_from_owned_bytes(unpacked, options, FrameLimits::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    fn assert_pack_round_trip(unpacked: &[u8], packed: &[u8]) {
        assert_eq!(pack(unpacked), packed);
        assert_eq!(unpack(packed).unwrap(), unpacked);
        assert_eq!(estimate_unpacked_size(packed).unwrap(), unpacked.len());
    }

    #[test]
    fn known_vectors() {
        assert_pack_round_trip(&[], &[]);
        assert_pack_round_trip(&[0; 8], &[0, 0]);
        assert_pack_round_trip(&[0; 16], &[0, 1]);
        assert_pack_round_trip(
            &[0, 0, 12, 0, 0, 34, 0, 0],
            &[0b0010_0100, 12, 34],
        );
        assert_pack_round_trip(
            &[1, 3, 2, 4, 5, 7, 6, 8],
            &[0xff, 1, 3, 2, 4, 5, 7, 6, 8, 0],
        );
        assert_pack_round_trip(
            &[
                0, 0, 0, 0, 0, 0, 0, 0, //
                0, 0, 0, 0, 0, 0, 0, 0, //
                8, 0, 0, 0, 3, 0, 2, 0, //
                25, 0, 0, 0, 170, 1, 0, 0, //
            ],
            &[
                0x00, 1, //
                0x51, 8, 3, 2, //
                0x31, 25, 170, 1, //
            ],
        );
    }

    #[test]
    fn literal_run_extends_across_dense_words() {
        let unpacked = [
            0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa, 0x99, 0x88, //
            1, 2, 3, 4, 5, 6, 7, 8, //
            9, 10, 11, 12, 13, 14, 15, 16, //
        ];
        let packed = pack(&unpacked);
        assert_eq!(packed[0], 0xff);
        // Two additional verbatim words follow the tagged one.
        assert_eq!(packed[9], 2);
        assert_eq!(unpack(&packed).unwrap(), unpacked);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let packed = pack(&[1, 3, 2, 4, 5, 7, 6, 8]);
        for cut in 1..packed.len() {
            let err = unpack(&packed[..cut]).unwrap_err();
            assert_eq!(err.kind, ErrorKind::TruncatedMessage, "cut at {cut}");
        }
        assert_eq!(
            estimate_unpacked_size(&packed[..3]).unwrap_err().kind,
            ErrorKind::TruncatedMessage
        );
    }

    #[test]
    fn packed_message_round_trip() {
        let mut message = message::Builder::new_default();
        message.set_root("packed hello").unwrap();
        let bytes = write_packed_message_to_bytes(&message);
        let reader = read_packed_message(&bytes, ReaderOptions::new()).unwrap();
        let root: crate::text::Reader = reader.get_root().unwrap();
        assert_eq!(root.to_str().unwrap(), "packed hello");
    }

    quickcheck! {
        fn round_trip(words: Vec<u64>) -> bool {
            let mut unpacked = Vec::with_capacity(words.len() * 8);
            for w in &words {
                unpacked.extend_from_slice(&w.to_le_bytes());
            }
            let packed = pack(&unpacked);
            unpack(&packed).unwrap() == unpacked
                && estimate_unpacked_size(&packed).unwrap() == unpacked.len()
        }

        fn unpack_never_panics(bytes: Vec<u8>) -> bool {
            // Arbitrary input must either unpack or produce a typed error.
            match unpack(&bytes) {
                Ok(out) => out.len() % BYTES_PER_WORD == 0,
                Err(e) => e.kind == ErrorKind::TruncatedMessage,
            }
        }
    }
}
