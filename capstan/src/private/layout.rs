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

//! The encoding layer: wire pointers and the struct/list views over segment
//! memory. Everything here is driven by generated accessor code and by the
//! typed wrappers in the crate root.
//!
//! All arithmetic on sizes and offsets that involves untrusted input uses
//! checked operations. Release builds must behave identically to debug
//! builds on adversarial messages.

use crate::private::arena::{BuilderArena, ReaderArena};
use crate::{Error, ErrorKind, Result, BYTES_PER_WORD};

pub const BITS_PER_BYTE: u64 = 8;
pub const BITS_PER_WORD: u64 = 64;
pub const POINTER_SIZE_IN_WORDS: u32 = 1;

/// Maximum number of elements in a list: the element-count field is 29 bits.
pub const MAX_ELEMENT_COUNT: u32 = (1 << 29) - 1;

const EMPTY_SEGMENT: &[u8] = &[];

/// Read access to segments: a message arena, or a bare single-segment byte
/// slice. The slice form backs pre-encoded default value literals, which
/// carry their own storage and need no limits.
#[derive(Clone, Copy)]
enum ArenaRef<'a> {
    Full(&'a dyn ReaderArena),
    SingleSegment(&'a [u8]),
}

impl<'a> std::fmt::Debug for ArenaRef<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArenaRef::Full(_) => f.write_str("ArenaRef::Full(..)"),
            ArenaRef::SingleSegment(s) => f.debug_tuple("ArenaRef::SingleSegment").field(s).finish(),
        }
    }
}

impl<'a> ArenaRef<'a> {
    fn empty() -> Self {
        ArenaRef::SingleSegment(EMPTY_SEGMENT)
    }

    fn get_segment(&self, id: u32) -> Result<&'a [u8]> {
        match self {
            ArenaRef::Full(arena) => arena.get_segment(id),
            ArenaRef::SingleSegment(segment) => {
                if id == 0 {
                    Ok(segment)
                } else {
                    Err(Error::from_kind(ErrorKind::InvalidSegmentId)
                        .context(format!("no segment with id {id}")))
                }
            }
        }
    }

    fn amplified_read(&self, words: u64) -> Result<()> {
        match self {
            ArenaRef::Full(arena) => arena.amplified_read(words),
            ArenaRef::SingleSegment(_) => Ok(()),
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementSize {
    Void = 0,
    Bit = 1,
    Byte = 2,
    TwoBytes = 3,
    FourBytes = 4,
    EightBytes = 5,
    Pointer = 6,
    InlineComposite = 7,
}

impl ElementSize {
    fn from_tag(tag: u8) -> Self {
        match tag & 7 {
            0 => Self::Void,
            1 => Self::Bit,
            2 => Self::Byte,
            3 => Self::TwoBytes,
            4 => Self::FourBytes,
            5 => Self::EightBytes,
            6 => Self::Pointer,
            _ => Self::InlineComposite,
        }
    }
}

pub fn data_bits_per_element(size: ElementSize) -> u64 {
    match size {
        ElementSize::Void => 0,
        ElementSize::Bit => 1,
        ElementSize::Byte => 8,
        ElementSize::TwoBytes => 16,
        ElementSize::FourBytes => 32,
        ElementSize::EightBytes | ElementSize::Pointer => 64,
        // Step is taken from the tag word instead.
        ElementSize::InlineComposite => 0,
    }
}

/// The size of a struct: data section words and pointer section words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StructSize {
    pub data: u16,
    pub pointers: u16,
}

impl StructSize {
    pub const fn total(self) -> u32 {
        self.data as u32 + self.pointers as u32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WirePointerKind {
    Struct,
    List,
    Far,
    Other,
}

/// One 8-byte tagged pointer word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WirePointer(u64);

impl WirePointer {
    const NULL: Self = Self(0);

    fn kind(self) -> WirePointerKind {
        match self.0 & 3 {
            0 => WirePointerKind::Struct,
            1 => WirePointerKind::List,
            2 => WirePointerKind::Far,
            _ => WirePointerKind::Other,
        }
    }

    fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Signed word offset from the end of the pointer to the start of its
    /// target. Valid for struct and list pointers.
    fn offset(self) -> i32 {
        (self.0 as u32 as i32) >> 2
    }

    /// For the tag word of an inline-composite list, the offset field holds
    /// the element count instead.
    fn inline_composite_element_count(self) -> u32 {
        (self.0 as u32) >> 2
    }

    fn struct_data_words(self) -> u16 {
        (self.0 >> 32) as u16
    }

    fn struct_pointer_count(self) -> u16 {
        (self.0 >> 48) as u16
    }

    fn list_element_size(self) -> ElementSize {
        ElementSize::from_tag((self.0 >> 32) as u8)
    }

    /// Element count, or total content words for inline-composite lists.
    fn list_element_count_or_words(self) -> u32 {
        ((self.0 >> 35) as u32) & MAX_ELEMENT_COUNT
    }

    fn is_double_far(self) -> bool {
        (self.0 >> 2) & 1 == 1
    }

    fn far_offset(self) -> u32 {
        ((self.0 >> 3) as u32) & MAX_ELEMENT_COUNT
    }

    fn far_segment_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    fn cap_index(self) -> u32 {
        (self.0 >> 32) as u32
    }

    fn new_struct(offset: i32, size: StructSize) -> Self {
        Self(
            ((offset as u32 as u64) << 2)
                | ((size.data as u64) << 32)
                | ((size.pointers as u64) << 48),
        )
    }

    /// The tag word that leads an inline-composite list's content.
    fn new_inline_composite_tag(element_count: u32, size: StructSize) -> Self {
        Self(
            ((element_count as u64) << 2)
                | ((size.data as u64) << 32)
                | ((size.pointers as u64) << 48),
        )
    }

    fn new_list(offset: i32, element_size: ElementSize, count_or_words: u32) -> Self {
        Self(
            1 | ((offset as u32 as u64) << 2)
                | ((element_size as u64) << 32)
                | ((count_or_words as u64) << 35),
        )
    }

    fn new_far(double: bool, offset: u32, segment_id: u32) -> Self {
        Self(
            2 | if double { 4 } else { 0 }
                | ((offset as u64) << 3)
                | ((segment_id as u64) << 32),
        )
    }

    fn new_capability(index: u32) -> Self {
        Self(3 | ((index as u64) << 32))
    }
}

fn read_word(segment: &[u8], index: u64) -> u64 {
    let i = index as usize * BYTES_PER_WORD;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&segment[i..i + 8]);
    u64::from_le_bytes(bytes)
}

fn write_word(segment: &mut [u8], index: u32, value: u64) {
    let i = index as usize * BYTES_PER_WORD;
    segment[i..i + 8].copy_from_slice(&value.to_le_bytes());
}

fn segment_words(segment: &[u8]) -> u64 {
    (segment.len() / BYTES_PER_WORD) as u64
}

/// Checks that `[start, start + size)` lies within the segment.
fn bounds_check(segment: &[u8], start: u64, size: u64) -> Result<()> {
    let end = start
        .checked_add(size)
        .ok_or_else(|| Error::from_kind(ErrorKind::ArithmeticOverflow))?;
    if end <= segment_words(segment) {
        Ok(())
    } else {
        Err(Error::from_kind(ErrorKind::InvalidPointer)
            .context("pointer target is outside the bounds of its segment".into()))
    }
}

/// Computes the content start of a struct or list pointer located at
/// `ref_offset`, rejecting targets before the start of the segment.
fn content_start(ref_offset: u64, pointer: WirePointer) -> Result<u64> {
    let start = ref_offset as i64 + 1 + pointer.offset() as i64;
    if start < 0 {
        return Err(Error::from_kind(ErrorKind::InvalidPointer)
            .context("pointer target precedes the start of its segment".into()));
    }
    Ok(start as u64)
}

/// Resolves far indirections. Returns the content-describing pointer, the
/// segment holding the content, and the content's first word.
fn follow_fars<'a>(
    arena: ArenaRef<'a>,
    segment_id: u32,
    ref_offset: u64,
) -> Result<(WirePointer, u32, &'a [u8], u64)> {
    let segment = arena.get_segment(segment_id)?;
    bounds_check(segment, ref_offset, 1)?;
    let pointer = WirePointer(read_word(segment, ref_offset));

    if pointer.kind() != WirePointerKind::Far {
        let start = content_start(ref_offset, pointer)?;
        return Ok((pointer, segment_id, segment, start));
    }

    let pad_segment_id = pointer.far_segment_id();
    let pad_offset = pointer.far_offset() as u64;
    let pad_segment = arena.get_segment(pad_segment_id)?;

    if !pointer.is_double_far() {
        bounds_check(pad_segment, pad_offset, 1)?;
        let pad = WirePointer(read_word(pad_segment, pad_offset));
        if pad.kind() == WirePointerKind::Far {
            return Err(Error::from_kind(ErrorKind::InvalidPointer)
                .context("far pointer landing pad is itself a far pointer".into()));
        }
        let start = content_start(pad_offset, pad)?;
        return Ok((pad, pad_segment_id, pad_segment, start));
    }

    // Double-far: the pad is a far pointer to the content, followed by a tag
    // word describing it.
    bounds_check(pad_segment, pad_offset, 2)?;
    let landing = WirePointer(read_word(pad_segment, pad_offset));
    if landing.kind() != WirePointerKind::Far || landing.is_double_far() {
        return Err(Error::from_kind(ErrorKind::InvalidPointer)
            .context("double-far landing pad must begin with a one-word far pointer".into()));
    }
    let tag = WirePointer(read_word(pad_segment, pad_offset + 1));
    if tag.kind() == WirePointerKind::Far {
        return Err(Error::from_kind(ErrorKind::InvalidPointer)
            .context("double-far tag word must describe content".into()));
    }
    let content_segment_id = landing.far_segment_id();
    let content_segment = arena.get_segment(content_segment_id)?;
    Ok((
        tag,
        content_segment_id,
        content_segment,
        landing.far_offset() as u64,
    ))
}

/// The kind of object a pointer refers to, after far resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerType {
    Null,
    Struct,
    List(ElementSize),
    Capability(u32),
}

// ---------------------------------------------------------------------------
// Primitive elements
// ---------------------------------------------------------------------------

/// A fixed-width scalar that can live in a struct data section or a
/// primitive list.
pub trait PrimitiveElement: Copy + Default + PartialEq + core::fmt::Debug {
    const BITS: u64;

    /// Reads from a little-endian slice of exactly `BITS / 8` bytes
    /// (1 byte for `bool`).
    fn read_from(slice: &[u8]) -> Self;
    fn write_to(self, slice: &mut [u8]);
}

macro_rules! int_element {
    ($t:ty, $bits:expr) => {
        impl PrimitiveElement for $t {
            const BITS: u64 = $bits;
            fn read_from(slice: &[u8]) -> Self {
                let mut bytes = [0u8; ($bits / 8) as usize];
                bytes.copy_from_slice(slice);
                <$t>::from_le_bytes(bytes)
            }
            fn write_to(self, slice: &mut [u8]) {
                slice.copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

int_element!(u8, 8);
int_element!(i8, 8);
int_element!(u16, 16);
int_element!(i16, 16);
int_element!(u32, 32);
int_element!(i32, 32);
int_element!(u64, 64);
int_element!(i64, 64);
int_element!(f32, 32);
int_element!(f64, 64);

impl PrimitiveElement for bool {
    const BITS: u64 = 1;
    fn read_from(slice: &[u8]) -> Self {
        slice[0] & 1 != 0
    }
    fn write_to(self, slice: &mut [u8]) {
        slice[0] = (slice[0] & !1) | self as u8;
    }
}

/// XOR masking against a schema default, so that zeroed memory reads as the
/// default value.
pub trait Masked: PrimitiveElement {
    fn mask(self, mask: Self) -> Self;
}

macro_rules! xor_mask {
    ($t:ty) => {
        impl Masked for $t {
            fn mask(self, mask: Self) -> Self {
                self ^ mask
            }
        }
    };
}

xor_mask!(u8);
xor_mask!(i8);
xor_mask!(u16);
xor_mask!(i16);
xor_mask!(u32);
xor_mask!(i32);
xor_mask!(u64);
xor_mask!(i64);

impl Masked for f32 {
    fn mask(self, mask: Self) -> Self {
        f32::from_bits(self.to_bits() ^ mask.to_bits())
    }
}

impl Masked for f64 {
    fn mask(self, mask: Self) -> Self {
        f64::from_bits(self.to_bits() ^ mask.to_bits())
    }
}

impl Masked for bool {
    fn mask(self, mask: Self) -> Self {
        self ^ mask
    }
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct PointerReader<'a> {
    arena: ArenaRef<'a>,
    segment_id: u32,
    segment: &'a [u8],
    /// Word offset of the pointer within its segment. `None` means this
    /// reader stands in for an absent pointer and reads as null.
    pointer: Option<u64>,
    nesting_limit: i32,
}

impl<'a> PointerReader<'a> {
    pub fn new_default() -> Self {
        Self {
            arena: ArenaRef::empty(),
            segment_id: 0,
            segment: EMPTY_SEGMENT,
            pointer: None,
            nesting_limit: 0x7fff_ffff,
        }
    }

    /// A reader for the root pointer of a message. An empty segment reads as
    /// a null root.
    pub fn get_root(
        arena: &'a dyn ReaderArena,
        segment_id: u32,
        word_offset: u64,
        nesting_limit: i32,
    ) -> Result<Self> {
        Self::get_root_in(ArenaRef::Full(arena), segment_id, word_offset, nesting_limit)
    }

    /// A reader over a pre-encoded default value literal: a single segment
    /// whose word 0 is the root pointer.
    pub fn get_default(literal: &'a [u8]) -> Result<Self> {
        Self::get_root_in(ArenaRef::SingleSegment(literal), 0, 0, 64)
    }

    fn get_root_in(
        arena: ArenaRef<'a>,
        segment_id: u32,
        word_offset: u64,
        nesting_limit: i32,
    ) -> Result<Self> {
        let segment = arena.get_segment(segment_id)?;
        if word_offset + 1 > segment_words(segment) {
            return Ok(Self::new_default());
        }
        Ok(Self {
            arena,
            segment_id,
            segment,
            pointer: Some(word_offset),
            nesting_limit,
        })
    }

    fn word(&self) -> WirePointer {
        match self.pointer {
            None => WirePointer::NULL,
            Some(offset) => WirePointer(read_word(self.segment, offset)),
        }
    }

    pub fn is_null(&self) -> bool {
        self.word().is_null()
    }

    pub fn pointer_type(&self) -> Result<PointerType> {
        let word = self.word();
        if word.is_null() {
            return Ok(PointerType::Null);
        }
        let (resolved, _, _, _) = follow_fars(
            self.arena,
            self.segment_id,
            self.pointer.expect("non-null pointer has a location"),
        )?;
        match resolved.kind() {
            WirePointerKind::Struct => Ok(PointerType::Struct),
            WirePointerKind::List => Ok(PointerType::List(resolved.list_element_size())),
            WirePointerKind::Other => Ok(PointerType::Capability(resolved.cap_index())),
            WirePointerKind::Far => Err(Error::from_kind(ErrorKind::InvalidPointer)
                .context("far pointer did not resolve to content".into())),
        }
    }

    pub fn get_struct(&self, default: Option<&'a [u8]>) -> Result<StructReader<'a>> {
        if self.word().is_null() {
            return match default {
                Some(d) => PointerReader::get_default(d)?.get_struct(None),
                None => Ok(StructReader::new_default()),
            };
        }
        if self.nesting_limit <= 0 {
            return Err(Error::from_kind(ErrorKind::NestingLimitExceeded));
        }
        let (pointer, segment_id, segment, start) = follow_fars(
            self.arena,
            self.segment_id,
            self.pointer.expect("non-null pointer has a location"),
        )?;
        if pointer.kind() != WirePointerKind::Struct {
            return Err(Error::from_kind(ErrorKind::InvalidPointer)
                .context("expected a struct pointer".into()));
        }
        let data_words = pointer.struct_data_words() as u64;
        let pointer_count = pointer.struct_pointer_count();
        let total = data_words + pointer_count as u64;
        bounds_check(segment, start, total)?;
        self.arena.amplified_read(core::cmp::max(total, 1))?;

        let data_start = start as usize * BYTES_PER_WORD;
        let data_len = data_words as usize * BYTES_PER_WORD;
        Ok(StructReader {
            arena: self.arena,
            segment_id,
            segment,
            data: &segment[data_start..data_start + data_len],
            pointer_start: start + data_words,
            pointer_count,
            nesting_limit: self.nesting_limit - 1,
        })
    }

    pub fn get_list(
        &self,
        expected: Option<ElementSize>,
        default: Option<&'a [u8]>,
    ) -> Result<ListReader<'a>> {
        if self.word().is_null() {
            return match default {
                Some(d) => PointerReader::get_default(d)?.get_list(expected, None),
                None => Ok(ListReader::new_default(
                    expected.unwrap_or(ElementSize::Void),
                )),
            };
        }
        if self.nesting_limit <= 0 {
            return Err(Error::from_kind(ErrorKind::NestingLimitExceeded));
        }
        let (pointer, segment_id, segment, start) = follow_fars(
            self.arena,
            self.segment_id,
            self.pointer.expect("non-null pointer has a location"),
        )?;
        if pointer.kind() != WirePointerKind::List {
            return Err(Error::from_kind(ErrorKind::InvalidPointer)
                .context("expected a list pointer".into()));
        }

        let element_size = pointer.list_element_size();
        let reader = if element_size == ElementSize::InlineComposite {
            let word_count = pointer.list_element_count_or_words() as u64;
            // Tag word plus the declared content.
            bounds_check(segment, start, word_count + 1)?;
            let tag = WirePointer(read_word(segment, start));
            if tag.kind() != WirePointerKind::Struct {
                return Err(Error::from_kind(ErrorKind::InvalidPointer)
                    .context("inline-composite tag must be a struct pointer".into()));
            }
            let element_count = tag.inline_composite_element_count();
            let struct_size = StructSize {
                data: tag.struct_data_words(),
                pointers: tag.struct_pointer_count(),
            };
            let words_per_element = struct_size.total() as u64;
            let expected_words = (element_count as u64)
                .checked_mul(words_per_element)
                .ok_or_else(|| Error::from_kind(ErrorKind::ElementCountTooLarge))?;
            if expected_words != word_count {
                return Err(Error::from_kind(ErrorKind::InvalidPointer).context(
                    "inline-composite word count does not match element count".into(),
                ));
            }
            self.arena.amplified_read(core::cmp::max(word_count, 1))?;
            if words_per_element == 0 {
                // Zero-sized elements still cost traversal, or a tiny
                // message could claim billions of them.
                self.arena.amplified_read(element_count as u64)?;
            }
            ListReader {
                arena: self.arena,
                segment_id,
                segment,
                first: start + 1,
                element_count,
                step_bits: words_per_element * BITS_PER_WORD,
                element_size,
                struct_data_bits: struct_size.data as u32 * BITS_PER_WORD as u32,
                struct_ptr_count: struct_size.pointers,
                nesting_limit: self.nesting_limit - 1,
            }
        } else {
            let element_count = pointer.list_element_count_or_words();
            let step_bits = data_bits_per_element(element_size);
            let total_bits = (element_count as u64)
                .checked_mul(step_bits)
                .ok_or_else(|| Error::from_kind(ErrorKind::ElementCountTooLarge))?;
            let word_count = total_bits.div_ceil(BITS_PER_WORD);
            bounds_check(segment, start, word_count)?;
            self.arena.amplified_read(core::cmp::max(word_count, 1))?;
            if element_size == ElementSize::Void {
                self.arena.amplified_read(element_count as u64)?;
            }
            let (data_bits, ptr_count) = match element_size {
                ElementSize::Pointer => (0, 1),
                other => (data_bits_per_element(other) as u32, 0),
            };
            ListReader {
                arena: self.arena,
                segment_id,
                segment,
                first: start,
                element_count,
                step_bits,
                element_size,
                struct_data_bits: data_bits,
                struct_ptr_count: ptr_count,
                nesting_limit: self.nesting_limit - 1,
            }
        };

        check_expected_element_size(&reader, expected)?;
        Ok(reader)
    }

    pub fn get_text(&self, default: Option<&'a [u8]>) -> Result<crate::text::Reader<'a>> {
        if self.word().is_null() {
            return Ok(crate::text::Reader::new(default.unwrap_or(&[])));
        }
        let list = self.get_list(Some(ElementSize::Byte), None)?;
        let bytes = list.as_raw_bytes();
        match bytes.split_last() {
            Some((&0, content)) => Ok(crate::text::Reader::new(content)),
            _ => Err(Error::from_kind(ErrorKind::InvalidPointer)
                .context("text blob is not NUL-terminated".into())),
        }
    }

    pub fn get_data(&self, default: Option<&'a [u8]>) -> Result<crate::data::Reader<'a>> {
        if self.word().is_null() {
            return Ok(default.unwrap_or(&[]));
        }
        let list = self.get_list(Some(ElementSize::Byte), None)?;
        Ok(list.as_raw_bytes())
    }

    /// Returns the capability-table index this pointer carries.
    pub fn get_capability(&self) -> Result<u32> {
        match self.pointer_type()? {
            PointerType::Capability(index) => Ok(index),
            PointerType::Null => Err(Error::from_kind(ErrorKind::CapabilityUnavailable)
                .context("read a null capability pointer".into())),
            _ => Err(Error::from_kind(ErrorKind::InvalidPointer)
                .context("expected a capability pointer".into())),
        }
    }
}

fn check_expected_element_size(reader: &ListReader, expected: Option<ElementSize>) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let err = |what: &str| {
        Err(Error::from_kind(ErrorKind::InvalidPointer)
            .context(format!("list element size is incompatible: expected {what}")))
    };
    match expected {
        ElementSize::Void => Ok(()),
        ElementSize::Bit => {
            if reader.element_size == ElementSize::Bit {
                Ok(())
            } else {
                err("a bit list")
            }
        }
        ElementSize::Byte | ElementSize::TwoBytes | ElementSize::FourBytes
        | ElementSize::EightBytes => {
            let needed = data_bits_per_element(expected) as u32;
            if reader.element_size == ElementSize::Bit {
                err("a data list")
            } else if reader.struct_data_bits >= needed {
                Ok(())
            } else {
                err("wider data elements")
            }
        }
        ElementSize::Pointer => {
            if reader.struct_ptr_count >= 1 {
                Ok(())
            } else {
                err("pointer elements")
            }
        }
        ElementSize::InlineComposite => {
            if reader.element_size == ElementSize::Bit {
                err("struct elements")
            } else {
                Ok(())
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StructReader<'a> {
    arena: ArenaRef<'a>,
    segment_id: u32,
    segment: &'a [u8],
    /// The struct's data section.
    data: &'a [u8],
    pointer_start: u64,
    pointer_count: u16,
    nesting_limit: i32,
}

impl<'a> StructReader<'a> {
    pub fn new_default() -> Self {
        Self {
            arena: ArenaRef::empty(),
            segment_id: 0,
            segment: EMPTY_SEGMENT,
            data: EMPTY_SEGMENT,
            pointer_start: 0,
            pointer_count: 0,
            nesting_limit: 0x7fff_ffff,
        }
    }

    pub fn data_words(&self) -> u16 {
        (self.data.len() / BYTES_PER_WORD) as u16
    }

    pub fn pointer_count(&self) -> u16 {
        self.pointer_count
    }

    pub fn raw_data(&self) -> &'a [u8] {
        self.data
    }

    /// Reads a scalar field. A field beyond the data written by the producer
    /// reads as zero, which the generated accessor then XORs with the
    /// schema's default.
    pub fn get_data_field<T: PrimitiveElement>(&self, offset: usize) -> T {
        let bytes = (T::BITS / 8) as usize;
        let start = offset * bytes;
        if start + bytes <= self.data.len() {
            T::read_from(&self.data[start..start + bytes])
        } else {
            T::default()
        }
    }

    pub fn get_data_field_mask<T: Masked>(&self, offset: usize, mask: T) -> T {
        self.get_data_field::<T>(offset).mask(mask)
    }

    pub fn get_bool_field(&self, bit_offset: usize) -> bool {
        let byte = bit_offset / 8;
        if byte < self.data.len() {
            self.data[byte] & (1 << (bit_offset % 8)) != 0
        } else {
            false
        }
    }

    pub fn get_bool_field_mask(&self, bit_offset: usize, mask: bool) -> bool {
        self.get_bool_field(bit_offset) ^ mask
    }

    /// Strict variant for protocol flag words: the nibble containing the bit
    /// must be exactly zero or exactly the addressed bit, so corrupted or
    /// deliberately overloaded flag bytes are rejected instead of silently
    /// truncated to one bit.
    pub fn get_bool_field_strict(&self, bit_offset: usize) -> Result<bool> {
        let byte_index = bit_offset / 8;
        if byte_index >= self.data.len() {
            return Ok(false);
        }
        let byte = self.data[byte_index];
        let nibble = (byte >> ((bit_offset % 8) / 4 * 4)) & 0xf;
        let position = bit_offset % 4;
        if nibble == 0 {
            Ok(false)
        } else if nibble == 1 << position {
            Ok(true)
        } else {
            Err(Error::from_kind(ErrorKind::ProtocolViolation)
                .context("boolean flag nibble has extraneous bits set".into()))
        }
    }

    pub fn get_pointer_field(&self, index: u16) -> PointerReader<'a> {
        if index < self.pointer_count {
            PointerReader {
                arena: self.arena,
                segment_id: self.segment_id,
                segment: self.segment,
                pointer: Some(self.pointer_start + index as u64),
                nesting_limit: self.nesting_limit,
            }
        } else {
            PointerReader::new_default()
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ListReader<'a> {
    arena: ArenaRef<'a>,
    segment_id: u32,
    segment: &'a [u8],
    /// First element's word offset (past the tag word for inline composites).
    first: u64,
    element_count: u32,
    step_bits: u64,
    element_size: ElementSize,
    struct_data_bits: u32,
    struct_ptr_count: u16,
    nesting_limit: i32,
}

impl<'a> ListReader<'a> {
    pub fn new_default(element_size: ElementSize) -> Self {
        Self {
            arena: ArenaRef::empty(),
            segment_id: 0,
            segment: EMPTY_SEGMENT,
            first: 0,
            element_count: 0,
            step_bits: data_bits_per_element(element_size),
            element_size,
            struct_data_bits: 0,
            struct_ptr_count: 0,
            nesting_limit: 0x7fff_ffff,
        }
    }

    pub fn len(&self) -> u32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn element_size(&self) -> ElementSize {
        self.element_size
    }

    fn element_bit(&self, index: u32) -> u64 {
        self.first * BITS_PER_WORD + index as u64 * self.step_bits
    }

    pub fn get_element<T: PrimitiveElement>(&self, index: u32) -> T {
        assert!(index < self.element_count, "list index out of bounds");
        if T::BITS > self.struct_data_bits as u64 {
            return T::default();
        }
        let bit = self.element_bit(index);
        if T::BITS == 1 {
            let byte = (bit / 8) as usize;
            return T::read_from(&[(self.segment[byte] >> (bit % 8)) & 1]);
        }
        let start = (bit / 8) as usize;
        let bytes = (T::BITS / 8) as usize;
        T::read_from(&self.segment[start..start + bytes])
    }

    /// The raw content of a byte list (text or data).
    pub fn as_raw_bytes(&self) -> &'a [u8] {
        let start = (self.first * BYTES_PER_WORD as u64) as usize;
        &self.segment[start..start + self.element_count as usize]
    }

    pub fn get_struct_element(&self, index: u32) -> StructReader<'a> {
        assert!(index < self.element_count, "list index out of bounds");
        let bit = self.element_bit(index);
        match self.element_size {
            ElementSize::InlineComposite => {
                let start = bit / BITS_PER_WORD;
                let data_words = (self.struct_data_bits as u64) / BITS_PER_WORD;
                let data_start = start as usize * BYTES_PER_WORD;
                let data_len = data_words as usize * BYTES_PER_WORD;
                StructReader {
                    arena: self.arena,
                    segment_id: self.segment_id,
                    segment: self.segment,
                    data: &self.segment[data_start..data_start + data_len],
                    pointer_start: start + data_words,
                    pointer_count: self.struct_ptr_count,
                    nesting_limit: self.nesting_limit,
                }
            }
            ElementSize::Pointer => StructReader {
                arena: self.arena,
                segment_id: self.segment_id,
                segment: self.segment,
                data: EMPTY_SEGMENT,
                pointer_start: self.first + index as u64,
                pointer_count: 1,
                nesting_limit: self.nesting_limit,
            },
            // A data list viewed as structs: each element is the struct's
            // first (partial) data word.
            _ => {
                let data_start = (bit / 8) as usize;
                let data_len = (self.step_bits / 8) as usize;
                StructReader {
                    arena: self.arena,
                    segment_id: self.segment_id,
                    segment: self.segment,
                    data: &self.segment[data_start..data_start + data_len],
                    pointer_start: 0,
                    pointer_count: 0,
                    nesting_limit: self.nesting_limit,
                }
            }
        }
    }

    pub fn get_pointer_element(&self, index: u32) -> PointerReader<'a> {
        assert!(index < self.element_count, "list index out of bounds");
        match self.element_size {
            ElementSize::Pointer => PointerReader {
                arena: self.arena,
                segment_id: self.segment_id,
                segment: self.segment,
                pointer: Some(self.first + index as u64),
                nesting_limit: self.nesting_limit,
            },
            ElementSize::InlineComposite => self.get_struct_element(index).get_pointer_field(0),
            _ => PointerReader::new_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub struct PointerBuilder<'a> {
    arena: &'a mut BuilderArena,
    segment_id: u32,
    pointer: u32,
}

impl<'a> PointerBuilder<'a> {
    pub fn get_root(arena: &'a mut BuilderArena, segment_id: u32, word_offset: u32) -> Self {
        Self {
            arena,
            segment_id,
            pointer: word_offset,
        }
    }

    pub fn reborrow(&mut self) -> PointerBuilder<'_> {
        PointerBuilder {
            arena: &mut *self.arena,
            segment_id: self.segment_id,
            pointer: self.pointer,
        }
    }

    pub fn as_reader(&self) -> PointerReader<'_> {
        let segment = self
            .arena
            .get_segment(self.segment_id)
            .expect("builder pointer refers to an existing segment");
        PointerReader {
            arena: ArenaRef::Full(&*self.arena),
            segment_id: self.segment_id,
            segment,
            pointer: Some(self.pointer as u64),
            nesting_limit: 0x7fff_ffff,
        }
    }

    fn word(&self) -> WirePointer {
        let segment = self
            .arena
            .get_segment(self.segment_id)
            .expect("builder pointer refers to an existing segment");
        WirePointer(read_word(segment, self.pointer as u64))
    }

    pub fn is_null(&self) -> bool {
        self.word().is_null()
    }

    /// Nulls out this pointer. Previously referenced content is abandoned in
    /// place.
    pub fn clear(&mut self) {
        write_word(self.arena.get_segment_mut(self.segment_id), self.pointer, 0);
    }

    /// Allocates `words` of content, spilling to another segment behind a far
    /// pointer when the current one is full. Returns the content location and
    /// the location (segment, word) where the content-describing pointer must
    /// be written: the original slot, or the far landing pad.
    fn allocate_content(&mut self, words: u32) -> Result<ContentAllocation> {
        if let Some(offset) = self.arena.allocate(self.segment_id, words) {
            return Ok(ContentAllocation {
                segment_id: self.segment_id,
                start: offset,
                tag_segment_id: self.segment_id,
                tag_offset: self.pointer,
            });
        }
        let (segment_id, pad) = self.arena.allocate_anywhere(
            words
                .checked_add(POINTER_SIZE_IN_WORDS)
                .ok_or_else(|| Error::from_kind(ErrorKind::ArithmeticOverflow))?,
        )?;
        write_word(
            self.arena.get_segment_mut(self.segment_id),
            self.pointer,
            WirePointer::new_far(false, pad, segment_id).0,
        );
        Ok(ContentAllocation {
            segment_id,
            start: pad + 1,
            tag_segment_id: segment_id,
            tag_offset: pad,
        })
    }

    fn write_content_pointer(&mut self, alloc: &ContentAllocation, pointer: WirePointer) {
        write_word(
            self.arena.get_segment_mut(alloc.tag_segment_id),
            alloc.tag_offset,
            pointer.0,
        );
    }

    pub fn init_struct(mut self, size: StructSize) -> Result<StructBuilder<'a>> {
        let alloc = self.allocate_content(size.total())?;
        let offset = alloc.start as i64 - (alloc.tag_offset as i64 + 1);
        self.write_content_pointer(&alloc, WirePointer::new_struct(offset as i32, size));
        let ContentAllocation {
            segment_id, start, ..
        } = alloc;
        Ok(StructBuilder {
            arena: self.arena,
            segment_id,
            data_start: start * BYTES_PER_WORD as u32,
            data_size_bits: size.data as u32 * BITS_PER_WORD as u32,
            pointer_start: start + size.data as u32,
            pointer_count: size.pointers,
        })
    }

    /// Returns the existing struct, upgrading it if it is smaller than
    /// `size`: the struct is relocated into a fresh allocation of the
    /// requested size and the old body is zeroed.
    pub fn get_struct(
        mut self,
        size: StructSize,
        default: Option<&[u8]>,
    ) -> Result<StructBuilder<'a>> {
        if self.is_null() {
            if let Some(d) = default {
                let src = PointerReader::get_default(d)?;
                copy_pointer(self.reborrow(), &src)?;
            } else {
                return self.init_struct(size);
            }
        }

        let (pointer, segment_id, _, start64) =
            follow_fars(ArenaRef::Full(&*self.arena), self.segment_id, self.pointer as u64)?;
        if pointer.kind() != WirePointerKind::Struct {
            return Err(Error::from_kind(ErrorKind::InvalidPointer)
                .context("expected a struct pointer".into()));
        }
        let start = start64 as u32;
        let existing = StructSize {
            data: pointer.struct_data_words(),
            pointers: pointer.struct_pointer_count(),
        };
        if existing.data >= size.data && existing.pointers >= size.pointers {
            return Ok(StructBuilder {
                arena: self.arena,
                segment_id,
                data_start: start * BYTES_PER_WORD as u32,
                data_size_bits: existing.data as u32 * BITS_PER_WORD as u32,
                pointer_start: start + existing.data as u32,
                pointer_count: existing.pointers,
            });
        }

        // Upgrade: deep-copy the old content into a detached message, null
        // the pointer, reinitialize at the larger size, and copy back.
        let new_size = StructSize {
            data: core::cmp::max(existing.data, size.data),
            pointers: core::cmp::max(existing.pointers, size.pointers),
        };
        let mut scratch = BuilderArena::new(new_size.total() + 1, crate::message::AllocationStrategy::GrowHeuristically);
        let scratch_segment = scratch.create_segment(1)?;
        scratch
            .allocate(scratch_segment, 1)
            .expect("fresh scratch segment has room for a root pointer");
        copy_pointer(
            PointerBuilder::get_root(&mut scratch, scratch_segment, 0),
            &self.as_reader(),
        )?;

        // Zero the old body so abandoned memory cannot leak stale data.
        {
            let old_words = existing.total();
            let segment = self.arena.get_segment_mut(segment_id);
            for w in 0..old_words {
                write_word(segment, start + w, 0);
            }
        }
        self.clear();

        let mut builder = self.init_struct(new_size)?;
        let scratch_reader =
            PointerReader::get_root(&scratch, scratch_segment, 0, 0x7fff_ffff)?;
        let old = scratch_reader.get_struct(None)?;
        builder.copy_content_from(&old)?;
        Ok(builder)
    }

    pub fn init_list(mut self, element_size: ElementSize, count: u32) -> Result<ListBuilder<'a>> {
        assert!(
            element_size != ElementSize::InlineComposite,
            "use init_struct_list for composite lists"
        );
        if count > MAX_ELEMENT_COUNT {
            return Err(Error::from_kind(ErrorKind::ElementCountTooLarge));
        }
        let step_bits = data_bits_per_element(element_size);
        let total_bits = (count as u64)
            .checked_mul(step_bits)
            .ok_or_else(|| Error::from_kind(ErrorKind::ArithmeticOverflow))?;
        let words = u32::try_from(total_bits.div_ceil(BITS_PER_WORD))
            .map_err(|_| Error::from_kind(ErrorKind::ArithmeticOverflow))?;
        let alloc = self.allocate_content(words)?;
        let offset = alloc.start as i64 - (alloc.tag_offset as i64 + 1);
        self.write_content_pointer(
            &alloc,
            WirePointer::new_list(offset as i32, element_size, count),
        );
        let ContentAllocation {
            segment_id, start, ..
        } = alloc;
        let (data_bits, ptr_count) = match element_size {
            ElementSize::Pointer => (0, 1),
            other => (data_bits_per_element(other) as u32, 0),
        };
        Ok(ListBuilder {
            arena: self.arena,
            segment_id,
            first: start,
            element_count: count,
            step_bits: step_bits as u32,
            element_size,
            struct_data_bits: data_bits,
            struct_ptr_count: ptr_count,
        })
    }

    pub fn init_struct_list(mut self, count: u32, size: StructSize) -> Result<ListBuilder<'a>> {
        if count > MAX_ELEMENT_COUNT {
            return Err(Error::from_kind(ErrorKind::ElementCountTooLarge));
        }
        let words_per_element = size.total();
        let content_words = (count as u64)
            .checked_mul(words_per_element as u64)
            .ok_or_else(|| Error::from_kind(ErrorKind::ElementCountTooLarge))?;
        let total_words = content_words
            .checked_add(1)
            .ok_or_else(|| Error::from_kind(ErrorKind::ArithmeticOverflow))?;
        let total_words = u32::try_from(total_words)
            .map_err(|_| Error::from_kind(ErrorKind::ElementCountTooLarge))?;
        let alloc = self.allocate_content(total_words)?;
        let offset = alloc.start as i64 - (alloc.tag_offset as i64 + 1);
        self.write_content_pointer(
            &alloc,
            WirePointer::new_list(
                offset as i32,
                ElementSize::InlineComposite,
                content_words as u32,
            ),
        );
        let ContentAllocation {
            segment_id, start, ..
        } = alloc;
        write_word(
            self.arena.get_segment_mut(segment_id),
            start,
            WirePointer::new_inline_composite_tag(count, size).0,
        );
        Ok(ListBuilder {
            arena: self.arena,
            segment_id,
            first: start + 1,
            element_count: count,
            step_bits: words_per_element * BITS_PER_WORD as u32,
            element_size: ElementSize::InlineComposite,
            struct_data_bits: size.data as u32 * BITS_PER_WORD as u32,
            struct_ptr_count: size.pointers,
        })
    }

    /// Returns the existing struct list. A null pointer yields an empty list.
    pub fn get_struct_list(self, size: StructSize) -> Result<ListBuilder<'a>> {
        if self.is_null() {
            return self.init_struct_list(0, size);
        }
        let (pointer, segment_id, _, start64) =
            follow_fars(ArenaRef::Full(&*self.arena), self.segment_id, self.pointer as u64)?;
        if pointer.kind() != WirePointerKind::List
            || pointer.list_element_size() != ElementSize::InlineComposite
        {
            return Err(Error::from_kind(ErrorKind::InvalidPointer)
                .context("expected an inline-composite list pointer".into()));
        }
        let start = start64 as u32;
        let segment = self.arena.get_segment(segment_id)?;
        let tag = WirePointer(read_word(segment, start as u64));
        let existing = StructSize {
            data: tag.struct_data_words(),
            pointers: tag.struct_pointer_count(),
        };
        if existing.data < size.data || existing.pointers < size.pointers {
            return Err(Error::from_kind(ErrorKind::InvalidPointer)
                .context("existing list elements are smaller than expected".into()));
        }
        Ok(ListBuilder {
            arena: self.arena,
            segment_id,
            first: start + 1,
            element_count: tag.inline_composite_element_count(),
            step_bits: existing.total() * BITS_PER_WORD as u32,
            element_size: ElementSize::InlineComposite,
            struct_data_bits: existing.data as u32 * BITS_PER_WORD as u32,
            struct_ptr_count: existing.pointers,
        })
    }

    pub fn set_text(self, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        let len = u32::try_from(bytes.len())
            .ok()
            .and_then(|n| n.checked_add(1))
            .ok_or_else(|| Error::from_kind(ErrorKind::ElementCountTooLarge))?;
        let list = self.init_list(ElementSize::Byte, len)?;
        let raw = list.into_raw_bytes();
        raw[..bytes.len()].copy_from_slice(bytes);
        // Trailing NUL is already zero.
        Ok(())
    }

    pub fn set_data(self, value: &[u8]) -> Result<()> {
        let len = u32::try_from(value.len())
            .map_err(|_| Error::from_kind(ErrorKind::ElementCountTooLarge))?;
        let list = self.init_list(ElementSize::Byte, len)?;
        list.into_raw_bytes().copy_from_slice(value);
        Ok(())
    }

    pub fn get_text(self, default: &str) -> Result<crate::text::Builder<'a>> {
        if self.is_null() {
            let bytes = default.as_bytes().to_vec();
            let list = self.init_list(ElementSize::Byte, bytes.len() as u32 + 1)?;
            let raw = list.into_raw_bytes();
            raw[..bytes.len()].copy_from_slice(&bytes);
            return Ok(crate::text::Builder::new(&mut raw[..bytes.len()]));
        }
        let (pointer, segment_id, _, start64) =
            follow_fars(ArenaRef::Full(&*self.arena), self.segment_id, self.pointer as u64)?;
        if pointer.kind() != WirePointerKind::List
            || pointer.list_element_size() != ElementSize::Byte
        {
            return Err(Error::from_kind(ErrorKind::InvalidPointer)
                .context("expected a byte list pointer".into()));
        }
        let count = pointer.list_element_count_or_words() as usize;
        if count == 0 {
            return Err(Error::from_kind(ErrorKind::InvalidPointer)
                .context("text blob is not NUL-terminated".into()));
        }
        let start = start64 as usize * BYTES_PER_WORD;
        let segment = self.arena.get_segment_mut(segment_id);
        Ok(crate::text::Builder::new(
            &mut segment[start..start + count - 1],
        ))
    }

    pub fn get_data(self) -> Result<&'a mut [u8]> {
        if self.is_null() {
            let list = self.init_list(ElementSize::Byte, 0)?;
            return Ok(list.into_raw_bytes());
        }
        let (pointer, segment_id, _, start64) =
            follow_fars(ArenaRef::Full(&*self.arena), self.segment_id, self.pointer as u64)?;
        if pointer.kind() != WirePointerKind::List
            || pointer.list_element_size() != ElementSize::Byte
        {
            return Err(Error::from_kind(ErrorKind::InvalidPointer)
                .context("expected a byte list pointer".into()));
        }
        let count = pointer.list_element_count_or_words() as usize;
        let start = start64 as usize * BYTES_PER_WORD;
        let segment = self.arena.get_segment_mut(segment_id);
        Ok(&mut segment[start..start + count])
    }

    pub fn set_capability(&mut self, index: u32) {
        write_word(
            self.arena.get_segment_mut(self.segment_id),
            self.pointer,
            WirePointer::new_capability(index).0,
        );
    }
}

struct ContentAllocation {
    segment_id: u32,
    start: u32,
    tag_segment_id: u32,
    tag_offset: u32,
}

pub struct StructBuilder<'a> {
    arena: &'a mut BuilderArena,
    segment_id: u32,
    /// Byte offset of the data section.
    data_start: u32,
    data_size_bits: u32,
    /// Word offset of the pointer section.
    pointer_start: u32,
    pointer_count: u16,
}

impl<'a> StructBuilder<'a> {
    pub fn reborrow(&mut self) -> StructBuilder<'_> {
        StructBuilder {
            arena: &mut *self.arena,
            segment_id: self.segment_id,
            data_start: self.data_start,
            data_size_bits: self.data_size_bits,
            pointer_start: self.pointer_start,
            pointer_count: self.pointer_count,
        }
    }

    pub fn as_reader(&self) -> StructReader<'_> {
        let segment = self
            .arena
            .get_segment(self.segment_id)
            .expect("builder struct refers to an existing segment");
        let data_start = self.data_start as usize;
        let data_len = (self.data_size_bits / 8) as usize;
        StructReader {
            arena: ArenaRef::Full(&*self.arena),
            segment_id: self.segment_id,
            segment,
            data: &segment[data_start..data_start + data_len],
            pointer_start: self.pointer_start as u64,
            pointer_count: self.pointer_count,
            nesting_limit: 0x7fff_ffff,
        }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        let start = self.data_start as usize;
        let len = (self.data_size_bits / 8) as usize;
        let segment = self.arena.get_segment_mut(self.segment_id);
        &mut segment[start..start + len]
    }

    pub fn set_data_field<T: PrimitiveElement>(&mut self, offset: usize, value: T) {
        let bytes = (T::BITS / 8) as usize;
        let start = offset * bytes;
        let data = self.data_mut();
        assert!(
            start + bytes <= data.len(),
            "field write is outside the struct's data section"
        );
        value.write_to(&mut data[start..start + bytes]);
    }

    pub fn set_data_field_mask<T: Masked>(&mut self, offset: usize, value: T, mask: T) {
        self.set_data_field(offset, value.mask(mask));
    }

    pub fn get_data_field<T: PrimitiveElement>(&self, offset: usize) -> T {
        self.as_reader().get_data_field(offset)
    }

    pub fn set_bool_field(&mut self, bit_offset: usize, value: bool) {
        let byte = bit_offset / 8;
        let bit = bit_offset % 8;
        let data = self.data_mut();
        assert!(byte < data.len(), "field write is outside the struct's data section");
        data[byte] = (data[byte] & !(1 << bit)) | ((value as u8) << bit);
    }

    pub fn set_bool_field_mask(&mut self, bit_offset: usize, value: bool, mask: bool) {
        self.set_bool_field(bit_offset, value ^ mask);
    }

    pub fn get_bool_field(&self, bit_offset: usize) -> bool {
        self.as_reader().get_bool_field(bit_offset)
    }

    pub fn get_pointer_field(self, index: u16) -> PointerBuilder<'a> {
        assert!(index < self.pointer_count, "pointer index out of bounds");
        PointerBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            pointer: self.pointer_start + index as u32,
        }
    }

    /// Copies another struct's content into this one, which must be at least
    /// as large.
    pub fn copy_content_from(&mut self, src: &StructReader<'_>) -> Result<()> {
        let src_data = src.raw_data();
        {
            let data = self.data_mut();
            assert!(
                src_data.len() <= data.len(),
                "source data section is larger than destination"
            );
            data[..src_data.len()].copy_from_slice(src_data);
        }
        assert!(src.pointer_count() <= self.pointer_count);
        for i in 0..src.pointer_count() {
            let dst = self.reborrow().get_pointer_field(i);
            copy_pointer(dst, &src.get_pointer_field(i))?;
        }
        Ok(())
    }
}

pub struct ListBuilder<'a> {
    arena: &'a mut BuilderArena,
    segment_id: u32,
    first: u32,
    element_count: u32,
    step_bits: u32,
    element_size: ElementSize,
    struct_data_bits: u32,
    struct_ptr_count: u16,
}

impl<'a> ListBuilder<'a> {
    pub fn reborrow(&mut self) -> ListBuilder<'_> {
        ListBuilder {
            arena: &mut *self.arena,
            segment_id: self.segment_id,
            first: self.first,
            element_count: self.element_count,
            step_bits: self.step_bits,
            element_size: self.element_size,
            struct_data_bits: self.struct_data_bits,
            struct_ptr_count: self.struct_ptr_count,
        }
    }

    pub fn len(&self) -> u32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn as_reader(&self) -> ListReader<'_> {
        let segment = self
            .arena
            .get_segment(self.segment_id)
            .expect("builder list refers to an existing segment");
        ListReader {
            arena: ArenaRef::Full(&*self.arena),
            segment_id: self.segment_id,
            segment,
            first: self.first as u64,
            element_count: self.element_count,
            step_bits: self.step_bits as u64,
            element_size: self.element_size,
            struct_data_bits: self.struct_data_bits,
            struct_ptr_count: self.struct_ptr_count,
            nesting_limit: 0x7fff_ffff,
        }
    }

    pub fn set_element<T: PrimitiveElement>(&mut self, index: u32, value: T) {
        assert!(index < self.element_count, "list index out of bounds");
        let bit = self.first as u64 * BITS_PER_WORD + index as u64 * self.step_bits as u64;
        let segment = self.arena.get_segment_mut(self.segment_id);
        if T::BITS == 1 {
            let byte = (bit / 8) as usize;
            let mut scratch = [(segment[byte] >> (bit % 8)) & 1];
            value.write_to(&mut scratch);
            let mask = 1u8 << (bit % 8);
            segment[byte] = (segment[byte] & !mask) | (scratch[0] << (bit % 8));
        } else {
            let start = (bit / 8) as usize;
            let bytes = (T::BITS / 8) as usize;
            value.write_to(&mut segment[start..start + bytes]);
        }
    }

    pub fn get_struct_element(self, index: u32) -> StructBuilder<'a> {
        assert!(index < self.element_count, "list index out of bounds");
        assert!(
            self.element_size == ElementSize::InlineComposite,
            "not a struct list"
        );
        let start = self.first + index * (self.step_bits / BITS_PER_WORD as u32);
        let data_words = self.struct_data_bits / BITS_PER_WORD as u32;
        StructBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            data_start: start * BYTES_PER_WORD as u32,
            data_size_bits: self.struct_data_bits,
            pointer_start: start + data_words,
            pointer_count: self.struct_ptr_count,
        }
    }

    pub fn get_pointer_element(self, index: u32) -> PointerBuilder<'a> {
        assert!(index < self.element_count, "list index out of bounds");
        assert!(self.element_size == ElementSize::Pointer, "not a pointer list");
        PointerBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            pointer: self.first + index,
        }
    }

    /// The raw content of a byte list, for bulk writes.
    pub fn into_raw_bytes(self) -> &'a mut [u8] {
        assert!(self.element_size == ElementSize::Byte, "not a byte list");
        let start = self.first as usize * BYTES_PER_WORD;
        let segment = self.arena.get_segment_mut(self.segment_id);
        &mut segment[start..start + self.element_count as usize]
    }

    fn raw_bit_region_mut(&mut self) -> &mut [u8] {
        let start = self.first as usize * BYTES_PER_WORD;
        let len = ((self.element_count as u64 * self.step_bits as u64 + 7) / 8) as usize;
        let segment = self.arena.get_segment_mut(self.segment_id);
        &mut segment[start..start + len]
    }
}

// ---------------------------------------------------------------------------
// Deep copy
// ---------------------------------------------------------------------------

/// Copies the object referenced by `src` into `dst`'s message, traversing far
/// pointers. Capability pointers copy their cap-table index verbatim; the RPC
/// layer is responsible for remapping descriptor tables across messages.
/// Recursion is bounded by the source reader's nesting limit.
pub fn copy_pointer(mut dst: PointerBuilder<'_>, src: &PointerReader<'_>) -> Result<()> {
    match src.pointer_type()? {
        PointerType::Null => {
            dst.clear();
            Ok(())
        }
        PointerType::Capability(index) => {
            dst.set_capability(index);
            Ok(())
        }
        PointerType::Struct => {
            let reader = src.get_struct(None)?;
            let mut builder = dst.init_struct(StructSize {
                data: reader.data_words(),
                pointers: reader.pointer_count(),
            })?;
            builder.copy_content_from(&reader)
        }
        PointerType::List(element_size) => copy_list(dst, src, element_size),
    }
}

/// Copies a resolved struct into a pointer slot of another message,
/// preserving the source's exact size.
pub fn copy_struct(dst: PointerBuilder<'_>, src: &StructReader<'_>) -> Result<()> {
    let mut builder = dst.init_struct(StructSize {
        data: src.data_words(),
        pointers: src.pointer_count(),
    })?;
    builder.copy_content_from(src)
}

fn copy_list(
    dst: PointerBuilder<'_>,
    src: &PointerReader<'_>,
    element_size: ElementSize,
) -> Result<()> {
    let reader = src.get_list(None, None)?;
    let count = reader.len();
    match element_size {
        ElementSize::InlineComposite => {
            let size = StructSize {
                data: (reader.struct_data_bits / BITS_PER_WORD as u32) as u16,
                pointers: reader.struct_ptr_count,
            };
            let mut builder = dst.init_struct_list(count, size)?;
            for i in 0..count {
                let src_elem = reader.get_struct_element(i);
                let mut dst_elem = builder.reborrow().get_struct_element(i);
                dst_elem.copy_content_from(&src_elem)?;
            }
            Ok(())
        }
        ElementSize::Pointer => {
            let mut builder = dst.init_list(ElementSize::Pointer, count)?;
            for i in 0..count {
                let dst_elem = builder.reborrow().get_pointer_element(i);
                copy_pointer(dst_elem, &reader.get_pointer_element(i))?;
            }
            Ok(())
        }
        _ => {
            let mut builder = dst.init_list(element_size, count)?;
            let bit_len = ((count as u64 * reader.step_bits + 7) / 8) as usize;
            let src_start = (reader.first * BYTES_PER_WORD as u64) as usize;
            let src_bytes = reader.segment[src_start..src_start + bit_len].to_vec();
            builder.raw_bit_region_mut().copy_from_slice(&src_bytes);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::AllocationStrategy;

    fn new_arena() -> BuilderArena {
        let mut arena = BuilderArena::new(4, AllocationStrategy::FixedSize);
        let seg = arena.create_segment(1).unwrap();
        arena.allocate(seg, 1).unwrap();
        arena
    }

    #[test]
    fn wire_pointer_struct_round_trip() {
        let p = WirePointer::new_struct(-3, StructSize { data: 2, pointers: 1 });
        assert_eq!(p.kind(), WirePointerKind::Struct);
        assert_eq!(p.offset(), -3);
        assert_eq!(p.struct_data_words(), 2);
        assert_eq!(p.struct_pointer_count(), 1);
    }

    #[test]
    fn wire_pointer_list_round_trip() {
        let p = WirePointer::new_list(7, ElementSize::FourBytes, 1000);
        assert_eq!(p.kind(), WirePointerKind::List);
        assert_eq!(p.offset(), 7);
        assert_eq!(p.list_element_size(), ElementSize::FourBytes);
        assert_eq!(p.list_element_count_or_words(), 1000);
    }

    #[test]
    fn wire_pointer_far_round_trip() {
        let p = WirePointer::new_far(true, 123, 4);
        assert_eq!(p.kind(), WirePointerKind::Far);
        assert!(p.is_double_far());
        assert_eq!(p.far_offset(), 123);
        assert_eq!(p.far_segment_id(), 4);
    }

    #[test]
    fn struct_build_and_read_back() {
        let mut arena = new_arena();
        let root = PointerBuilder::get_root(&mut arena, 0, 0);
        let mut builder = root
            .init_struct(StructSize { data: 2, pointers: 1 })
            .unwrap();
        builder.set_data_field::<u32>(0, 42);
        builder.set_data_field::<u64>(1, 0xdead_beef_0000_0001);
        builder.set_bool_field(32, true);
        builder
            .reborrow()
            .get_pointer_field(0)
            .set_text("hello")
            .unwrap();

        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        let reader = root.get_struct(None).unwrap();
        assert_eq!(reader.get_data_field::<u32>(0), 42);
        assert_eq!(reader.get_data_field::<u64>(1), 0xdead_beef_0000_0001);
        assert!(reader.get_bool_field(32));
        assert!(!reader.get_bool_field(33));
        let text = reader.get_pointer_field(0).get_text(None).unwrap();
        assert_eq!(text.to_str().unwrap(), "hello");
    }

    #[test]
    fn unwritten_fields_read_as_zero() {
        let mut arena = new_arena();
        let root = PointerBuilder::get_root(&mut arena, 0, 0);
        root.init_struct(StructSize { data: 1, pointers: 0 }).unwrap();

        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        let reader = root.get_struct(None).unwrap();
        // Inside the declared extent.
        assert_eq!(reader.get_data_field::<u32>(0), 0);
        // Beyond the written extent: forward compatibility.
        assert_eq!(reader.get_data_field::<u64>(5), 0);
        assert!(reader.get_pointer_field(3).is_null());
    }

    #[test]
    fn default_mask_round_trips() {
        let mut arena = new_arena();
        let root = PointerBuilder::get_root(&mut arena, 0, 0);
        let mut builder = root
            .init_struct(StructSize { data: 1, pointers: 0 })
            .unwrap();

        // A fresh struct reads the default.
        assert_eq!(builder.as_reader().get_data_field_mask::<u16>(0, 1234), 1234);
        // Writing the default stores zero, which reads back as the default.
        builder.set_data_field_mask::<u16>(0, 1234, 1234);
        assert_eq!(builder.get_data_field::<u16>(0), 0);
        assert_eq!(builder.as_reader().get_data_field_mask::<u16>(0, 1234), 1234);
        // Writing another value reads back as that value.
        builder.set_data_field_mask::<u16>(0, 77, 1234);
        assert_eq!(builder.as_reader().get_data_field_mask::<u16>(0, 1234), 77);
    }

    #[test]
    fn strict_bool_rejects_overloaded_nibbles() {
        let mut arena = new_arena();
        let root = PointerBuilder::get_root(&mut arena, 0, 0);
        let mut builder = root
            .init_struct(StructSize { data: 1, pointers: 0 })
            .unwrap();
        builder.set_data_field::<u8>(4, 0b0000_0001);

        let reader_arena = &arena as &dyn ReaderArena;
        let root = PointerReader::get_root(reader_arena, 0, 0, 64).unwrap();
        let reader = root.get_struct(None).unwrap();
        assert!(reader.get_bool_field_strict(32).unwrap());
        assert!(!reader.get_bool_field_strict(40).unwrap());

        let root = PointerBuilder::get_root(&mut arena, 0, 0);
        let mut builder = root
            .get_struct(StructSize { data: 1, pointers: 0 }, None)
            .unwrap();
        builder.set_data_field::<u8>(4, 0b0000_0011);
        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        let reader = root.get_struct(None).unwrap();
        let err = reader.get_bool_field_strict(32).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolViolation);
    }

    #[test]
    fn struct_list_round_trip() {
        let mut arena = new_arena();
        let root = PointerBuilder::get_root(&mut arena, 0, 0);
        let mut list = root
            .init_struct_list(3, StructSize { data: 1, pointers: 1 })
            .unwrap();
        for i in 0..3 {
            let mut elem = list.reborrow().get_struct_element(i);
            elem.set_data_field::<u32>(0, i * 10);
            elem.get_pointer_field(0)
                .set_text(&format!("elem{i}"))
                .unwrap();
        }

        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        let reader = root.get_list(Some(ElementSize::InlineComposite), None).unwrap();
        assert_eq!(reader.len(), 3);
        for i in 0..3 {
            let elem = reader.get_struct_element(i);
            assert_eq!(elem.get_data_field::<u32>(0), i * 10);
            assert_eq!(
                elem.get_pointer_field(0)
                    .get_text(None)
                    .unwrap()
                    .to_str()
                    .unwrap(),
                format!("elem{i}")
            );
        }
    }

    #[test]
    fn cross_segment_content_uses_far_pointer() {
        // A tiny fixed-size arena forces content into later segments.
        let mut arena = BuilderArena::new(2, AllocationStrategy::FixedSize);
        let seg = arena.create_segment(1).unwrap();
        arena.allocate(seg, 1).unwrap();

        let root = PointerBuilder::get_root(&mut arena, 0, 0);
        let mut builder = root
            .init_struct(StructSize { data: 2, pointers: 1 })
            .unwrap();
        builder.set_data_field::<u64>(0, 99);
        builder
            .reborrow()
            .get_pointer_field(0)
            .set_text("spillover")
            .unwrap();
        assert!(arena.len() > 1);

        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        let reader = root.get_struct(None).unwrap();
        assert_eq!(reader.get_data_field::<u64>(0), 99);
        assert_eq!(
            reader
                .get_pointer_field(0)
                .get_text(None)
                .unwrap()
                .to_str()
                .unwrap(),
            "spillover"
        );
    }

    #[test]
    fn deep_copy_across_messages() {
        let mut src_arena = new_arena();
        {
            let root = PointerBuilder::get_root(&mut src_arena, 0, 0);
            let mut builder = root
                .init_struct(StructSize { data: 1, pointers: 2 })
                .unwrap();
            builder.set_data_field::<u32>(0, 7);
            builder
                .reborrow()
                .get_pointer_field(0)
                .set_text("nested")
                .unwrap();
            let mut list = builder
                .reborrow()
                .get_pointer_field(1)
                .init_list(ElementSize::TwoBytes, 4)
                .unwrap();
            for i in 0..4u32 {
                list.set_element::<u16>(i, i as u16 * 3);
            }
        }

        let mut dst_arena = new_arena();
        {
            let src_root = PointerReader::get_root(&src_arena, 0, 0, 64).unwrap();
            let dst_root = PointerBuilder::get_root(&mut dst_arena, 0, 0);
            copy_pointer(dst_root, &src_root).unwrap();
        }

        let root = PointerReader::get_root(&dst_arena, 0, 0, 64).unwrap();
        let reader = root.get_struct(None).unwrap();
        assert_eq!(reader.get_data_field::<u32>(0), 7);
        assert_eq!(
            reader
                .get_pointer_field(0)
                .get_text(None)
                .unwrap()
                .to_str()
                .unwrap(),
            "nested"
        );
        let list = reader
            .get_pointer_field(1)
            .get_list(Some(ElementSize::TwoBytes), None)
            .unwrap();
        assert_eq!(list.len(), 4);
        assert_eq!(list.get_element::<u16>(3), 9);
    }

    #[test]
    fn adversarial_composite_count_is_rejected() {
        // List pointer claiming an inline-composite list whose tag promises
        // 0x10000000 elements of 2 words each.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(
            &WirePointer::new_list(0, ElementSize::InlineComposite, 4).0.to_le_bytes(),
        );
        bytes.extend_from_slice(
            &WirePointer::new_inline_composite_tag(
                0x1000_0000,
                StructSize { data: 2, pointers: 0 },
            )
            .0
            .to_le_bytes(),
        );
        bytes.extend_from_slice(&[0; 32]);

        let root = PointerReader::get_default(&bytes).unwrap();
        let err = root.get_list(None, None).unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::InvalidPointer | ErrorKind::ElementCountTooLarge
        ));
    }

    #[test]
    fn out_of_bounds_struct_pointer_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(
            &WirePointer::new_struct(100, StructSize { data: 1, pointers: 0 }).0.to_le_bytes(),
        );
        let root = PointerReader::get_default(&bytes).unwrap();
        let err = root.get_struct(None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidPointer);
    }

    #[test]
    fn nesting_limit_is_enforced() {
        // A pointer that points at itself as a struct containing a pointer.
        let mut arena = new_arena();
        {
            let root = PointerBuilder::get_root(&mut arena, 0, 0);
            let mut b = root.init_struct(StructSize { data: 0, pointers: 1 }).unwrap();
            let mut inner = b
                .reborrow()
                .get_pointer_field(0)
                .init_struct(StructSize { data: 0, pointers: 1 })
                .unwrap();
            let _ = inner.reborrow();
        }
        let root = PointerReader::get_root(&arena, 0, 0, 1).unwrap();
        let outer = root.get_struct(None).unwrap();
        let err = outer.get_pointer_field(0).get_struct(None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NestingLimitExceeded);
    }
}
