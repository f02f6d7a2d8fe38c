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

//! # capstan
//!
//! A pure-Rust implementation of the
//! [Cap'n Proto](https://capnproto.org) data encoding: segmented messages,
//! zero-copy readers, in-place builders, the packed codec, and the schema
//! model consumed by code generators. The RPC runtime lives in the companion
//! `capstan-rpc` crate.

pub mod any_pointer;
pub mod data;
pub mod message;
pub mod primitive_list;
pub mod schema;
pub mod serialize;
pub mod serialize_packed;
pub mod struct_list;
pub mod text;
pub mod traits;

/// Code generated by the schema compiler reaches into this module. It is not
/// covered by semver guarantees.
pub mod private;

/// 8 bytes, the granularity of Cap'n Proto memory allocation.
pub const BYTES_PER_WORD: usize = 8;

/// Constructs a word from its constituent bytes, least-significant first.
/// Mainly useful for writing byte-exact tests.
pub const fn word(b0: u8, b1: u8, b2: u8, b3: u8, b4: u8, b5: u8, b6: u8, b7: u8) -> [u8; 8] {
    [b0, b1, b2, b3, b4, b5, b6, b7]
}

/// Size of a message. Every generated struct type has a constant of this
/// type describing its layout, and size hints passed to RPC requests use it
/// to pre-allocate message space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageSize {
    pub word_count: u64,

    /// Size of the capability table.
    pub cap_count: u32,
}

impl core::ops::AddAssign for MessageSize {
    fn add_assign(&mut self, rhs: Self) {
        self.word_count += rhs.word_count;
        self.cap_count += rhs.cap_count;
    }
}

/// An enum value or union discriminant that was not found among those defined
/// in a schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotInSchema(pub u16);

impl core::fmt::Display for NotInSchema {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(fmt, "value {} was not found among the schema's variants", self.0)
    }
}

impl std::error::Error for NotInSchema {}

impl From<NotInSchema> for Error {
    fn from(e: NotInSchema) -> Self {
        Self::from_kind(ErrorKind::InvalidEnumValue).context(e.to_string())
    }
}

/// Things that can go wrong when you read or write a message.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input ended in the middle of a message.
    TruncatedMessage,

    /// A pointer was malformed or pointed outside the bounds of its message.
    InvalidPointer,

    /// A pointer referenced a segment that does not exist in the message.
    InvalidSegmentId,

    /// A frame header declared more segments than the configured limit allows.
    SegmentCountLimitExceeded,

    /// A list declared more elements than can be addressed, or more than the
    /// message could possibly contain.
    ElementCountTooLarge,

    /// A pointer chain exceeded the configured nesting limit.
    NestingLimitExceeded,

    /// Reading the message consumed more words than the configured traversal
    /// limit allows.
    TraversalLimitExceeded,

    /// A size computation overflowed. Adversarial inputs trigger this instead
    /// of silently wrapping.
    ArithmeticOverflow,

    /// An enum value or union discriminant was outside its schema's range.
    InvalidEnumValue,

    /// A frame declared a total size above the configured limit.
    FrameTooLarge,

    /// The remote peer violated the RPC protocol: duplicate id, unknown id,
    /// malformed capability descriptor, or similar.
    ProtocolViolation,

    /// A capability was used after it became unavailable.
    CapabilityUnavailable,

    /// The connection was closed locally.
    ConnectionClosed,

    /// The remote peer aborted the connection.
    ConnectionAborted,

    /// A second drain waiter was registered on a stream that already has one.
    StreamDrainAlreadyPending,

    /// Memory allocation failed.
    OutOfMemory,

    /// Generic application-level failure. RPC exceptions of type `failed`
    /// map here.
    Failed,

    /// The callee is temporarily overloaded; the caller may retry later.
    Overloaded,

    /// The connection to a third party was lost.
    Disconnected,

    /// The requested method is not implemented by the callee.
    Unimplemented,
}

impl ErrorKind {
    fn label(self) -> &'static str {
        match self {
            Self::TruncatedMessage => "Message ends prematurely",
            Self::InvalidPointer => "Invalid pointer",
            Self::InvalidSegmentId => "Invalid segment id",
            Self::SegmentCountLimitExceeded => "Segment count limit exceeded",
            Self::ElementCountTooLarge => "Element count too large",
            Self::NestingLimitExceeded => "Nesting limit exceeded",
            Self::TraversalLimitExceeded => "Traversal limit exceeded",
            Self::ArithmeticOverflow => "Arithmetic overflow",
            Self::InvalidEnumValue => "Invalid enum value",
            Self::FrameTooLarge => "Frame too large",
            Self::ProtocolViolation => "Protocol violation",
            Self::CapabilityUnavailable => "Capability unavailable",
            Self::ConnectionClosed => "Connection closed",
            Self::ConnectionAborted => "Connection aborted",
            Self::StreamDrainAlreadyPending => "Stream drain already pending",
            Self::OutOfMemory => "Out of memory",
            Self::Failed => "Failed",
            Self::Overloaded => "Overloaded",
            Self::Disconnected => "Disconnected",
            Self::Unimplemented => "Unimplemented",
        }
    }
}

/// An error that occurred while reading, building, or transmitting a message.
#[derive(Clone, Debug, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,

    /// Human-readable explanation, appended to the kind's label when
    /// displayed.
    pub extra: String,
}

impl Error {
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            extra: String::new(),
        }
    }

    pub fn context(mut self, extra: String) -> Self {
        self.extra = extra;
        self
    }

    pub fn failed(extra: String) -> Self {
        Self::from_kind(ErrorKind::Failed).context(extra)
    }

    pub fn overloaded(extra: String) -> Self {
        Self::from_kind(ErrorKind::Overloaded).context(extra)
    }

    pub fn disconnected(extra: String) -> Self {
        Self::from_kind(ErrorKind::Disconnected).context(extra)
    }

    pub fn unimplemented(extra: String) -> Self {
        Self::from_kind(ErrorKind::Unimplemented).context(extra)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        if self.extra.is_empty() {
            write!(fmt, "{}", self.kind.label())
        } else {
            write!(fmt, "{}: {}", self.kind.label(), self.extra)
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ErrorKind::TruncatedMessage,
            std::io::ErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
            std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::ConnectionReset => {
                ErrorKind::Disconnected
            }
            _ => ErrorKind::Failed,
        };
        Self::from_kind(kind).context(format!("{err}"))
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::failed(format!("{err}"))
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Self::failed(format!("{err}"))
    }
}

/// Because messages are lazily validated, the return type of any method that
/// reads a pointer field must be wrapped in a Result.
pub type Result<T> = core::result::Result<T, Error>;

/// The segments of a built message, borrowed from its builder.
///
/// Most messages fit in a single segment; avoid a heap allocation for that
/// case.
pub enum OutputSegments<'s> {
    SingleSegment([&'s [u8]; 1]),
    MultiSegment(Vec<&'s [u8]>),
}

impl<'s> core::ops::Deref for OutputSegments<'s> {
    type Target = [&'s [u8]];
    fn deref(&self) -> &[&'s [u8]] {
        match self {
            OutputSegments::SingleSegment(s) => s,
            OutputSegments::MultiSegment(v) => v,
        }
    }
}

impl<'s> message::ReaderSegments for OutputSegments<'s> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        match self {
            OutputSegments::SingleSegment(s) => s.get(id as usize).copied(),
            OutputSegments::MultiSegment(v) => v.get(id as usize).copied(),
        }
    }

    fn len(&self) -> usize {
        match self {
            OutputSegments::SingleSegment(_) => 1,
            OutputSegments::MultiSegment(v) => v.len(),
        }
    }
}
