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

//! The contracts between generated code and the runtime.

use crate::private::layout::{
    PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
};
use crate::Result;

/// Marker type for a value whose storage lives inside a message. Generated
/// code emits one `Owned` type per struct, list, and blob type; it ties the
/// corresponding `Reader` and `Builder` views together.
pub trait Owned {
    type Reader<'a>: FromPointerReader<'a>;
    type Builder<'a>: FromPointerBuilder<'a>;
}

/// Like [Owned], but restricted to struct types, which additionally know
/// their layout and can live in inline-composite lists.
pub trait OwnedStruct {
    type Reader<'a>: FromStructReader<'a>;
    type Builder<'a>: FromStructBuilder<'a>;

    const STRUCT_SIZE: StructSize;
}

pub trait FromPointerReader<'a>: Sized {
    fn get_from_pointer(reader: &PointerReader<'a>, default: Option<&'a [u8]>) -> Result<Self>;
}

pub trait FromPointerBuilder<'a>: Sized {
    fn init_pointer(builder: PointerBuilder<'a>, length: u32) -> Self;
    fn get_from_pointer(builder: PointerBuilder<'a>, default: Option<&'a [u8]>) -> Result<Self>;
}

pub trait FromStructReader<'a> {
    fn new(reader: StructReader<'a>) -> Self;
}

pub trait FromStructBuilder<'a> {
    fn new(builder: StructBuilder<'a>) -> Self;
}

/// A value that can be deep-copied into a pointer field of a message under
/// construction.
pub trait SetPointerBuilder {
    fn set_pointer_builder(builder: PointerBuilder<'_>, from: Self) -> Result<()>;
}

/// Generated enum types convert to and from their wire discriminant.
pub trait ToU16 {
    fn to_u16(self) -> u16;
}

pub trait FromU16: Sized {
    fn from_u16(value: u16) -> core::result::Result<Self, crate::NotInSchema>;
}
