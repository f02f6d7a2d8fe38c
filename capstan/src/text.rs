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

//! UTF-8 encoded text. On the wire this is a byte list with a trailing NUL;
//! the views here exclude the NUL.

use crate::private::layout::{PointerBuilder, PointerReader};
use crate::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use crate::Result;

#[derive(Clone, Copy)]
pub struct Owned(());

impl crate::traits::Owned for Owned {
    type Reader<'a> = Reader<'a>;
    type Builder<'a> = Builder<'a>;
}

/// The content of a text field, not yet validated as UTF-8. Cap'n Proto
/// requires text to be valid UTF-8, but malicious senders may not comply.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn to_str(&self) -> Result<&'a str> {
        Ok(core::str::from_utf8(self.bytes)?)
    }

    pub fn to_string(&self) -> Result<String> {
        Ok(self.to_str()?.to_string())
    }
}

impl<'a> From<&'a str> for Reader<'a> {
    fn from(value: &'a str) -> Self {
        Self {
            bytes: value.as_bytes(),
        }
    }
}

impl<'a> core::fmt::Debug for Reader<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match core::str::from_utf8(self.bytes) {
            Ok(s) => write!(f, "{s:?}"),
            Err(_) => write!(f, "<invalid utf-8: {:?}>", self.bytes),
        }
    }
}

impl<'a> FromPointerReader<'a> for Reader<'a> {
    fn get_from_pointer(reader: &PointerReader<'a>, default: Option<&'a [u8]>) -> Result<Self> {
        reader.get_text(default)
    }
}

pub struct Builder<'a> {
    bytes: &'a mut [u8],
}

impl<'a> Builder<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }

    pub fn as_reader(&self) -> Reader<'_> {
        Reader { bytes: self.bytes }
    }
}

impl<'a> FromPointerBuilder<'a> for Builder<'a> {
    fn init_pointer(builder: PointerBuilder<'a>, length: u32) -> Self {
        match builder.init_list(crate::private::layout::ElementSize::Byte, length + 1) {
            Ok(list) => {
                let raw = list.into_raw_bytes();
                let len = raw.len();
                Builder::new(&mut raw[..len - 1])
            }
            Err(e) => panic!("failed to allocate text: {e}"),
        }
    }

    fn get_from_pointer(builder: PointerBuilder<'a>, _default: Option<&'a [u8]>) -> Result<Self> {
        builder.get_text("")
    }
}

impl<'a> SetPointerBuilder for Reader<'a> {
    fn set_pointer_builder(builder: PointerBuilder<'_>, from: Reader<'a>) -> Result<()> {
        let list = builder.init_list(
            crate::private::layout::ElementSize::Byte,
            from.bytes.len() as u32 + 1,
        )?;
        let raw = list.into_raw_bytes();
        raw[..from.bytes.len()].copy_from_slice(from.bytes);
        Ok(())
    }
}

impl SetPointerBuilder for &str {
    fn set_pointer_builder(builder: PointerBuilder<'_>, from: &str) -> Result<()> {
        builder.set_text(from)
    }
}
