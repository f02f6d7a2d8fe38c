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

//! Dynamically typed value.

use crate::private::layout::{copy_pointer, PointerBuilder, PointerReader, PointerType};
use crate::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use crate::Result;

#[derive(Clone, Copy)]
pub struct Owned(());

impl crate::traits::Owned for Owned {
    type Reader<'a> = Reader<'a>;
    type Builder<'a> = Builder<'a>;
}

#[derive(Clone, Copy)]
pub struct Reader<'a> {
    reader: PointerReader<'a>,
}

impl<'a> Reader<'a> {
    pub fn new(reader: PointerReader<'a>) -> Reader<'a> {
        Reader { reader }
    }

    pub fn is_null(&self) -> bool {
        self.reader.is_null()
    }

    pub fn pointer_type(&self) -> Result<PointerType> {
        self.reader.pointer_type()
    }

    pub fn get_as<T: FromPointerReader<'a>>(&self) -> Result<T> {
        T::get_from_pointer(&self.reader, None)
    }

    /// The capability-table index carried by this pointer.
    pub fn get_capability_index(&self) -> Result<u32> {
        self.reader.get_capability()
    }

    /// Walks a sequence of pointer-field indexes starting at this value.
    /// An empty path returns the value itself. This is the transform
    /// operation applied to promised answers.
    pub fn get_pointer_path(&self, path: &[u16]) -> Result<Reader<'a>> {
        let mut reader = self.reader;
        for &index in path {
            reader = reader.get_struct(None)?.get_pointer_field(index);
        }
        Ok(Reader { reader })
    }
}

impl<'a> FromPointerReader<'a> for Reader<'a> {
    fn get_from_pointer(reader: &PointerReader<'a>, _default: Option<&'a [u8]>) -> Result<Self> {
        Ok(Reader { reader: *reader })
    }
}

pub struct Builder<'a> {
    builder: PointerBuilder<'a>,
}

impl<'a> Builder<'a> {
    pub fn new(builder: PointerBuilder<'a>) -> Builder<'a> {
        Builder { builder }
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            builder: self.builder.reborrow(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.builder.is_null()
    }

    pub fn as_reader(&self) -> Reader<'_> {
        Reader {
            reader: self.builder.as_reader(),
        }
    }

    pub fn init_as<T: FromPointerBuilder<'a>>(self) -> T {
        T::init_pointer(self.builder, 0)
    }

    pub fn initn_as<T: FromPointerBuilder<'a>>(self, length: u32) -> T {
        T::init_pointer(self.builder, length)
    }

    pub fn get_as<T: FromPointerBuilder<'a>>(self) -> Result<T> {
        T::get_from_pointer(self.builder, None)
    }

    pub fn set_as<From: SetPointerBuilder>(self, value: From) -> Result<()> {
        SetPointerBuilder::set_pointer_builder(self.builder, value)
    }

    pub fn set_capability_index(&mut self, index: u32) {
        self.builder.set_capability(index);
    }

    pub fn clear(&mut self) {
        self.builder.clear();
    }
}

impl<'a> FromPointerBuilder<'a> for Builder<'a> {
    fn init_pointer(mut builder: PointerBuilder<'a>, _len: u32) -> Builder<'a> {
        builder.clear();
        Builder { builder }
    }
    fn get_from_pointer(
        builder: PointerBuilder<'a>,
        _default: Option<&'a [u8]>,
    ) -> Result<Builder<'a>> {
        Ok(Builder { builder })
    }
}

impl<'a> SetPointerBuilder for Reader<'a> {
    fn set_pointer_builder(builder: PointerBuilder<'_>, from: Reader<'a>) -> Result<()> {
        copy_pointer(builder, &from.reader)
    }
}
