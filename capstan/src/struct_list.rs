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

//! List of structs.

use core::marker;

use crate::private::layout::{ElementSize, ListBuilder, ListReader, PointerBuilder, PointerReader};
use crate::traits::{
    FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader, OwnedStruct,
};
use crate::Result;

#[derive(Clone, Copy)]
pub struct Owned<T>
where
    T: OwnedStruct,
{
    marker: marker::PhantomData<T>,
}

impl<T> crate::traits::Owned for Owned<T>
where
    T: OwnedStruct,
{
    type Reader<'a> = Reader<'a, T>;
    type Builder<'a> = Builder<'a, T>;
}

#[derive(Clone, Copy)]
pub struct Reader<'a, T>
where
    T: OwnedStruct,
{
    marker: marker::PhantomData<T>,
    reader: ListReader<'a>,
}

impl<'a, T: OwnedStruct> Reader<'a, T> {
    pub fn len(&self) -> u32 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> T::Reader<'a> {
        FromStructReader::new(self.reader.get_struct_element(index))
    }

    pub fn iter(self) -> impl Iterator<Item = T::Reader<'a>> + 'a
    where
        T: 'a,
    {
        let reader = self.reader;
        (0..reader.len()).map(move |i| FromStructReader::new(reader.get_struct_element(i)))
    }
}

impl<'a, T: OwnedStruct> FromPointerReader<'a> for Reader<'a, T> {
    fn get_from_pointer(reader: &PointerReader<'a>, default: Option<&'a [u8]>) -> Result<Self> {
        Ok(Reader {
            marker: marker::PhantomData,
            reader: reader.get_list(Some(ElementSize::InlineComposite), default)?,
        })
    }
}

pub struct Builder<'a, T>
where
    T: OwnedStruct,
{
    marker: marker::PhantomData<T>,
    builder: ListBuilder<'a>,
}

impl<'a, T: OwnedStruct> Builder<'a, T> {
    pub fn len(&self) -> u32 {
        self.builder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(self, index: u32) -> T::Builder<'a> {
        FromStructBuilder::new(self.builder.get_struct_element(index))
    }

    pub fn reborrow(&mut self) -> Builder<'_, T> {
        Builder {
            marker: marker::PhantomData,
            builder: self.builder.reborrow(),
        }
    }
}

impl<'a, T: OwnedStruct> FromPointerBuilder<'a> for Builder<'a, T> {
    fn init_pointer(builder: PointerBuilder<'a>, length: u32) -> Self {
        match builder.init_struct_list(length, T::STRUCT_SIZE) {
            Ok(list) => Builder {
                marker: marker::PhantomData,
                builder: list,
            },
            Err(e) => panic!("failed to allocate struct list: {e}"),
        }
    }

    fn get_from_pointer(builder: PointerBuilder<'a>, _default: Option<&'a [u8]>) -> Result<Self> {
        Ok(Builder {
            marker: marker::PhantomData,
            builder: builder.get_struct_list(T::STRUCT_SIZE)?,
        })
    }
}
