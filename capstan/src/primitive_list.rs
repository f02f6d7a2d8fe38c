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

//! List of primitives.

use core::marker;

use crate::private::layout::{
    ElementSize, ListBuilder, ListReader, PointerBuilder, PointerReader, PrimitiveElement,
};
use crate::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use crate::Result;

#[derive(Clone, Copy)]
pub struct Owned<T> {
    marker: marker::PhantomData<T>,
}

impl<T> crate::traits::Owned for Owned<T>
where
    T: PrimitiveElement,
{
    type Reader<'a> = Reader<'a, T>;
    type Builder<'a> = Builder<'a, T>;
}

fn element_size_for<T: PrimitiveElement>() -> ElementSize {
    match T::BITS {
        1 => ElementSize::Bit,
        8 => ElementSize::Byte,
        16 => ElementSize::TwoBytes,
        32 => ElementSize::FourBytes,
        _ => ElementSize::EightBytes,
    }
}

#[derive(Clone, Copy)]
pub struct Reader<'a, T>
where
    T: PrimitiveElement,
{
    marker: marker::PhantomData<T>,
    reader: ListReader<'a>,
}

impl<'a, T: PrimitiveElement> Reader<'a, T> {
    pub fn len(&self) -> u32 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> T {
        self.reader.get_element(index)
    }

    pub fn iter(self) -> impl Iterator<Item = T> + 'a
    where
        T: 'a,
    {
        (0..self.reader.len()).map(move |i| self.reader.get_element(i))
    }
}

impl<'a, T: PrimitiveElement> FromPointerReader<'a> for Reader<'a, T> {
    fn get_from_pointer(reader: &PointerReader<'a>, default: Option<&'a [u8]>) -> Result<Self> {
        Ok(Reader {
            marker: marker::PhantomData,
            reader: reader.get_list(Some(element_size_for::<T>()), default)?,
        })
    }
}

pub struct Builder<'a, T>
where
    T: PrimitiveElement,
{
    marker: marker::PhantomData<T>,
    builder: ListBuilder<'a>,
}

impl<'a, T: PrimitiveElement> Builder<'a, T> {
    pub fn len(&self) -> u32 {
        self.builder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set(&mut self, index: u32, value: T) {
        self.builder.set_element(index, value);
    }

    pub fn get(&self, index: u32) -> T {
        self.builder.as_reader().get_element(index)
    }

    pub fn reborrow(&mut self) -> Builder<'_, T> {
        Builder {
            marker: marker::PhantomData,
            builder: self.builder.reborrow(),
        }
    }
}

impl<'a, T: PrimitiveElement> FromPointerBuilder<'a> for Builder<'a, T> {
    fn init_pointer(builder: PointerBuilder<'a>, length: u32) -> Self {
        match builder.init_list(element_size_for::<T>(), length) {
            Ok(list) => Builder {
                marker: marker::PhantomData,
                builder: list,
            },
            Err(e) => panic!("failed to allocate list: {e}"),
        }
    }

    fn get_from_pointer(_builder: PointerBuilder<'a>, _default: Option<&'a [u8]>) -> Result<Self> {
        Err(crate::Error::unimplemented(
            "reading a primitive list back out of a builder is not supported; \
             initialize it with the final length instead"
                .into(),
        ))
    }
}

impl<'a, T: PrimitiveElement> SetPointerBuilder for Reader<'a, T> {
    fn set_pointer_builder(builder: PointerBuilder<'_>, from: Reader<'a, T>) -> Result<()> {
        let mut list = builder.init_list(element_size_for::<T>(), from.len())?;
        for i in 0..from.len() {
            list.set_element(i, from.get(i));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::message;

    #[test]
    fn primitive_list_round_trip() {
        let mut message = message::Builder::new_default();
        {
            let mut list = message.init_root::<super::Builder<'_, u32>>();
            // init_pointer length comes through init_root's hint of zero, so
            // rebuild through any_pointer with an explicit count.
            assert_eq!(list.len(), 0);
            let _ = list.reborrow();
        }
        let mut message = message::Builder::new_default();
        {
            let root: crate::any_pointer::Builder = message.init_root();
            let mut list: super::Builder<'_, u32> = root.initn_as(5);
            for i in 0..5 {
                list.set(i, i * i);
            }
            assert_eq!(list.get(4), 16);
        }
        let reader = message.get_root_as_reader::<super::Reader<'_, u32>>().unwrap();
        assert_eq!(reader.len(), 5);
        let collected: Vec<u32> = reader.iter().collect();
        assert_eq!(collected, vec![0, 1, 4, 9, 16]);
    }

    #[test]
    fn bool_list_round_trip() {
        let mut message = message::Builder::new_default();
        {
            let root: crate::any_pointer::Builder = message.init_root();
            let mut list: super::Builder<'_, bool> = root.initn_as(10);
            for i in 0..10 {
                list.set(i, i % 3 == 0);
            }
        }
        let reader = message
            .get_root_as_reader::<super::Reader<'_, bool>>()
            .unwrap();
        assert_eq!(reader.len(), 10);
        for i in 0..10 {
            assert_eq!(reader.get(i), i % 3 == 0);
        }
    }
}
