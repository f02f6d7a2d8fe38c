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

//! End-to-end exercise of the accessor conventions that generated code
//! relies on, using a hand-written module for this schema:
//!
//! ```capnp
//! struct Envelope {
//!   id @0 :UInt32;
//!   sequence @1 :UInt64 = 41;
//!   urgent @2 :Bool = true;
//!   payload @3 :Text;
//! }
//! ```

pub mod envelope {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::Result;

    pub const STRUCT_SIZE: StructSize = StructSize {
        data: 2,
        pointers: 1,
    };

    #[derive(Clone, Copy)]
    pub struct Owned(());

    impl capstan::traits::Owned for Owned {
        type Reader<'a> = Reader<'a>;
        type Builder<'a> = Builder<'a>;
    }

    impl capstan::traits::OwnedStruct for Owned {
        type Reader<'a> = Reader<'a>;
        type Builder<'a> = Builder<'a>;
        const STRUCT_SIZE: StructSize = STRUCT_SIZE;
    }

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> FromStructReader<'a> for Reader<'a> {
        fn new(reader: StructReader<'a>) -> Self {
            Self { reader }
        }
    }

    impl<'a> FromPointerReader<'a> for Reader<'a> {
        fn get_from_pointer(
            reader: &PointerReader<'a>,
            default: Option<&'a [u8]>,
        ) -> Result<Self> {
            Ok(Self {
                reader: reader.get_struct(default)?,
            })
        }
    }

    impl<'a> Reader<'a> {
        pub fn get_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_sequence(&self) -> u64 {
            self.reader.get_data_field_mask::<u64>(1, 41)
        }

        pub fn get_urgent(&self) -> bool {
            self.reader.get_bool_field_mask(32, true)
        }

        pub fn has_payload(&self) -> bool {
            !self.reader.get_pointer_field(0).is_null()
        }

        pub fn get_payload(&self) -> Result<capstan::text::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0), None)
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> FromStructBuilder<'a> for Builder<'a> {
        fn new(builder: StructBuilder<'a>) -> Self {
            Self { builder }
        }
    }

    impl<'a> FromPointerBuilder<'a> for Builder<'a> {
        fn init_pointer(builder: PointerBuilder<'a>, _length: u32) -> Self {
            match builder.init_struct(STRUCT_SIZE) {
                Ok(builder) => Self { builder },
                Err(e) => panic!("failed to allocate struct: {e}"),
            }
        }

        fn get_from_pointer(
            builder: PointerBuilder<'a>,
            default: Option<&'a [u8]>,
        ) -> Result<Self> {
            Ok(Self {
                builder: builder.get_struct(STRUCT_SIZE, default)?,
            })
        }
    }

    impl<'a> Builder<'a> {
        pub fn reborrow(&mut self) -> Builder<'_> {
            Builder {
                builder: self.builder.reborrow(),
            }
        }

        pub fn as_reader(&self) -> Reader<'_> {
            Reader {
                reader: self.builder.as_reader(),
            }
        }

        pub fn set_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn set_sequence(&mut self, value: u64) {
            self.builder.set_data_field_mask::<u64>(1, value, 41);
        }

        pub fn set_urgent(&mut self, value: bool) {
            self.builder.set_bool_field_mask(32, value, true);
        }

        pub fn set_payload(&mut self, value: &str) -> Result<()> {
            self.builder.reborrow().get_pointer_field(0).set_text(value)
        }
    }

    impl<'a> SetPointerBuilder for Reader<'a> {
        fn set_pointer_builder(builder: PointerBuilder<'_>, from: Reader<'a>) -> Result<()> {
            copy_struct(builder, &from.reader)
        }
    }
}

use capstan::message::{Builder, ReaderOptions};
use capstan::{serialize, serialize_packed};

#[test]
fn build_encode_decode() {
    let mut message = Builder::new_default();
    {
        let mut root = message.init_root::<envelope::Builder>();
        root.set_id(42);
        root.set_payload("hello").unwrap();
    }

    let bytes = serialize::write_message_to_bytes(&message);
    let reader = serialize::read_message_from_flat_slice(&bytes, ReaderOptions::new()).unwrap();
    let root: envelope::Reader = reader.get_root().unwrap();
    assert_eq!(root.get_id(), 42);
    assert_eq!(root.get_payload().unwrap().to_str().unwrap(), "hello");

    let packed = serialize_packed::write_packed_message_to_bytes(&message);
    let reader = serialize_packed::read_packed_message(&packed, ReaderOptions::new()).unwrap();
    let root: envelope::Reader = reader.get_root().unwrap();
    assert_eq!(root.get_id(), 42);
    assert_eq!(root.get_payload().unwrap().to_str().unwrap(), "hello");
}

#[test]
fn scalar_defaults_follow_xor_semantics() {
    let mut message = Builder::new_default();
    {
        let mut root = message.init_root::<envelope::Builder>();
        // Freshly allocated struct reads each field's default.
        assert_eq!(root.as_reader().get_sequence(), 41);
        assert!(root.as_reader().get_urgent());
        assert_eq!(root.as_reader().get_id(), 0);

        // Writing the default reads back as the default.
        root.set_sequence(41);
        assert_eq!(root.as_reader().get_sequence(), 41);

        // Writing another value reads back as that value.
        root.set_sequence(1000);
        assert_eq!(root.as_reader().get_sequence(), 1000);
        root.set_urgent(false);
        assert!(!root.as_reader().get_urgent());
    }
}

#[test]
fn deep_copy_between_messages() {
    let mut source = Builder::new_default();
    {
        let mut root = source.init_root::<envelope::Builder>();
        root.set_id(7);
        root.set_sequence(99);
        root.set_payload("copied").unwrap();
    }

    let mut destination = Builder::new_default();
    destination
        .set_root(source.get_root_as_reader::<envelope::Reader>().unwrap())
        .unwrap();

    let root: envelope::Reader = destination.get_root_as_reader().unwrap();
    assert_eq!(root.get_id(), 7);
    assert_eq!(root.get_sequence(), 99);
    assert_eq!(root.get_payload().unwrap().to_str().unwrap(), "copied");
}

#[test]
fn absent_payload_reads_as_empty_default() {
    let mut message = Builder::new_default();
    {
        let mut root = message.init_root::<envelope::Builder>();
        root.set_id(1);
    }
    let bytes = serialize::write_message_to_bytes(&message);
    let reader = serialize::read_message_from_flat_slice(&bytes, ReaderOptions::new()).unwrap();
    let root: envelope::Reader = reader.get_root().unwrap();
    assert!(!root.has_payload());
    assert_eq!(root.get_payload().unwrap().as_bytes(), b"");
}

#[test]
fn struct_list_of_envelopes() {
    let mut message = Builder::new_default();
    {
        let root: capstan::any_pointer::Builder = message.init_root();
        let mut list: capstan::struct_list::Builder<envelope::Owned> = root.initn_as(3);
        for i in 0..3 {
            let mut elem = list.reborrow().get(i);
            elem.set_id(i);
            elem.set_payload(&format!("payload {i}")).unwrap();
        }
    }
    let bytes = serialize::write_message_to_bytes(&message);
    let reader = serialize::read_message_from_flat_slice(&bytes, ReaderOptions::new()).unwrap();
    let list: capstan::struct_list::Reader<envelope::Owned> = reader.get_root().unwrap();
    assert_eq!(list.len(), 3);
    for i in 0..3 {
        let elem = list.get(i);
        assert_eq!(elem.get_id(), i);
        assert_eq!(
            elem.get_payload().unwrap().to_str().unwrap(),
            format!("payload {i}")
        );
    }
}
