// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
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

//! Hand-maintained accessors for the message types of the Cap'n Proto RPC
//! protocol (rpc.capnp). Follows the conventions of compiler-generated code;
//! field offsets are bit-exact with the standard schema and must stay that
//! way.

#![allow(clippy::should_implement_trait)]

macro_rules! struct_boilerplate {
    ($size:expr) => {
        pub const STRUCT_SIZE: StructSize = $size;

        #[derive(Clone, Copy)]
        pub struct Owned(());

        impl ::capstan::traits::Owned for Owned {
            type Reader<'a> = Reader<'a>;
            type Builder<'a> = Builder<'a>;
        }

        impl ::capstan::traits::OwnedStruct for Owned {
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

        impl<'a> SetPointerBuilder for Reader<'a> {
            fn set_pointer_builder(builder: PointerBuilder<'_>, from: Reader<'a>) -> Result<()> {
                copy_struct(builder, &from.reader)
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
        }
    };
}

pub mod exception {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::{NotInSchema, Result};

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 2,
    });

    #[repr(u16)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Type {
        Failed = 0,
        Overloaded = 1,
        Disconnected = 2,
        Unimplemented = 3,
    }

    impl TryFrom<u16> for Type {
        type Error = NotInSchema;
        fn try_from(value: u16) -> core::result::Result<Self, NotInSchema> {
            match value {
                0 => Ok(Self::Failed),
                1 => Ok(Self::Overloaded),
                2 => Ok(Self::Disconnected),
                3 => Ok(Self::Unimplemented),
                other => Err(NotInSchema(other)),
            }
        }
    }

    impl<'a> Reader<'a> {
        pub fn get_reason(&self) -> Result<capstan::text::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0), None)
        }

        pub fn get_type(&self) -> core::result::Result<Type, NotInSchema> {
            Type::try_from(self.reader.get_data_field::<u16>(2))
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_reason(&mut self, value: &str) -> Result<()> {
            self.builder.reborrow().get_pointer_field(0).set_text(value)
        }

        pub fn set_type(&mut self, value: Type) {
            self.builder.set_data_field::<u16>(2, value as u16);
        }
    }
}

pub mod message {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::{NotInSchema, Result};

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });

    pub enum Which<'a> {
        Unimplemented(Result<Reader<'a>>),
        Abort(Result<super::exception::Reader<'a>>),
        Call(Result<super::call::Reader<'a>>),
        Return(Result<super::return_::Reader<'a>>),
        Finish(Result<super::finish::Reader<'a>>),
        Resolve(Result<super::resolve::Reader<'a>>),
        Release(Result<super::release::Reader<'a>>),
        ObsoleteSave(Result<capstan::any_pointer::Reader<'a>>),
        Bootstrap(Result<super::bootstrap::Reader<'a>>),
        ObsoleteDelete(Result<capstan::any_pointer::Reader<'a>>),
        Provide(Result<super::provide::Reader<'a>>),
        Accept(Result<super::accept::Reader<'a>>),
        Join(Result<super::join::Reader<'a>>),
        Disembargo(Result<super::disembargo::Reader<'a>>),
    }

    impl<'a> Reader<'a> {
        pub fn which(&self) -> core::result::Result<Which<'a>, NotInSchema> {
            let pointer = self.reader.get_pointer_field(0);
            match self.reader.get_data_field::<u16>(0) {
                0 => Ok(Which::Unimplemented(FromPointerReader::get_from_pointer(
                    &pointer, None,
                ))),
                1 => Ok(Which::Abort(FromPointerReader::get_from_pointer(
                    &pointer, None,
                ))),
                2 => Ok(Which::Call(FromPointerReader::get_from_pointer(
                    &pointer, None,
                ))),
                3 => Ok(Which::Return(FromPointerReader::get_from_pointer(
                    &pointer, None,
                ))),
                4 => Ok(Which::Finish(FromPointerReader::get_from_pointer(
                    &pointer, None,
                ))),
                5 => Ok(Which::Resolve(FromPointerReader::get_from_pointer(
                    &pointer, None,
                ))),
                6 => Ok(Which::Release(FromPointerReader::get_from_pointer(
                    &pointer, None,
                ))),
                7 => Ok(Which::ObsoleteSave(FromPointerReader::get_from_pointer(
                    &pointer, None,
                ))),
                8 => Ok(Which::Bootstrap(FromPointerReader::get_from_pointer(
                    &pointer, None,
                ))),
                9 => Ok(Which::ObsoleteDelete(FromPointerReader::get_from_pointer(
                    &pointer, None,
                ))),
                10 => Ok(Which::Provide(FromPointerReader::get_from_pointer(
                    &pointer, None,
                ))),
                11 => Ok(Which::Accept(FromPointerReader::get_from_pointer(
                    &pointer, None,
                ))),
                12 => Ok(Which::Join(FromPointerReader::get_from_pointer(
                    &pointer, None,
                ))),
                13 => Ok(Which::Disembargo(FromPointerReader::get_from_pointer(
                    &pointer, None,
                ))),
                other => Err(NotInSchema(other)),
            }
        }
    }

    impl<'a> Builder<'a> {
        pub fn init_unimplemented(self) -> Builder<'a> {
            let mut builder = self.builder;
            builder.set_data_field::<u16>(0, 0);
            FromPointerBuilder::init_pointer(builder.get_pointer_field(0), 0)
        }

        /// Copies a received message into an Unimplemented reply.
        pub fn set_unimplemented(self, original: Reader<'_>) -> Result<()> {
            let mut builder = self.builder;
            builder.set_data_field::<u16>(0, 0);
            SetPointerBuilder::set_pointer_builder(builder.get_pointer_field(0), original)
        }

        pub fn init_abort(self) -> super::exception::Builder<'a> {
            let mut builder = self.builder;
            builder.set_data_field::<u16>(0, 1);
            FromPointerBuilder::init_pointer(builder.get_pointer_field(0), 0)
        }

        pub fn init_call(self) -> super::call::Builder<'a> {
            let mut builder = self.builder;
            builder.set_data_field::<u16>(0, 2);
            FromPointerBuilder::init_pointer(builder.get_pointer_field(0), 0)
        }

        pub fn init_return(self) -> super::return_::Builder<'a> {
            let mut builder = self.builder;
            builder.set_data_field::<u16>(0, 3);
            FromPointerBuilder::init_pointer(builder.get_pointer_field(0), 0)
        }

        pub fn init_finish(self) -> super::finish::Builder<'a> {
            let mut builder = self.builder;
            builder.set_data_field::<u16>(0, 4);
            FromPointerBuilder::init_pointer(builder.get_pointer_field(0), 0)
        }

        pub fn init_resolve(self) -> super::resolve::Builder<'a> {
            let mut builder = self.builder;
            builder.set_data_field::<u16>(0, 5);
            FromPointerBuilder::init_pointer(builder.get_pointer_field(0), 0)
        }

        pub fn init_release(self) -> super::release::Builder<'a> {
            let mut builder = self.builder;
            builder.set_data_field::<u16>(0, 6);
            FromPointerBuilder::init_pointer(builder.get_pointer_field(0), 0)
        }

        pub fn init_bootstrap(self) -> super::bootstrap::Builder<'a> {
            let mut builder = self.builder;
            builder.set_data_field::<u16>(0, 8);
            FromPointerBuilder::init_pointer(builder.get_pointer_field(0), 0)
        }

        pub fn init_provide(self) -> super::provide::Builder<'a> {
            let mut builder = self.builder;
            builder.set_data_field::<u16>(0, 10);
            FromPointerBuilder::init_pointer(builder.get_pointer_field(0), 0)
        }

        pub fn init_accept(self) -> super::accept::Builder<'a> {
            let mut builder = self.builder;
            builder.set_data_field::<u16>(0, 11);
            FromPointerBuilder::init_pointer(builder.get_pointer_field(0), 0)
        }

        pub fn init_join(self) -> super::join::Builder<'a> {
            let mut builder = self.builder;
            builder.set_data_field::<u16>(0, 12);
            FromPointerBuilder::init_pointer(builder.get_pointer_field(0), 0)
        }

        pub fn init_disembargo(self) -> super::disembargo::Builder<'a> {
            let mut builder = self.builder;
            builder.set_data_field::<u16>(0, 13);
            FromPointerBuilder::init_pointer(builder.get_pointer_field(0), 0)
        }
    }
}

pub mod bootstrap {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::Result;

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });

    impl<'a> Reader<'a> {
        pub fn get_question_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }
    }
}

pub mod call {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::{NotInSchema, Result};

    struct_boilerplate!(StructSize {
        data: 3,
        pointers: 3,
    });

    pub enum WhichSendResultsTo<'a> {
        Caller(()),
        Yourself(()),
        ThirdParty(capstan::any_pointer::Reader<'a>),
    }

    impl<'a> Reader<'a> {
        pub fn get_question_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_target(&self) -> Result<super::message_target::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0), None)
        }

        pub fn get_interface_id(&self) -> u64 {
            self.reader.get_data_field::<u64>(1)
        }

        pub fn get_method_id(&self) -> u16 {
            self.reader.get_data_field::<u16>(2)
        }

        pub fn get_params(&self) -> Result<super::payload::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(1), None)
        }

        pub fn get_send_results_to(
            &self,
        ) -> core::result::Result<WhichSendResultsTo<'a>, NotInSchema> {
            match self.reader.get_data_field::<u16>(3) {
                0 => Ok(WhichSendResultsTo::Caller(())),
                1 => Ok(WhichSendResultsTo::Yourself(())),
                2 => Ok(WhichSendResultsTo::ThirdParty(
                    capstan::any_pointer::Reader::new(self.reader.get_pointer_field(2)),
                )),
                other => Err(NotInSchema(other)),
            }
        }

        pub fn get_allow_third_party_tail_call(&self) -> bool {
            self.reader.get_bool_field(128)
        }

        pub fn get_no_promise_pipelining(&self) -> bool {
            self.reader.get_bool_field(129)
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn init_target(&mut self) -> super::message_target::Builder<'_> {
            FromPointerBuilder::init_pointer(self.builder.reborrow().get_pointer_field(0), 0)
        }

        pub fn set_interface_id(&mut self, value: u64) {
            self.builder.set_data_field::<u64>(1, value);
        }

        pub fn set_method_id(&mut self, value: u16) {
            self.builder.set_data_field::<u16>(2, value);
        }

        pub fn init_params(&mut self) -> super::payload::Builder<'_> {
            FromPointerBuilder::init_pointer(self.builder.reborrow().get_pointer_field(1), 0)
        }

        pub fn set_send_results_to_caller(&mut self) {
            self.builder.set_data_field::<u16>(3, 0);
        }

        pub fn set_send_results_to_yourself(&mut self) {
            self.builder.set_data_field::<u16>(3, 1);
        }

        pub fn init_send_results_to_third_party(&mut self) -> capstan::any_pointer::Builder<'_> {
            self.builder.set_data_field::<u16>(3, 2);
            capstan::any_pointer::Builder::new(self.builder.reborrow().get_pointer_field(2))
        }
    }
}

pub mod return_ {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::{NotInSchema, Result};

    struct_boilerplate!(StructSize {
        data: 2,
        pointers: 1,
    });

    pub enum Which<'a> {
        Results(Result<super::payload::Reader<'a>>),
        Exception(Result<super::exception::Reader<'a>>),
        Canceled(()),
        ResultsSentElsewhere(()),
        TakeFromOtherQuestion(u32),
        AcceptFromThirdParty(capstan::any_pointer::Reader<'a>),
    }

    impl<'a> Reader<'a> {
        pub fn get_answer_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_release_param_caps(&self) -> bool {
            self.reader.get_bool_field_mask(32, true)
        }

        pub fn which(&self) -> core::result::Result<Which<'a>, NotInSchema> {
            match self.reader.get_data_field::<u16>(3) {
                0 => Ok(Which::Results(FromPointerReader::get_from_pointer(
                    &self.reader.get_pointer_field(0),
                    None,
                ))),
                1 => Ok(Which::Exception(FromPointerReader::get_from_pointer(
                    &self.reader.get_pointer_field(0),
                    None,
                ))),
                2 => Ok(Which::Canceled(())),
                3 => Ok(Which::ResultsSentElsewhere(())),
                4 => Ok(Which::TakeFromOtherQuestion(
                    self.reader.get_data_field::<u32>(2),
                )),
                5 => Ok(Which::AcceptFromThirdParty(
                    capstan::any_pointer::Reader::new(self.reader.get_pointer_field(0)),
                )),
                other => Err(NotInSchema(other)),
            }
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_answer_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn set_release_param_caps(&mut self, value: bool) {
            self.builder.set_bool_field_mask(32, value, true);
        }

        pub fn init_results(&mut self) -> super::payload::Builder<'_> {
            self.builder.set_data_field::<u16>(3, 0);
            FromPointerBuilder::init_pointer(self.builder.reborrow().get_pointer_field(0), 0)
        }

        pub fn init_exception(&mut self) -> super::exception::Builder<'_> {
            self.builder.set_data_field::<u16>(3, 1);
            FromPointerBuilder::init_pointer(self.builder.reborrow().get_pointer_field(0), 0)
        }

        pub fn set_canceled(&mut self) {
            self.builder.set_data_field::<u16>(3, 2);
        }

        pub fn set_results_sent_elsewhere(&mut self) {
            self.builder.set_data_field::<u16>(3, 3);
        }

        pub fn set_take_from_other_question(&mut self, value: u32) {
            self.builder.set_data_field::<u16>(3, 4);
            self.builder.set_data_field::<u32>(2, value);
        }
    }
}

pub mod finish {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::Result;

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 0,
    });

    impl<'a> Reader<'a> {
        pub fn get_question_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_release_result_caps(&self) -> bool {
            self.reader.get_bool_field_mask(32, true)
        }

        pub fn get_require_early_cancellation_workaround(&self) -> bool {
            self.reader.get_bool_field_mask(33, true)
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn set_release_result_caps(&mut self, value: bool) {
            self.builder.set_bool_field_mask(32, value, true);
        }

        pub fn set_require_early_cancellation_workaround(&mut self, value: bool) {
            self.builder.set_bool_field_mask(33, value, true);
        }
    }
}

pub mod resolve {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::{NotInSchema, Result};

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });

    pub enum Which<'a> {
        Cap(Result<super::cap_descriptor::Reader<'a>>),
        Exception(Result<super::exception::Reader<'a>>),
    }

    impl<'a> Reader<'a> {
        pub fn get_promise_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn which(&self) -> core::result::Result<Which<'a>, NotInSchema> {
            match self.reader.get_data_field::<u16>(2) {
                0 => Ok(Which::Cap(FromPointerReader::get_from_pointer(
                    &self.reader.get_pointer_field(0),
                    None,
                ))),
                1 => Ok(Which::Exception(FromPointerReader::get_from_pointer(
                    &self.reader.get_pointer_field(0),
                    None,
                ))),
                other => Err(NotInSchema(other)),
            }
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_promise_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn init_cap(&mut self) -> super::cap_descriptor::Builder<'_> {
            self.builder.set_data_field::<u16>(2, 0);
            FromPointerBuilder::init_pointer(self.builder.reborrow().get_pointer_field(0), 0)
        }

        pub fn init_exception(&mut self) -> super::exception::Builder<'_> {
            self.builder.set_data_field::<u16>(2, 1);
            FromPointerBuilder::init_pointer(self.builder.reborrow().get_pointer_field(0), 0)
        }
    }
}

pub mod release {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::Result;

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 0,
    });

    impl<'a> Reader<'a> {
        pub fn get_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_reference_count(&self) -> u32 {
            self.reader.get_data_field::<u32>(1)
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn set_reference_count(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(1, value);
        }
    }
}

pub mod disembargo {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::{NotInSchema, Result};

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum WhichContext {
        SenderLoopback(u32),
        ReceiverLoopback(u32),
        Accept(()),
        Provide(u32),
    }

    impl<'a> Reader<'a> {
        pub fn get_target(&self) -> Result<super::message_target::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0), None)
        }

        pub fn get_context(&self) -> core::result::Result<WhichContext, NotInSchema> {
            let value = self.reader.get_data_field::<u32>(0);
            match self.reader.get_data_field::<u16>(2) {
                0 => Ok(WhichContext::SenderLoopback(value)),
                1 => Ok(WhichContext::ReceiverLoopback(value)),
                2 => Ok(WhichContext::Accept(())),
                3 => Ok(WhichContext::Provide(value)),
                other => Err(NotInSchema(other)),
            }
        }
    }

    impl<'a> Builder<'a> {
        pub fn init_target(&mut self) -> super::message_target::Builder<'_> {
            FromPointerBuilder::init_pointer(self.builder.reborrow().get_pointer_field(0), 0)
        }

        pub fn set_context_sender_loopback(&mut self, embargo_id: u32) {
            self.builder.set_data_field::<u16>(2, 0);
            self.builder.set_data_field::<u32>(0, embargo_id);
        }

        pub fn set_context_receiver_loopback(&mut self, embargo_id: u32) {
            self.builder.set_data_field::<u16>(2, 1);
            self.builder.set_data_field::<u32>(0, embargo_id);
        }

        pub fn set_context_accept(&mut self) {
            self.builder.set_data_field::<u16>(2, 2);
        }

        pub fn set_context_provide(&mut self, question_id: u32) {
            self.builder.set_data_field::<u16>(2, 3);
            self.builder.set_data_field::<u32>(0, question_id);
        }
    }
}

pub mod provide {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::Result;

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 2,
    });

    impl<'a> Reader<'a> {
        pub fn get_question_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_target(&self) -> Result<super::message_target::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0), None)
        }

        pub fn get_recipient(&self) -> capstan::any_pointer::Reader<'a> {
            capstan::any_pointer::Reader::new(self.reader.get_pointer_field(1))
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn init_target(&mut self) -> super::message_target::Builder<'_> {
            FromPointerBuilder::init_pointer(self.builder.reborrow().get_pointer_field(0), 0)
        }

        pub fn init_recipient(&mut self) -> capstan::any_pointer::Builder<'_> {
            capstan::any_pointer::Builder::new(self.builder.reborrow().get_pointer_field(1))
        }
    }
}

pub mod accept {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::Result;

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });

    impl<'a> Reader<'a> {
        pub fn get_question_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_provision(&self) -> capstan::any_pointer::Reader<'a> {
            capstan::any_pointer::Reader::new(self.reader.get_pointer_field(0))
        }

        /// The embargo flag sits alone in its byte, so the strict decoder
        /// applies.
        pub fn get_embargo(&self) -> Result<bool> {
            self.reader.get_bool_field_strict(32)
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn init_provision(&mut self) -> capstan::any_pointer::Builder<'_> {
            capstan::any_pointer::Builder::new(self.builder.reborrow().get_pointer_field(0))
        }

        pub fn set_embargo(&mut self, value: bool) {
            self.builder.set_bool_field(32, value);
        }
    }
}

pub mod join {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::Result;

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 2,
    });

    impl<'a> Reader<'a> {
        pub fn get_question_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_target(&self) -> Result<super::message_target::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0), None)
        }

        pub fn get_key_part(&self) -> Result<super::join_key_part::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(1), None)
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn init_target(&mut self) -> super::message_target::Builder<'_> {
            FromPointerBuilder::init_pointer(self.builder.reborrow().get_pointer_field(0), 0)
        }

        pub fn init_key_part(&mut self) -> super::join_key_part::Builder<'_> {
            FromPointerBuilder::init_pointer(self.builder.reborrow().get_pointer_field(1), 0)
        }
    }
}

pub mod join_key_part {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::Result;

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 0,
    });

    impl<'a> Reader<'a> {
        pub fn get_join_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_part_count(&self) -> u16 {
            self.reader.get_data_field::<u16>(2)
        }

        pub fn get_part_num(&self) -> u16 {
            self.reader.get_data_field::<u16>(3)
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_join_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn set_part_count(&mut self, value: u16) {
            self.builder.set_data_field::<u16>(2, value);
        }

        pub fn set_part_num(&mut self, value: u16) {
            self.builder.set_data_field::<u16>(3, value);
        }
    }
}

pub mod message_target {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::{NotInSchema, Result};

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });

    pub enum Which<'a> {
        ImportedCap(u32),
        PromisedAnswer(Result<super::promised_answer::Reader<'a>>),
    }

    impl<'a> Reader<'a> {
        pub fn which(&self) -> core::result::Result<Which<'a>, NotInSchema> {
            match self.reader.get_data_field::<u16>(2) {
                0 => Ok(Which::ImportedCap(self.reader.get_data_field::<u32>(0))),
                1 => Ok(Which::PromisedAnswer(FromPointerReader::get_from_pointer(
                    &self.reader.get_pointer_field(0),
                    None,
                ))),
                other => Err(NotInSchema(other)),
            }
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_imported_cap(&mut self, value: u32) {
            self.builder.set_data_field::<u16>(2, 0);
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn init_promised_answer(&mut self) -> super::promised_answer::Builder<'_> {
            self.builder.set_data_field::<u16>(2, 1);
            FromPointerBuilder::init_pointer(self.builder.reborrow().get_pointer_field(0), 0)
        }
    }
}

pub mod payload {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::Result;

    struct_boilerplate!(StructSize {
        data: 0,
        pointers: 2,
    });

    impl<'a> Reader<'a> {
        pub fn get_content(&self) -> capstan::any_pointer::Reader<'a> {
            capstan::any_pointer::Reader::new(self.reader.get_pointer_field(0))
        }

        pub fn has_cap_table(&self) -> bool {
            !self.reader.get_pointer_field(1).is_null()
        }

        pub fn get_cap_table(
            &self,
        ) -> Result<capstan::struct_list::Reader<'a, super::cap_descriptor::Owned>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(1), None)
        }
    }

    impl<'a> Builder<'a> {
        pub fn get_content(&mut self) -> capstan::any_pointer::Builder<'_> {
            capstan::any_pointer::Builder::new(self.builder.reborrow().get_pointer_field(0))
        }

        pub fn init_cap_table(
            &mut self,
            length: u32,
        ) -> capstan::struct_list::Builder<'_, super::cap_descriptor::Owned> {
            FromPointerBuilder::init_pointer(
                self.builder.reborrow().get_pointer_field(1),
                length,
            )
        }
    }
}

pub mod cap_descriptor {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::{NotInSchema, Result};

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });

    pub enum Which<'a> {
        None(()),
        SenderHosted(u32),
        SenderPromise(u32),
        ReceiverHosted(u32),
        ReceiverAnswer(Result<super::promised_answer::Reader<'a>>),
        ThirdPartyHosted(Result<super::third_party_cap_descriptor::Reader<'a>>),
    }

    impl<'a> Reader<'a> {
        pub fn which(&self) -> core::result::Result<Which<'a>, NotInSchema> {
            let id = self.reader.get_data_field::<u32>(1);
            match self.reader.get_data_field::<u16>(0) {
                0 => Ok(Which::None(())),
                1 => Ok(Which::SenderHosted(id)),
                2 => Ok(Which::SenderPromise(id)),
                3 => Ok(Which::ReceiverHosted(id)),
                4 => Ok(Which::ReceiverAnswer(FromPointerReader::get_from_pointer(
                    &self.reader.get_pointer_field(0),
                    None,
                ))),
                5 => Ok(Which::ThirdPartyHosted(
                    FromPointerReader::get_from_pointer(
                        &self.reader.get_pointer_field(0),
                        None,
                    ),
                )),
                other => Err(NotInSchema(other)),
            }
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_none(&mut self) {
            self.builder.set_data_field::<u16>(0, 0);
        }

        pub fn set_sender_hosted(&mut self, value: u32) {
            self.builder.set_data_field::<u16>(0, 1);
            self.builder.set_data_field::<u32>(1, value);
        }

        pub fn set_sender_promise(&mut self, value: u32) {
            self.builder.set_data_field::<u16>(0, 2);
            self.builder.set_data_field::<u32>(1, value);
        }

        pub fn set_receiver_hosted(&mut self, value: u32) {
            self.builder.set_data_field::<u16>(0, 3);
            self.builder.set_data_field::<u32>(1, value);
        }

        pub fn init_receiver_answer(&mut self) -> super::promised_answer::Builder<'_> {
            self.builder.set_data_field::<u16>(0, 4);
            FromPointerBuilder::init_pointer(self.builder.reborrow().get_pointer_field(0), 0)
        }

        pub fn init_third_party_hosted(
            &mut self,
        ) -> super::third_party_cap_descriptor::Builder<'_> {
            self.builder.set_data_field::<u16>(0, 5);
            FromPointerBuilder::init_pointer(self.builder.reborrow().get_pointer_field(0), 0)
        }
    }
}

pub mod promised_answer {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::Result;

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });

    impl<'a> Reader<'a> {
        pub fn get_question_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn has_transform(&self) -> bool {
            !self.reader.get_pointer_field(0).is_null()
        }

        pub fn get_transform(
            &self,
        ) -> Result<capstan::struct_list::Reader<'a, op::Owned>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0), None)
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn init_transform(
            &mut self,
            length: u32,
        ) -> capstan::struct_list::Builder<'_, op::Owned> {
            FromPointerBuilder::init_pointer(
                self.builder.reborrow().get_pointer_field(0),
                length,
            )
        }
    }

    pub mod op {
        use capstan::private::layout::{
            copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
        };
        use capstan::traits::{
            FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
            SetPointerBuilder,
        };
        use capstan::{NotInSchema, Result};

        struct_boilerplate!(StructSize {
            data: 1,
            pointers: 0,
        });

        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum Which {
            Noop(()),
            GetPointerField(u16),
        }

        impl<'a> Reader<'a> {
            pub fn which(&self) -> core::result::Result<Which, NotInSchema> {
                match self.reader.get_data_field::<u16>(0) {
                    0 => Ok(Which::Noop(())),
                    1 => Ok(Which::GetPointerField(
                        self.reader.get_data_field::<u16>(1),
                    )),
                    other => Err(NotInSchema(other)),
                }
            }
        }

        impl<'a> Builder<'a> {
            pub fn set_noop(&mut self) {
                self.builder.set_data_field::<u16>(0, 0);
            }

            pub fn set_get_pointer_field(&mut self, value: u16) {
                self.builder.set_data_field::<u16>(0, 1);
                self.builder.set_data_field::<u16>(1, value);
            }
        }
    }
}

pub mod third_party_cap_descriptor {
    use capstan::private::layout::{
        copy_struct, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use capstan::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use capstan::Result;

    struct_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });

    impl<'a> Reader<'a> {
        pub fn get_id(&self) -> capstan::any_pointer::Reader<'a> {
            capstan::any_pointer::Reader::new(self.reader.get_pointer_field(0))
        }

        pub fn get_vine_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }
    }

    impl<'a> Builder<'a> {
        pub fn init_id(&mut self) -> capstan::any_pointer::Builder<'_> {
            capstan::any_pointer::Builder::new(self.builder.reborrow().get_pointer_field(0))
        }

        pub fn set_vine_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan::message::Builder;

    #[test]
    fn call_layout_round_trips() {
        let mut message = Builder::new_default();
        {
            let root = message.init_root::<message::Builder>();
            let mut call = root.init_call();
            call.set_question_id(17);
            call.set_interface_id(0xdead_beef_cafe_0042);
            call.set_method_id(3);
            call.init_target().set_imported_cap(5);
            call.set_send_results_to_yourself();
        }
        let reader: message::Reader = message.get_root_as_reader().unwrap();
        let message::Which::Call(call) = reader.which().unwrap() else {
            panic!("expected a call");
        };
        let call = call.unwrap();
        assert_eq!(call.get_question_id(), 17);
        assert_eq!(call.get_interface_id(), 0xdead_beef_cafe_0042);
        assert_eq!(call.get_method_id(), 3);
        assert!(matches!(
            call.get_send_results_to().unwrap(),
            call::WhichSendResultsTo::Yourself(())
        ));
        let message_target::Which::ImportedCap(id) = call.get_target().unwrap().which().unwrap()
        else {
            panic!("expected an imported cap");
        };
        assert_eq!(id, 5);
    }

    #[test]
    fn finish_flag_defaults_are_true() {
        let mut message = Builder::new_default();
        {
            let root = message.init_root::<message::Builder>();
            let mut finish = root.init_finish();
            finish.set_question_id(1);
        }
        let reader: message::Reader = message.get_root_as_reader().unwrap();
        let message::Which::Finish(finish) = reader.which().unwrap() else {
            panic!("expected a finish");
        };
        let finish = finish.unwrap();
        // Both booleans default to true, so a zeroed word must read true.
        assert!(finish.get_release_result_caps());
        assert!(finish.get_require_early_cancellation_workaround());

        let mut message = Builder::new_default();
        {
            let root = message.init_root::<message::Builder>();
            let mut finish = root.init_finish();
            finish.set_question_id(1);
            finish.set_release_result_caps(false);
            finish.set_require_early_cancellation_workaround(false);
        }
        let reader: message::Reader = message.get_root_as_reader().unwrap();
        let message::Which::Finish(finish) = reader.which().unwrap() else {
            panic!("expected a finish");
        };
        let finish = finish.unwrap();
        assert!(!finish.get_release_result_caps());
        assert!(!finish.get_require_early_cancellation_workaround());
    }

    #[test]
    fn cap_descriptor_variants() {
        let mut message = Builder::new_default();
        {
            let mut payload = message.init_root::<payload::Builder>();
            let mut table = payload.init_cap_table(3);
            table.reborrow().get(0).set_sender_hosted(11);
            table.reborrow().get(1).set_receiver_hosted(22);
            let mut answer = table.reborrow().get(2);
            let mut promised = answer.init_receiver_answer();
            promised.set_question_id(9);
            let mut transform = promised.init_transform(2);
            transform.reborrow().get(0).set_get_pointer_field(1);
            transform.reborrow().get(1).set_get_pointer_field(4);
        }
        let payload: payload::Reader = message.get_root_as_reader().unwrap();
        let table = payload.get_cap_table().unwrap();
        assert_eq!(table.len(), 3);
        assert!(matches!(
            table.get(0).which().unwrap(),
            cap_descriptor::Which::SenderHosted(11)
        ));
        assert!(matches!(
            table.get(1).which().unwrap(),
            cap_descriptor::Which::ReceiverHosted(22)
        ));
        let cap_descriptor::Which::ReceiverAnswer(answer) = table.get(2).which().unwrap() else {
            panic!("expected a receiver answer");
        };
        let answer = answer.unwrap();
        assert_eq!(answer.get_question_id(), 9);
        let transform = answer.get_transform().unwrap();
        assert_eq!(transform.len(), 2);
        assert!(matches!(
            transform.get(1).which().unwrap(),
            promised_answer::op::Which::GetPointerField(4)
        ));
    }

    #[test]
    fn return_union_discriminants() {
        let mut message = Builder::new_default();
        {
            let root = message.init_root::<message::Builder>();
            let mut ret = root.init_return();
            ret.set_answer_id(5);
            ret.set_take_from_other_question(77);
        }
        let reader: message::Reader = message.get_root_as_reader().unwrap();
        let message::Which::Return(ret) = reader.which().unwrap() else {
            panic!("expected a return");
        };
        let ret = ret.unwrap();
        assert_eq!(ret.get_answer_id(), 5);
        assert!(ret.get_release_param_caps());
        assert!(matches!(
            ret.which().unwrap(),
            return_::Which::TakeFromOtherQuestion(77)
        ));
    }
}
