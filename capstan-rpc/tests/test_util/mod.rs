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

//! Hand-written servers for a small test protocol, playing the role that
//! schema-generated dispatch code would.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use capstan::Result;
use capstan_rpc::{
    CapRef, Dispatcher, Event, LoopbackPair, Payload, PayloadBuilder, Peer, QuestionId,
    ServerId, ServerSet,
};

pub const ECHO_INTERFACE: u64 = 0xe5e5_0000_0000_0001;
pub const ECHO_METHOD: u16 = 0;

pub const FACTORY_INTERFACE: u64 = 0xe5e5_0000_0000_0002;
pub const GET_FOO_METHOD: u16 = 0;

/// Echoes its text parameter and records every call.
pub struct EchoServer {
    pub calls: Rc<Cell<u32>>,
    pub log: Rc<RefCell<Vec<String>>>,
}

impl EchoServer {
    pub fn new() -> (Self, Rc<Cell<u32>>, Rc<RefCell<Vec<String>>>) {
        let calls = Rc::new(Cell::new(0));
        let log = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                calls: calls.clone(),
                log: log.clone(),
            },
            calls,
            log,
        )
    }
}

impl Dispatcher for EchoServer {
    fn dispatch_call(
        &mut self,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> Result<PayloadBuilder> {
        assert_eq!(interface_id, ECHO_INTERFACE);
        assert_eq!(method_id, ECHO_METHOD);
        let text: capstan::text::Reader = params.content()?.get_as()?;
        let text = text.to_str()?.to_string();
        self.calls.set(self.calls.get() + 1);
        self.log.borrow_mut().push(text.clone());
        let mut results = PayloadBuilder::new();
        results.content().set_as(text.as_str())?;
        Ok(results)
    }
}

/// Returns a fixed capability from every call (and from bootstrap, when
/// registered as the bootstrap server).
pub struct CapServer {
    pub cap: CapRef,
}

impl Dispatcher for CapServer {
    fn dispatch_call(
        &mut self,
        _interface_id: u64,
        _method_id: u16,
        _params: Payload,
    ) -> Result<PayloadBuilder> {
        let mut results = PayloadBuilder::new();
        results.set_cap(self.cap.clone());
        Ok(results)
    }
}

pub fn text_params(text: &str) -> PayloadBuilder {
    let mut params = PayloadBuilder::new();
    params
        .content()
        .set_as(text)
        .expect("building text params cannot fail");
    params
}

/// Pumps frames and server dispatch until the connection goes quiet.
pub fn drive(pair: &mut LoopbackPair, servers: &mut ServerSet) {
    for _ in 0..16 {
        pair.pump().expect("pump");
        servers.pump(&mut pair.server).expect("server dispatch");
    }
    pair.pump().expect("pump");
}

/// Pops the next completed question from the peer's event queue, skipping
/// resolution notices.
pub fn next_return(peer: &mut Peer) -> (QuestionId, Result<Payload>) {
    while let Some(event) = peer.poll_event() {
        match event {
            Event::Returned {
                question_id,
                result,
            } => return (question_id, result),
            Event::Resolved { .. } => continue,
            Event::Aborted { error } => panic!("connection aborted: {error}"),
            Event::IncomingCall { .. } | Event::LoopbackCall { .. } => {
                panic!("unexpected inbound call on the client side")
            }
        }
    }
    panic!("no completed question in the event queue")
}

/// Fetches the peer's bootstrap capability, fully pumped.
pub fn bootstrap_cap(pair: &mut LoopbackPair, servers: &mut ServerSet) -> (QuestionId, CapRef) {
    let question = pair.client.send_bootstrap().expect("send bootstrap");
    drive(pair, servers);
    let (returned, result) = next_return(&mut pair.client);
    assert_eq!(returned, question);
    let cap = result
        .expect("bootstrap succeeds")
        .single_cap()
        .expect("bootstrap payload carries one capability");
    (question, cap)
}

/// A server slot id that is never registered; payloads only.
pub fn opaque_server_slot(set: &mut ServerSet) -> ServerId {
    struct Unreachable;
    impl Dispatcher for Unreachable {
        fn dispatch_call(
            &mut self,
            _interface_id: u64,
            _method_id: u16,
            _params: Payload,
        ) -> Result<PayloadBuilder> {
            panic!("this server is never supposed to be called")
        }
    }
    set.add(Box::new(Unreachable))
}
