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

//! Two-party connection scenarios: bootstrap, calls, pipelining, promise
//! resolution with embargoes, cancellation, and teardown.

mod test_util;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use capstan::{Error, ErrorKind};
use capstan_rpc::{
    CapRef, LoopbackPair, PayloadBuilder, Peer, PeerOptions, ServerSet, Transform, Transport,
};

use test_util::*;

#[test]
fn bootstrap_echo_and_release_empties_the_export_table() {
    let mut pair = LoopbackPair::new(PeerOptions::default());
    let mut servers = ServerSet::new();
    let (echo, calls, _log) = EchoServer::new();
    let echo = servers.add(Box::new(echo));
    pair.server.set_bootstrap(echo);

    let (boot_question, cap) = bootstrap_cap(&mut pair, &mut servers);
    let CapRef::Import(import_id) = cap.clone() else {
        panic!("bootstrap capability should be an import");
    };

    let call_question = pair
        .client
        .send_call(&cap, ECHO_INTERFACE, ECHO_METHOD, text_params("x"))
        .unwrap();
    drive(&mut pair, &mut servers);

    let (returned, result) = next_return(&mut pair.client);
    assert_eq!(returned, call_question);
    let payload = result.unwrap();
    let text: capstan::text::Reader = payload.content().unwrap().get_as().unwrap();
    assert_eq!(text.to_str().unwrap(), "x");
    assert_eq!(calls.get(), 1);

    pair.client.send_finish(call_question, true).unwrap();
    pair.client.send_finish(boot_question, false).unwrap();
    pair.client.send_release(import_id, 1).unwrap();
    drive(&mut pair, &mut servers);

    assert_eq!(pair.server.export_count(), 0);
    assert_eq!(pair.server.answer_count(), 0);
    assert_eq!(pair.client.question_count(), 0);
    assert_eq!(pair.client.import_count(), 0);
}

#[test]
fn pipelined_call_is_delivered_once_after_the_return() {
    let mut pair = LoopbackPair::new(PeerOptions::default());
    let mut servers = ServerSet::new();
    let (foo, foo_calls, _log) = EchoServer::new();
    let foo = servers.add(Box::new(foo));
    let factory = servers.add(Box::new(CapServer {
        cap: CapRef::LocalServer(foo),
    }));
    pair.server.set_bootstrap(factory);

    let (_boot, factory_cap) = bootstrap_cap(&mut pair, &mut servers);

    // Both calls go out before any frame is delivered: the second targets
    // the not-yet-returned result of the first.
    let question_a = pair
        .client
        .send_call(
            &factory_cap,
            FACTORY_INTERFACE,
            GET_FOO_METHOD,
            PayloadBuilder::new(),
        )
        .unwrap();
    let question_b = pair
        .client
        .send_call(
            &CapRef::PromisedAnswer {
                question_id: question_a,
                transform: Transform::new(),
            },
            ECHO_INTERFACE,
            ECHO_METHOD,
            text_params("pipelined"),
        )
        .unwrap();
    drive(&mut pair, &mut servers);

    let (first, result_a) = next_return(&mut pair.client);
    assert_eq!(first, question_a);
    assert!(result_a.is_ok());

    let (second, result_b) = next_return(&mut pair.client);
    assert_eq!(second, question_b);
    let payload = result_b.unwrap();
    let text: capstan::text::Reader = payload.content().unwrap().get_as().unwrap();
    assert_eq!(text.to_str().unwrap(), "pipelined");
    assert_eq!(foo_calls.get(), 1);
}

struct FlakyTransport {
    frames: Rc<RefCell<VecDeque<Vec<u8>>>>,
    fail_next: Rc<Cell<bool>>,
}

impl Transport for FlakyTransport {
    fn send_frame(&mut self, frame: Vec<u8>) -> capstan::Result<()> {
        if self.fail_next.take() {
            return Err(Error::disconnected("injected send failure".into()));
        }
        self.frames.borrow_mut().push_back(frame);
        Ok(())
    }
}

#[test]
fn send_failure_rolls_back_staged_cap_effects() {
    let frames = Rc::new(RefCell::new(VecDeque::new()));
    let fail_next = Rc::new(Cell::new(false));
    let transport = FlakyTransport {
        frames: frames.clone(),
        fail_next: fail_next.clone(),
    };
    let mut peer = Peer::new(Box::new(transport), PeerOptions::default());

    let two_fresh_caps = || {
        let mut params = PayloadBuilder::new();
        params.add_cap(CapRef::LocalServer(10));
        params.add_cap(CapRef::LocalServer(11));
        params
    };

    fail_next.set(true);
    let err = peer
        .send_call(&CapRef::Import(0), ECHO_INTERFACE, ECHO_METHOD, two_fresh_caps())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Disconnected);

    // Nothing reached the wire and no staged effect survived.
    assert!(frames.borrow().is_empty());
    assert_eq!(peer.export_count(), 0);
    assert_eq!(peer.question_count(), 0);

    // The same send succeeds once the transport recovers, and only then do
    // the exports appear.
    peer.send_call(&CapRef::Import(0), ECHO_INTERFACE, ECHO_METHOD, two_fresh_caps())
        .unwrap();
    assert_eq!(frames.borrow().len(), 1);
    assert_eq!(peer.export_count(), 2);
    assert_eq!(peer.export_ref_count(0), Some(1));
    assert_eq!(peer.export_ref_count(1), Some(1));
}

fn run_finish_case(workaround: bool) -> u32 {
    let mut pair = LoopbackPair::new(PeerOptions::default());
    let mut servers = ServerSet::new();
    let (echo, calls, _log) = EchoServer::new();
    let echo = servers.add(Box::new(echo));

    let promise = pair.server.new_promise_export();
    let gate = servers.add(Box::new(CapServer {
        cap: CapRef::Export(promise),
    }));
    pair.server.set_bootstrap(gate);

    let (_boot, cap) = bootstrap_cap(&mut pair, &mut servers);

    // The call parks behind the unresolved promise on the server.
    let question = pair
        .client
        .send_call(&cap, ECHO_INTERFACE, ECHO_METHOD, text_params("parked"))
        .unwrap();
    pair.pump().unwrap();

    // Finish races ahead of the resolution.
    pair.client
        .send_finish_with_workaround(question, true, workaround)
        .unwrap();
    pair.pump().unwrap();

    pair.server
        .send_resolve(promise, Ok(CapRef::LocalServer(echo)))
        .unwrap();
    drive(&mut pair, &mut servers);
    calls.get()
}

#[test]
fn early_finish_cancels_a_queued_promised_call() {
    assert_eq!(run_finish_case(false), 0);
}

#[test]
fn early_finish_with_workaround_preserves_a_queued_promised_call() {
    assert_eq!(run_finish_case(true), 1);
}

#[test]
fn embargo_preserves_call_order_across_resolution() {
    let mut pair = LoopbackPair::new(PeerOptions::default());
    let mut servers = ServerSet::new();
    let (echo, _calls, log) = EchoServer::new();
    let echo = servers.add(Box::new(echo));

    let promise = pair.server.new_promise_export();
    let gate = servers.add(Box::new(CapServer {
        cap: CapRef::Export(promise),
    }));
    pair.server.set_bootstrap(gate);

    let (_boot, cap) = bootstrap_cap(&mut pair, &mut servers);

    // First call parks behind the promise.
    let question_one = pair
        .client
        .send_call(&cap, ECHO_INTERFACE, ECHO_METHOD, text_params("one"))
        .unwrap();
    pair.pump().unwrap();
    assert!(log.borrow().is_empty());

    // The promise settles to a locally hosted server; the parked call runs.
    pair.server
        .send_resolve(promise, Ok(CapRef::LocalServer(echo)))
        .unwrap();
    servers.pump(&mut pair.server).unwrap();
    assert_eq!(*log.borrow(), vec!["one".to_string()]);

    // Deliver only the Resolve to the client; it raises an embargo and asks
    // for a loopback.
    assert!(pair.pump_one_to_client().unwrap());

    // A call issued under the embargo must not be observable anywhere yet.
    let question_two = pair
        .client
        .send_call(&cap, ECHO_INTERFACE, ECHO_METHOD, text_params("two"))
        .unwrap();
    assert_eq!(*log.borrow(), vec!["one".to_string()]);

    // Let the disembargo echo complete; the held call flows afterwards.
    drive(&mut pair, &mut servers);
    assert_eq!(*log.borrow(), vec!["one".to_string(), "two".to_string()]);

    let (first, result_one) = next_return(&mut pair.client);
    assert_eq!(first, question_one);
    assert!(result_one.is_ok());
    let (second, result_two) = next_return(&mut pair.client);
    assert_eq!(second, question_two);
    assert!(result_two.is_ok());
}

#[test]
fn client_handles_pipeline_through_the_bootstrap() {
    let (client_transport, client_to_server) = capstan_rpc::QueueTransport::new();
    let (server_transport, server_to_client) = capstan_rpc::QueueTransport::new();
    let client_peer = Rc::new(RefCell::new(Peer::new(
        Box::new(client_transport),
        PeerOptions::default(),
    )));
    let mut server_peer = Peer::new(Box::new(server_transport), PeerOptions::default());

    let mut servers = ServerSet::new();
    let (foo, foo_calls, _log) = EchoServer::new();
    let foo = servers.add(Box::new(foo));
    let factory = servers.add(Box::new(CapServer {
        cap: capstan_rpc::CapRef::LocalServer(foo),
    }));
    server_peer.set_bootstrap(factory);

    // Every call goes out before a single frame is delivered: the factory
    // call pipelines on the bootstrap, and the echo call pipelines on the
    // factory call.
    let (bootstrap, boot_question) =
        capstan_rpc::Client::bootstrap(client_peer.clone()).unwrap();
    let factory_question = bootstrap
        .call(FACTORY_INTERFACE, GET_FOO_METHOD, PayloadBuilder::new())
        .unwrap();
    let echo_question = bootstrap
        .pipeline(factory_question)
        .client()
        .call(ECHO_INTERFACE, ECHO_METHOD, text_params("deep"))
        .unwrap();

    for _ in 0..8 {
        while let Some(frame) = client_to_server.pop() {
            server_peer.handle_frame(&frame).unwrap();
        }
        servers.pump(&mut server_peer).unwrap();
        while let Some(frame) = server_to_client.pop() {
            client_peer.borrow_mut().handle_frame(&frame).unwrap();
        }
    }

    let mut client = client_peer.borrow_mut();
    let (first, _) = next_return(&mut client);
    assert_eq!(first, boot_question);
    let (second, _) = next_return(&mut client);
    assert_eq!(second, factory_question);
    let (third, result) = next_return(&mut client);
    assert_eq!(third, echo_question);
    let payload = result.unwrap();
    let text: capstan::text::Reader = payload.content().unwrap().get_as().unwrap();
    assert_eq!(text.to_str().unwrap(), "deep");
    assert_eq!(foo_calls.get(), 1);
}

#[test]
fn duplicate_question_id_aborts_the_connection() {
    let mut pair = LoopbackPair::new(PeerOptions::default());
    let mut servers = ServerSet::new();
    let (echo, _calls, _log) = EchoServer::new();
    let echo = servers.add(Box::new(echo));
    pair.server.set_bootstrap(echo);

    let frame = {
        let mut message = capstan::message::Builder::new_default();
        {
            let root = message.init_root::<capstan_rpc::proto::message::Builder>();
            let mut bootstrap = root.init_bootstrap();
            bootstrap.set_question_id(7);
        }
        capstan::serialize::write_message_to_bytes(&message)
    };

    pair.server.handle_frame(&frame).unwrap();
    let err = pair.server.handle_frame(&frame).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProtocolViolation);
    assert!(pair.server.is_closed());
    assert_eq!(pair.server.export_count(), 0);

    // The teardown reaches the other side. The client may trip over the
    // orphaned Return first; either way it ends up closed.
    assert!(pair.pump().is_err());
    assert!(pair.client.is_closed());
}

#[test]
fn shutdown_drains_outstanding_questions() {
    let mut pair = LoopbackPair::new(PeerOptions::default());
    let question = pair.client.send_bootstrap().unwrap();

    pair.client.shutdown(true);
    pair.client.shutdown(true); // idempotent

    let (returned, result) = next_return(&mut pair.client);
    assert_eq!(returned, question);
    assert_eq!(result.unwrap_err().kind, ErrorKind::ConnectionClosed);
    assert!(pair.client.is_closed());
    assert!(pair
        .client
        .send_bootstrap()
        .is_err());
}

#[test]
fn exception_returns_propagate_to_pipelined_calls() {
    let mut pair = LoopbackPair::new(PeerOptions::default());
    let mut servers = ServerSet::new();

    struct FailingServer;
    impl capstan_rpc::Dispatcher for FailingServer {
        fn dispatch_call(
            &mut self,
            _interface_id: u64,
            _method_id: u16,
            _params: capstan_rpc::Payload,
        ) -> capstan::Result<PayloadBuilder> {
            Err(Error::failed("no results here".into()))
        }
    }
    let failing = servers.add(Box::new(FailingServer));
    pair.server.set_bootstrap(failing);

    let (_boot, cap) = bootstrap_cap(&mut pair, &mut servers);

    let question_a = pair
        .client
        .send_call(&cap, ECHO_INTERFACE, ECHO_METHOD, PayloadBuilder::new())
        .unwrap();
    let question_b = pair
        .client
        .send_call(
            &CapRef::PromisedAnswer {
                question_id: question_a,
                transform: Transform::from_ops(&[0]),
            },
            ECHO_INTERFACE,
            ECHO_METHOD,
            PayloadBuilder::new(),
        )
        .unwrap();
    drive(&mut pair, &mut servers);

    let (first, result_a) = next_return(&mut pair.client);
    assert_eq!(first, question_a);
    assert_eq!(result_a.unwrap_err().kind, ErrorKind::Failed);

    let (second, result_b) = next_return(&mut pair.client);
    assert_eq!(second, question_b);
    assert_eq!(result_b.unwrap_err().kind, ErrorKind::Failed);
}
