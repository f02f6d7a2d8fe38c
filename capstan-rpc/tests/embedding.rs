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

//! Embedding surfaces: the flat host bridge and the off-thread worker pool.

mod test_util;

use capstan::ErrorKind;
use capstan_rpc::bridge::HostBridge;
use capstan_rpc::worker::WorkerPool;
use capstan_rpc::{
    CapRef, Event, LoopbackPair, PayloadBuilder, Peer, PeerOptions, QueueTransport,
};

use test_util::*;

#[test]
fn host_bridge_round_trip() {
    // The "host" side: a peer wrapped in the byte-oriented bridge.
    let mut bridge = HostBridge::new(PeerOptions::default());
    let host_server = 0;
    bridge.peer_mut().set_bootstrap(host_server);

    // The remote side: an ordinary peer.
    let (transport, remote_out) = QueueTransport::new();
    let mut remote = Peer::new(Box::new(transport), PeerOptions::default());

    let boot_question = remote.send_bootstrap().unwrap();
    while let Some(frame) = remote_out.pop() {
        bridge.push_inbound(&frame).unwrap();
    }
    while let Some(frame) = bridge.pop_outbound() {
        remote.handle_frame(&frame).unwrap();
    }
    let (returned, result) = next_return(&mut remote);
    assert_eq!(returned, boot_question);
    let cap = result.unwrap().single_cap().unwrap();

    // A call dispatched to the host, answered through the flat surface.
    let call_question = remote
        .send_call(&cap, ECHO_INTERFACE, ECHO_METHOD, text_params("over the bridge"))
        .unwrap();
    while let Some(frame) = remote_out.pop() {
        bridge.push_inbound(&frame).unwrap();
    }

    let Some(Event::IncomingCall {
        answer_id,
        server,
        interface_id,
        params,
        ..
    }) = bridge.peer_mut().poll_event()
    else {
        panic!("the host should see the incoming call");
    };
    assert_eq!(server, host_server);
    assert_eq!(interface_id, ECHO_INTERFACE);
    let text: capstan::text::Reader = params.content().unwrap().get_as().unwrap();

    // The host computes a response frame out-of-band and posts it by id.
    let response_frame = {
        let mut message = capstan::message::Builder::new_default();
        message.set_root(text.to_str().unwrap()).unwrap();
        capstan::serialize::write_message_to_bytes(&message)
    };
    bridge
        .post_host_response(answer_id, Ok(response_frame))
        .unwrap();

    while let Some(frame) = bridge.pop_outbound() {
        remote.handle_frame(&frame).unwrap();
    }
    let (returned, result) = next_return(&mut remote);
    assert_eq!(returned, call_question);
    let payload = result.unwrap();
    let text: capstan::text::Reader = payload.content().unwrap().get_as().unwrap();
    assert_eq!(text.to_str().unwrap(), "over the bridge");
}

#[test]
fn host_bridge_rejects_unknown_question_ids() {
    let mut bridge = HostBridge::new(PeerOptions::default());
    let err = bridge
        .post_host_response(99, Ok(Vec::new()))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProtocolViolation);

    // Response content is validated only after the id check.
    let err = bridge
        .post_host_response(99, Err(capstan::Error::failed("boom".into())))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProtocolViolation);
}

#[test]
fn worker_pool_computes_results_off_thread() {
    let mut pair = LoopbackPair::new(PeerOptions::default());
    let worker_server = 0;
    pair.server.set_bootstrap(worker_server);
    let mut pool = WorkerPool::new(2);

    let boot_question = pair.client.send_bootstrap().unwrap();
    pair.pump().unwrap();
    let (_q, result) = next_return(&mut pair.client);
    let cap = result.unwrap().single_cap().unwrap();
    assert!(matches!(cap, CapRef::Import(_)));
    pair.client.send_finish(boot_question, false).unwrap();
    pair.pump().unwrap();

    let first = pair
        .client
        .send_call(&cap, ECHO_INTERFACE, ECHO_METHOD, text_params("alpha"))
        .unwrap();
    let second = pair
        .client
        .send_call(&cap, ECHO_INTERFACE, ECHO_METHOD, text_params("beta"))
        .unwrap();
    pair.pump().unwrap();

    // Parameters are extracted on the dispatch thread; only owned data
    // crosses into the pool.
    let mut dispatched = 0;
    while let Some(event) = pair.server.poll_event() {
        let Event::IncomingCall {
            answer_id, params, ..
        } = event
        else {
            panic!("expected an incoming call");
        };
        let text: capstan::text::Reader = params.content().unwrap().get_as().unwrap();
        let text = text.to_str().unwrap().to_string();
        pool.spawn(answer_id, move || {
            let mut results = PayloadBuilder::new();
            results.content().set_as(format!("{text}!").as_str())?;
            Ok(results)
        });
        dispatched += 1;
    }
    assert_eq!(dispatched, 2);

    while pool.outstanding() > 0 {
        pool.drain_into_blocking(&mut pair.server).unwrap();
    }
    pair.pump().unwrap();

    let mut answers = std::collections::HashMap::new();
    for _ in 0..2 {
        let (question, result) = next_return(&mut pair.client);
        let payload = result.unwrap();
        let text: capstan::text::Reader = payload.content().unwrap().get_as().unwrap();
        answers.insert(question, text.to_str().unwrap().to_string());
    }
    assert_eq!(answers.get(&first).map(String::as_str), Some("alpha!"));
    assert_eq!(answers.get(&second).map(String::as_str), Some("beta!"));
}
