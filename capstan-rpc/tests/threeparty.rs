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

//! Level 3 scenarios: handing a capability hosted on one vat to another vat
//! without proxying through the introducer, and joining capability parts.

mod test_util;

use capstan::ErrorKind;
use capstan_rpc::{
    CapRef, LoopbackPair, PeerOptions, ServerSet, SharedProvisions,
};

use test_util::*;

/// Peer A introduces a capability hosted on vat C to peer B.
///
/// Connections: A--B (A hosts the introducer), A--C and B--C (C hosts the
/// target). C's two connections share one provision table.
#[test]
fn provide_accept_hands_off_a_capability() {
    // A--C: A is the client; C hosts the target.
    let mut pair_ac = LoopbackPair::new(PeerOptions::default());
    // B--C: B is the client.
    let mut pair_bc = LoopbackPair::new(PeerOptions::default());
    // A--B: B is the client; A hosts the introducer.
    let mut pair_ab = LoopbackPair::new(PeerOptions::default());

    let shared = SharedProvisions::default();
    pair_ac.server.set_shared_provisions(shared.clone());
    pair_bc.server.set_shared_provisions(shared.clone());

    // Vat C's servers, reachable from both of C's connections.
    let mut c_servers = ServerSet::new();
    let (target, target_calls, target_log) = EchoServer::new();
    let target = c_servers.add(Box::new(target));
    pair_ac.server.set_bootstrap(target);

    // A imports the target from C.
    let (_boot_ac, target_on_a) = bootstrap_cap(&mut pair_ac, &mut c_servers);

    // A registers the provision with C and introduces the capability to B
    // as third-party hosted, with a vine falling back through A.
    let completion_key = b"completion-key-1".to_vec();
    let provide_question = pair_ac
        .client
        .send_provide(&target_on_a, &completion_key)
        .unwrap();
    drive(&mut pair_ac, &mut c_servers);
    let (returned, provide_ack) = next_return(&mut pair_ac.client);
    assert_eq!(returned, provide_question);
    provide_ack.unwrap();
    assert_eq!(shared.borrow().len(), 1);

    let mut a_servers = ServerSet::new();
    let vine = opaque_server_slot(&mut a_servers);
    let introducer = a_servers.add(Box::new(CapServer {
        cap: CapRef::ThirdPartyHosted {
            third_party_id: completion_key.clone(),
            vine,
        },
    }));
    pair_ab.server.set_bootstrap(introducer);

    // B receives the introduction.
    let (_boot_ab, introduced) = bootstrap_cap(&mut pair_ab, &mut a_servers);
    let CapRef::ThirdParty {
        third_party_id,
        vine: _vine_import,
    } = introduced
    else {
        panic!("introduction should carry a third-party capability");
    };
    assert_eq!(third_party_id, completion_key);

    // B redeems the completion key directly with C.
    let accept_question = pair_bc
        .client
        .send_accept(&third_party_id, false)
        .unwrap();
    drive(&mut pair_bc, &mut c_servers);
    let (returned, accepted) = next_return(&mut pair_bc.client);
    assert_eq!(returned, accept_question);
    let accepted_cap = accepted.unwrap().single_cap().unwrap();
    assert!(matches!(accepted_cap, CapRef::Import(_)));

    // Subsequent B->C calls reach the C-side target without touching A.
    let call_question = pair_bc
        .client
        .send_call(
            &accepted_cap,
            ECHO_INTERFACE,
            ECHO_METHOD,
            text_params("direct"),
        )
        .unwrap();
    drive(&mut pair_bc, &mut c_servers);
    let (returned, result) = next_return(&mut pair_bc.client);
    assert_eq!(returned, call_question);
    let payload = result.unwrap();
    let text: capstan::text::Reader = payload.content().unwrap().get_as().unwrap();
    assert_eq!(text.to_str().unwrap(), "direct");
    assert_eq!(target_calls.get(), 1);
    assert_eq!(*target_log.borrow(), vec!["direct".to_string()]);

    // The introducer retires its provisional state.
    pair_ac.client.send_finish(provide_question, false).unwrap();
    drive(&mut pair_ac, &mut c_servers);
    assert!(shared.borrow().is_empty());
    assert_eq!(pair_ac.server.provision_count(), 0);
}

/// An Accept that arrives before its Provide parks until another connection
/// registers the provision.
#[test]
fn accept_before_provide_parks_until_redeemed() {
    let mut pair_ac = LoopbackPair::new(PeerOptions::default());
    let mut pair_bc = LoopbackPair::new(PeerOptions::default());

    let shared = SharedProvisions::default();
    pair_ac.server.set_shared_provisions(shared.clone());
    pair_bc.server.set_shared_provisions(shared.clone());

    let mut c_servers = ServerSet::new();
    let (target, _calls, _log) = EchoServer::new();
    let target = c_servers.add(Box::new(target));
    pair_ac.server.set_bootstrap(target);

    let key = b"early-key".to_vec();

    // B's Accept arrives first and parks.
    let accept_question = pair_bc.client.send_accept(&key, true).unwrap();
    drive(&mut pair_bc, &mut c_servers);
    assert!(pair_bc.client.poll_event().is_none());

    // A provides through its own connection.
    let (_boot, target_on_a) = bootstrap_cap(&mut pair_ac, &mut c_servers);
    pair_ac.client.send_provide(&target_on_a, &key).unwrap();
    drive(&mut pair_ac, &mut c_servers);

    // The parked Accept redeems once C's other connection is prompted.
    pair_bc.server.redeem_pending_accepts().unwrap();
    drive(&mut pair_bc, &mut c_servers);
    let (returned, accepted) = next_return(&mut pair_bc.client);
    assert_eq!(returned, accept_question);
    assert!(accepted.unwrap().single_cap().is_ok());
}

#[test]
fn join_succeeds_when_all_parts_designate_one_capability() {
    let mut pair = LoopbackPair::new(PeerOptions::default());
    let mut servers = ServerSet::new();
    let (echo, _calls, _log) = EchoServer::new();
    let echo = servers.add(Box::new(echo));
    pair.server.set_bootstrap(echo);

    let (_boot, cap) = bootstrap_cap(&mut pair, &mut servers);

    let part_one = pair.client.send_join(&cap, 42, 2, 0).unwrap();
    let part_two = pair.client.send_join(&cap, 42, 2, 1).unwrap();
    drive(&mut pair, &mut servers);

    let (first, result_one) = next_return(&mut pair.client);
    assert_eq!(first, part_one);
    assert!(result_one.unwrap().single_cap().is_ok());
    let (second, result_two) = next_return(&mut pair.client);
    assert_eq!(second, part_two);
    assert!(result_two.unwrap().single_cap().is_ok());
}

#[test]
fn early_finish_abandons_a_pending_join() {
    let mut pair = LoopbackPair::new(PeerOptions::default());
    let mut servers = ServerSet::new();
    let (echo, _calls, _log) = EchoServer::new();
    let echo = servers.add(Box::new(echo));
    pair.server.set_bootstrap(echo);

    let (_boot, cap) = bootstrap_cap(&mut pair, &mut servers);

    // Two of three parts arrive; the join cannot complete yet.
    let part_one = pair.client.send_join(&cap, 11, 3, 0).unwrap();
    let part_two = pair.client.send_join(&cap, 11, 3, 1).unwrap();
    pair.pump().unwrap();
    assert!(pair.client.poll_event().is_none());

    // The caller walks away from the first part; the whole join unwinds.
    pair.client.send_finish(part_one, false).unwrap();
    drive(&mut pair, &mut servers);

    let (first, result_one) = next_return(&mut pair.client);
    assert_eq!(first, part_one);
    let canceled = result_one.unwrap_err();
    assert!(canceled.extra.contains("canceled"), "{canceled}");

    let (second, result_two) = next_return(&mut pair.client);
    assert_eq!(second, part_two);
    let abandoned = result_two.unwrap_err();
    assert_eq!(abandoned.kind, ErrorKind::Failed);
    assert!(abandoned.extra.contains("abandoned"), "{abandoned}");

    // A late part for the discarded join starts over and completes nothing.
    let part_three = pair.client.send_join(&cap, 11, 3, 2).unwrap();
    drive(&mut pair, &mut servers);
    assert!(pair.client.poll_event().is_none());
    let _ = part_three;
}

#[test]
fn join_fails_when_parts_diverge() {
    let mut pair = LoopbackPair::new(PeerOptions::default());
    let mut servers = ServerSet::new();
    let (echo, _calls, _log) = EchoServer::new();
    let echo = servers.add(Box::new(echo));
    let other = servers.add(Box::new(CapServer {
        cap: CapRef::LocalServer(echo),
    }));
    let factory = servers.add(Box::new(CapServer {
        cap: CapRef::LocalServer(other),
    }));
    pair.server.set_bootstrap(factory);

    // Two distinct capabilities: the factory itself and the cap it vends.
    let (_boot, factory_cap) = bootstrap_cap(&mut pair, &mut servers);
    let vend_question = pair
        .client
        .send_call(
            &factory_cap,
            FACTORY_INTERFACE,
            GET_FOO_METHOD,
            capstan_rpc::PayloadBuilder::new(),
        )
        .unwrap();
    drive(&mut pair, &mut servers);
    let (_q, vended) = next_return(&mut pair.client);
    let vended_cap = vended.unwrap().single_cap().unwrap();
    let _ = vend_question;

    let part_one = pair.client.send_join(&factory_cap, 7, 2, 0).unwrap();
    let part_two = pair.client.send_join(&vended_cap, 7, 2, 1).unwrap();
    drive(&mut pair, &mut servers);

    let (first, result_one) = next_return(&mut pair.client);
    assert_eq!(first, part_one);
    assert_eq!(result_one.unwrap_err().kind, ErrorKind::Failed);
    let (second, result_two) = next_return(&mut pair.client);
    assert_eq!(second, part_two);
    assert_eq!(result_two.unwrap_err().kind, ErrorKind::Failed);
}
