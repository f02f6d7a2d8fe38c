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

//! The client surface that generated interface code wraps: an untyped
//! capability handle bound to a shared peer, plus pipelined handles onto
//! results that have not arrived yet.

use std::cell::RefCell;
use std::rc::Rc;

use capstan::Result;

use crate::peer::{CapRef, PayloadBuilder, Peer, QuestionId, ResultsTo};
use crate::pipeline::Transform;

/// An untyped client: a capability plus the connection it lives on.
/// Generated `FooClient` types wrap one of these and add typed request
/// builders.
#[derive(Clone)]
pub struct Client {
    peer: Rc<RefCell<Peer>>,
    cap: CapRef,
}

impl Client {
    pub fn new(peer: Rc<RefCell<Peer>>, cap: CapRef) -> Self {
        Self { peer, cap }
    }

    /// Fetches the connection's bootstrap capability as a pipeline, so calls
    /// can start before the bootstrap Return arrives.
    pub fn bootstrap(peer: Rc<RefCell<Peer>>) -> Result<(Self, QuestionId)> {
        let question_id = peer.borrow_mut().send_bootstrap()?;
        let client = Self {
            peer,
            cap: CapRef::PromisedAnswer {
                question_id,
                transform: Transform::new(),
            },
        };
        Ok((client, question_id))
    }

    pub fn cap(&self) -> &CapRef {
        &self.cap
    }

    pub fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        params: PayloadBuilder,
    ) -> Result<QuestionId> {
        self.peer
            .borrow_mut()
            .send_call(&self.cap, interface_id, method_id, params)
    }

    pub fn call_with_results_to(
        &self,
        interface_id: u64,
        method_id: u16,
        params: PayloadBuilder,
        results_to: ResultsTo,
    ) -> Result<QuestionId> {
        self.peer.borrow_mut().send_call_with_results_to(
            &self.cap,
            interface_id,
            method_id,
            params,
            results_to,
        )
    }

    /// A handle onto the future results of a question issued through this
    /// client's connection.
    pub fn pipeline(&self, question_id: QuestionId) -> Pipeline {
        Pipeline {
            peer: self.peer.clone(),
            question_id,
            transform: Transform::new(),
        }
    }
}

/// A path into the not-yet-returned results of a call. Each
/// `get_pointer_field` descends one pointer; `client()` yields a callable
/// handle for the capability at the current path.
#[derive(Clone)]
pub struct Pipeline {
    peer: Rc<RefCell<Peer>>,
    question_id: QuestionId,
    transform: Transform,
}

impl Pipeline {
    pub fn get_pointer_field(&self, pointer_index: u16) -> Pipeline {
        Pipeline {
            peer: self.peer.clone(),
            question_id: self.question_id,
            transform: self.transform.then(pointer_index),
        }
    }

    pub fn as_cap(&self) -> CapRef {
        CapRef::PromisedAnswer {
            question_id: self.question_id,
            transform: self.transform.clone(),
        }
    }

    pub fn client(&self) -> Client {
        Client {
            peer: self.peer.clone(),
            cap: self.as_cap(),
        }
    }
}
