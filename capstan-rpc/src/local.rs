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

//! Locally hosted servers and the registry that routes calls to them.
//!
//! Generated code layers typed `Server` traits over [Dispatcher]; the peer
//! itself only ever sees [ServerId] slots.

use capstan::{Error, Result};

use crate::peer::{Event, Payload, Peer, ServerId};
use crate::tables::ExportTable;
use crate::PayloadBuilder;

/// A vat-local capability implementation, keyed by (interface id, method id)
/// exactly as generated dispatch code is.
pub trait Dispatcher {
    fn dispatch_call(
        &mut self,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> Result<PayloadBuilder>;
}

/// The embedder's registry of local servers. Slots are referenced from
/// payloads as [crate::CapRef::LocalServer] and from peer events.
pub struct ServerSet {
    servers: ExportTable<Box<dyn Dispatcher>>,
    unhandled: Vec<Event>,
}

impl ServerSet {
    pub fn new() -> Self {
        Self {
            servers: ExportTable::new(),
            unhandled: Vec::new(),
        }
    }

    pub fn add(&mut self, server: Box<dyn Dispatcher>) -> ServerId {
        self.servers.push(server)
    }

    pub fn remove(&mut self, id: ServerId) -> Option<Box<dyn Dispatcher>> {
        self.servers.erase(id)
    }

    pub fn get_mut(&mut self, id: ServerId) -> Option<&mut Box<dyn Dispatcher>> {
        self.servers.get_mut(id)
    }

    /// Drains the peer's event queue, dispatching calls to registered
    /// servers and posting their results back. Events this loop does not
    /// consume (returns, resolutions, aborts) are kept for the embedder.
    pub fn pump(&mut self, peer: &mut Peer) -> Result<()> {
        while let Some(event) = peer.poll_event() {
            match event {
                Event::IncomingCall {
                    answer_id,
                    server,
                    interface_id,
                    method_id,
                    params,
                } => {
                    let result = self.run(server, interface_id, method_id, params);
                    peer.post_result(answer_id, result)?;
                }
                Event::LoopbackCall {
                    question_id,
                    server,
                    interface_id,
                    method_id,
                    params,
                } => {
                    let result = self.run(server, interface_id, method_id, params);
                    peer.post_loopback_result(question_id, result)?;
                }
                other => self.unhandled.push(other),
            }
        }
        Ok(())
    }

    fn run(
        &mut self,
        server: ServerId,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> Result<PayloadBuilder> {
        match self.servers.get_mut(server) {
            Some(dispatcher) => dispatcher.dispatch_call(interface_id, method_id, params),
            None => Err(Error::unimplemented(format!(
                "no server registered in slot {server}"
            ))),
        }
    }

    /// Events `pump` did not consume, in arrival order.
    pub fn take_unhandled(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.unhandled)
    }
}

impl Default for ServerSet {
    fn default() -> Self {
        Self::new()
    }
}
