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

//! A flat byte-oriented surface over a peer, for embedding in hosts that
//! only speak pointers and lengths: push inbound bytes, pop outbound bytes,
//! post call responses by question id.

use capstan::{Error, Result};

use crate::peer::{AnswerId, Peer, PeerOptions};
use crate::transport::{FrameQueue, QueueTransport};
use crate::PayloadBuilder;

pub struct HostBridge {
    peer: Peer,
    outbound: FrameQueue,
}

impl HostBridge {
    pub fn new(options: PeerOptions) -> Self {
        let (transport, outbound) = QueueTransport::new();
        Self {
            peer: Peer::new(Box::new(transport), options),
            outbound,
        }
    }

    /// Direct access to the wrapped peer, for configuration and events.
    pub fn peer_mut(&mut self) -> &mut Peer {
        &mut self.peer
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Feeds connection bytes in. Byte chunks may be split anywhere.
    pub fn push_inbound(&mut self, bytes: &[u8]) -> Result<()> {
        self.peer.push_bytes(bytes)
    }

    /// Pops the next outbound frame, if any.
    pub fn pop_outbound(&mut self) -> Option<Vec<u8>> {
        self.outbound.pop()
    }

    /// Completes a host-dispatched call. The frame, when present, is a
    /// framed message whose root is the result content. The question id is
    /// validated before anything is dispatched.
    pub fn post_host_response(
        &mut self,
        question_id: AnswerId,
        response: std::result::Result<Vec<u8>, Error>,
    ) -> Result<()> {
        if !self.peer.has_answer(question_id) {
            return Err(capstan::Error::from_kind(capstan::ErrorKind::ProtocolViolation)
                .context(format!("response for unknown question {question_id}")));
        }
        let result = match response {
            Ok(frame) => PayloadBuilder::from_content_bytes(
                &frame,
                capstan::message::ReaderOptions::default(),
            ),
            Err(error) => Err(error),
        };
        self.peer.post_result(question_id, result)
    }
}
