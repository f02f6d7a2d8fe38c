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

//! An implementation of the Cap'n Proto remote procedure call protocol,
//! through Level 3: promise pipelining, embargoes, and three-party handoff.
//!
//! The heart of the crate is [Peer], a sans-IO state machine for one end of
//! a connection. Bytes from the wire go into [Peer::push_bytes]; frames for
//! the wire come out through a [Transport]; calls on local capabilities
//! surface as [Event]s and are answered with [Peer::post_result]. The
//! [bridge::HostBridge] flattens that surface further, down to byte pushes
//! and pops, for polyglot embeddings.

pub mod bridge;
pub mod cap_table;
pub mod call_queue;
pub mod client;
pub mod flow;
pub mod local;
pub mod peer;
pub mod pipeline;
pub mod proto;
pub mod tables;
pub mod transport;
pub mod worker;

pub use crate::client::{Client, Pipeline};
pub use crate::local::{Dispatcher, ServerSet};
pub use crate::peer::{
    AnswerId, CapRef, EmbargoId, Event, ExportId, ImportId, Payload, PayloadBuilder, Peer,
    PeerOptions, ProvisionMap, QuestionId, ResultsTo, ServerId, SharedProvisions,
};
pub use crate::pipeline::Transform;
pub use crate::transport::{FrameQueue, QueueTransport, Transport};

/// An in-memory connection between two peers, delivering frames through
/// queues that the test driver (or a single-process embedder) pumps.
pub struct LoopbackPair {
    pub client: Peer,
    pub server: Peer,
    client_to_server: FrameQueue,
    server_to_client: FrameQueue,
}

impl LoopbackPair {
    pub fn new(options: PeerOptions) -> Self {
        let (client_transport, client_to_server) = QueueTransport::new();
        let (server_transport, server_to_client) = QueueTransport::new();
        Self {
            client: Peer::new(Box::new(client_transport), options),
            server: Peer::new(Box::new(server_transport), options),
            client_to_server,
            server_to_client,
        }
    }

    /// Delivers queued frames in both directions until the connection goes
    /// quiet. Returns the number of frames moved.
    pub fn pump(&mut self) -> capstan::Result<usize> {
        let mut moved = 0;
        loop {
            let mut progressed = false;
            while let Some(frame) = self.client_to_server.pop() {
                self.server.handle_frame(&frame)?;
                moved += 1;
                progressed = true;
            }
            while let Some(frame) = self.server_to_client.pop() {
                self.client.handle_frame(&frame)?;
                moved += 1;
                progressed = true;
            }
            if !progressed {
                return Ok(moved);
            }
        }
    }

    /// Delivers at most one pending frame from the server to the client.
    pub fn pump_one_to_client(&mut self) -> capstan::Result<bool> {
        match self.server_to_client.pop() {
            Some(frame) => {
                self.client.handle_frame(&frame)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delivers at most one pending frame from the client to the server.
    pub fn pump_one_to_server(&mut self) -> capstan::Result<bool> {
        match self.client_to_server.pop() {
            Some(frame) => {
                self.server.handle_frame(&frame)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
