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

//! The outbound half of a connection, as the peer sees it. The peer hands
//! complete frames to the transport in dispatch order; whether they travel
//! over a socket, a pipe, or an in-memory queue is the embedder's business.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use capstan::Result;

/// Delivers one framed message. A successful return means the frame has been
/// accepted for in-order delivery; the peer commits staged capability
/// side-effects only after that point.
pub trait Transport {
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<()>;
}

/// A handle onto frames queued by a [QueueTransport], for the embedder (or a
/// host bridge) to drain.
#[derive(Clone)]
pub struct FrameQueue {
    frames: Rc<RefCell<VecDeque<Vec<u8>>>>,
}

impl FrameQueue {
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.frames.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.borrow().is_empty()
    }
}

/// A transport that parks outbound frames in a queue.
pub struct QueueTransport {
    frames: Rc<RefCell<VecDeque<Vec<u8>>>>,
}

impl QueueTransport {
    pub fn new() -> (Self, FrameQueue) {
        let frames = Rc::new(RefCell::new(VecDeque::new()));
        (
            Self {
                frames: frames.clone(),
            },
            FrameQueue { frames },
        )
    }
}

impl Transport for QueueTransport {
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        self.frames.borrow_mut().push_back(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_transport_preserves_order() {
        let (mut transport, queue) = QueueTransport::new();
        transport.send_frame(vec![1]).unwrap();
        transport.send_frame(vec![2]).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(vec![1]));
        assert_eq!(queue.pop(), Some(vec![2]));
        assert!(queue.is_empty());
    }
}
