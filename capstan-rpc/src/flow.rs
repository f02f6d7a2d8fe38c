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

//! Back-pressure accounting for streaming calls: a client sends a window of
//! calls without waiting for returns, and waits for the stream to drain
//! before finishing.

use capstan::{Error, ErrorKind, Result};

/// Per-stream flow state. `start` before each send, `handle_return` on each
/// return; a single drain waiter fires when the window empties.
pub struct StreamState {
    in_flight: u32,
    drain_waiter: Option<Box<dyn FnOnce()>>,
    finished: bool,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            in_flight: 0,
            drain_waiter: None,
            finished: false,
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Accounts for a streaming call about to be sent.
    pub fn start(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::from_kind(ErrorKind::ConnectionClosed)
                .context("stream is already finished".into()));
        }
        self.in_flight = self
            .in_flight
            .checked_add(1)
            .ok_or_else(|| Error::from_kind(ErrorKind::ArithmeticOverflow))?;
        Ok(())
    }

    /// Accounts for a return of a streaming call.
    pub fn handle_return(&mut self) -> Result<()> {
        assert!(self.in_flight > 0, "return without a matching start");
        self.in_flight -= 1;
        if self.in_flight == 0 {
            if let Some(waiter) = self.drain_waiter.take() {
                waiter();
            }
        }
        Ok(())
    }

    /// Registers the callback to run once all in-flight calls have returned.
    /// If the stream is already drained, the callback runs immediately.
    /// At most one waiter may be registered at a time; a second registration
    /// is an error, not a silent overwrite.
    pub fn wait_drain(&mut self, callback: Box<dyn FnOnce()>) -> Result<()> {
        if self.drain_waiter.is_some() {
            return Err(Error::from_kind(ErrorKind::StreamDrainAlreadyPending));
        }
        if self.in_flight == 0 {
            callback();
        } else {
            self.drain_waiter = Some(callback);
        }
        Ok(())
    }

    /// Closes the stream. Pending in-flight calls complete as exceptions on
    /// the caller's side; the returned count tells the caller how many.
    pub fn finish(&mut self) -> u32 {
        self.finished = true;
        let abandoned = self.in_flight;
        self.in_flight = 0;
        self.drain_waiter = None;
        abandoned
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn drain_fires_when_window_empties() {
        let mut stream = StreamState::new();
        stream.start().unwrap();
        stream.start().unwrap();

        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        stream
            .wait_drain(Box::new(move || fired2.set(true)))
            .unwrap();
        assert!(!fired.get());

        stream.handle_return().unwrap();
        assert!(!fired.get());
        stream.handle_return().unwrap();
        assert!(fired.get());
    }

    #[test]
    fn drain_on_empty_stream_fires_immediately() {
        let mut stream = StreamState::new();
        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        stream
            .wait_drain(Box::new(move || fired2.set(true)))
            .unwrap();
        assert!(fired.get());
    }

    #[test]
    fn second_drain_waiter_is_rejected() {
        let mut stream = StreamState::new();
        stream.start().unwrap();
        stream.wait_drain(Box::new(|| {})).unwrap();
        let err = stream.wait_drain(Box::new(|| {})).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StreamDrainAlreadyPending);
    }

    #[test]
    fn finish_abandons_in_flight_calls() {
        let mut stream = StreamState::new();
        stream.start().unwrap();
        stream.start().unwrap();
        assert_eq!(stream.finish(), 2);
        let err = stream.start().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionClosed);
    }

    #[test]
    #[should_panic(expected = "return without a matching start")]
    fn unmatched_return_panics() {
        let mut stream = StreamState::new();
        let _ = stream.handle_return();
    }
}
