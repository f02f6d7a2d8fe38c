// Copyright (c) 2016 Sandstorm Development Group, Inc. and contributors
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

//! An ordered message writer over an `AsyncWrite`.
//!
//! An RPC peer requires its transport to deliver frames in exactly the order
//! they were dispatched. This queue provides that guarantee for any number
//! of senders: messages are framed and written strictly in submission order,
//! each submission resolves with its message (so builders can be reused) and
//! the number of bytes it occupied on the wire, and the queue is retired
//! with [Sender::close], whose `drain` flag mirrors the peer's
//! `shutdown(drain)`: flush what is queued, or discard it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use capstan::{Error, ErrorKind, BYTES_PER_WORD};

use crate::serialize::AsOutputSegments;

/// One queued message and the slot its outcome lands in.
struct Enqueued<M> {
    message: M,
    /// Receives the message back along with its framed size in bytes.
    completed: oneshot::Sender<(M, u64)>,
}

enum Command<M> {
    Write(Enqueued<M>),
    /// Shut the writer down. Messages already queued have either been
    /// written by the time this is reached, or marked for discard.
    Close { done: oneshot::Sender<()> },
}

/// State visible to senders while the driver runs.
struct Shared {
    /// Messages submitted but not yet written (or discarded).
    queued: AtomicUsize,
    /// Once set, queued and future messages are dropped instead of written.
    discarding: AtomicBool,
    /// Total bytes the driver has put on the wire.
    bytes_written: AtomicU64,
}

/// A handle that submits messages to the write queue. Clones share the
/// queue and its ordering.
pub struct Sender<M>
where
    M: AsOutputSegments,
{
    commands: mpsc::UnboundedSender<Command<M>>,
    shared: Arc<Shared>,
}

impl<M> Clone for Sender<M>
where
    M: AsOutputSegments,
{
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            shared: self.shared.clone(),
        }
    }
}

/// The size of a message on the wire: the segment table plus the segments.
fn framed_len(message: &impl AsOutputSegments) -> u64 {
    let segments = message.as_output_segments();
    let table_bytes = (4 + segments.len() as u64 * 4).div_ceil(BYTES_PER_WORD as u64)
        * BYTES_PER_WORD as u64;
    table_bytes + segments.iter().map(|s| s.len() as u64).sum::<u64>()
}

fn queue_gone() -> Error {
    Error::from_kind(ErrorKind::ConnectionClosed).context("the write queue has shut down".into())
}

/// Creates a write queue over `writer`. The returned future is the driver;
/// it must be polled for writes to make progress, and resolves when the
/// queue closes or the writer fails.
pub fn write_queue<W, M>(mut writer: W) -> (Sender<M>, impl Future<Output = Result<(), Error>>)
where
    W: AsyncWrite + Unpin,
    M: AsOutputSegments,
{
    let (commands, receiver) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        queued: AtomicUsize::new(0),
        discarding: AtomicBool::new(false),
        bytes_written: AtomicU64::new(0),
    });

    let sender = Sender {
        commands,
        shared: shared.clone(),
    };

    let driver = async move {
        let mut commands = UnboundedReceiverStream::new(receiver);
        while let Some(command) = commands.next().await {
            match command {
                Command::Write(entry) => {
                    if shared.discarding.load(Ordering::SeqCst) {
                        // Dropping the completion slot tells the submitter
                        // its message never reached the wire.
                        shared.queued.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    let framed = framed_len(&entry.message);
                    let outcome =
                        crate::serialize::write_message(&mut writer, &entry.message).await;
                    shared.queued.fetch_sub(1, Ordering::SeqCst);
                    outcome?;
                    writer.flush().await?;
                    shared.bytes_written.fetch_add(framed, Ordering::SeqCst);
                    let _ = entry.completed.send((entry.message, framed));
                }
                Command::Close { done } => {
                    writer.shutdown().await?;
                    let _ = done.send(());
                    return Ok(());
                }
            }
        }
        Ok(())
    };

    (sender, driver)
}

impl<M> Sender<M>
where
    M: AsOutputSegments,
{
    /// Submits a message. The returned future resolves once the message has
    /// been written and flushed, yielding the message back together with the
    /// number of bytes it occupied on the wire.
    pub fn send(&mut self, message: M) -> impl Future<Output = Result<(M, u64), Error>> + Unpin {
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        let (completed, outcome) = oneshot::channel();
        let _ = self.commands.send(Command::Write(Enqueued { message, completed }));
        futures_util::TryFutureExt::map_err(outcome, |_| queue_gone())
    }

    /// Messages submitted but not yet written.
    pub fn len(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::SeqCst)
    }

    /// Retires the queue. With `drain` set, everything already submitted is
    /// written first; without it, queued messages are discarded and their
    /// submitters see an error. Either way the writer is shut down and
    /// later `send` futures resolve to an error.
    pub fn close(&mut self, drain: bool) -> impl Future<Output = Result<(), Error>> + Unpin {
        if !drain {
            self.shared.discarding.store(true, Ordering::SeqCst);
        }
        let (done, closed) = oneshot::channel();
        let _ = self.commands.send(Command::Close { done });
        futures_util::TryFutureExt::map_err(closed, |_| queue_gone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan::message;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("build a single-threaded runtime")
            .block_on(future)
    }

    fn text_message(text: &str) -> message::Builder {
        let mut message = message::Builder::new_default();
        message.set_root(text).unwrap();
        message
    }

    #[test]
    fn writes_are_ordered_and_accounted() {
        block_on(async {
            let (writer, mut read_side) = tokio::io::duplex(1 << 16);
            let (mut sender, driver) = write_queue::<_, message::Builder>(writer);

            let send_first = sender.send(text_message("first"));
            let send_second = sender.send(text_message("second"));
            let closed = sender.close(true);

            let (first, second, closed, driver_result) =
                tokio::join!(send_first, send_second, closed, driver);
            let (_, first_bytes) = first.unwrap();
            let (_, second_bytes) = second.unwrap();
            closed.unwrap();
            driver_result.unwrap();

            assert!(first_bytes % BYTES_PER_WORD as u64 == 0);
            assert_eq!(sender.bytes_written(), first_bytes + second_bytes);
            assert!(sender.is_empty());

            let mut seen = Vec::new();
            while let Some(reader) = crate::serialize::read_message(
                &mut read_side,
                message::ReaderOptions::new(),
            )
            .await
            .unwrap()
            {
                let root: capstan::text::Reader = reader.get_root().unwrap();
                seen.push(root.to_str().unwrap().to_string());
            }
            assert_eq!(seen, vec!["first", "second"]);
        });
    }

    #[test]
    fn closing_without_drain_discards_queued_writes() {
        block_on(async {
            let (writer, mut read_side) = tokio::io::duplex(1 << 16);
            let (mut sender, driver) = write_queue::<_, message::Builder>(writer);

            let send = sender.send(text_message("never written"));
            let closed = sender.close(false);

            let (send_result, closed, driver_result) = tokio::join!(send, closed, driver);
            assert_eq!(send_result.unwrap_err().kind, ErrorKind::ConnectionClosed);
            closed.unwrap();
            driver_result.unwrap();

            assert_eq!(sender.bytes_written(), 0);
            assert!(sender.is_empty());

            // Nothing reached the wire.
            let end = crate::serialize::read_message(
                &mut read_side,
                message::ReaderOptions::new(),
            )
            .await
            .unwrap();
            assert!(end.is_none());
        });
    }

    #[test]
    fn framed_len_matches_the_stream_framing() {
        block_on(async {
            let message = text_message("sized");
            let expected = framed_len(&message);
            let mut cursor = std::io::Cursor::new(Vec::new());
            crate::serialize::write_message(&mut cursor, &message)
                .await
                .unwrap();
            assert_eq!(cursor.into_inner().len() as u64, expected);
        });
    }
}
