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

//! Optional worker pool: user handlers run off the dispatch thread and their
//! results are handed back to the dispatch thread for sending. The peer
//! itself stays single-threaded.

use std::sync::mpsc;
use std::thread;

use capstan::Error;

use crate::peer::{AnswerId, Peer};
use crate::PayloadBuilder;

type Job = Box<dyn FnOnce() -> Result<PayloadBuilder, Error> + Send>;

enum Command {
    Run { answer_id: AnswerId, job: Job },
    Stop,
}

/// A fixed pool of worker threads computing call results.
pub struct WorkerPool {
    jobs: mpsc::Sender<Command>,
    results: mpsc::Receiver<(AnswerId, Result<PayloadBuilder, Error>)>,
    handles: Vec<thread::JoinHandle<()>>,
    outstanding: usize,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<Command>();
        let (result_tx, result_rx) = mpsc::channel();
        let job_rx = std::sync::Arc::new(std::sync::Mutex::new(job_rx));

        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads.max(1) {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            handles.push(thread::spawn(move || loop {
                let command = {
                    let guard = job_rx.lock().expect("worker queue lock");
                    guard.recv()
                };
                match command {
                    Ok(Command::Run { answer_id, job }) => {
                        let result = job();
                        if result_tx.send((answer_id, result)).is_err() {
                            return;
                        }
                    }
                    Ok(Command::Stop) | Err(_) => return,
                }
            }));
        }

        Self {
            jobs: job_tx,
            results: result_rx,
            handles,
            outstanding: 0,
        }
    }

    /// Queues a handler to run off-thread. Its result is delivered on the
    /// next `drain_into` call from the dispatch thread.
    pub fn spawn(
        &mut self,
        answer_id: AnswerId,
        job: impl FnOnce() -> Result<PayloadBuilder, Error> + Send + 'static,
    ) {
        self.outstanding += 1;
        let _ = self.jobs.send(Command::Run {
            answer_id,
            job: Box::new(job),
        });
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Posts every finished result into the peer. Must be called from the
    /// dispatch thread.
    pub fn drain_into(&mut self, peer: &mut Peer) -> capstan::Result<()> {
        while let Ok((answer_id, result)) = self.results.try_recv() {
            self.outstanding -= 1;
            peer.post_result(answer_id, result)?;
        }
        Ok(())
    }

    /// Blocks until one result is available, then posts everything ready.
    /// Useful for test drivers with no event loop.
    pub fn drain_into_blocking(&mut self, peer: &mut Peer) -> capstan::Result<()> {
        if self.outstanding > 0 {
            if let Ok((answer_id, result)) = self.results.recv() {
                self.outstanding -= 1;
                peer.post_result(answer_id, result)?;
            }
        }
        self.drain_into(peer)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for _ in &self.handles {
            let _ = self.jobs.send(Command::Stop);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
