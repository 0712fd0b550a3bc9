// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Blocking streams backed by in-memory channels.

use super::{ServerReader, ServerWriter, StreamCounters, StreamStats, WriteOptions};
use crate::context::CallContext;
use std::{sync::Arc, time::Duration};

/// How often a blocked read re-checks the call for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Returns the two ends of one call's message streams. The server end reads what the client end
/// sends, and vice versa.
pub fn call<In, Out>(context: Arc<CallContext>) -> (ServerStream<In, Out>, ClientStream<In, Out>) {
    let (client_tx, server_rx) = flume::unbounded();
    let (server_tx, client_rx) = flume::unbounded();
    let counters = Arc::new(StreamCounters::default());
    (
        ServerStream {
            context: context.clone(),
            rx: server_rx,
            tx: Some(server_tx),
            counters: counters.clone(),
        },
        ClientStream {
            context,
            tx: Some(client_tx),
            rx: client_rx,
            counters,
        },
    )
}

/// The server end of a call, backed by a [`Sender`](flume::Sender) and
/// [`Receiver`](flume::Receiver).
#[derive(Debug)]
pub struct ServerStream<In, Out> {
    context: Arc<CallContext>,
    rx: flume::Receiver<In>,
    /// `None` once the server half-closed.
    tx: Option<flume::Sender<Out>>,
    counters: Arc<StreamCounters>,
}

impl<In, Out> ServerStream<In, Out> {
    /// The context of the call the stream belongs to.
    pub fn context(&self) -> &Arc<CallContext> {
        &self.context
    }

    fn send(&mut self, msg: Out, last: bool) -> bool {
        if self.context.is_cancelled() {
            return false;
        }
        let Some(tx) = &self.tx else {
            tracing::trace!("WriteAfterHalfClose");
            return false;
        };
        if tx.send(msg).is_err() {
            return false;
        }
        self.context.mark_initial_metadata_sent();
        self.counters.record_write(last);
        if last {
            self.tx = None;
        }
        true
    }
}

impl<In, Out> ServerReader<In> for ServerStream<In, Out> {
    fn read(&mut self) -> Option<In> {
        loop {
            if self.context.is_cancelled() {
                return None;
            }
            match self.rx.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(msg) => {
                    self.counters.record_read();
                    return Some(msg);
                }
                Err(flume::RecvTimeoutError::Timeout) => continue,
                Err(flume::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

impl<In, Out> ServerWriter<Out> for ServerStream<In, Out> {
    fn write(&mut self, msg: Out) -> bool {
        self.send(msg, false)
    }

    fn write_last(&mut self, msg: Out, _: WriteOptions) -> bool {
        self.send(msg, true)
    }
}

/// The client end of a call.
#[derive(Debug)]
pub struct ClientStream<In, Out> {
    context: Arc<CallContext>,
    /// `None` once the client half-closed.
    tx: Option<flume::Sender<In>>,
    rx: flume::Receiver<Out>,
    counters: Arc<StreamCounters>,
}

impl<In, Out> ClientStream<In, Out> {
    /// Sends a message to the server. Returns false once the client half-closed or the server
    /// end is gone.
    pub fn send(&self, msg: In) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(msg).is_ok())
    }

    /// Half-closes the client side; the server's reads fail once it drains what was sent.
    pub fn writes_done(&mut self) {
        self.tx = None;
    }

    /// Blocks until the server writes a message. Returns `None` once the server half-closed
    /// or went away.
    pub fn recv(&self) -> Option<Out> {
        self.rx.recv().ok()
    }

    /// Receives a message without blocking the executor.
    pub async fn recv_async(&self) -> Option<Out> {
        self.rx.recv_async().await.ok()
    }

    /// Every message already written by the server.
    pub fn drain(&self) -> Vec<Out> {
        self.rx.try_iter().collect()
    }

    /// Cancels the call from the client side.
    pub fn cancel(&self) {
        tracing::info!("ClientCancel");
        self.context.try_cancel();
    }

    /// The call context.
    pub fn context(&self) -> &Arc<CallContext> {
        &self.context
    }

    /// Stream operations completed by the server so far.
    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot()
    }
}
