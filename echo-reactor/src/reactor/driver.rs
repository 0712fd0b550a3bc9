// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Drives [`ServerReactor`]s on a tokio runtime, with the client end of each call in memory.
//!
//! Every event is delivered from a spawned task, so reactor callbacks run concurrently on the
//! runtime's worker threads. Reads, writes and timers count as outstanding operations; once the
//! reactor finished the call and none is outstanding, the driver delivers [`Event::Done`],
//! releases the reactor and then hands the status to the client.

use super::{Event, ServerCall, ServerReactor};
use crate::{
    context::{lock, CallContext},
    metadata::Metadata,
    status::Status,
    transport::{StreamCounters, StreamStats, WriteOptions},
};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tokio::{runtime::Handle, sync::oneshot};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Starts a call served by `reactor`, delivering [`Event::Started`] right away. Returns the
/// client end of the call.
///
/// # Panics
///
/// Panics if called outside of a tokio runtime.
pub fn start<R>(reactor: R, context: Arc<CallContext>) -> ClientCall<R::Req, R::Resp>
where
    R: ServerReactor,
{
    let (client_tx, inbound) = flume::unbounded();
    let (outbound, client_rx) = flume::unbounded();
    let (status_tx, status_rx) = oneshot::channel();
    let counters = Arc::new(StreamCounters::default());
    let headers = Arc::new(Mutex::new(None));
    let span = tracing::info_span!(
        "RPC",
        rpc.method = reactor.method().unwrap_or("unknown"),
        rpc.peer = context.peer()
    );
    let call = Arc::new_cyclic(|this| Call {
        this: this.clone(),
        reactor: Mutex::new(Some(Arc::new(reactor))),
        context: context.clone(),
        runtime: Handle::current(),
        span,
        inbound,
        outbound: Mutex::new(Some(outbound)),
        read_pending: AtomicBool::new(false),
        write_pending: AtomicBool::new(false),
        response: Mutex::new(None),
        finish_called: AtomicBool::new(false),
        finished: CancellationToken::new(),
        status: Mutex::new(None),
        status_tx: Mutex::new(Some(status_tx)),
        in_flight: AtomicUsize::new(0),
        done: AtomicBool::new(false),
        counters: counters.clone(),
        headers: headers.clone(),
    });
    let started = call.clone();
    call.spawn_op(async move {
        tracing::info!("ReceiveRequest");
        started.deliver(Event::Started);
        started.watch_cancellation();
    });
    ClientCall {
        context,
        tx: Some(client_tx),
        rx: client_rx,
        status_rx,
        headers,
        counters,
    }
}

/// The server side of one call.
struct Call<R: ServerReactor> {
    this: Weak<Call<R>>,
    /// The owning handle; taken when `Done` is delivered.
    reactor: Mutex<Option<Arc<R>>>,
    context: Arc<CallContext>,
    runtime: Handle,
    span: tracing::Span,
    inbound: flume::Receiver<R::Req>,
    /// `None` once the server half-closed or finished.
    outbound: Mutex<Option<flume::Sender<R::Resp>>>,
    read_pending: AtomicBool,
    write_pending: AtomicBool,
    response: Mutex<Option<R::Resp>>,
    finish_called: AtomicBool,
    finished: CancellationToken,
    status: Mutex<Option<Status>>,
    status_tx: Mutex<Option<oneshot::Sender<Status>>>,
    in_flight: AtomicUsize,
    done: AtomicBool,
    counters: Arc<StreamCounters>,
    headers: Arc<Mutex<Option<Metadata>>>,
}

impl<R: ServerReactor> Call<R> {
    fn deliver(&self, event: Event<R::Req>) {
        let reactor = lock(&self.reactor).clone();
        let Some(reactor) = reactor else {
            tracing::trace!("EventAfterDone");
            return;
        };
        reactor.react(event, self);
    }

    /// Runs `op` on the runtime as an outstanding operation.
    fn spawn_op<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.runtime.spawn(
            async move {
                op.await;
                this.op_complete();
            }
            .instrument(self.span.clone()),
        );
    }

    fn op_complete(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.maybe_done();
        }
    }

    fn maybe_done(&self) {
        if !self.finished.is_cancelled()
            || self.in_flight.load(Ordering::Acquire) != 0
            || self.done.swap(true, Ordering::AcqRel)
        {
            return;
        }
        let reactor = lock(&self.reactor).take();
        if let Some(reactor) = reactor {
            reactor.react(Event::Done, self);
        }
        tracing::debug!("ReleaseReactor");
        let status = lock(&self.status).take();
        let status_tx = lock(&self.status_tx).take();
        if let (Some(status), Some(status_tx)) = (status, status_tx) {
            // The client may have gone away.
            let _ = status_tx.send(status);
        }
    }

    /// Delivers `Cancel` if the call is cancelled before it finishes.
    fn watch_cancellation(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.runtime.spawn(
            async move {
                tokio::select! {
                    biased;
                    _ = this.finished.cancelled() => {}
                    _ = this.context.cancelled() => {
                        this.in_flight.fetch_add(1, Ordering::AcqRel);
                        if !this.finished.is_cancelled() {
                            tracing::info!("DeliverCancel");
                            this.deliver(Event::Cancel);
                        }
                        this.op_complete();
                    }
                }
            }
            .instrument(self.span.clone()),
        );
    }

    /// Publishes the initial metadata the first time it is called.
    fn send_headers(&self) {
        if self.context.mark_initial_metadata_sent() {
            *lock(&self.headers) = Some(self.context.initial_metadata());
        }
    }

    fn send(&self, response: R::Resp, last: bool) -> bool {
        if self.finished.is_cancelled() || self.context.is_cancelled() {
            return false;
        }
        let mut outbound = lock(&self.outbound);
        let Some(tx) = outbound.as_ref() else {
            tracing::trace!("WriteAfterHalfClose");
            return false;
        };
        self.send_headers();
        if tx.send(response).is_err() {
            return false;
        }
        self.counters.record_write(last);
        if last {
            *outbound = None;
        }
        true
    }

    fn write(&self, response: R::Resp, last: bool) {
        assert!(
            !self.write_pending.swap(true, Ordering::AcqRel),
            "write started while another write is outstanding"
        );
        let ok = self.send(response, last);
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.spawn_op(async move {
            this.write_pending.store(false, Ordering::Release);
            this.deliver(Event::WriteDone(ok));
        });
    }
}

impl<R: ServerReactor> ServerCall<R::Resp> for Call<R> {
    fn context(&self) -> &CallContext {
        &self.context
    }

    fn start_read(&self) {
        assert!(
            !self.read_pending.swap(true, Ordering::AcqRel),
            "read started while another read is outstanding"
        );
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.spawn_op(async move {
            let request = tokio::select! {
                biased;
                _ = this.context.cancelled() => None,
                _ = this.finished.cancelled() => None,
                request = this.inbound.recv_async() => request.ok(),
            };
            if request.is_some() {
                this.counters.record_read();
            }
            this.read_pending.store(false, Ordering::Release);
            this.deliver(Event::ReadDone(request));
        });
    }

    fn start_write(&self, response: R::Resp) {
        self.write(response, false);
    }

    fn start_write_last(&self, response: R::Resp, _: WriteOptions) {
        self.write(response, true);
    }

    fn send_initial_metadata(&self) {
        self.send_headers();
    }

    fn set_response(&self, response: R::Resp) {
        *lock(&self.response) = Some(response);
    }

    fn finish(&self, status: Status) {
        if self.finish_called.swap(true, Ordering::AcqRel) {
            panic!("call finished twice; second status: {status}");
        }
        tracing::info!(code = %status.code(), message = status.message(), "Finish");
        if status.is_ok() {
            let response = lock(&self.response).take();
            if let Some(response) = response {
                self.send(response, false);
            }
        }
        self.send_headers();
        self.context.mark_status_sent();
        *lock(&self.outbound) = None;
        *lock(&self.status) = Some(status);
        self.finished.cancel();
    }

    fn schedule(&self, delay: Duration) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.spawn_op(async move {
            tokio::time::sleep(delay).await;
            this.deliver(Event::Alarm);
        });
    }
}

/// The client end of a call started with [`start`].
#[derive(Debug)]
pub struct ClientCall<Req, Resp> {
    context: Arc<CallContext>,
    /// `None` once the client half-closed.
    tx: Option<flume::Sender<Req>>,
    rx: flume::Receiver<Resp>,
    status_rx: oneshot::Receiver<Status>,
    headers: Arc<Mutex<Option<Metadata>>>,
    counters: Arc<StreamCounters>,
}

impl<Req, Resp> ClientCall<Req, Resp> {
    /// Sends a message to the server. Returns false once the client half-closed or the call is
    /// over.
    pub fn send(&self, request: Req) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(request).is_ok())
    }

    /// Half-closes the client side.
    pub fn writes_done(&mut self) {
        self.tx = None;
    }

    /// Cancels the call from the client side.
    pub fn cancel(&self) {
        tracing::info!("ClientCancel");
        self.context.try_cancel();
    }

    /// Receives the next server message. Returns `None` once the server half-closed or
    /// finished.
    pub async fn recv(&self) -> Option<Resp> {
        self.rx.recv_async().await.ok()
    }

    /// Waits for the call to end. Returns the server messages not yet received and the final
    /// status. By the time it returns, the server released its reactor.
    pub async fn finish(self) -> (Vec<Resp>, Status) {
        let status = self
            .status_rx
            .await
            .unwrap_or_else(|_| Status::internal("call dropped without a status"));
        (self.rx.try_iter().collect(), status)
    }

    /// The initial metadata, once the server sent it.
    pub fn initial_metadata(&self) -> Option<Metadata> {
        lock(&self.headers).clone()
    }

    /// The trailing metadata added by the server so far.
    pub fn trailing_metadata(&self) -> Metadata {
        self.context.trailing_metadata()
    }

    /// Stream operations completed by the server so far.
    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot()
    }

    /// The call's stream counters, which outlive the client end.
    pub fn counters(&self) -> Arc<StreamCounters> {
        self.counters.clone()
    }

    /// The call context.
    pub fn context(&self) -> &Arc<CallContext> {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::UnimplementedReactor;
    use assert_matches::assert_matches;

    /// Writes a countdown, then finishes.
    struct Countdown {
        writes: AtomicUsize,
        done: Arc<AtomicBool>,
    }

    impl ServerReactor for Countdown {
        type Req = ();
        type Resp = usize;

        fn react(&self, event: Event<()>, call: &dyn ServerCall<usize>) {
            match event {
                Event::Started | Event::WriteDone(true) => {
                    match self.writes.fetch_sub(1, Ordering::SeqCst) {
                        0 => call.finish(Status::ok()),
                        n => call.start_write(n),
                    }
                }
                Event::Done => self.done.store(true, Ordering::SeqCst),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn done_follows_finish_and_outstanding_writes() {
        let done = Arc::new(AtomicBool::new(false));
        let reactor = Countdown {
            writes: AtomicUsize::new(3),
            done: done.clone(),
        };
        let client = start(reactor, Arc::new(CallContext::builder().build()));
        let (responses, status) = client.finish().await;
        assert!(status.is_ok());
        assert_eq!(responses, [3, 2, 1]);
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unimplemented_finishes_at_start() {
        let client = start(
            UnimplementedReactor::<(), ()>::default(),
            Arc::new(CallContext::builder().build()),
        );
        let (responses, status) = client.finish().await;
        assert!(responses.is_empty());
        assert_eq!(status.code(), crate::status::Code::Unimplemented);
    }

    struct FinishTwice;

    impl ServerReactor for FinishTwice {
        type Req = ();
        type Resp = ();

        fn react(&self, event: Event<()>, call: &dyn ServerCall<()>) {
            if let Event::Started = event {
                call.finish(Status::ok());
                let second = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    call.finish(Status::cancelled())
                }));
                assert_matches!(second, Err(_));
            }
        }
    }

    #[tokio::test]
    async fn finishing_twice_panics() {
        let client = start(FinishTwice, Arc::new(CallContext::builder().build()));
        let (_, status) = client.finish().await;
        assert!(status.is_ok());
    }
}
