// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Provides the reactor-style echo service.
//!
//! A reactor is a per-call state machine. The runtime drives it with [`Event`]s and hands it a
//! [`ServerCall`] through which it starts reads, writes and timers and finishes the call. Starting
//! an operation never blocks: the matching completion event arrives later, possibly on another
//! thread, and possibly at the same time as a [`Event::Cancel`]. Every path that can end the call
//! therefore goes through a [`FinishOnce`] gate.

use crate::{
    cancellations::server_try_cancel_nonblocking,
    context::{lock, CallContext},
    message::{EchoRequest, EchoResponse, SimpleRequest},
    metadata::ServerTryCancel,
    server::Config,
    status::Status,
    transport::WriteOptions,
};
use std::{marker::PhantomData, sync::Arc, sync::Mutex, time::Duration};

pub mod driver;

mod bidi;
mod read;
mod unary;
mod write;

pub use bidi::BidiStreamReactor;
pub use read::RequestStreamReactor;
pub use unary::{CheckMetadataReactor, EchoReactor};
pub use write::ResponseStreamReactor;

/// Something that happened to a call.
#[derive(Debug)]
pub enum Event<Req> {
    /// The call arrived. Always the first event.
    Started,
    /// A read started with [`ServerCall::start_read`] completed; `None` means the client
    /// half-closed or the call was cancelled.
    ReadDone(Option<Req>),
    /// A write completed; false means the message was not sent.
    WriteDone(bool),
    /// The call was cancelled by either side. Delivered at most once and never before `Started`
    /// returns. It may race with the reactor finishing the call.
    Cancel,
    /// A timer started with [`ServerCall::schedule`] fired.
    Alarm,
    /// The call is finished and no operation is outstanding. Always the last event; the runtime
    /// releases the reactor afterward.
    Done,
}

/// The operations a reactor may start on its call.
///
/// At most one read and one write may be outstanding at a time.
pub trait ServerCall<Resp>: Send + Sync {
    /// The call context.
    fn context(&self) -> &CallContext;

    /// Starts reading the next client message; completes with [`Event::ReadDone`].
    fn start_read(&self);

    /// Starts writing a message; completes with [`Event::WriteDone`].
    fn start_write(&self, response: Resp);

    /// Starts writing the final message and half-closing the stream in one operation;
    /// completes with [`Event::WriteDone`].
    fn start_write_last(&self, response: Resp, options: WriteOptions);

    /// Sends the initial metadata added so far ahead of any message.
    fn send_initial_metadata(&self);

    /// Sets the single response of a unary or client-streaming call. It is sent if the call
    /// finishes OK.
    fn set_response(&self, response: Resp);

    /// Finishes the call with `status`.
    ///
    /// # Panics
    ///
    /// Runtimes panic when a call is finished twice.
    fn finish(&self, status: Status);

    /// Delivers [`Event::Alarm`] after `delay`.
    fn schedule(&self, delay: Duration);
}

/// A per-call state machine driven by the runtime.
pub trait ServerReactor: Send + Sync + 'static {
    /// Type of client messages.
    type Req: Send + 'static;

    /// Type of server messages.
    type Resp: Send + 'static;

    /// Reacts to one event. May be invoked concurrently from several threads.
    fn react(&self, event: Event<Self::Req>, call: &dyn ServerCall<Self::Resp>);

    /// The name of the method the reactor serves.
    fn method(&self) -> Option<&'static str> {
        None
    }
}

/// Admits exactly one of several racing attempts to finish a call.
#[derive(Debug, Default)]
pub struct FinishOnce {
    finished: Mutex<bool>,
}

impl FinishOnce {
    /// Finishes the call unless it already was. Returns true iff this attempt finished it.
    pub fn finish<Resp>(&self, call: &dyn ServerCall<Resp>, status: Status) -> bool {
        let mut finished = lock(&self.finished);
        if *finished {
            tracing::trace!(code = %status.code(), "FinishOnce: already finished");
            return false;
        }
        call.finish(status);
        *finished = true;
        true
    }

    /// Runs `f` while holding the gate, unless the call is finished. Returns true iff `f` ran.
    pub fn unless_finished(&self, f: impl FnOnce()) -> bool {
        let finished = lock(&self.finished);
        if *finished {
            return false;
        }
        f();
        drop(finished);
        true
    }

    /// True once the call was finished through this gate.
    pub fn is_finished(&self) -> bool {
        *lock(&self.finished)
    }
}

/// What a streaming reactor does once its message exchange is over.
///
/// Cancellation during processing is left for [`Event::Cancel`] to finish; cancellation after
/// processing is triggered now and also finished by [`Event::Cancel`]; otherwise the call
/// finishes OK.
fn finish_after_processing<Resp>(
    policy: ServerTryCancel,
    gate: &FinishOnce,
    call: &dyn ServerCall<Resp>,
) {
    match policy {
        ServerTryCancel::CancelDuringProcessing => {}
        ServerTryCancel::CancelAfterProcessing => server_try_cancel_nonblocking(call.context()),
        ServerTryCancel::DoNotCancel | ServerTryCancel::CancelBeforeProcessing => {
            gate.finish(call, Status::ok());
        }
    }
}

/// Applies the policy at the start of a streaming call. Returns false if the call was cancelled
/// before processing and no message may be exchanged.
fn start_processing(policy: ServerTryCancel, context: &CallContext) -> bool {
    match policy {
        ServerTryCancel::CancelBeforeProcessing => {
            server_try_cancel_nonblocking(context);
            false
        }
        ServerTryCancel::CancelDuringProcessing => {
            // Cancellation takes effect while messages are exchanged; don't wait for it.
            context.try_cancel();
            true
        }
        ServerTryCancel::DoNotCancel | ServerTryCancel::CancelAfterProcessing => true,
    }
}

/// Handles [`Event::Cancel`] for a streaming reactor.
fn on_cancel<Resp>(started: bool, gate: &FinishOnce, call: &dyn ServerCall<Resp>) {
    assert!(started, "cancel delivered before the call started");
    assert!(
        call.context().is_cancelled(),
        "cancel delivered for a call that is not cancelled"
    );
    gate.finish(call, Status::cancelled());
}

/// A reactor for a method that has no handler.
#[derive(Debug)]
pub struct UnimplementedReactor<Req, Resp> {
    ghost: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Default for UnimplementedReactor<Req, Resp> {
    fn default() -> Self {
        UnimplementedReactor { ghost: PhantomData }
    }
}

impl<Req, Resp> ServerReactor for UnimplementedReactor<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Req = Req;
    type Resp = Resp;

    fn react(&self, event: Event<Req>, call: &dyn ServerCall<Resp>) {
        if let Event::Started = event {
            call.finish(crate::method::Method::Unimplemented.unimplemented_status());
        }
    }

    fn method(&self) -> Option<&'static str> {
        Some("Unimplemented")
    }
}

/// The reactor-style echo service. Creates one reactor per call.
#[derive(Clone, Debug, Default)]
pub struct CallbackEchoService {
    config: Arc<Config>,
}

impl Config {
    /// Returns a reactor-style service configured with `self`.
    pub fn callback_service(self) -> CallbackEchoService {
        CallbackEchoService::new(self)
    }
}

impl CallbackEchoService {
    /// Returns a service configured with `config`.
    pub fn new(config: Config) -> Self {
        CallbackEchoService {
            config: Arc::new(config),
        }
    }

    /// A reactor echoing `request`.
    pub fn echo(&self, request: EchoRequest) -> EchoReactor {
        EchoReactor::new(request, self.config.clone())
    }

    /// A reactor checking the custom client metadata pair.
    pub fn check_client_initial_metadata(&self, _: SimpleRequest) -> CheckMetadataReactor {
        CheckMetadataReactor::default()
    }

    /// A reactor concatenating the client's messages.
    pub fn request_stream(&self) -> RequestStreamReactor {
        RequestStreamReactor::default()
    }

    /// A reactor streaming responses derived from `request`.
    pub fn response_stream(&self, request: EchoRequest) -> ResponseStreamReactor {
        ResponseStreamReactor::new(request, self.config.default_response_streams)
    }

    /// A reactor echoing each client message.
    pub fn bidi_stream(&self) -> BidiStreamReactor {
        BidiStreamReactor::default()
    }

    /// A reactor for the method without a handler.
    pub fn unimplemented(&self, _: EchoRequest) -> UnimplementedReactor<EchoRequest, EchoResponse> {
        UnimplementedReactor::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCall {
        context: CallContext,
        finishes: AtomicUsize,
        reads: AtomicUsize,
    }

    impl ServerCall<()> for CountingCall {
        fn context(&self) -> &CallContext {
            &self.context
        }
        fn start_read(&self) {
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
        fn start_write(&self, _: ()) {}
        fn start_write_last(&self, _: (), _: WriteOptions) {}
        fn send_initial_metadata(&self) {}
        fn set_response(&self, _: ()) {}
        fn finish(&self, _: Status) {
            self.finishes.fetch_add(1, Ordering::SeqCst);
        }
        fn schedule(&self, _: Duration) {}
    }

    impl CountingCall {
        fn new() -> Self {
            CountingCall {
                context: CallContext::builder().build(),
                finishes: AtomicUsize::new(0),
                reads: AtomicUsize::new(0),
            }
        }
    }

    #[test]
    fn finish_once_admits_one_of_many_threads() {
        let counting = CountingCall::new();
        let call: &dyn ServerCall<()> = &counting;
        let gate = FinishOnce::default();
        let winners = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if gate.finish(call, Status::cancelled()) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(counting.finishes.load(Ordering::SeqCst), 1);
        assert!(gate.is_finished());
    }

    #[test]
    fn unless_finished_skips_after_finish() {
        let counting = CountingCall::new();
        let call: &dyn ServerCall<()> = &counting;
        let gate = FinishOnce::default();
        assert!(gate.unless_finished(|| call.start_read()));
        gate.finish(call, Status::ok());
        assert!(!gate.unless_finished(|| call.start_read()));
        assert_eq!(counting.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn after_processing_triggers_cancel_without_finishing() {
        let counting = CountingCall::new();
        let call: &dyn ServerCall<()> = &counting;
        let gate = FinishOnce::default();
        finish_after_processing(ServerTryCancel::CancelAfterProcessing, &gate, call);
        assert!(counting.context.is_cancelled());
        assert!(!gate.is_finished());
        finish_after_processing(ServerTryCancel::CancelDuringProcessing, &gate, call);
        assert!(!gate.is_finished());
        on_cancel(true, &gate, call);
        assert_eq!(counting.finishes.load(Ordering::SeqCst), 1);
    }
}
