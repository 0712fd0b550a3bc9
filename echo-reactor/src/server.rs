// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Provides the blocking-style echo service: each call occupies one thread, and the handler
//! blocks on every read and write until the call completes.

use crate::{
    cancellations::server_try_cancel,
    context::CallContext,
    echo::{finish_echo, maybe_echo_deadline, maybe_set_host},
    message::{EchoRequest, EchoResponse, RequestParams, SimpleRequest, SimpleResponse},
    metadata::{
        ServerTryCancel, DEFAULT_RESPONSE_STREAMS_TO_SEND, SERVER_FINISH_AFTER_N_READS,
        SERVER_RESPONSE_STREAMS_TO_SEND, SERVER_USE_COALESCING_API,
    },
    method::Method,
    status::Status,
    transport::{ServerReader, ServerWriter, WriteOptions},
};
use std::{thread, time::Duration};
use tracing::info_span;

/// Settings that control the behavior of the echo service in both styles.
#[derive(Clone, Debug)]
pub struct Config {
    /// When set, copied into the `host` of every echo response.
    pub host: Option<String>,
    /// Responses the server-streaming handler sends when the client does not choose a count.
    pub default_response_streams: usize,
    /// How often the reactor unary handler re-checks a call it cancelled itself.
    pub cancel_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: None,
            default_response_streams: DEFAULT_RESPONSE_STREAMS_TO_SEND,
            cancel_poll_interval: Duration::from_millis(1),
        }
    }
}

impl Config {
    /// Returns a blocking-style service configured with `self`.
    pub fn service(self) -> EchoService {
        EchoService::new(self)
    }
}

/// Runs `body` under the server try-cancel policy.
///
/// Before processing, the call is cancelled and `body` never runs. During processing, one
/// auxiliary thread cancels the call while `body` runs and is joined before returning. After
/// processing, `body` runs to completion before the call is cancelled. Every policy but
/// [`DoNotCancel`](ServerTryCancel::DoNotCancel) yields CANCELLED.
fn process<T>(
    context: &CallContext,
    policy: ServerTryCancel,
    body: impl FnOnce() -> T,
) -> Result<T, Status> {
    match policy {
        ServerTryCancel::DoNotCancel => Ok(body()),
        ServerTryCancel::CancelBeforeProcessing => {
            server_try_cancel(context);
            Err(Status::cancelled())
        }
        ServerTryCancel::CancelDuringProcessing => {
            thread::scope(|scope| {
                scope.spawn(|| server_try_cancel(context));
                body();
            });
            Err(Status::cancelled())
        }
        ServerTryCancel::CancelAfterProcessing => {
            body();
            server_try_cancel(context);
            Err(Status::cancelled())
        }
    }
}

/// The blocking-style echo service.
#[derive(Clone, Debug, Default)]
pub struct EchoService {
    config: Config,
}

impl EchoService {
    /// Returns a service configured with `config`.
    pub fn new(config: Config) -> Self {
        EchoService { config }
    }

    /// The service configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Echoes `request`, applying its parameters.
    ///
    /// An expected error in the parameters overrides every other behavior. A try-cancel policy
    /// in the metadata cancels the call, since the request was already read by the time the
    /// handler runs.
    pub fn echo(&self, context: &CallContext, request: &EchoRequest) -> Result<EchoResponse, Status> {
        let _span = info_span!("RPC", rpc.method = "Echo", rpc.peer = context.peer()).entered();
        let param = request.param.as_ref();
        // Slow handling makes short-deadline calls fail.
        if let Some(sleep) = param.and_then(RequestParams::server_sleep) {
            thread::sleep(sleep);
        }
        if param.is_some_and(|p| p.server_die) {
            tracing::error!("The request should not reach application handler.");
            std::process::abort();
        }
        if let Some(error) = param.and_then(|p| p.expected_error.as_ref()) {
            return Err(error.into());
        }
        if context.client_metadata().server_try_cancel().cancels() {
            server_try_cancel(context);
            return Err(Status::cancelled());
        }

        let mut response = EchoResponse::new(request.message.clone());
        maybe_echo_deadline(context, request, &mut response);
        maybe_set_host(self.config.host.as_deref(), &mut response);
        if let Some(interval) = param.and_then(RequestParams::client_cancel_after) {
            context.signal_client();
            context.poll_until_cancelled(interval);
            return Err(Status::cancelled());
        } else if let Some(delay) = param.and_then(RequestParams::server_cancel_after) {
            thread::sleep(delay);
            return Err(Status::cancelled());
        } else if !param.is_some_and(|p| p.skip_cancelled_check) && context.is_cancelled() {
            tracing::info!("CancelledBeforeEcho");
            return Err(Status::cancelled());
        }

        finish_echo(context, request, &mut response, || {})?;
        Ok(response)
    }

    /// Succeeds iff the client sent the custom metadata pair exactly once.
    pub fn check_client_initial_metadata(
        &self,
        context: &CallContext,
        _: &SimpleRequest,
    ) -> Result<SimpleResponse, Status> {
        crate::echo::check_client_initial_metadata(context)?;
        Ok(SimpleResponse {})
    }

    /// Deliberately has no handler.
    pub fn unimplemented(&self, _: &CallContext, _: &EchoRequest) -> Result<EchoResponse, Status> {
        Err(Method::Unimplemented.unimplemented_status())
    }

    /// Reads requests until the stream ends, concatenating their messages into one response.
    pub fn request_stream<R>(&self, context: &CallContext, reader: &mut R) -> Result<EchoResponse, Status>
    where
        R: ServerReader<EchoRequest>,
    {
        let _span =
            info_span!("RPC", rpc.method = "RequestStream", rpc.peer = context.peer()).entered();
        let policy = context.client_metadata().server_try_cancel();
        process(context, policy, || {
            let mut response = EchoResponse::new("");
            let mut num_msgs_read = 0;
            while let Some(request) = reader.read() {
                response.message.push_str(&request.message);
                num_msgs_read += 1;
            }
            tracing::info!(num_msgs_read, "ReadComplete");
            response
        })
    }

    /// Writes the configured number of responses, each the request message followed by its
    /// index. With the coalescing flag, the last response also half-closes the stream.
    pub fn response_stream<W>(
        &self,
        context: &CallContext,
        request: &EchoRequest,
        writer: &mut W,
    ) -> Result<(), Status>
    where
        W: ServerWriter<EchoResponse>,
    {
        let _span =
            info_span!("RPC", rpc.method = "ResponseStream", rpc.peer = context.peer()).entered();
        let metadata = context.client_metadata();
        let policy = metadata.server_try_cancel();
        let coalescing = metadata.int_value(SERVER_USE_COALESCING_API, 0) != 0;
        let responses_to_send = metadata.count_value(
            SERVER_RESPONSE_STREAMS_TO_SEND,
            self.config.default_response_streams,
        );
        process(context, policy, || {
            for i in 0..responses_to_send {
                let response = EchoResponse::new(format!("{}{i}", request.message));
                if i + 1 == responses_to_send && coalescing {
                    writer.write_last(response, WriteOptions::default());
                } else {
                    writer.write(response);
                }
            }
        })
    }

    /// Echoes every request as it is read. The read numbered by the finish-after-N-reads
    /// threshold is echoed with a write that also half-closes the stream.
    pub fn bidi_stream<S>(&self, context: &CallContext, stream: &mut S) -> Result<(), Status>
    where
        S: ServerReader<EchoRequest> + ServerWriter<EchoResponse>,
    {
        let _span =
            info_span!("RPC", rpc.method = "BidiStream", rpc.peer = context.peer()).entered();
        let metadata = context.client_metadata();
        let policy = metadata.server_try_cancel();
        let write_last_after = metadata.count_value(SERVER_FINISH_AFTER_N_READS, 0);
        process(context, policy, || {
            let mut read_counts = 0;
            while let Some(request) = stream.read() {
                read_counts += 1;
                tracing::info!(message = %request.message, "RecvMsg");
                let response = EchoResponse::new(request.message);
                if read_counts == write_last_after {
                    stream.write_last(response, WriteOptions::default());
                } else {
                    stream.write(response);
                }
            }
        })
    }
}
