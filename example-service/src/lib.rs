// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use echo_reactor::{
    message::{EchoRequest, EchoResponse, SimpleRequest},
    metadata::{
        Metadata, SERVER_FINISH_AFTER_N_READS, SERVER_RESPONSE_STREAMS_TO_SEND,
        SERVER_TRY_CANCEL_REQUEST, SERVER_USE_CANCEL_CALLBACK, SERVER_USE_COALESCING_API,
    },
    method::CallShape,
    reactor::driver::{self, ClientCall},
    transport::channel,
    CallContext, CallbackEchoService, EchoService, Method, Status,
};
use std::{fmt, sync::Arc};
use tracing_subscriber::{fmt::format::FmtSpan, prelude::*};

/// The metadata knobs a client can set on a call.
#[derive(Clone, Debug, Default, clap::Args)]
pub struct CallFlags {
    /// When the server cancels the call: 0 never, 1 before, 2 during, 3 after processing.
    #[arg(long, default_value_t = 0)]
    pub try_cancel: i32,
    /// How the reactor echo uses the cancel callback: 0 not at all, 1 early, 2 late, 3 no cancel.
    #[arg(long, default_value_t = 0)]
    pub cancel_callback: i32,
    /// Responses the server streams.
    #[arg(long)]
    pub responses: Option<usize>,
    /// Half-close the response stream with the last write.
    #[arg(long)]
    pub coalesce: bool,
    /// Half-close the bidi stream when echoing this read.
    #[arg(long)]
    pub finish_after: Option<usize>,
}

impl CallFlags {
    /// The client metadata the flags translate to.
    pub fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(SERVER_TRY_CANCEL_REQUEST, self.try_cancel.to_string());
        metadata.insert(SERVER_USE_CANCEL_CALLBACK, self.cancel_callback.to_string());
        if let Some(responses) = self.responses {
            metadata.insert(SERVER_RESPONSE_STREAMS_TO_SEND, responses.to_string());
        }
        if self.coalesce {
            metadata.insert(SERVER_USE_COALESCING_API, "1");
        }
        if let Some(n) = self.finish_after {
            metadata.insert(SERVER_FINISH_AFTER_N_READS, n.to_string());
        }
        metadata
    }

    /// A fresh context for one call.
    pub fn context(&self, peer: &str) -> Arc<CallContext> {
        Arc::new(
            CallContext::builder()
                .peer(peer)
                .client_metadata(self.metadata())
                .build(),
        )
    }
}

/// What the client observed when a call ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    /// Every response message, in order.
    pub responses: Vec<String>,
    /// The terminal status.
    pub status: Status,
}

impl Outcome {
    fn new(responses: Vec<EchoResponse>, status: Status) -> Self {
        Outcome {
            responses: responses.into_iter().map(|r| r.message).collect(),
            status,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {:?}", self.status, self.responses)
    }
}

fn requests(messages: &[String]) -> impl Iterator<Item = EchoRequest> + '_ {
    messages.iter().map(EchoRequest::new)
}

fn first_request(messages: &[String]) -> EchoRequest {
    EchoRequest::new(messages.first().map(String::as_str).unwrap_or_default())
}

fn streams_requests(method: Method) -> bool {
    matches!(
        method.shape(),
        CallShape::ClientStreaming | CallShape::BidiStreaming
    )
}

/// Runs one call to the method at `path` against the blocking-style service on the current
/// thread. Paths that name no method end with `UNIMPLEMENTED`.
pub fn run_blocking(
    service: &EchoService,
    path: &str,
    context: Arc<CallContext>,
    messages: &[String],
) -> Outcome {
    let method = match Method::from_path(path) {
        Ok(method) => method,
        Err(status) => return Outcome::new(vec![], status),
    };
    let (mut server, mut client) = channel::call::<EchoRequest, EchoResponse>(context.clone());
    if streams_requests(method) {
        requests(messages).for_each(|request| {
            client.send(request);
        });
        client.writes_done();
    }
    let result = match method {
        Method::Echo => service
            .echo(&context, &first_request(messages))
            .map(|response| vec![response]),
        Method::CheckClientInitialMetadata => service
            .check_client_initial_metadata(&context, &SimpleRequest::default())
            .map(|_| vec![]),
        Method::Unimplemented => service
            .unimplemented(&context, &first_request(messages))
            .map(|response| vec![response]),
        Method::RequestStream => service
            .request_stream(&context, &mut server)
            .map(|response| vec![response]),
        Method::ResponseStream => service
            .response_stream(&context, &first_request(messages), &mut server)
            .map(|()| vec![]),
        Method::BidiStream => service.bidi_stream(&context, &mut server).map(|()| vec![]),
    };
    drop(server);
    match result {
        Ok(mut responses) => {
            responses.extend(client.drain());
            Outcome::new(responses, Status::ok())
        }
        Err(status) => Outcome::new(client.drain(), status),
    }
}

async fn stream_requests(
    mut call: ClientCall<EchoRequest, EchoResponse>,
    messages: &[String],
) -> (Vec<EchoResponse>, Status) {
    requests(messages).for_each(|request| {
        call.send(request);
    });
    call.writes_done();
    call.finish().await
}

/// Runs one call to the method at `path` against the reactor-style service. Must be called
/// within a tokio runtime. Paths that name no method end with `UNIMPLEMENTED`.
pub async fn run_reactor(
    service: &CallbackEchoService,
    path: &str,
    context: Arc<CallContext>,
    messages: &[String],
) -> Outcome {
    let method = match Method::from_path(path) {
        Ok(method) => method,
        Err(status) => return Outcome::new(vec![], status),
    };
    let (responses, status) = match method {
        Method::Echo => {
            driver::start(service.echo(first_request(messages)), context)
                .finish()
                .await
        }
        Method::CheckClientInitialMetadata => {
            let reactor = service.check_client_initial_metadata(SimpleRequest::default());
            let (_, status) = driver::start(reactor, context).finish().await;
            (vec![], status)
        }
        Method::Unimplemented => {
            driver::start(service.unimplemented(first_request(messages)), context)
                .finish()
                .await
        }
        Method::RequestStream => {
            stream_requests(driver::start(service.request_stream(), context), messages).await
        }
        Method::ResponseStream => {
            driver::start(service.response_stream(first_request(messages)), context)
                .finish()
                .await
        }
        Method::BidiStream => {
            stream_requests(driver::start(service.bidi_stream(), context), messages).await
        }
    };
    Outcome::new(responses, status)
}

/// Initializes a tracing subscriber that logs to stdout, filtered by `RUST_LOG`.
pub fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_span_events(FmtSpan::NEW | FmtSpan::CLOSE))
        .try_init()?;
    Ok(())
}
