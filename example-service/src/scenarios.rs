// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use echo_reactor::Config;
use futures::future;
use service::{init_tracing, run_blocking, run_reactor, CallFlags};
use std::time::Duration;

/// Which handler style serves the calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum Style {
    Blocking,
    Reactor,
    Both,
}

#[derive(Parser)]
#[command(about = "Runs echo calls and prints how each one ended.")]
struct Flags {
    /// The method to call, as `/<service>/<method>` or a bare method name.
    #[arg(long, default_value = "/grpc.testing.EchoTestService/BidiStream")]
    method: String,
    /// The handler style.
    #[arg(long, value_enum, default_value_t = Style::Both)]
    style: Style,
    /// Concurrent calls per style.
    #[arg(long, default_value_t = 1)]
    calls: usize,
    /// Copied into the host of every echo response.
    #[arg(long)]
    host: Option<String>,
    /// Responses streamed when the call does not ask for a count.
    #[arg(long, default_value_t = 3)]
    default_responses: usize,
    /// Milliseconds between checks of a call the reactor echo cancelled itself.
    #[arg(long, default_value_t = 1)]
    cancel_poll_ms: u64,
    /// Messages the client sends; the first one is the request of single-request calls.
    #[arg(long = "message", default_values_t = vec!["hello".to_string()])]
    messages: Vec<String>,
    #[command(flatten)]
    call: CallFlags,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing()?;

    let config = Config {
        host: flags.host.clone(),
        default_response_streams: flags.default_responses,
        cancel_poll_interval: Duration::from_millis(flags.cancel_poll_ms),
    };

    if matches!(flags.style, Style::Blocking | Style::Both) {
        let handles: Vec<_> = (0..flags.calls)
            .map(|i| {
                let service = config.clone().service();
                let context = flags.call.context(&format!("blocking-client-{i}"));
                let messages = flags.messages.clone();
                let method = flags.method.clone();
                tokio::task::spawn_blocking(move || {
                    run_blocking(&service, &method, context, &messages)
                })
            })
            .collect();
        for (i, outcome) in future::try_join_all(handles).await?.into_iter().enumerate() {
            tracing::info!(call = i, %outcome, "BlockingCallEnded");
            println!("blocking #{i}: {outcome}");
        }
    }

    if matches!(flags.style, Style::Reactor | Style::Both) {
        let service = config.callback_service();
        let outcomes = future::join_all((0..flags.calls).map(|i| {
            let context = flags.call.context(&format!("reactor-client-{i}"));
            run_reactor(&service, &flags.method, context, &flags.messages)
        }))
        .await;
        for (i, outcome) in outcomes.into_iter().enumerate() {
            tracing::info!(call = i, %outcome, "ReactorCallEnded");
            println!("reactor #{i}: {outcome}");
        }
    }

    Ok(())
}
