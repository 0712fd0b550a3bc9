// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use super::{
    finish_after_processing, on_cancel, start_processing, Event, FinishOnce, ServerCall,
    ServerReactor,
};
use crate::{
    context::lock,
    message::{EchoRequest, EchoResponse},
    metadata::ServerTryCancel,
};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct ReadState {
    policy: ServerTryCancel,
    message: String,
    num_msgs_read: usize,
    started: bool,
}

/// Concatenates the messages of a client stream into one response.
#[derive(Debug, Default)]
pub struct RequestStreamReactor {
    state: Mutex<ReadState>,
    gate: FinishOnce,
}

impl ServerReactor for RequestStreamReactor {
    type Req = EchoRequest;
    type Resp = EchoResponse;

    fn react(&self, event: Event<EchoRequest>, call: &dyn ServerCall<EchoResponse>) {
        let mut state = lock(&self.state);
        match event {
            Event::Started => {
                state.policy = call.context().client_metadata().server_try_cancel();
                if start_processing(state.policy, call.context()) {
                    call.start_read();
                }
                state.started = true;
            }
            Event::ReadDone(Some(request)) => {
                state.message.push_str(&request.message);
                state.num_msgs_read += 1;
                call.start_read();
            }
            Event::ReadDone(None) => {
                tracing::info!(num_msgs_read = state.num_msgs_read, "ReadComplete");
                call.set_response(EchoResponse::new(std::mem::take(&mut state.message)));
                finish_after_processing(state.policy, &self.gate, call);
            }
            Event::Cancel => on_cancel(state.started, &self.gate, call),
            Event::WriteDone(_) | Event::Alarm | Event::Done => {}
        }
    }

    fn method(&self) -> Option<&'static str> {
        Some("RequestStream")
    }
}
