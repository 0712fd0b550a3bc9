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
    metadata::{ServerTryCancel, SERVER_RESPONSE_STREAMS_TO_SEND, SERVER_USE_COALESCING_API},
    status::Status,
    transport::WriteOptions,
};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct WriteState {
    policy: ServerTryCancel,
    coalescing: bool,
    responses_to_send: usize,
    num_msgs_sent: usize,
    started: bool,
}

/// Streams responses derived from one request, one write at a time.
#[derive(Debug)]
pub struct ResponseStreamReactor {
    request: EchoRequest,
    default_responses: usize,
    state: Mutex<WriteState>,
    gate: FinishOnce,
}

impl ResponseStreamReactor {
    /// Returns a reactor streaming responses to `request`. Sends `default_responses` responses
    /// unless the client metadata asks for another count.
    pub fn new(request: EchoRequest, default_responses: usize) -> Self {
        ResponseStreamReactor {
            request,
            default_responses,
            state: Mutex::default(),
            gate: FinishOnce::default(),
        }
    }

    /// Issues the next write. A coalesced last write finishes the call right away rather than
    /// waiting for its completion.
    fn next_write(&self, state: &mut WriteState, call: &dyn ServerCall<EchoResponse>) {
        let response = EchoResponse::new(format!("{}{}", self.request.message, state.num_msgs_sent));
        state.num_msgs_sent += 1;
        if state.coalescing && state.num_msgs_sent == state.responses_to_send {
            call.start_write_last(response, WriteOptions::default());
            self.gate.finish(call, Status::ok());
        } else {
            call.start_write(response);
        }
    }
}

impl ServerReactor for ResponseStreamReactor {
    type Req = ();
    type Resp = EchoResponse;

    fn react(&self, event: Event<()>, call: &dyn ServerCall<EchoResponse>) {
        let mut state = lock(&self.state);
        match event {
            Event::Started => {
                let metadata = call.context().client_metadata();
                state.policy = metadata.server_try_cancel();
                state.coalescing = metadata.int_value(SERVER_USE_COALESCING_API, 0) != 0;
                state.responses_to_send =
                    metadata.count_value(SERVER_RESPONSE_STREAMS_TO_SEND, self.default_responses);
                if start_processing(state.policy, call.context()) {
                    if state.responses_to_send > 0 {
                        self.next_write(&mut state, call);
                    } else {
                        finish_after_processing(state.policy, &self.gate, call);
                    }
                }
                state.started = true;
            }
            Event::WriteDone(_) => {
                if state.num_msgs_sent < state.responses_to_send {
                    self.next_write(&mut state, call);
                } else if !state.coalescing {
                    finish_after_processing(state.policy, &self.gate, call);
                }
            }
            Event::Cancel => on_cancel(state.started, &self.gate, call),
            Event::ReadDone(_) | Event::Alarm | Event::Done => {}
        }
    }

    fn method(&self) -> Option<&'static str> {
        Some("ResponseStream")
    }
}
