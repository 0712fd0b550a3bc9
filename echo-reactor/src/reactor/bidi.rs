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
    metadata::{ServerTryCancel, SERVER_FINISH_AFTER_N_READS},
    transport::WriteOptions,
};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct BidiState {
    policy: ServerTryCancel,
    /// The read whose echo half-closes the stream; 0 never does.
    write_last_after: usize,
    num_msgs_read: usize,
    /// Set once the finish decision was applied; no read follows.
    processed: bool,
    started: bool,
}

/// Echoes every message of a client stream, alternating reads and writes.
#[derive(Debug, Default)]
pub struct BidiStreamReactor {
    state: Mutex<BidiState>,
    gate: FinishOnce,
}

impl ServerReactor for BidiStreamReactor {
    type Req = EchoRequest;
    type Resp = EchoResponse;

    fn react(&self, event: Event<EchoRequest>, call: &dyn ServerCall<EchoResponse>) {
        let mut state = lock(&self.state);
        match event {
            Event::Started => {
                let metadata = call.context().client_metadata();
                state.policy = metadata.server_try_cancel();
                state.write_last_after = metadata.count_value(SERVER_FINISH_AFTER_N_READS, 0);
                if start_processing(state.policy, call.context()) {
                    call.start_read();
                }
                state.started = true;
            }
            Event::ReadDone(Some(request)) => {
                state.num_msgs_read += 1;
                tracing::info!(message = %request.message, "RecvMsg");
                let response = EchoResponse::new(request.message);
                if state.num_msgs_read != state.write_last_after {
                    // Reading resumes once the write completes.
                    call.start_write(response);
                    return;
                }
                call.start_write_last(response, WriteOptions::default());
                state.processed = true;
                finish_after_processing(state.policy, &self.gate, call);
            }
            Event::ReadDone(None) => {
                if !state.processed {
                    state.processed = true;
                    finish_after_processing(state.policy, &self.gate, call);
                }
            }
            // The completion of the half-closing write starts nothing.
            Event::WriteDone(_) if state.processed => {}
            Event::WriteDone(_) => {
                self.gate.unless_finished(|| call.start_read());
            }
            Event::Cancel => on_cancel(state.started, &self.gate, call),
            Event::Alarm | Event::Done => {}
        }
    }

    fn method(&self) -> Option<&'static str> {
        Some("BidiStream")
    }
}
