// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use super::{Event, FinishOnce, ServerCall, ServerReactor};
use crate::{
    context::lock,
    echo::{check_client_initial_metadata, finish_echo, maybe_echo_deadline, maybe_set_host},
    message::{EchoRequest, EchoResponse, RequestParams, SimpleResponse},
    metadata::CancelCallbackMode,
    server::Config,
    status::Status,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// What the pending timer does when it fires.
#[derive(Clone, Copy, Debug)]
enum Alarm {
    /// The server sleep elapsed; echo the request.
    Resume,
    /// Finish CANCELLED if the call was cancelled, otherwise check again after the interval.
    PollCancelled(Duration),
    /// The server-cancel-after delay elapsed.
    CancelAfter,
}

#[derive(Debug)]
struct UnaryState {
    mode: CancelCallbackMode,
    /// The cancel callback is installed: [`Event::Cancel`] is observed.
    callback_installed: bool,
    /// The handler returned expecting the cancel callback to end the call.
    awaiting_cancel: bool,
    alarm: Option<Alarm>,
}

/// Echoes one request without blocking: sleeps are timers, and waits for cancellation are either
/// a timer loop or the cancel callback, as selected by the call's cancel callback mode.
#[derive(Debug)]
pub struct EchoReactor {
    request: EchoRequest,
    config: Arc<Config>,
    state: Mutex<UnaryState>,
    callback_invoked: AtomicBool,
    gate: FinishOnce,
}

impl EchoReactor {
    /// Returns a reactor that echoes `request`.
    pub fn new(request: EchoRequest, config: Arc<Config>) -> Self {
        EchoReactor {
            request,
            config,
            state: Mutex::new(UnaryState {
                mode: CancelCallbackMode::DoNotUse,
                callback_installed: false,
                awaiting_cancel: false,
                alarm: None,
            }),
            callback_invoked: AtomicBool::new(false),
            gate: FinishOnce::default(),
        }
    }

    fn param(&self) -> Option<&RequestParams> {
        self.request.param.as_ref()
    }

    fn set_alarm(
        &self,
        state: &mut UnaryState,
        alarm: Alarm,
        delay: Duration,
        call: &dyn ServerCall<EchoResponse>,
    ) {
        debug_assert!(state.alarm.is_none(), "one alarm at a time");
        state.alarm = Some(alarm);
        call.schedule(delay);
    }

    fn on_started(&self, state: &mut UnaryState, call: &dyn ServerCall<EchoResponse>) {
        state.mode = call.context().client_metadata().cancel_callback_mode();
        state.callback_installed = state.mode.uses_callback();
        // Slow handling makes short-deadline calls fail.
        match self.param().and_then(RequestParams::server_sleep) {
            Some(sleep) => self.set_alarm(state, Alarm::Resume, sleep, call),
            None => self.echo_non_delayed(state, call),
        }
    }

    fn on_alarm(&self, state: &mut UnaryState, call: &dyn ServerCall<EchoResponse>) {
        let Some(alarm) = state.alarm.take() else {
            tracing::warn!("AlarmWithoutTimer");
            return;
        };
        match alarm {
            Alarm::Resume => self.echo_non_delayed(state, call),
            Alarm::PollCancelled(interval) => self.loop_until_cancelled(state, interval, call),
            Alarm::CancelAfter => {
                self.gate.finish(call, Status::cancelled());
            }
        }
    }

    fn on_cancel(&self, state: &mut UnaryState, call: &dyn ServerCall<EchoResponse>) {
        if !state.callback_installed {
            return;
        }
        assert!(
            !self.callback_invoked.swap(true, Ordering::AcqRel),
            "cancel callback invoked twice"
        );
        tracing::info!("CancelCallback");
        if state.awaiting_cancel {
            self.gate.finish(call, Status::cancelled());
        }
    }

    fn loop_until_cancelled(
        &self,
        state: &mut UnaryState,
        interval: Duration,
        call: &dyn ServerCall<EchoResponse>,
    ) {
        if call.context().is_cancelled() {
            self.gate.finish(call, Status::cancelled());
        } else {
            self.set_alarm(state, Alarm::PollCancelled(interval), interval, call);
        }
    }

    fn echo_non_delayed(&self, state: &mut UnaryState, call: &dyn ServerCall<EchoResponse>) {
        let context = call.context();
        if state.mode.expects_cancel() {
            // Finished by whichever comes last: this point or the cancel callback.
            state.awaiting_cancel = true;
            if self.callback_invoked.load(Ordering::Acquire) {
                self.gate.finish(call, Status::cancelled());
            }
            return;
        }
        state.callback_installed = false;
        assert!(
            !self.callback_invoked.load(Ordering::Acquire),
            "cancel callback invoked for a call that did not expect cancellation"
        );

        let param = self.param();
        if param.is_some_and(|p| p.server_die) {
            tracing::error!("The request should not reach application handler.");
            std::process::abort();
        }
        if let Some(error) = param.and_then(|p| p.expected_error.as_ref()) {
            self.gate.finish(call, error.into());
            return;
        }
        if context.client_metadata().server_try_cancel().cancels() {
            crate::cancellations::server_try_cancel_nonblocking(context);
            self.loop_until_cancelled(state, self.config.cancel_poll_interval, call);
            return;
        }

        tracing::debug!(message = %self.request.message, "EchoRequest");
        let mut response = EchoResponse::new(self.request.message.clone());
        maybe_echo_deadline(context, &self.request, &mut response);
        maybe_set_host(self.config.host.as_deref(), &mut response);
        if let Some(interval) = param.and_then(RequestParams::client_cancel_after) {
            context.signal_client();
            self.loop_until_cancelled(state, interval, call);
            return;
        } else if let Some(delay) = param.and_then(RequestParams::server_cancel_after) {
            self.set_alarm(state, Alarm::CancelAfter, delay, call);
            return;
        } else if !param.is_some_and(|p| p.skip_cancelled_check) && context.is_cancelled() {
            tracing::info!("CancelledBeforeEcho");
            self.gate.finish(call, Status::cancelled());
            return;
        }

        match finish_echo(context, &self.request, &mut response, || call.send_initial_metadata()) {
            Ok(()) => {
                call.set_response(response);
                self.gate.finish(call, Status::ok());
            }
            Err(status) => {
                self.gate.finish(call, status);
            }
        }
    }
}

impl ServerReactor for EchoReactor {
    type Req = ();
    type Resp = EchoResponse;

    fn react(&self, event: Event<()>, call: &dyn ServerCall<EchoResponse>) {
        let mut state = lock(&self.state);
        match event {
            Event::Started => self.on_started(&mut state, call),
            Event::Alarm => self.on_alarm(&mut state, call),
            Event::Cancel => self.on_cancel(&mut state, call),
            Event::Done => tracing::debug!("EchoDone"),
            Event::ReadDone(_) | Event::WriteDone(_) => {}
        }
    }

    fn method(&self) -> Option<&'static str> {
        Some("Echo")
    }
}

/// Checks the custom client metadata pair, then finishes.
#[derive(Debug, Default)]
pub struct CheckMetadataReactor {
    gate: FinishOnce,
}

impl ServerReactor for CheckMetadataReactor {
    type Req = ();
    type Resp = SimpleResponse;

    fn react(&self, event: Event<()>, call: &dyn ServerCall<SimpleResponse>) {
        if let Event::Started = event {
            let status = match check_client_initial_metadata(call.context()) {
                Ok(()) => {
                    call.set_response(SimpleResponse {});
                    Status::ok()
                }
                Err(status) => status,
            };
            self.gate.finish(call, status);
        }
    }

    fn method(&self) -> Option<&'static str> {
        Some("CheckClientInitialMetadata")
    }
}
