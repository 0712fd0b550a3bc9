// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Messages exchanged by the echo service.

use crate::status::Status;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An error the client asks the server to terminate the call with.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStatus {
    /// The wire status code.
    pub code: i32,
    /// The status message.
    pub error_message: String,
    /// Binary error details.
    pub binary_error_details: Bytes,
}

impl From<&ErrorStatus> for Status {
    fn from(error: &ErrorStatus) -> Self {
        Status::from_wire(
            error.code,
            error.error_message.clone(),
            error.binary_error_details.clone(),
        )
    }
}

/// Debugging information a client can ask the server to send back in a trailer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugInfo {
    /// Stack frames.
    pub stack_entries: Vec<String>,
    /// Free-form detail.
    pub detail: String,
}

impl DebugInfo {
    /// True iff there is nothing to report.
    pub fn is_empty(&self) -> bool {
        self.stack_entries.is_empty() && self.detail.is_empty()
    }

    /// Serializes the debug info for a binary trailer.
    pub fn to_bytes(&self) -> Result<Bytes, bincode::Error> {
        bincode::serialize(self).map(Bytes::from)
    }

    /// Deserializes debug info read from a binary trailer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Per-request knobs that select server behavior. Absent parameters mean a plain echo.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestParams {
    /// Echo the call deadline in the response.
    pub echo_deadline: bool,
    /// Microseconds the server sleeps before handling the request.
    pub server_sleep_us: u64,
    /// Abort the server process when the request reaches the handler.
    pub server_die: bool,
    /// Terminate with this status instead of echoing.
    pub expected_error: Option<ErrorStatus>,
    /// The client cancels the call; the server polls for it at this interval.
    pub client_cancel_after_us: u64,
    /// The server returns CANCELLED after this many microseconds.
    pub server_cancel_after_us: u64,
    /// Do not treat a call already cancelled by the client as finished.
    pub skip_cancelled_check: bool,
    /// Echo client metadata as initial metadata.
    pub echo_metadata_initially: bool,
    /// Echo client metadata as trailing metadata.
    pub echo_metadata: bool,
    /// With `echo_metadata`, send this back in a trailer and terminate CANCELLED.
    pub debug_info: DebugInfo,
    /// Expected `transport_security_type` of the auth context.
    pub expected_transport_security_type: String,
    /// Expected peer identity; empty means the peer is expected to be unauthenticated.
    pub expected_client_identity: String,
    /// Check the auth context even when no client identity is expected.
    pub check_auth_context: bool,
    /// Respond with a message of this many NUL characters instead of echoing.
    pub response_message_length: usize,
    /// Echo the peer address in the response.
    pub echo_peer: bool,
}

impl RequestParams {
    /// The server sleep, if any.
    pub fn server_sleep(&self) -> Option<Duration> {
        micros(self.server_sleep_us)
    }

    /// The client-cancel polling interval, if the client is going to cancel.
    pub fn client_cancel_after(&self) -> Option<Duration> {
        micros(self.client_cancel_after_us)
    }

    /// The server-cancel delay, if any.
    pub fn server_cancel_after(&self) -> Option<Duration> {
        micros(self.server_cancel_after_us)
    }

    /// True iff the auth context should be checked.
    pub fn checks_auth_context(&self) -> bool {
        !self.expected_client_identity.is_empty() || self.check_auth_context
    }
}

fn micros(us: u64) -> Option<Duration> {
    (us > 0).then(|| Duration::from_micros(us))
}

/// Fields the server fills in when asked to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseParams {
    /// The call deadline in seconds since the Unix epoch; `i64::MAX` when there is none.
    pub request_deadline: i64,
    /// The host configured on the service.
    pub host: String,
    /// The peer address.
    pub peer: String,
}

/// An echo request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRequest {
    /// The message to echo.
    pub message: String,
    /// Optional behavior knobs.
    pub param: Option<RequestParams>,
}

impl EchoRequest {
    /// A plain echo request.
    pub fn new(message: impl Into<String>) -> Self {
        EchoRequest {
            message: message.into(),
            param: None,
        }
    }

    /// Attaches parameters to the request.
    pub fn with_param(mut self, param: RequestParams) -> Self {
        self.param = Some(param);
        self
    }
}

/// An echo response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoResponse {
    /// The echoed message.
    pub message: String,
    /// Fields the server filled in.
    pub param: Option<ResponseParams>,
}

impl EchoResponse {
    /// A response carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        EchoResponse {
            message: message.into(),
            param: None,
        }
    }

    /// The response parameters, created on first use.
    pub fn param_mut(&mut self) -> &mut ResponseParams {
        self.param.get_or_insert_with(Default::default)
    }
}

/// Request of the initial-metadata check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleRequest {}

/// Response of the initial-metadata check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleResponse {}
