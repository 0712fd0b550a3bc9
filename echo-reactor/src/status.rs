// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Terminal call results.

use bytes::Bytes;
use std::fmt;

/// Status codes, numbered as on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum Code {
    /// Not an error; returned on success.
    Ok = 0,
    /// The operation was cancelled, typically by the caller.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// The client specified an invalid argument.
    InvalidArgument = 3,
    /// The deadline expired before the operation could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// The entity that a client attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission to execute the operation.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation's execution.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// The operation was attempted past the valid range.
    OutOfRange = 11,
    /// The operation is not implemented or not supported.
    Unimplemented = 12,
    /// An invariant expected by the underlying system has been broken.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request does not have valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// Maps a wire code to a [`Code`]. Codes outside the known range map to [`Code::Unknown`].
    pub fn from_i32(code: i32) -> Code {
        match code {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    /// The wire value of this code.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The terminal result of a call: a code, a message, and optional binary details.
///
/// Exactly one `Status` is delivered per call.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    code: Code,
    wire_code: i32,
    message: String,
    details: Bytes,
}

impl Status {
    /// Returns a status with the given code and message and no details.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self::with_details(code, message, Bytes::new())
    }

    /// Returns a status carrying binary error details.
    pub fn with_details(code: Code, message: impl Into<String>, details: impl Into<Bytes>) -> Self {
        Status {
            code,
            wire_code: code.as_i32(),
            message: message.into(),
            details: details.into(),
        }
    }

    /// Returns a status for a raw wire code, which is kept even when it names no [`Code`].
    pub fn from_wire(code: i32, message: impl Into<String>, details: impl Into<Bytes>) -> Self {
        Status {
            wire_code: code,
            ..Self::with_details(Code::from_i32(code), message, details)
        }
    }

    /// The successful status.
    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    /// The status every cancelled call terminates with.
    pub fn cancelled() -> Self {
        Self::new(Code::Cancelled, "")
    }

    /// Returns an `UNIMPLEMENTED` status.
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    /// Returns an `INTERNAL` status.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// Returns a `FAILED_PRECONDITION` status.
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    /// Returns an `UNAUTHENTICATED` status.
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    /// The status code; [`Code::Unknown`] for wire codes outside the known range.
    pub fn code(&self) -> Code {
        self.code
    }

    /// The status code as sent on the wire.
    pub fn wire_code(&self) -> i32 {
        self.wire_code
    }

    /// The status message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Binary error details; empty when none were attached.
    pub fn details(&self) -> &Bytes {
        &self.details
    }

    /// True iff the code is [`Code::Ok`].
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn unknown_wire_codes_map_to_unknown() {
        assert_eq!(Code::from_i32(5), Code::NotFound);
        assert_eq!(Code::from_i32(16), Code::Unauthenticated);
        assert_eq!(Code::from_i32(17), Code::Unknown);
        assert_eq!(Code::from_i32(-1), Code::Unknown);
    }

    #[test]
    fn status_display_includes_code_and_message() {
        let status = Status::new(Code::NotFound, "nope");
        assert_eq!(status.to_string(), "NotFound: nope");
        assert_matches!(status.details().len(), 0);
    }

    #[test]
    fn wire_codes_outside_the_known_range_are_kept() {
        let status = Status::from_wire(42, "custom", Bytes::new());
        assert_eq!(status.code(), Code::Unknown);
        assert_eq!(status.wire_code(), 42);
        assert_ne!(status, Status::new(Code::Unknown, "custom"));
        assert_eq!(Status::from_wire(5, "x", Bytes::new()), Status::new(Code::NotFound, "x"));
    }

    #[test]
    fn details_are_preserved() {
        let status = Status::with_details(Code::Aborted, "x", &b"\x01\x02"[..]);
        assert_eq!(status.details().as_ref(), b"\x01\x02");
        assert!(!status.is_ok());
        assert!(Status::ok().is_ok());
    }
}
