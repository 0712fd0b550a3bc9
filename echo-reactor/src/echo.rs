// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Helpers that derive response fields from the call context, shared by both handler styles.

use crate::{
    context::CallContext,
    message::{EchoRequest, EchoResponse, RequestParams},
    metadata::{
        CHECK_CLIENT_INITIAL_METADATA_KEY, CHECK_CLIENT_INITIAL_METADATA_VAL,
        DEBUG_INFO_TRAILER_KEY,
    },
    status::Status,
};
use std::time::{SystemTime, UNIX_EPOCH};

/// Deadline seconds reported when the call has no deadline.
pub const INFINITE_DEADLINE_SECS: i64 = i64::MAX;

/// Sets the response's `request_deadline` to the call deadline in seconds, when requested.
pub fn maybe_echo_deadline(context: &CallContext, request: &EchoRequest, response: &mut EchoResponse) {
    if request.param.as_ref().is_some_and(|p| p.echo_deadline) {
        response.param_mut().request_deadline = deadline_secs(context.deadline());
    }
}

fn deadline_secs(deadline: Option<SystemTime>) -> i64 {
    let Some(deadline) = deadline else {
        return INFINITE_DEADLINE_SECS;
    };
    match deadline.duration_since(UNIX_EPOCH) {
        Ok(since) => i64::try_from(since.as_secs()).unwrap_or(INFINITE_DEADLINE_SECS),
        Err(before) => -i64::try_from(before.duration().as_secs()).unwrap_or(i64::MAX),
    }
}

/// Sets the response's `peer` to the peer address, when requested.
pub fn maybe_echo_peer(context: &CallContext, request: &EchoRequest, response: &mut EchoResponse) {
    if request.param.as_ref().is_some_and(|p| p.echo_peer) {
        response.param_mut().peer = context.peer().to_owned();
    }
}

/// Sets the response's `host` when the service is configured with one.
pub fn maybe_set_host(host: Option<&str>, response: &mut EchoResponse) {
    if let Some(host) = host {
        response.param_mut().host = host.to_owned();
    }
}

/// Replaces the message with `response_message_length` NUL characters, when requested.
pub fn maybe_override_length(request: &EchoRequest, response: &mut EchoResponse) {
    if let Some(len) = request
        .param
        .as_ref()
        .map(|p| p.response_message_length)
        .filter(|len| *len > 0)
    {
        response.message = "\0".repeat(len);
    }
}

/// Checks the peer's auth context against what the client expects.
///
/// The transport security type must have exactly one value equal to
/// `expected_transport_security_type`. With an empty `expected_client_identity` the peer must be
/// unauthenticated with no identity; otherwise it must be authenticated with exactly that one
/// identity.
pub fn check_server_auth_context(
    context: &CallContext,
    expected_transport_security_type: &str,
    expected_client_identity: &str,
) -> Result<(), Status> {
    let auth = context.auth_context();
    if auth.transport_security_type != [expected_transport_security_type] {
        return Err(Status::unauthenticated(format!(
            "transport security type {:?}, expected [{expected_transport_security_type:?}]",
            auth.transport_security_type
        )));
    }
    if expected_client_identity.is_empty() {
        if !auth.peer_identity_property_name.is_empty()
            || !auth.peer_identity.is_empty()
            || auth.is_peer_authenticated()
        {
            return Err(Status::unauthenticated(
                "expected an unauthenticated peer with no identity",
            ));
        }
    } else if !auth.is_peer_authenticated() || auth.peer_identity != [expected_client_identity] {
        return Err(Status::unauthenticated(format!(
            "peer identity {:?}, expected [{expected_client_identity:?}]",
            auth.peer_identity
        )));
    }
    Ok(())
}

/// Copies every client metadata entry into the initial metadata. Returns true if it did.
pub(crate) fn maybe_echo_metadata_initially(
    context: &CallContext,
    param: &RequestParams,
) -> Result<bool, Status> {
    if !param.echo_metadata_initially {
        return Ok(false);
    }
    for (key, value) in context.client_metadata().iter() {
        context.add_initial_metadata(key, value.clone())?;
    }
    Ok(true)
}

/// Copies every client metadata entry into the trailing metadata.
///
/// When the request carries debug info, it is serialized into the debug-info trailer and the
/// call must terminate CANCELLED; that is reported as `Err(Status::cancelled())`.
pub(crate) fn maybe_echo_metadata(context: &CallContext, param: &RequestParams) -> Result<(), Status> {
    if !param.echo_metadata {
        return Ok(());
    }
    for (key, value) in context.client_metadata().iter() {
        context.add_trailing_metadata(key, value.clone())?;
    }
    if !param.debug_info.is_empty() {
        let serialized = param
            .debug_info
            .to_bytes()
            .map_err(|e| Status::internal(format!("could not serialize debug info: {e}")))?;
        context.add_trailing_metadata(DEBUG_INFO_TRAILER_KEY, serialized)?;
        return Err(Status::cancelled());
    }
    Ok(())
}

/// Runs the echo steps that follow the cancellation checks: metadata echo, auth context check,
/// length override and peer echo.
///
/// `send_initial_metadata` is invoked after initial metadata was echoed, for runtimes that send
/// it eagerly.
pub(crate) fn finish_echo(
    context: &CallContext,
    request: &EchoRequest,
    response: &mut EchoResponse,
    send_initial_metadata: impl FnOnce(),
) -> Result<(), Status> {
    if let Some(param) = &request.param {
        if maybe_echo_metadata_initially(context, param)? {
            send_initial_metadata();
        }
        maybe_echo_metadata(context, param)?;
        if param.checks_auth_context() {
            check_server_auth_context(
                context,
                &param.expected_transport_security_type,
                &param.expected_client_identity,
            )?;
        }
    }
    maybe_override_length(request, response);
    maybe_echo_peer(context, request, response);
    Ok(())
}

/// Checks that the client sent the custom metadata pair exactly once.
pub fn check_client_initial_metadata(context: &CallContext) -> Result<(), Status> {
    let metadata = context.client_metadata();
    let matches = metadata.match_count(
        CHECK_CLIENT_INITIAL_METADATA_KEY,
        CHECK_CLIENT_INITIAL_METADATA_VAL,
    );
    let count = metadata.count(CHECK_CLIENT_INITIAL_METADATA_KEY);
    if matches != 1 || count != 1 {
        return Err(Status::failed_precondition(format!(
            "{CHECK_CLIENT_INITIAL_METADATA_KEY}: {matches} matching of {count} entries"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::AuthContext, message::DebugInfo, metadata::MetadataValue, status::Code};
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn echo_param(param: RequestParams) -> EchoRequest {
        EchoRequest::new("hello").with_param(param)
    }

    #[test]
    fn deadline_echo_reports_seconds_or_infinity() {
        let request = echo_param(RequestParams {
            echo_deadline: true,
            ..Default::default()
        });
        let mut response = EchoResponse::new("hello");
        maybe_echo_deadline(&CallContext::builder().build(), &request, &mut response);
        assert_eq!(response.param.as_ref().unwrap().request_deadline, i64::MAX);

        let deadline = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let ctx = CallContext::builder().deadline(deadline).build();
        maybe_echo_deadline(&ctx, &request, &mut response);
        assert_eq!(response.param.unwrap().request_deadline, 1_700_000_000);
    }

    #[test]
    fn no_param_means_no_response_param() {
        let ctx = CallContext::builder().peer("peer").build();
        let request = EchoRequest::new("hello");
        let mut response = EchoResponse::new("hello");
        maybe_echo_deadline(&ctx, &request, &mut response);
        maybe_echo_peer(&ctx, &request, &mut response);
        maybe_override_length(&request, &mut response);
        assert_eq!(response, EchoResponse::new("hello"));
    }

    #[test]
    fn length_override_uses_nul_characters() {
        let request = echo_param(RequestParams {
            response_message_length: 4,
            ..Default::default()
        });
        let mut response = EchoResponse::new("hello");
        maybe_override_length(&request, &mut response);
        assert_eq!(response.message, "\0\0\0\0");
    }

    #[test]
    fn insecure_peer_passes_unauthenticated_check() {
        let ctx = CallContext::builder().build();
        assert_matches!(check_server_auth_context(&ctx, "insecure", ""), Ok(()));
        assert_matches!(
            check_server_auth_context(&ctx, "ssl", ""),
            Err(s) if s.code() == Code::Unauthenticated
        );
        assert_matches!(check_server_auth_context(&ctx, "insecure", "alice"), Err(_));
    }

    #[test]
    fn authenticated_peer_requires_single_matching_identity() {
        let ctx = CallContext::builder()
            .auth_context(AuthContext::authenticated("ssl", "x509_common_name", ["alice"]))
            .build();
        assert_matches!(check_server_auth_context(&ctx, "ssl", "alice"), Ok(()));
        assert_matches!(check_server_auth_context(&ctx, "ssl", "bob"), Err(_));
        assert_matches!(check_server_auth_context(&ctx, "ssl", ""), Err(_));

        let ctx = CallContext::builder()
            .auth_context(AuthContext::authenticated(
                "ssl",
                "x509_subject_alternative_name",
                ["alice", "alice"],
            ))
            .build();
        assert_matches!(check_server_auth_context(&ctx, "ssl", "alice"), Err(_));
    }

    #[test]
    fn debug_info_lands_in_trailer_and_cancels() {
        let ctx = CallContext::builder().metadata("k", "v").build();
        let param = RequestParams {
            echo_metadata: true,
            debug_info: DebugInfo {
                stack_entries: vec![],
                detail: "details".into(),
            },
            ..Default::default()
        };
        assert_matches!(maybe_echo_metadata(&ctx, &param), Err(s) if s.code() == Code::Cancelled);
        let trailers = ctx.trailing_metadata();
        assert_eq!(trailers.get("k"), Some(&MetadataValue::from("v")));
        let blob = trailers.get(DEBUG_INFO_TRAILER_KEY).unwrap().as_bytes();
        assert_eq!(DebugInfo::from_bytes(blob).unwrap().detail, "details");
    }

    #[test]
    fn initial_metadata_check_requires_exactly_one_pair() {
        let ctx = CallContext::builder()
            .metadata(CHECK_CLIENT_INITIAL_METADATA_KEY, CHECK_CLIENT_INITIAL_METADATA_VAL)
            .build();
        assert_matches!(check_client_initial_metadata(&ctx), Ok(()));

        let ctx = CallContext::builder()
            .metadata(CHECK_CLIENT_INITIAL_METADATA_KEY, CHECK_CLIENT_INITIAL_METADATA_VAL)
            .metadata(CHECK_CLIENT_INITIAL_METADATA_KEY, "other")
            .build();
        assert_matches!(
            check_client_initial_metadata(&ctx),
            Err(s) if s.code() == Code::FailedPrecondition
        );
        assert_matches!(
            check_client_initial_metadata(&CallContext::builder().build()),
            Err(_)
        );
    }
}
