use assert_matches::assert_matches;
use echo_reactor::{
    context::{AuthContext, CallContext},
    message::{DebugInfo, EchoRequest, EchoResponse, ErrorStatus, RequestParams, SimpleRequest},
    metadata::{
        CHECK_CLIENT_INITIAL_METADATA_KEY, CHECK_CLIENT_INITIAL_METADATA_VAL,
        DEBUG_INFO_TRAILER_KEY, SERVER_FINISH_AFTER_N_READS, SERVER_RESPONSE_STREAMS_TO_SEND,
        SERVER_TRY_CANCEL_REQUEST, SERVER_USE_COALESCING_API,
    },
    server::{Config, EchoService},
    status::Code,
    transport::{
        channel::{self, ClientStream, ServerStream},
        StreamStats,
    },
};
use std::{sync::Arc, thread, time::Duration};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn context_with(metadata: &[(&str, &str)]) -> Arc<CallContext> {
    let mut builder = CallContext::builder().peer("ipv4:127.0.0.1:5000");
    for (key, value) in metadata {
        builder = builder.metadata(key, *value);
    }
    Arc::new(builder.build())
}

fn streams(
    context: &Arc<CallContext>,
) -> (
    ServerStream<EchoRequest, EchoResponse>,
    ClientStream<EchoRequest, EchoResponse>,
) {
    channel::call(context.clone())
}

fn messages(responses: Vec<EchoResponse>) -> Vec<String> {
    responses.into_iter().map(|r| r.message).collect()
}

#[test]
fn expected_error_overrides_echo() {
    init_tracing();
    let service = EchoService::default();
    let request = EchoRequest::new("hi").with_param(RequestParams {
        expected_error: Some(ErrorStatus {
            code: 5,
            error_message: "nope".into(),
            ..Default::default()
        }),
        echo_metadata: true,
        ..Default::default()
    });
    let status = service.echo(&context_with(&[]), &request).unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(status.message(), "nope");
}

#[test]
fn echo_applies_params() {
    init_tracing();
    let service = Config {
        host: Some("localhost".into()),
        ..Default::default()
    }
    .service();
    let context = context_with(&[("k", "v")]);
    let request = EchoRequest::new("hi").with_param(RequestParams {
        echo_peer: true,
        echo_metadata_initially: true,
        echo_metadata: true,
        response_message_length: 4,
        ..Default::default()
    });
    let response = service.echo(&context, &request).unwrap();
    assert_eq!(response.message, "\0\0\0\0");
    let param = response.param.unwrap();
    assert_eq!(param.host, "localhost");
    assert_eq!(param.peer, "ipv4:127.0.0.1:5000");
    let initial = context.initial_metadata();
    assert_eq!(initial.get("k").and_then(|v| v.as_str()), Some("v"));
    let trailing = context.trailing_metadata();
    assert_eq!(trailing.get("k").and_then(|v| v.as_str()), Some("v"));
}

#[test]
fn echo_debug_info_terminates_cancelled() {
    let service = EchoService::default();
    let context = context_with(&[]);
    let debug_info = DebugInfo {
        stack_entries: vec!["frame".into()],
        detail: "boom".into(),
    };
    let request = EchoRequest::new("hi").with_param(RequestParams {
        echo_metadata: true,
        debug_info: debug_info.clone(),
        ..Default::default()
    });
    let status = service.echo(&context, &request).unwrap_err();
    assert_eq!(status.code(), Code::Cancelled);
    let trailer = context.trailing_metadata();
    let serialized = trailer.get(DEBUG_INFO_TRAILER_KEY).unwrap();
    assert_eq!(DebugInfo::from_bytes(serialized.as_bytes()).unwrap(), debug_info);
}

#[test]
fn echo_with_try_cancel_is_cancelled() {
    let service = EchoService::default();
    for policy in ["1", "2", "3"] {
        let context = context_with(&[(SERVER_TRY_CANCEL_REQUEST, policy)]);
        let status = service.echo(&context, &EchoRequest::new("hi")).unwrap_err();
        assert_eq!(status.code(), Code::Cancelled);
        assert!(context.is_cancelled());
    }
}

#[test]
fn echo_waits_for_client_cancel() {
    init_tracing();
    let service = EchoService::default();
    let context = context_with(&[]);
    let request = EchoRequest::new("hi").with_param(RequestParams {
        client_cancel_after_us: 1000,
        ..Default::default()
    });
    let handler = {
        let context = context.clone();
        thread::spawn(move || service.echo(&context, &request))
    };
    while !context.client_signalled() {
        thread::sleep(Duration::from_millis(1));
    }
    context.try_cancel();
    assert_matches!(handler.join().unwrap(), Err(s) if s.code() == Code::Cancelled);
}

#[test]
fn echo_of_cancelled_call_respects_skip_check() {
    let service = EchoService::default();
    let context = context_with(&[]);
    context.try_cancel();
    assert_matches!(
        service.echo(&context, &EchoRequest::new("hi")),
        Err(s) if s.code() == Code::Cancelled
    );
    let skip = EchoRequest::new("hi").with_param(RequestParams {
        skip_cancelled_check: true,
        ..Default::default()
    });
    assert_matches!(service.echo(&context, &skip), Ok(r) if r.message == "hi");
}

#[test]
fn auth_context_checks() {
    let service = EchoService::default();
    let authenticated = Arc::new(
        CallContext::builder()
            .auth_context(AuthContext::authenticated(
                "ssl",
                "x509_subject_alternative_name",
                ["client"],
            ))
            .build(),
    );
    let expect_client = EchoRequest::new("hi").with_param(RequestParams {
        expected_transport_security_type: "ssl".into(),
        expected_client_identity: "client".into(),
        ..Default::default()
    });
    assert_matches!(service.echo(&authenticated, &expect_client), Ok(_));

    let expect_anonymous = EchoRequest::new("hi").with_param(RequestParams {
        expected_transport_security_type: "ssl".into(),
        check_auth_context: true,
        ..Default::default()
    });
    assert_matches!(
        service.echo(&authenticated, &expect_anonymous),
        Err(s) if s.code() == Code::Unauthenticated
    );

    let insecure = context_with(&[]);
    let expect_insecure = EchoRequest::new("hi").with_param(RequestParams {
        expected_transport_security_type: "insecure".into(),
        check_auth_context: true,
        ..Default::default()
    });
    assert_matches!(service.echo(&insecure, &expect_insecure), Ok(_));
}

#[test]
fn check_client_initial_metadata() {
    let service = EchoService::default();
    let once = context_with(&[(
        CHECK_CLIENT_INITIAL_METADATA_KEY,
        CHECK_CLIENT_INITIAL_METADATA_VAL,
    )]);
    assert_matches!(
        service.check_client_initial_metadata(&once, &SimpleRequest {}),
        Ok(_)
    );
    let twice = context_with(&[
        (CHECK_CLIENT_INITIAL_METADATA_KEY, CHECK_CLIENT_INITIAL_METADATA_VAL),
        (CHECK_CLIENT_INITIAL_METADATA_KEY, "other"),
    ]);
    assert_matches!(
        service.check_client_initial_metadata(&twice, &SimpleRequest {}),
        Err(s) if s.code() == Code::FailedPrecondition
    );
}

#[test]
fn unimplemented_method() {
    let service = EchoService::default();
    assert_matches!(
        service.unimplemented(&context_with(&[]), &EchoRequest::new("hi")),
        Err(s) if s.code() == Code::Unimplemented
    );
}

#[test]
fn request_stream_concatenates() {
    let service = EchoService::default();
    let context = context_with(&[]);
    let (mut server, mut client) = streams(&context);
    for message in ["a", "b", "c"] {
        assert!(client.send(EchoRequest::new(message)));
    }
    client.writes_done();
    let response = service.request_stream(&context, &mut server).unwrap();
    assert_eq!(response.message, "abc");
    assert_eq!(client.stats().reads, 3);
}

#[test]
fn request_stream_cancelled_before_processing_reads_nothing() {
    let service = EchoService::default();
    let context = context_with(&[(SERVER_TRY_CANCEL_REQUEST, "1")]);
    let (mut server, mut client) = streams(&context);
    client.send(EchoRequest::new("a"));
    client.writes_done();
    assert_matches!(
        service.request_stream(&context, &mut server),
        Err(s) if s.code() == Code::Cancelled
    );
    assert_eq!(client.stats(), StreamStats::default());
}

#[test]
fn request_stream_cancelled_during_processing() {
    init_tracing();
    let service = EchoService::default();
    let context = context_with(&[(SERVER_TRY_CANCEL_REQUEST, "2")]);
    // The client never half-closes; only the cancellation ends the reads.
    let (mut server, client) = streams(&context);
    client.send(EchoRequest::new("a"));
    assert_matches!(
        service.request_stream(&context, &mut server),
        Err(s) if s.code() == Code::Cancelled
    );
    assert!(context.is_cancelled());
}

#[test]
fn request_stream_cancelled_after_processing_reads_everything() {
    let service = EchoService::default();
    let context = context_with(&[(SERVER_TRY_CANCEL_REQUEST, "3")]);
    let (mut server, mut client) = streams(&context);
    for message in ["a", "b"] {
        client.send(EchoRequest::new(message));
    }
    client.writes_done();
    assert_matches!(
        service.request_stream(&context, &mut server),
        Err(s) if s.code() == Code::Cancelled
    );
    assert_eq!(client.stats().reads, 2);
}

#[test]
fn response_stream_sends_indexed_messages() {
    let service = EchoService::default();
    let context = context_with(&[]);
    let (mut server, client) = streams(&context);
    service
        .response_stream(&context, &EchoRequest::new("hi"), &mut server)
        .unwrap();
    drop(server);
    assert_eq!(messages(client.drain()), ["hi0", "hi1", "hi2"]);
}

#[test]
fn response_stream_with_negative_count_sends_nothing() {
    let service = EchoService::default();
    let context = context_with(&[(SERVER_RESPONSE_STREAMS_TO_SEND, "-1")]);
    let (mut server, client) = streams(&context);
    service
        .response_stream(&context, &EchoRequest::new("hi"), &mut server)
        .unwrap();
    drop(server);
    assert!(client.drain().is_empty());
    assert_eq!(client.stats(), StreamStats::default());
}

#[test]
fn response_stream_coalesces_last_write() {
    let service = EchoService::default();
    let context = context_with(&[
        (SERVER_RESPONSE_STREAMS_TO_SEND, "5"),
        (SERVER_USE_COALESCING_API, "1"),
    ]);
    let (mut server, client) = streams(&context);
    service
        .response_stream(&context, &EchoRequest::new("m"), &mut server)
        .unwrap();
    assert_eq!(messages(client.drain()), ["m0", "m1", "m2", "m3", "m4"]);
    assert_eq!(
        client.stats(),
        StreamStats {
            reads: 0,
            writes: 5,
            last_writes: 1,
        }
    );
    // The last write half-closed the stream.
    assert_matches!(client.recv(), None);
}

#[test]
fn response_stream_policies() {
    let service = EchoService::default();

    let before = context_with(&[(SERVER_TRY_CANCEL_REQUEST, "1")]);
    let (mut server, client) = streams(&before);
    assert_matches!(
        service.response_stream(&before, &EchoRequest::new("x"), &mut server),
        Err(s) if s.code() == Code::Cancelled
    );
    assert_eq!(client.stats().writes, 0);

    let after = context_with(&[(SERVER_TRY_CANCEL_REQUEST, "3")]);
    let (mut server, client) = streams(&after);
    assert_matches!(
        service.response_stream(&after, &EchoRequest::new("x"), &mut server),
        Err(s) if s.code() == Code::Cancelled
    );
    assert_eq!(client.stats().writes, 3);

    let during = context_with(&[(SERVER_TRY_CANCEL_REQUEST, "2")]);
    let (mut server, _client) = streams(&during);
    assert_matches!(
        service.response_stream(&during, &EchoRequest::new("x"), &mut server),
        Err(s) if s.code() == Code::Cancelled
    );
}

#[test]
fn bidi_stream_echoes_and_half_closes_at_threshold() {
    init_tracing();
    let service = EchoService::default();
    let context = context_with(&[(SERVER_FINISH_AFTER_N_READS, "2")]);
    let (mut server, mut client) = streams(&context);
    for message in ["a", "b"] {
        client.send(EchoRequest::new(message));
    }
    client.writes_done();
    service.bidi_stream(&context, &mut server).unwrap();
    assert_eq!(messages(client.drain()), ["a", "b"]);
    assert_eq!(
        client.stats(),
        StreamStats {
            reads: 2,
            writes: 2,
            last_writes: 1,
        }
    );
}

#[test]
fn bidi_stream_interleaved_with_client() {
    let service = EchoService::default();
    let context = context_with(&[]);
    let (mut server, mut client) = streams(&context);
    let handler = {
        let context = context.clone();
        thread::spawn(move || service.bidi_stream(&context, &mut server))
    };
    for message in ["x", "y", "z"] {
        client.send(EchoRequest::new(message));
        assert_matches!(client.recv(), Some(r) if r.message == message);
    }
    client.writes_done();
    assert_matches!(handler.join().unwrap(), Ok(()));
}

#[test]
fn bidi_stream_cancelled_after_processing() {
    let service = EchoService::default();
    let context = context_with(&[(SERVER_TRY_CANCEL_REQUEST, "3")]);
    let (mut server, mut client) = streams(&context);
    client.send(EchoRequest::new("a"));
    client.writes_done();
    assert_matches!(
        service.bidi_stream(&context, &mut server),
        Err(s) if s.code() == Code::Cancelled
    );
    assert_eq!(client.stats().reads, 1);
    assert_eq!(client.stats().writes, 1);
}

#[test]
fn bidi_stream_cancelled_before_processing_reads_nothing() {
    let service = EchoService::default();
    let context = context_with(&[(SERVER_TRY_CANCEL_REQUEST, "1")]);
    let (mut server, mut client) = streams(&context);
    client.send(EchoRequest::new("a"));
    client.writes_done();
    assert_matches!(
        service.bidi_stream(&context, &mut server),
        Err(s) if s.code() == Code::Cancelled
    );
    assert_eq!(client.stats(), StreamStats::default());
    assert!(client.drain().is_empty());
}

#[test]
fn bidi_stream_cancelled_during_processing() {
    init_tracing();
    let service = EchoService::default();
    let context = context_with(&[(SERVER_TRY_CANCEL_REQUEST, "2")]);
    // The client never half-closes; only the cancellation ends the reads.
    let (mut server, client) = streams(&context);
    client.send(EchoRequest::new("a"));
    assert_matches!(
        service.bidi_stream(&context, &mut server),
        Err(s) if s.code() == Code::Cancelled
    );
    assert!(context.is_cancelled());
}
