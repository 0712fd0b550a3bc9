// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! An echo RPC service built to exercise how calls end: cancellation by either side at any point
//! of a call, and the race between completing a call and cancelling it.
//!
//! The service has four call shapes: unary [`Echo`](method::Method::Echo), client-streaming
//! [`RequestStream`](method::Method::RequestStream), server-streaming
//! [`ResponseStream`](method::Method::ResponseStream) and bidirectional
//! [`BidiStream`](method::Method::BidiStream). Each comes in two styles:
//!
//! - Blocking ([`server::EchoService`]): the handler owns a thread for the whole call and blocks
//!   on every read and write.
//! - Reactor ([`reactor::CallbackEchoService`]): the handler is a state machine reacting to
//!   [`reactor::Event`]s delivered from any thread.
//!
//! Clients steer the server through call metadata. `server_try_cancel` makes the server cancel
//! the call itself before, during or after exchanging messages; other keys select the number of
//! streamed responses, coalesced last writes and the use of the cancel callback. No matter how
//! the races play out, every call ends with exactly one status.
//!
//! ## Example
//!
//! ```rust
//! use echo_reactor::{
//!     context::CallContext,
//!     message::{EchoRequest, EchoResponse},
//!     metadata::SERVER_TRY_CANCEL_REQUEST,
//!     server::Config,
//!     status::Code,
//!     transport::channel,
//! };
//! use std::{sync::Arc, thread};
//!
//! let service = Config::default().service();
//! let context = Arc::new(
//!     CallContext::builder()
//!         .metadata(SERVER_TRY_CANCEL_REQUEST, "3")
//!         .build(),
//! );
//! let (mut server, mut client) = channel::call::<EchoRequest, EchoResponse>(context.clone());
//! for message in ["a", "b", "c"] {
//!     client.send(EchoRequest::new(message));
//! }
//! client.writes_done();
//! let status = thread::spawn(move || service.request_stream(&context, &mut server))
//!     .join()
//!     .unwrap()
//!     .unwrap_err();
//! assert_eq!(status.code(), Code::Cancelled);
//! assert_eq!(client.stats().reads, 3);
//! ```

#![deny(missing_docs)]
#![allow(clippy::type_complexity)]

pub mod cancellations;
pub mod context;
pub mod echo;
pub mod message;
pub mod metadata;
pub mod method;
pub mod reactor;
pub mod server;
pub mod status;
pub mod transport;

pub use crate::{
    context::CallContext,
    method::Method,
    reactor::CallbackEchoService,
    server::{Config, EchoService},
    status::{Code, Status},
};
