// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Provides the per-call context: deadline, peer, metadata in both directions, auth context and
//! cancellation state. The runtime creates one context per call and lends it to the handler.

use crate::{
    cancellations::CallCancellation,
    metadata::{Metadata, MetadataValue},
    status::Status,
};
use static_assertions::assert_impl_all;
use std::{
    sync::{Mutex, MutexGuard},
    time::{Duration, SystemTime},
};
use tokio_util::sync::WaitForCancellationFuture;

/// Property values describing how the peer authenticated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthContext {
    /// Values of the `transport_security_type` property, e.g. `["insecure"]` or `["ssl"]`.
    pub transport_security_type: Vec<String>,
    /// Name of the property holding the peer identity; empty when the peer is unauthenticated.
    pub peer_identity_property_name: String,
    /// Values of the peer identity property.
    pub peer_identity: Vec<String>,
}

impl AuthContext {
    /// An unauthenticated peer on an insecure transport.
    pub fn insecure() -> Self {
        AuthContext {
            transport_security_type: vec!["insecure".into()],
            ..Default::default()
        }
    }

    /// A peer authenticated by `property_name` with the given identities.
    pub fn authenticated(
        transport_security_type: impl Into<String>,
        property_name: impl Into<String>,
        identities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        AuthContext {
            transport_security_type: vec![transport_security_type.into()],
            peer_identity_property_name: property_name.into(),
            peer_identity: identities.into_iter().map(Into::into).collect(),
        }
    }

    /// True iff the peer identity property is set.
    pub fn is_peer_authenticated(&self) -> bool {
        !self.peer_identity_property_name.is_empty()
    }
}

/// Errors produced by a [`CallContext`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// Initial metadata cannot change once it has been sent.
    #[error("initial metadata was already sent")]
    InitialMetadataSent,
    /// Trailing metadata cannot change once the status has been sent.
    #[error("trailing metadata was already sent with the status")]
    TrailingMetadataSent,
}

impl From<ContextError> for Status {
    fn from(e: ContextError) -> Self {
        Status::internal(e.to_string())
    }
}

#[derive(Debug, Default)]
struct Outgoing {
    initial: Metadata,
    initial_sent: bool,
    trailing: Metadata,
    status_sent: bool,
}

/// A call context that carries call-scoped information like the deadline, client metadata and
/// cancellation state.
///
/// The context should not be stored in a service implementation, because it is different for
/// each call.
#[derive(Debug)]
pub struct CallContext {
    deadline: Option<SystemTime>,
    peer: String,
    client_metadata: Metadata,
    auth_context: AuthContext,
    cancellation: CallCancellation,
    outgoing: Mutex<Outgoing>,
    /// Set when the handler is ready for the client to cancel.
    signal_client: Mutex<bool>,
}

assert_impl_all!(CallContext: Send, Sync);

impl CallContext {
    /// Returns a builder for a context with no deadline, an empty peer and no metadata.
    pub fn builder() -> CallContextBuilder {
        CallContextBuilder::default()
    }

    /// When the client expects the call to be complete by; `None` means no deadline.
    pub fn deadline(&self) -> Option<SystemTime> {
        self.deadline
    }

    /// The address of the peer.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// The metadata sent by the client.
    pub fn client_metadata(&self) -> &Metadata {
        &self.client_metadata
    }

    /// How the peer authenticated.
    pub fn auth_context(&self) -> &AuthContext {
        &self.auth_context
    }

    /// True once the call has been cancelled by either side.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Requests cancellation of the call. Idempotent; the runtime reacts asynchronously.
    pub fn try_cancel(&self) {
        self.cancellation.cancel();
    }

    /// Completes when the call is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }

    /// Blocks the current thread until the call is cancelled.
    pub fn wait_cancelled(&self) {
        self.cancellation.wait()
    }

    /// Blocks the current thread until the call is cancelled, re-checking every `interval`.
    pub fn poll_until_cancelled(&self, interval: Duration) {
        while !self.is_cancelled() {
            std::thread::sleep(interval);
        }
    }

    /// Adds a key-value pair to the initial metadata.
    pub fn add_initial_metadata(
        &self,
        key: impl AsRef<str>,
        value: impl Into<MetadataValue>,
    ) -> Result<(), ContextError> {
        let mut outgoing = self.outgoing();
        if outgoing.initial_sent {
            return Err(ContextError::InitialMetadataSent);
        }
        outgoing.initial.insert(key, value);
        Ok(())
    }

    /// Adds a key-value pair to the trailing metadata.
    pub fn add_trailing_metadata(
        &self,
        key: impl AsRef<str>,
        value: impl Into<MetadataValue>,
    ) -> Result<(), ContextError> {
        let mut outgoing = self.outgoing();
        if outgoing.status_sent {
            return Err(ContextError::TrailingMetadataSent);
        }
        outgoing.trailing.insert(key, value);
        Ok(())
    }

    /// A snapshot of the initial metadata added so far.
    pub fn initial_metadata(&self) -> Metadata {
        self.outgoing().initial.clone()
    }

    /// A snapshot of the trailing metadata added so far.
    pub fn trailing_metadata(&self) -> Metadata {
        self.outgoing().trailing.clone()
    }

    /// Freezes the initial metadata. Returns false if it was already frozen.
    pub(crate) fn mark_initial_metadata_sent(&self) -> bool {
        !std::mem::replace(&mut self.outgoing().initial_sent, true)
    }

    /// Freezes all outgoing metadata when the status goes out.
    pub(crate) fn mark_status_sent(&self) {
        let mut outgoing = self.outgoing();
        outgoing.initial_sent = true;
        outgoing.status_sent = true;
    }

    /// Tells the client it may now cancel the call.
    pub fn signal_client(&self) {
        *lock(&self.signal_client) = true;
    }

    /// True once the handler has told the client it may cancel.
    pub fn client_signalled(&self) -> bool {
        *lock(&self.signal_client)
    }

    fn outgoing(&self) -> MutexGuard<'_, Outgoing> {
        lock(&self.outgoing)
    }
}

/// Locks `mutex`, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Builds a [`CallContext`].
#[derive(Debug, Default)]
pub struct CallContextBuilder {
    deadline: Option<SystemTime>,
    peer: String,
    client_metadata: Metadata,
    auth_context: Option<AuthContext>,
}

impl CallContextBuilder {
    /// Sets an absolute deadline.
    pub fn deadline(mut self, deadline: SystemTime) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets a deadline `timeout` from now.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(SystemTime::now() + timeout)
    }

    /// Sets the peer address.
    pub fn peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    /// Adds a client metadata entry.
    pub fn metadata(mut self, key: impl AsRef<str>, value: impl Into<MetadataValue>) -> Self {
        self.client_metadata.insert(key, value);
        self
    }

    /// Replaces all client metadata.
    pub fn client_metadata(mut self, metadata: Metadata) -> Self {
        self.client_metadata = metadata;
        self
    }

    /// Sets the auth context. Defaults to [`AuthContext::insecure`].
    pub fn auth_context(mut self, auth_context: AuthContext) -> Self {
        self.auth_context = Some(auth_context);
        self
    }

    /// Builds the context.
    pub fn build(self) -> CallContext {
        CallContext {
            deadline: self.deadline,
            peer: self.peer,
            client_metadata: self.client_metadata,
            auth_context: self.auth_context.unwrap_or_else(AuthContext::insecure),
            cancellation: CallCancellation::new(),
            outgoing: Mutex::default(),
            signal_client: Mutex::default(),
        }
    }
}
