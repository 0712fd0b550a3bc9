// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Call cancellation: the monotonic cancel signal a context carries, and the triggers a handler
//! uses to cancel its own call.

use crate::context::CallContext;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// The cancellation state of one call. Once cancelled, it stays cancelled.
#[derive(Clone, Debug, Default)]
pub struct CallCancellation(CancellationToken);

impl CallCancellation {
    /// Returns a signal that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the call. Cancelling an already-cancelled call is a no-op.
    pub fn cancel(&self) {
        self.0.cancel();
    }

    /// True once the call has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Completes when the call is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.0.cancelled()
    }

    /// Blocks the current thread until the call is cancelled.
    ///
    /// Must not be called from within an async task.
    pub fn wait(&self) {
        futures::executor::block_on(self.0.cancelled())
    }
}

/// Cancels the call and blocks until the cancellation is observable through the context.
///
/// # Panics
///
/// Panics if the call was already cancelled: a handler only triggers cancellation of a live call.
pub fn server_try_cancel(context: &CallContext) {
    server_try_cancel_nonblocking(context);
    context.wait_cancelled();
}

/// Cancels the call without waiting for the runtime to observe it. Used where the caller must
/// not block, such as inside a reactor callback.
///
/// # Panics
///
/// Panics if the call was already cancelled.
pub fn server_try_cancel_nonblocking(context: &CallContext) {
    assert!(
        !context.is_cancelled(),
        "server tried to cancel a call that was already cancelled"
    );
    context.try_cancel();
    tracing::info!("ServerTryCancel");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::prelude::*;
    use futures_test::task::noop_context;
    use std::{pin::pin, sync::Arc, task::Poll, thread, time::Duration};

    #[test]
    fn cancellation_is_monotonic() {
        let cancellation = CallCancellation::new();
        assert!(!cancellation.is_cancelled());
        cancellation.cancel();
        cancellation.cancel();
        assert!(cancellation.is_cancelled());
    }

    #[test]
    fn wait_returns_once_cancelled_elsewhere() {
        let cancellation = CallCancellation::new();
        let canceller = cancellation.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            canceller.cancel();
        });
        cancellation.wait();
        assert!(cancellation.is_cancelled());
        handle.join().unwrap();
    }

    #[test]
    fn cancelled_future_wakes_on_cancel() {
        let cancellation = CallCancellation::new();
        let mut cancelled = pin!(cancellation.cancelled());
        assert_eq!(cancelled.poll_unpin(&mut noop_context()), Poll::Pending);
        cancellation.cancel();
        assert_eq!(cancelled.poll_unpin(&mut noop_context()), Poll::Ready(()));
    }

    #[test]
    fn blocking_trigger_returns_cancelled() {
        let ctx = Arc::new(CallContext::builder().build());
        server_try_cancel(&ctx);
        assert!(ctx.is_cancelled());
    }

    #[test]
    #[should_panic(expected = "already cancelled")]
    fn triggering_twice_is_fatal() {
        let ctx = CallContext::builder().build();
        server_try_cancel_nonblocking(&ctx);
        server_try_cancel_nonblocking(&ctx);
    }
}
