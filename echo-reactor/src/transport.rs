// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Provides the blocking stream primitives handlers read and write messages with, as well as an
//! in-memory implementation.
//!
//! The handlers are transport-agnostic. Any stream that impls [`ServerReader`] and
//! [`ServerWriter`] can be plugged in.

use std::sync::atomic::{AtomicUsize, Ordering};

pub mod channel;

/// Options for a single write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// The write may be buffered rather than sent immediately.
    pub buffer_hint: bool,
}

/// Reads client messages. Blocks until a message arrives.
pub trait ServerReader<T> {
    /// Returns the next message, or `None` once the client half-closed or the call was
    /// cancelled.
    fn read(&mut self) -> Option<T>;
}

/// Writes server messages.
pub trait ServerWriter<T> {
    /// Writes one message. Returns false if the stream is broken or the call was cancelled.
    fn write(&mut self, msg: T) -> bool;

    /// Writes the final message and half-closes the stream in one operation.
    fn write_last(&mut self, msg: T, options: WriteOptions) -> bool;
}

/// Counts the stream operations that completed on a call.
#[derive(Debug, Default)]
pub struct StreamCounters {
    reads: AtomicUsize,
    writes: AtomicUsize,
    last_writes: AtomicUsize,
}

/// A snapshot of [`StreamCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Messages read by the server.
    pub reads: usize,
    /// Messages written by the server, including coalesced last writes.
    pub writes: usize,
    /// Writes that half-closed the stream.
    pub last_writes: usize,
}

impl StreamCounters {
    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, last: bool) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if last {
            self.last_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the current counts.
    pub fn snapshot(&self) -> StreamStats {
        StreamStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            last_writes: self.last_writes.load(Ordering::Relaxed),
        }
    }
}
