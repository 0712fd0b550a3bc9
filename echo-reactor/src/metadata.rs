// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Call metadata and the policies that clients select through it.

use bytes::Bytes;
use std::str::FromStr;

/// Selects when the server cancels a call relative to message exchange.
pub const SERVER_TRY_CANCEL_REQUEST: &str = "server_try_cancel";
/// Selects how the reactor unary handler uses the cancel callback.
pub const SERVER_USE_CANCEL_CALLBACK: &str = "server_use_cancel_callback";
/// Nonzero makes the server-streaming handler coalesce its last write with the half-close.
pub const SERVER_USE_COALESCING_API: &str = "server_use_coalescing_api";
/// How many responses the server-streaming handler sends.
pub const SERVER_RESPONSE_STREAMS_TO_SEND: &str = "server_responses_to_send";
/// After how many reads the bidi handler writes its last message and finishes.
pub const SERVER_FINISH_AFTER_N_READS: &str = "server_finish_after_n_reads";
/// Key checked by the initial metadata check handler.
pub const CHECK_CLIENT_INITIAL_METADATA_KEY: &str = "custom_client_metadata";
/// Value checked by the initial metadata check handler.
pub const CHECK_CLIENT_INITIAL_METADATA_VAL: &str = "Value for client metadata";
/// Trailer carrying the serialized debug info of a request.
pub const DEBUG_INFO_TRAILER_KEY: &str = "debug-info-bin";

/// Responses sent by the server-streaming handler when the client does not say otherwise.
pub const DEFAULT_RESPONSE_STREAMS_TO_SEND: usize = 3;

/// A metadata value. Keys ending in `-bin` carry binary values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataValue {
    /// Printable text.
    Ascii(String),
    /// Arbitrary bytes.
    Binary(Bytes),
}

impl MetadataValue {
    /// The value as text, if it is not binary.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    /// The raw bytes of the value.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Ascii(s) => s.as_bytes(),
            MetadataValue::Binary(b) => b,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Ascii(value.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Ascii(value)
    }
}

impl From<Bytes> for MetadataValue {
    fn from(value: Bytes) -> Self {
        MetadataValue::Binary(value)
    }
}

/// An ordered multimap from lowercase keys to values.
///
/// Keys are normalized to lowercase on insertion and lookup, so lookups are case-insensitive.
/// Multiple values may be stored under one key; insertion order is preserved.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    /// Returns empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value under `key`.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<MetadataValue>) {
        self.entries
            .push((key.as_ref().to_ascii_lowercase(), value.into()));
    }

    /// Appends a binary value under `key`.
    pub fn insert_bin(&mut self, key: impl AsRef<str>, value: impl Into<Bytes>) {
        self.insert(key, MetadataValue::Binary(value.into()));
    }

    /// The first value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.get_all(key).next()
    }

    /// Every value stored under `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a MetadataValue> + 'a {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// The number of values stored under `key`.
    pub fn count(&self, key: &str) -> usize {
        self.get_all(key).count()
    }

    /// The number of entries that exactly match the given key-value pair.
    pub fn match_count(&self, key: &str, value: &str) -> usize {
        self.get_all(key)
            .filter(|v| v.as_bytes() == value.as_bytes())
            .count()
    }

    /// Iterates over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True iff there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses the first value under `key` as an integer.
    ///
    /// Returns `default` when the key is absent or its value does not parse; malformed values
    /// are never surfaced as errors.
    pub fn int_value<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + Copy + std::fmt::Debug,
    {
        let Some(value) = self.get(key) else {
            return default;
        };
        let parsed = value
            .as_str()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(default);
        tracing::debug!(key, value = ?parsed, "MetadataPolicy");
        parsed
    }

    /// Parses the first value under `key` as a signed count, clamping negative counts to zero.
    pub fn count_value(&self, key: &str, default: usize) -> usize {
        let count = self.int_value(key, i64::try_from(default).unwrap_or(i64::MAX));
        usize::try_from(count.max(0)).unwrap_or(usize::MAX)
    }

    /// Reads the server try-cancel policy.
    pub fn server_try_cancel(&self) -> ServerTryCancel {
        ServerTryCancel::from_i32(self.int_value(SERVER_TRY_CANCEL_REQUEST, 0))
    }

    /// Reads the cancel callback mode.
    pub fn cancel_callback_mode(&self) -> CancelCallbackMode {
        CancelCallbackMode::from_i32(self.int_value(SERVER_USE_CANCEL_CALLBACK, 0))
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: AsRef<str>,
    V: Into<MetadataValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

/// When, relative to message exchange, the server cancels the call itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerTryCancel {
    /// The server never cancels.
    #[default]
    DoNotCancel,
    /// Cancel before any message is read or written.
    CancelBeforeProcessing,
    /// Cancel concurrently with message exchange.
    CancelDuringProcessing,
    /// Cancel once every message has been exchanged.
    CancelAfterProcessing,
}

impl ServerTryCancel {
    /// Values outside the known range, including negative ones, mean [`DoNotCancel`].
    ///
    /// [`DoNotCancel`]: ServerTryCancel::DoNotCancel
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => ServerTryCancel::CancelBeforeProcessing,
            2 => ServerTryCancel::CancelDuringProcessing,
            3 => ServerTryCancel::CancelAfterProcessing,
            _ => ServerTryCancel::DoNotCancel,
        }
    }

    /// True for every policy except [`DoNotCancel`](ServerTryCancel::DoNotCancel).
    pub fn cancels(self) -> bool {
        self != ServerTryCancel::DoNotCancel
    }
}

/// How the reactor unary handler uses the cancel callback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CancelCallbackMode {
    /// Cancellation is observed by polling the context.
    #[default]
    DoNotUse,
    /// The client cancels before the handler starts.
    MaybeEarlyCancel,
    /// The client cancels while the handler is running.
    MaybeLateCancel,
    /// The callback is installed but no cancellation is expected.
    MaybeNoCancel,
}

impl CancelCallbackMode {
    /// Values outside the known range mean [`DoNotUse`](CancelCallbackMode::DoNotUse).
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => CancelCallbackMode::MaybeEarlyCancel,
            2 => CancelCallbackMode::MaybeLateCancel,
            3 => CancelCallbackMode::MaybeNoCancel,
            _ => CancelCallbackMode::DoNotUse,
        }
    }

    /// True iff the handler installs a cancel callback.
    pub fn uses_callback(self) -> bool {
        self != CancelCallbackMode::DoNotUse
    }

    /// True iff the handler expects the call to be cancelled.
    pub fn expects_cancel(self) -> bool {
        matches!(
            self,
            CancelCallbackMode::MaybeEarlyCancel | CancelCallbackMode::MaybeLateCancel
        )
    }
}
