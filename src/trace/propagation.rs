// Licensed to the Apache Software Foundation (ASF) under one or more
// contributor license agreements.  See the NOTICE file distributed with
// this work for additional information regarding copyright ownership.
// The ASF licenses this file to You under the Apache License, Version 2.0
// (the "License"); you may not use this file except in compliance with
// the License.  You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! W3C trace-context handling.

use http::HeaderMap;
use uuid::Uuid;

/// Header carrying the W3C trace context.
pub static TRACEPARENT_HEADER_KEY: &str = "traceparent";

/// Header carrying vendor specific trace state.
pub static TRACESTATE_HEADER_KEY: &str = "tracestate";

/// `tracestate` key proxies stamp on every call they forward. A call arriving
/// with it is downstream of a proxied call, so not the entry of its trace.
pub static PROXY_STATE_KEY: &str = "fit";

/// Decoded `traceparent` header, `version-traceid-spanid-flags`.
///
/// Every field is empty when the header is missing or malformed: a call
/// without tracing is still proxied, it just can't be correlated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceParent {
    /// Format version.
    pub version: String,
    /// Id shared by every span of the trace.
    pub trace_id: String,
    /// Span of the caller.
    pub parent_span_id: String,
    /// Trace flags, i.e. sampling.
    pub flags: String,
}

impl TraceParent {
    /// Decode a header value. Never fails.
    pub fn decode(header_value: &str) -> Self {
        let pieces: Vec<&str> = header_value.split('-').collect();

        if pieces.len() < 4 {
            return Self::default();
        }

        Self {
            version: pieces[0].to_owned(),
            trace_id: pieces[1].to_owned(),
            parent_span_id: pieces[2].to_owned(),
            flags: pieces[3].to_owned(),
        }
    }

    /// Decode from request headers, a value that isn't visible ASCII counts
    /// as missing.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(TRACEPARENT_HEADER_KEY)
            .and_then(|value| value.to_str().ok())
            .map(Self::decode)
            .unwrap_or_default()
    }

    /// Whether the call carries no usable trace id.
    #[inline]
    pub fn is_untraced(&self) -> bool {
        self.trace_id.is_empty()
    }

    /// Header value to forward downstream, with `span_id` as the new parent.
    pub fn child_header(&self, span_id: &str) -> Option<String> {
        if self.is_untraced() {
            return None;
        }
        Some(format!(
            "{}-{}-{}-{}",
            self.version, self.trace_id, span_id, self.flags
        ))
    }
}

/// Decoded `tracestate` header: `key=value` entries, most recent first.
///
/// Malformed entries are skipped, repeated headers are joined in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceStateHeader {
    entries: Vec<(String, String)>,
}

impl TraceStateHeader {
    /// Decode a header value. Never fails.
    pub fn decode(header_value: &str) -> Self {
        let mut state = Self::default();
        state.extend(header_value);
        state
    }

    /// Decode from request headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut state = Self::default();
        for value in headers.get_all(TRACESTATE_HEADER_KEY) {
            if let Ok(value) = value.to_str() {
                state.extend(value);
            }
        }
        state
    }

    fn extend(&mut self, header_value: &str) {
        let entries = header_value
            .split(',')
            .filter_map(|member| member.trim().split_once('='))
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.to_owned(), value.to_owned()));
        self.entries.extend(entries);
    }

    /// Value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.as_str())
    }

    /// Whether there are no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set `key`, moving it to the front as W3C asks of updated entries.
    pub fn with_entry(mut self, key: &str, value: impl Into<String>) -> Self {
        self.entries.retain(|(k, _)| k != key);
        self.entries.insert(0, (key.to_owned(), value.into()));
        self
    }

    /// Header value.
    pub fn encode(&self) -> String {
        self.entries
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Trace id of a request, empty when it has none.
pub fn trace_id(headers: &HeaderMap) -> String {
    TraceParent::from_headers(headers).trace_id
}

/// Fresh 16 hex digit span id.
pub fn generate_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}
