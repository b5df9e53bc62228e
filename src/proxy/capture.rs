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

//! Capturing what a call answered.

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// How [ResponseData::body] is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    /// Body was valid utf-8 and is carried as is.
    #[default]
    Utf8,
    /// Body was binary and is carried base64 encoded.
    Base64,
}

/// Reported outcome of a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    /// Status answered, `None` when there was no answer.
    pub status: Option<u16>,
    /// Body, empty when hashed or when there was no answer.
    pub body: String,
    /// Encoding of `body`.
    #[serde(default)]
    pub body_encoding: BodyEncoding,
    /// Hex xxHash64 of the body, when hashing was asked for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_hash: Option<String>,
    /// Whether the answer was received completely.
    pub complete: bool,
    /// Time from the decision to the captured answer.
    pub duration_ms: f64,
    /// Part of `duration_ms` spent by fault injection itself.
    pub overhead_duration_ms: f64,
}

impl ResponseData {
    /// Whether the call failed, i.e. had no answer or a non 2xx one.
    pub fn is_erroneous(&self) -> bool {
        !matches!(self.status, Some(200..=299))
    }
}

/// Collects the answer of a call, forwarded or injected.
#[derive(Debug, Default)]
pub struct ResponseCapture {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    complete: bool,
}

impl ResponseCapture {
    /// New capture, nothing answered yet.
    #[inline]
    pub fn new() -> Self {
        Default::default()
    }

    /// Record status and headers.
    pub fn write_head(&mut self, status: StatusCode, headers: HeaderMap) {
        self.status = Some(status);
        self.headers = headers;
    }

    /// Append a body chunk.
    pub fn write_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    /// Mark the answer as fully received.
    pub fn finish(&mut self) {
        self.complete = true;
    }

    /// Record a whole response at once.
    pub fn record(&mut self, response: &http::Response<Bytes>) {
        self.write_head(response.status(), response.headers().clone());
        self.write_body(response.body());
        self.finish();
    }

    /// Status answered so far.
    #[inline]
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Headers answered so far.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Body received so far.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the answer was fully received.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Reportable view of the capture. Durations are left zero for the caller
    /// to fill in.
    ///
    /// An incomplete capture reports no status and no body, whatever part of
    /// the answer did arrive.
    pub fn response_data(&self, hash_body: bool) -> ResponseData {
        if !self.complete {
            return ResponseData::default();
        }

        let mut data = ResponseData {
            status: self.status.map(|status| status.as_u16()),
            complete: true,
            ..Default::default()
        };

        if hash_body {
            data.body_hash = Some(hash(&self.body));
            return data;
        }

        match std::str::from_utf8(&self.body) {
            Ok(body) => data.body = body.to_owned(),
            Err(_) => {
                data.body = STANDARD.encode(&self.body);
                data.body_encoding = BodyEncoding::Base64;
            }
        }
        data
    }
}

fn hash(body: &[u8]) -> String {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(body);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_capture_is_no_response() {
        let mut capture = ResponseCapture::new();
        capture.write_head(StatusCode::OK, HeaderMap::new());
        capture.write_body(b"partial");

        let data = capture.response_data(false);
        assert_eq!(data.status, None);
        assert!(data.body.is_empty());
        assert!(!data.complete);
        assert!(data.is_erroneous());
    }

    #[test]
    fn hashed_body() {
        let mut capture = ResponseCapture::new();
        capture.record(&http::Response::new(Bytes::from_static(b"OK\n")));

        let data = capture.response_data(true);
        assert_eq!(data.status, Some(200));
        assert!(data.body.is_empty());
        assert_eq!(data.body_hash.as_deref().map(str::len), Some(16));
        assert_eq!(data.body_hash, capture.response_data(true).body_hash);
        assert!(!data.is_erroneous());
    }

    #[test]
    fn binary_body_is_base64() {
        let mut capture = ResponseCapture::new();
        capture.record(&http::Response::new(Bytes::from_static(&[0xff, 0x00])));

        let data = capture.response_data(false);
        assert_eq!(data.body_encoding, BodyEncoding::Base64);
        assert_eq!(data.body, "/wA=");
    }
}
