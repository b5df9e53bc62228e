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

use crate::{
    faultload::{uid::FaultUid, Fault},
    proxy::capture::ResponseData,
    trace::identity::Protocol,
};
use serde::{Deserialize, Serialize};

/// What happened to one call, as handed to the collector.
///
/// A collector joins the reports of every proxy in a trace on `trace_id`
/// and rebuilds the call tree from `parent_span_id`/`span_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceReport {
    /// Trace of the call, empty for untraced calls.
    pub trace_id: String,
    /// Span of the caller.
    pub parent_span_id: String,
    /// Span of the call, as forwarded downstream.
    pub span_id: String,
    /// Identity of the call.
    pub uid: FaultUid,
    /// Whether this is the first call of the trace seen by this proxy.
    pub is_initial: bool,
    /// Wire protocol.
    pub protocol: Protocol,
    /// Fault injected instead of or around forwarding.
    pub injected_fault: Option<Fault>,
    /// Captured answer.
    pub response: ResponseData,
    /// Faults of the same trace whose execution overlapped with this call.
    pub concurrent_to: Vec<FaultUid>,
}
