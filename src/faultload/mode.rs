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

use serde::{Deserialize, Serialize};

/// What to do instead of (or before) forwarding a matched call.
///
/// The set of modes is closed; how each one is carried out is up to the
/// [Inject](crate::proxy::collaborator::Inject) implementation in use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FaultMode {
    /// Hold the call for a while, then forward it.
    Delay {
        /// Delay in milliseconds.
        duration_ms: u64,
    },
    /// Answer with an error status without forwarding.
    HttpError {
        /// Status code to answer with.
        status: u16,
    },
    /// Never answer.
    Abort,
    /// Forward, but mangle the response body.
    Corrupt,
    /// Opaque instructions for a custom injector.
    Custom {
        /// Injector specific payload.
        payload: serde_json::Value,
    },
}

impl FaultMode {
    /// Serialized tag of the mode.
    pub fn kind(&self) -> &'static str {
        match self {
            FaultMode::Delay { .. } => "delay",
            FaultMode::HttpError { .. } => "http_error",
            FaultMode::Abort => "abort",
            FaultMode::Corrupt => "corrupt",
            FaultMode::Custom { .. } => "custom",
        }
    }
}
