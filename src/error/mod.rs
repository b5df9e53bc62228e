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

use std::time::Duration;

/// Fit proxy result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Fit proxy error type.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The faultload document sent on the control path could not be decoded.
    #[error("decode faultload failed: {0}")]
    FaultloadDecode(#[from] serde_json::Error),

    /// The downstream transport failed to produce a response.
    #[error("forward call failed: {0}")]
    Forward(Box<dyn std::error::Error + Send + Sync + 'static>),

    /// The forwarding or injection step did not finish in time.
    #[error("call did not complete within {0:?}")]
    Timeout(Duration),

    /// A request tried to leave its state machine out of order.
    #[error("invalid proxy state transition from {from} to {to}")]
    InvalidTransition {
        /// Phase the request was in.
        from: &'static str,
        /// Phase that was requested.
        to: &'static str,
    },

    /// Tokio join failed.
    #[error("tokio join failed: {0}")]
    TokioJoin(#[from] tokio::task::JoinError),

    /// Other uncovered errors.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}
