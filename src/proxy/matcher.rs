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

//! Deciding whether a call gets a fault injected.

use crate::{
    faultload::{uid::FaultUid, Fault, Faultload},
    trace::registry::{InFlightGuard, TraceState},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which fault wins when several declared faults match one call.
///
/// More than one match means the faultload is ambiguous; the policy only
/// keeps behavior predictable while that gets fixed upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// The earliest declared fault.
    #[default]
    FirstDeclared,
    /// The latest declared fault.
    LastDeclared,
}

/// Outcome of [FaultMatcher::decide].
#[derive(Debug, Default)]
pub struct Decision {
    /// Fault to inject, `None` to forward.
    pub injected: Option<Fault>,
    /// Faults of the same trace in flight when the decision was taken.
    pub concurrent: Vec<FaultUid>,
    guard: Option<InFlightGuard>,
}

impl Decision {
    /// Plain forwarding, nothing in flight.
    #[inline]
    pub fn forward() -> Self {
        Default::default()
    }

    /// Whether a fault is injected.
    #[inline]
    pub fn is_injected(&self) -> bool {
        self.injected.is_some()
    }

    /// Close the decision once the call completed. Returns the injected fault
    /// and every fault concurrent to this call, including the ones that were
    /// decided while it ran.
    pub fn finish(self) -> (Option<Fault>, Vec<FaultUid>) {
        let concurrent = match self.guard {
            Some(guard) => guard.finish(),
            None => self.concurrent,
        };
        (self.injected, concurrent)
    }
}

/// Matches call identities against a trace's faultload.
#[derive(Debug, Clone, Default)]
pub struct FaultMatcher {
    policy: MatchPolicy,
}

impl FaultMatcher {
    /// New with the ambiguity policy.
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    /// Get the ambiguity policy.
    #[inline]
    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// The declared fault applying to `uid`, if any.
    pub fn find<'a>(&self, uid: &FaultUid, faultload: &'a Faultload) -> Option<&'a Fault> {
        let mut candidates = faultload.matching(uid);
        let first = candidates.next()?;
        let Some(last) = candidates.last() else {
            return Some(first);
        };

        warn!(
            trace_id = %faultload.trace_id,
            %uid,
            policy = ?self.policy,
            "several faults match one call"
        );
        match self.policy {
            MatchPolicy::FirstDeclared => Some(first),
            MatchPolicy::LastDeclared => Some(last),
        }
    }

    /// Decide for the call `uid` of `trace`.
    ///
    /// An injected fault is put in flight before returning, so concurrent
    /// decisions of the same trace see it. Calls of unknown traces and calls
    /// without a matching fault are forwarded.
    pub fn decide(&self, uid: &FaultUid, trace: Option<&Arc<TraceState>>) -> Decision {
        let Some(trace) = trace else {
            return Decision::forward();
        };

        let injected = trace
            .faultload()
            .and_then(|faultload| self.find(uid, &faultload).cloned());

        match injected {
            Some(fault) => {
                let (concurrent, guard) = trace.enter(uid.clone());
                debug!(
                    trace_id = trace.trace_id(),
                    %uid,
                    mode = fault.mode.kind(),
                    concurrent = concurrent.len(),
                    "injecting fault"
                );
                Decision {
                    injected: Some(fault),
                    concurrent,
                    guard: Some(guard),
                }
            }
            None => Decision {
                injected: None,
                concurrent: trace.in_flight(),
                guard: None,
            },
        }
    }
}
