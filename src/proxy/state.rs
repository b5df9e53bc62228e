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

//! Per request state machine.
//!
//! `Received → Identified → Decided → {Forwarding | Injecting} → Captured →
//! Reported`, where a delay style injection moves on from `Injecting` to
//! `Forwarding`.

use crate::{
    error::Error,
    faultload::Fault,
    proxy::{capture::ResponseCapture, matcher::Decision, report::TraceReport},
    trace::identity::RequestMetadata,
};
use std::time::Duration;
use tokio::time::Instant;

/// Phase of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing done yet.
    Received,
    /// Identity derived.
    Identified,
    /// Fault decision taken.
    Decided,
    /// Waiting on the downstream service.
    Forwarding,
    /// Waiting on fault execution.
    Injecting,
    /// Outcome recorded.
    Captured,
    /// Report built.
    Reported,
}

impl Phase {
    /// Name of the phase.
    pub fn name(self) -> &'static str {
        match self {
            Phase::Received => "received",
            Phase::Identified => "identified",
            Phase::Decided => "decided",
            Phase::Forwarding => "forwarding",
            Phase::Injecting => "injecting",
            Phase::Captured => "captured",
            Phase::Reported => "reported",
        }
    }

    fn leads_to(self, next: Phase) -> bool {
        use Phase::*;

        matches!(
            (self, next),
            (Received, Identified)
                | (Identified, Decided)
                | (Decided, Forwarding)
                | (Decided, Injecting)
                | (Injecting, Forwarding)
                | (Injecting, Captured)
                | (Forwarding, Captured)
                | (Captured, Reported)
        )
    }
}

/// Everything known about one request while it is handled. Owned by the
/// request's task and consumed into its [TraceReport].
#[derive(Debug)]
pub struct ProxyState {
    phase: Phase,
    metadata: Option<RequestMetadata>,
    decision: Option<Decision>,
    capture: ResponseCapture,
    started: Option<Instant>,
    duration: Duration,
    overhead: Duration,
}

impl Default for ProxyState {
    fn default() -> Self {
        Self {
            phase: Phase::Received,
            metadata: None,
            decision: None,
            capture: ResponseCapture::new(),
            started: None,
            duration: Duration::ZERO,
            overhead: Duration::ZERO,
        }
    }
}

impl ProxyState {
    /// New received request.
    #[inline]
    pub fn new() -> Self {
        Default::default()
    }

    /// Get phase.
    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Metadata, once identified.
    #[inline]
    pub fn metadata(&self) -> Option<&RequestMetadata> {
        self.metadata.as_ref()
    }

    /// Injected fault, once decided.
    pub fn injected_fault(&self) -> Option<&Fault> {
        self.decision.as_ref()?.injected.as_ref()
    }

    /// Capture of the answer.
    #[inline]
    pub fn capture_mut(&mut self) -> &mut ResponseCapture {
        &mut self.capture
    }

    fn advance(&mut self, next: Phase) -> crate::Result<()> {
        if !self.phase.leads_to(next) {
            return Err(Error::InvalidTransition {
                from: self.phase.name(),
                to: next.name(),
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Identity derived.
    pub fn identified(&mut self, metadata: RequestMetadata) -> crate::Result<()> {
        self.advance(Phase::Identified)?;
        self.metadata = Some(metadata);
        Ok(())
    }

    /// Decision taken.
    pub fn decided(&mut self, decision: Decision) -> crate::Result<()> {
        self.advance(Phase::Decided)?;
        self.decision = Some(decision);
        Ok(())
    }

    /// Forwarding starts, timing starts with it unless injection started it.
    pub fn forwarding(&mut self) -> crate::Result<()> {
        self.advance(Phase::Forwarding)?;
        self.started.get_or_insert_with(Instant::now);
        Ok(())
    }

    /// Injection starts, timing starts with it.
    pub fn injecting(&mut self) -> crate::Result<()> {
        self.advance(Phase::Injecting)?;
        self.started = Some(Instant::now());
        Ok(())
    }

    /// Account time spent by fault execution.
    pub fn add_overhead(&mut self, overhead: Duration) {
        self.overhead += overhead;
    }

    /// Outcome recorded, timing stops.
    pub fn captured(&mut self) -> crate::Result<()> {
        self.advance(Phase::Captured)?;
        if let Some(started) = self.started {
            self.duration = started.elapsed();
        }
        Ok(())
    }

    /// Build the report, closing the decision.
    pub fn into_report(mut self, hash_body: bool) -> crate::Result<TraceReport> {
        self.advance(Phase::Reported)?;

        let (Some(metadata), Some(decision)) = (self.metadata, self.decision) else {
            return Err(Error::InvalidTransition {
                from: Phase::Captured.name(),
                to: Phase::Reported.name(),
            });
        };

        let mut response = self.capture.response_data(hash_body);
        response.duration_ms = as_millis_f64(self.duration);
        response.overhead_duration_ms = as_millis_f64(self.overhead);

        let (injected_fault, concurrent_to) = decision.finish();

        Ok(TraceReport {
            trace_id: metadata.trace_parent.trace_id,
            parent_span_id: metadata.trace_parent.parent_span_id,
            span_id: metadata.span_id,
            uid: metadata.uid,
            is_initial: metadata.is_initial,
            protocol: metadata.protocol,
            injected_fault,
            response,
            concurrent_to,
        })
    }
}

fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_skipping_phases() {
        let mut state = ProxyState::new();
        assert!(matches!(
            state.forwarding(),
            Err(Error::InvalidTransition {
                from: "received",
                to: "forwarding"
            })
        ));
        assert_eq!(state.phase(), Phase::Received);
        assert!(state.decided(Decision::forward()).is_err());
    }
}
