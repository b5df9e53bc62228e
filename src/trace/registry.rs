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

//! Trace scoped state shared by every call of a trace: its faultload and the
//! faults currently in flight.

use crate::faultload::{uid::FaultUid, Faultload};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, warn};

struct InFlightEntry {
    ticket: u64,
    uid: FaultUid,
    overlaps: Vec<FaultUid>,
}

/// State of one trace.
pub struct TraceState {
    trace_id: String,
    faultload: RwLock<Option<Arc<Faultload>>>,
    next_ticket: AtomicU64,
    in_flight: Mutex<Vec<InFlightEntry>>,
    touched: Mutex<Instant>,
}

impl std::fmt::Debug for TraceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceState")
            .field("trace_id", &self.trace_id)
            .field("faultload", &*self.faultload.read())
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

impl TraceState {
    fn new(trace_id: String) -> Self {
        Self {
            trace_id,
            faultload: Default::default(),
            next_ticket: Default::default(),
            in_flight: Default::default(),
            touched: Mutex::new(Instant::now()),
        }
    }

    /// Get trace id.
    #[inline]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Faultload of the trace, if one was registered.
    pub fn faultload(&self) -> Option<Arc<Faultload>> {
        self.faultload.read().clone()
    }

    fn set_faultload(&self, faultload: Faultload) {
        let previous = self.faultload.write().replace(Arc::new(faultload));
        if previous.is_some() {
            warn!(trace_id = %self.trace_id, "faultload registered twice, replacing");
        }
        self.touch();
    }

    fn touch(&self) {
        *self.touched.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.touched.lock().elapsed()
    }

    /// Faults currently in flight.
    pub fn in_flight(&self) -> Vec<FaultUid> {
        self.in_flight
            .lock()
            .iter()
            .map(|entry| entry.uid.clone())
            .collect()
    }

    /// Put `uid` in flight. Returns what was in flight already, and a guard
    /// taking `uid` out again.
    ///
    /// Registration and the snapshot happen under one lock, so of two
    /// concurrent entries the later always sees the earlier, and the earlier
    /// learns about the later through its guard.
    pub fn enter(self: &Arc<Self>, uid: FaultUid) -> (Vec<FaultUid>, InFlightGuard) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut in_flight = self.in_flight.lock();

        let concurrent: Vec<FaultUid> = in_flight.iter().map(|entry| entry.uid.clone()).collect();
        for entry in in_flight.iter_mut() {
            entry.overlaps.push(uid.clone());
        }
        in_flight.push(InFlightEntry {
            ticket,
            uid: uid.clone(),
            overlaps: concurrent.clone(),
        });
        drop(in_flight);

        self.touch();
        let guard = InFlightGuard {
            state: Arc::clone(self),
            ticket,
            uid,
            left: false,
        };
        (concurrent, guard)
    }

    fn leave(&self, ticket: u64) -> Vec<FaultUid> {
        let mut in_flight = self.in_flight.lock();
        match in_flight.iter().position(|entry| entry.ticket == ticket) {
            Some(index) => in_flight.swap_remove(index).overlaps,
            None => Vec::new(),
        }
    }
}

/// Keeps a fault in flight until finished or dropped.
#[must_use = "the fault leaves the in flight set when the guard is dropped"]
pub struct InFlightGuard {
    state: Arc<TraceState>,
    ticket: u64,
    uid: FaultUid,
    left: bool,
}

impl InFlightGuard {
    /// The fault held in flight.
    #[inline]
    pub fn uid(&self) -> &FaultUid {
        &self.uid
    }

    /// Take the fault out of flight, returning every fault whose window
    /// overlapped with it.
    pub fn finish(mut self) -> Vec<FaultUid> {
        self.left = true;
        self.state.leave(self.ticket)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.left {
            self.state.leave(self.ticket);
        }
    }
}

impl std::fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightGuard")
            .field("trace_id", &self.state.trace_id)
            .field("uid", &self.uid)
            .finish()
    }
}

/// Every live trace, by trace id.
#[derive(Debug, Default)]
pub struct TraceRegistry {
    traces: RwLock<HashMap<String, Arc<TraceState>>>,
}

impl TraceRegistry {
    /// New empty registry.
    #[inline]
    pub fn new() -> Self {
        Default::default()
    }

    /// Start a trace with its faultload.
    pub fn register(&self, faultload: Faultload) -> Arc<TraceState> {
        let state = self.get_or_create(&faultload.trace_id);
        debug!(trace_id = %faultload.trace_id, faults = faultload.len(), "faultload registered");
        state.set_faultload(faultload);
        state
    }

    /// Get the state of a trace, keeping it from expiring.
    pub fn get(&self, trace_id: &str) -> Option<Arc<TraceState>> {
        let state = self.traces.read().get(trace_id).cloned()?;
        state.touch();
        Some(state)
    }

    /// Get the state of a trace, starting it without faultload if unknown.
    pub fn get_or_create(&self, trace_id: &str) -> Arc<TraceState> {
        if let Some(state) = self.get(trace_id) {
            return state;
        }
        self.traces
            .write()
            .entry(trace_id.to_owned())
            .or_insert_with(|| Arc::new(TraceState::new(trace_id.to_owned())))
            .clone()
    }

    /// End a trace. Calls still in flight keep their state alive until they
    /// finish, but new calls start from scratch.
    pub fn complete(&self, trace_id: &str) -> Option<Arc<TraceState>> {
        self.traces.write().remove(trace_id)
    }

    /// End traces idle for at least `ttl`, returns their ids.
    pub fn evict_idle(&self, ttl: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        self.traces.write().retain(|trace_id, state| {
            let keep = state.idle_for() < ttl;
            if !keep {
                evicted.push(trace_id.clone());
            }
            keep
        });
        evicted
    }

    /// Number of live traces.
    pub fn len(&self) -> usize {
        self.traces.read().len()
    }

    /// Whether no trace is live.
    pub fn is_empty(&self) -> bool {
        self.traces.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_entries_see_each_other() {
        let registry = TraceRegistry::new();
        let state = registry.get_or_create("t1");
        let a = FaultUid::new("x", "y", "/a", 0);
        let b = FaultUid::new("x", "y", "/b", 0);

        let (before_a, guard_a) = state.enter(a.clone());
        let (before_b, guard_b) = state.enter(b.clone());
        assert!(before_a.is_empty());
        assert_eq!(before_b, vec![a.clone()]);

        assert_eq!(guard_a.finish(), vec![b.clone()]);
        assert_eq!(guard_b.finish(), vec![a]);
        assert!(state.in_flight().is_empty());
    }

    #[test]
    fn dropped_guard_leaves() {
        let state = TraceRegistry::new().get_or_create("t1");
        {
            let (_, _guard) = state.enter(FaultUid::new("x", "y", "/a", 0));
            assert_eq!(state.in_flight().len(), 1);
        }
        assert!(state.in_flight().is_empty());
    }

    #[test]
    fn lifecycle() {
        let registry = TraceRegistry::new();
        registry.register(Faultload::new("t1", vec![]));
        registry.get_or_create("t2");
        assert_eq!(registry.len(), 2);
        assert!(registry.get("t1").unwrap().faultload().is_some());
        assert!(registry.get("t2").unwrap().faultload().is_none());

        assert!(registry.complete("t1").is_some());
        assert!(registry.get("t1").is_none());
        assert_eq!(registry.evict_idle(Duration::ZERO), vec!["t2".to_owned()]);
        assert!(registry.is_empty());
    }
}
