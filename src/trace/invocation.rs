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

//! Per-trace occurrence counting of identical calls.

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    hash::{BuildHasher, RandomState},
    time::Duration,
};
use tokio::time::Instant;

const SHARD_COUNT: usize = 16;

/// Calls sharing a key are told apart by their occurrence index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvocationKey {
    /// Calling service.
    pub origin: String,
    /// Logical operation.
    pub signature: String,
    /// Owning trace.
    pub trace_id: String,
}

impl InvocationKey {
    /// New key.
    pub fn new(
        origin: impl Into<String>,
        signature: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            origin: origin.into(),
            signature: signature.into(),
            trace_id: trace_id.into(),
        }
    }
}

struct Slot {
    next: u64,
    touched: Instant,
}

/// Process wide keyed counter handing out `0, 1, 2, ...` per key.
///
/// Keys are spread over a fixed number of shards, each behind its own lock, so
/// increments of one key are linearizable while unrelated keys rarely contend.
/// Entries are never dropped implicitly; call [InvocationCounter::evict_trace]
/// when a trace completes or [InvocationCounter::evict_idle] periodically.
pub struct InvocationCounter {
    shards: Box<[Mutex<HashMap<InvocationKey, Slot>>]>,
    hasher: RandomState,
}

impl Default for InvocationCounter {
    fn default() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::default()).collect(),
            hasher: RandomState::new(),
        }
    }
}

impl std::fmt::Debug for InvocationCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationCounter")
            .field("len", &self.len())
            .finish()
    }
}

impl InvocationCounter {
    /// New empty counter.
    #[inline]
    pub fn new() -> Self {
        Default::default()
    }

    fn shard(&self, key: &InvocationKey) -> &Mutex<HashMap<InvocationKey, Slot>> {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Take the next occurrence index of `key`.
    pub fn next_index(&self, key: &InvocationKey) -> u64 {
        let now = Instant::now();
        let mut shard = self.shard(key).lock();

        if let Some(slot) = shard.get_mut(key) {
            let index = slot.next;
            slot.next += 1;
            slot.touched = now;
            return index;
        }

        shard.insert(
            key.clone(),
            Slot {
                next: 1,
                touched: now,
            },
        );
        0
    }

    /// Drop every key of `trace_id`, returns how many were dropped.
    pub fn evict_trace(&self, trace_id: &str) -> usize {
        self.retain(|key, _| key.trace_id != trace_id)
    }

    /// Drop keys untouched for at least `ttl`, returns how many were dropped.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        self.retain(|_, slot| slot.touched.elapsed() < ttl)
    }

    fn retain(&self, mut keep: impl FnMut(&InvocationKey, &Slot) -> bool) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|key, slot| keep(key, slot));
            removed += before - shard.len();
        }
        removed
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
