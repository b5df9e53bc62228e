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

//! Declared faults of a trace.

pub mod mode;
pub mod uid;

use crate::faultload::{
    mode::FaultMode,
    uid::{FaultUid, FaultUidPattern},
};
use serde::{Deserialize, Serialize};

/// A declared rule: which calls to hit, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    /// Calls the fault applies to.
    pub uid: FaultUidPattern,
    /// Injection to perform.
    pub mode: FaultMode,
}

impl Fault {
    /// New fault.
    pub fn new(uid: FaultUidPattern, mode: FaultMode) -> Self {
        Self { uid, mode }
    }

    /// Whether the fault applies to `uid`.
    #[inline]
    pub fn matches(&self, uid: &FaultUid) -> bool {
        self.uid.matches(uid)
    }
}

/// Every fault declared for one trace, as sent on the control path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Faultload {
    /// Faults in declaration order.
    #[serde(default)]
    pub faults: Vec<Fault>,
    /// Trace the faults belong to.
    pub trace_id: String,
}

impl Faultload {
    /// New faultload for `trace_id`.
    pub fn new(trace_id: impl Into<String>, faults: Vec<Fault>) -> Self {
        Self {
            faults,
            trace_id: trace_id.into(),
        }
    }

    /// Decode the control document.
    pub fn from_slice(body: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Number of declared faults.
    #[inline]
    pub fn len(&self) -> usize {
        self.faults.len()
    }

    /// Whether no faults are declared.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    /// Faults applying to `uid`, in declaration order.
    pub fn matching<'a>(&'a self, uid: &FaultUid) -> impl Iterator<Item = &'a Fault> {
        self.faults.iter().filter(move |fault| fault.matches(uid))
    }

    /// Faults with the given mode kind.
    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Fault> + 'a {
        self.faults
            .iter()
            .filter(move |fault| fault.mode.kind() == kind)
    }

    /// Whether any fault has one of the given mode kinds.
    pub fn has_kind(&self, kinds: &[&str]) -> bool {
        self.faults
            .iter()
            .any(|fault| kinds.contains(&fault.mode.kind()))
    }
}
