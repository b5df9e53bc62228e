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

//! Call identities and the patterns faults are declared against.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Matches any origin, destination or signature in a [FaultUidPattern].
pub const ANY_WILDCARD: &str = "*";

/// Identity used when a peer cannot be determined at all.
pub const NO_IDENTITY: &str = "<none>";

/// Canonical identity of one call occurrence within a trace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaultUid {
    /// Calling service.
    pub origin: String,
    /// Receiving service.
    pub destination: String,
    /// Logical operation, i.e. the http path or the grpc method.
    pub signature: String,
    /// Zero-based occurrence of `(origin, signature)` within the trace.
    pub count: u64,
}

impl FaultUid {
    /// New uid from its parts.
    pub fn new(
        origin: impl Into<String>,
        destination: impl Into<String>,
        signature: impl Into<String>,
        count: u64,
    ) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
            signature: signature.into(),
            count,
        }
    }
}

impl fmt::Display for FaultUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}>{}:{}#{}",
            self.origin, self.destination, self.signature, self.count
        )
    }
}

/// A [FaultUid] with optional parts, used to declare which calls a fault
/// applies to.
///
/// `count` left out (or negative in the control document) means every
/// occurrence, and [ANY_WILDCARD] in a string field matches every value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaultUidPattern {
    /// Calling service.
    pub origin: String,
    /// Receiving service.
    pub destination: String,
    /// Logical operation.
    pub signature: String,
    /// Occurrence, `None` for any.
    #[serde(
        default,
        deserialize_with = "deserialize_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub count: Option<u64>,
}

impl FaultUidPattern {
    /// Pattern matching every occurrence of the triple.
    pub fn any_count(
        origin: impl Into<String>,
        destination: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
            signature: signature.into(),
            count: None,
        }
    }

    /// Restrict the pattern to one occurrence.
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Whether the pattern applies to every occurrence.
    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.count.is_none()
    }

    /// Whether `uid` matches on origin, destination and signature.
    pub fn matches_up_to_count(&self, uid: &FaultUid) -> bool {
        part_matches(&self.origin, &uid.origin)
            && part_matches(&self.destination, &uid.destination)
            && part_matches(&self.signature, &uid.signature)
    }

    /// Whether `uid` is one of the calls this pattern describes.
    pub fn matches(&self, uid: &FaultUid) -> bool {
        self.matches_up_to_count(uid) && self.count.is_none_or(|count| count == uid.count)
    }
}

impl From<FaultUid> for FaultUidPattern {
    fn from(uid: FaultUid) -> Self {
        Self {
            origin: uid.origin,
            destination: uid.destination,
            signature: uid.signature,
            count: Some(uid.count),
        }
    }
}

impl fmt::Display for FaultUidPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>{}:{}", self.origin, self.destination, self.signature)?;
        match self.count {
            Some(count) => write!(f, "#{}", count),
            None => f.write_str("#∞"),
        }
    }
}

fn part_matches(pattern: &str, value: &str) -> bool {
    pattern == ANY_WILDCARD || pattern == value
}

fn deserialize_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let count = Option::<i64>::deserialize(deserializer)?;
    Ok(count.and_then(|count| u64::try_from(count).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_parts_match_anything() {
        let pattern = FaultUidPattern::any_count("*", "b", "*");
        assert!(pattern.matches(&FaultUid::new("a", "b", "/foo", 3)));
        assert!(!pattern.matches(&FaultUid::new("a", "c", "/foo", 3)));
    }

    #[test]
    fn negative_count_means_any() {
        let pattern: FaultUidPattern = serde_json::from_str(
            r#"{"origin":"a","destination":"b","signature":"/foo","count":-1}"#,
        )
        .unwrap();
        assert!(pattern.is_persistent());
    }

    #[test]
    fn display() {
        assert_eq!(FaultUid::new("a", "b", "/foo", 2).to_string(), "a>b:/foo#2");
        assert_eq!(
            FaultUidPattern::any_count("a", "b", "/foo").to_string(),
            "a>b:/foo#∞"
        );
    }
}
