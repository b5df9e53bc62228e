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

//! Proxy configuration.

use crate::proxy::matcher::MatchPolicy;
use std::{env, time::Duration};
use tracing::warn;

/// Env var naming the local service.
pub const ENV_SERVICE_NAME: &str = "SERVICE_NAME";
/// Env var holding the deployment prefix stripped from resolved names.
pub const ENV_STACK_PREFIX: &str = "STACK_PREFIX";
/// Env var holding the path prefix stripped from grpc signatures.
pub const ENV_GRPC_PATH_PREFIX: &str = "GRPC_PATH_PREFIX";
/// Env var turning body hashing on (`1`/`true`).
pub const ENV_HASH_BODY: &str = "FIT_HASH_BODY";
/// Env var with the forward/injection timeout in milliseconds.
pub const ENV_CALL_TIMEOUT_MS: &str = "FIT_CALL_TIMEOUT_MS";
/// Env var with the idle trace expiry in seconds.
pub const ENV_TRACE_TTL_SECS: &str = "FIT_TRACE_TTL_SECS";

/// Configuration of a [FaultProxy](crate::proxy::handler::FaultProxy).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    service_name: String,
    stack_prefix: String,
    grpc_path_prefix: String,
    hash_body: bool,
    call_timeout: Duration,
    trace_ttl: Duration,
    match_policy: MatchPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: Default::default(),
            stack_prefix: Default::default(),
            grpc_path_prefix: "/".to_owned(),
            hash_body: false,
            call_timeout: Duration::from_secs(30),
            trace_ttl: Duration::from_secs(600),
            match_policy: Default::default(),
        }
    }
}

impl Config {
    /// New with the local service name and defaults for everything else.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Read from the environment. Unset or unparsable values keep their
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::new(
            env::var(ENV_SERVICE_NAME)
                .ok()
                .filter(|name| !name.is_empty())
                .or_else(host_name)
                .unwrap_or_default(),
        );

        if let Ok(prefix) = env::var(ENV_STACK_PREFIX) {
            config.stack_prefix = prefix;
        }
        if let Some(prefix) = env::var(ENV_GRPC_PATH_PREFIX).ok().filter(|p| !p.is_empty()) {
            config.grpc_path_prefix = prefix;
        }
        if let Ok(hash_body) = env::var(ENV_HASH_BODY) {
            config.hash_body = matches!(hash_body.as_str(), "1" | "true" | "TRUE" | "yes");
        }
        if let Some(ms) = parse_env::<u64>(ENV_CALL_TIMEOUT_MS) {
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_env::<u64>(ENV_TRACE_TTL_SECS) {
            config.trace_ttl = Duration::from_secs(secs);
        }
        config
    }

    /// Set the deployment prefix stripped from resolved service names.
    pub fn with_stack_prefix(mut self, stack_prefix: impl Into<String>) -> Self {
        self.stack_prefix = stack_prefix.into();
        self
    }

    /// Set the path prefix stripped from grpc signatures. Defaults to `/`.
    pub fn with_grpc_path_prefix(mut self, grpc_path_prefix: impl Into<String>) -> Self {
        self.grpc_path_prefix = grpc_path_prefix.into();
        self
    }

    /// Report body hashes instead of bodies.
    pub fn with_hash_body(mut self, hash_body: bool) -> Self {
        self.hash_body = hash_body;
        self
    }

    /// Bound on forwarding and injection, defaults to 30s.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Idle time after which a trace's state is dropped, defaults to 10min.
    pub fn with_trace_ttl(mut self, trace_ttl: Duration) -> Self {
        self.trace_ttl = trace_ttl;
        self
    }

    /// Policy for calls matched by several faults.
    pub fn with_match_policy(mut self, match_policy: MatchPolicy) -> Self {
        self.match_policy = match_policy;
        self
    }

    /// Get service name.
    #[inline]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Get stack prefix.
    #[inline]
    pub fn stack_prefix(&self) -> &str {
        &self.stack_prefix
    }

    /// Get grpc path prefix.
    #[inline]
    pub fn grpc_path_prefix(&self) -> &str {
        &self.grpc_path_prefix
    }

    /// Whether bodies are hashed.
    #[inline]
    pub fn hash_body(&self) -> bool {
        self.hash_body
    }

    /// Get call timeout.
    #[inline]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Get trace ttl.
    #[inline]
    pub fn trace_ttl(&self) -> Duration {
        self.trace_ttl
    }

    /// Get match policy.
    #[inline]
    pub fn match_policy(&self) -> MatchPolicy {
        self.match_policy
    }
}

#[cfg(feature = "hostname")]
fn host_name() -> Option<String> {
    hostname::get().ok().and_then(|name| name.into_string().ok())
}

#[cfg(not(feature = "hostname"))]
fn host_name() -> Option<String> {
    None
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = env::var(key).ok()?;
    match value.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, %value, "ignoring unparsable env var");
            None
        }
    }
}
