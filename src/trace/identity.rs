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

//! Derivation of a [FaultUid] from an inbound call.

use crate::{
    faultload::uid::{FaultUid, NO_IDENTITY},
    trace::{
        invocation::{InvocationCounter, InvocationKey},
        propagation::{generate_span_id, TraceParent, TraceStateHeader, PROXY_STATE_KEY},
    },
};
use http::{header::CONTENT_TYPE, header::HOST, HeaderMap};
use serde::{Deserialize, Serialize};
use parking_lot::RwLock;
use std::{collections::HashMap, net::SocketAddr, ops::Deref, sync::Arc};
use tracing::debug;

/// Identity oracle, maps a network host to a fully qualified name.
///
/// Lookups run inline on the async call path, so implementations must answer
/// from memory. Wrap a resolver that does network round trips in
/// [CachedLookup], or feed a [StaticLookup] from a background task. `None`
/// means the host is unknown and the raw host will be used instead.
pub trait Lookup {
    /// Name of `host`, e.g. `orders.shop-stack.svc.cluster.local`.
    fn lookup(&self, host: &str) -> Option<String>;
}

/// Lookup that knows nothing.
impl Lookup for () {
    fn lookup(&self, _host: &str) -> Option<String> {
        None
    }
}

impl<T: Lookup + ?Sized> Lookup for Box<T> {
    fn lookup(&self, host: &str) -> Option<String> {
        Lookup::lookup(self.deref(), host)
    }
}

impl<T: Lookup + ?Sized> Lookup for Arc<T> {
    fn lookup(&self, host: &str) -> Option<String> {
        Lookup::lookup(self.deref(), host)
    }
}

/// Fixed host to name table.
#[derive(Debug, Default, Clone)]
pub struct StaticLookup {
    names: HashMap<String, String>,
}

impl StaticLookup {
    /// New empty table.
    #[inline]
    pub fn new() -> Self {
        Default::default()
    }

    /// Add a host name.
    pub fn with_name(mut self, host: impl Into<String>, name: impl Into<String>) -> Self {
        self.names.insert(host.into(), name.into());
        self
    }
}

impl Lookup for StaticLookup {
    fn lookup(&self, host: &str) -> Option<String> {
        self.names.get(host).cloned()
    }
}

/// Remembers every answer of the wrapped lookup, misses included, so each host
/// is resolved at most once.
#[derive(Debug, Default)]
pub struct CachedLookup<L> {
    inner: L,
    names: RwLock<HashMap<String, Option<String>>>,
}

impl<L: Lookup> CachedLookup<L> {
    /// Wrap `inner`.
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            names: Default::default(),
        }
    }

    /// Forget every answer, e.g. after a redeployment.
    pub fn clear(&self) {
        self.names.write().clear();
    }

    /// Number of hosts answered.
    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    /// Whether nothing was answered yet.
    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }
}

impl<L: Lookup> Lookup for CachedLookup<L> {
    fn lookup(&self, host: &str) -> Option<String> {
        if let Some(name) = self.names.read().get(host) {
            return name.clone();
        }
        let name = self.inner.lookup(host);
        self.names.write().insert(host.to_owned(), name.clone());
        name
    }
}

pub(crate) type DynLookup = dyn Lookup + Send + Sync + 'static;

/// Turns network hosts into short service names.
pub struct HostIdentifier {
    lookup: Box<DynLookup>,
    stack_prefix: String,
}

impl HostIdentifier {
    /// New with lookup oracle and the deployment prefix to strip from names.
    pub fn new(
        lookup: impl Lookup + Send + Sync + 'static,
        stack_prefix: impl Into<String>,
    ) -> Self {
        Self {
            lookup: Box::new(lookup),
            stack_prefix: stack_prefix.into(),
        }
    }

    /// Service name of `host`, or `host` itself when it can't be resolved.
    pub fn identify(&self, host: &str) -> String {
        let Some(fqdn) = self.lookup.lookup(host) else {
            debug!(host, "no name for host, using address");
            return host.to_owned();
        };

        let service = fqdn.split('.').next().unwrap_or(&fqdn);
        let service = service.strip_prefix(&*self.stack_prefix).unwrap_or(service);
        if service.is_empty() {
            return host.to_owned();
        }
        service.to_owned()
    }

    /// Service name behind `host:port`, [NO_IDENTITY] when there is no
    /// address to speak of.
    pub fn identify_addr(&self, addr: Option<&str>) -> String {
        match addr.and_then(split_host) {
            Some(host) => self.identify(&host),
            None => {
                debug!(?addr, "can't determine host of address");
                NO_IDENTITY.to_owned()
            }
        }
    }
}

impl std::fmt::Debug for HostIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostIdentifier")
            .field("stack_prefix", &self.stack_prefix)
            .finish()
    }
}

/// Host part of `host:port`, `[v6]:port` or a bare host name.
fn split_host(addr: &str) -> Option<String> {
    if let Ok(addr) = addr.parse::<SocketAddr>() {
        return Some(addr.ip().to_string());
    }

    let host = match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        Some(_) => return None,
        None => addr,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if host.is_empty() {
        None
    } else {
        Some(host.to_owned())
    }
}

/// Wire protocol of a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Plain http.
    #[default]
    Http,
    /// Grpc over http/2.
    Grpc,
}

impl Protocol {
    /// Detect from the `content-type` header.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let is_grpc = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/grpc"));
        if is_grpc {
            Protocol::Grpc
        } else {
            Protocol::Http
        }
    }
}

/// The parts of an inbound call identity derivation looks at.
#[derive(Debug, Clone, Copy)]
pub struct CallInfo<'a> {
    /// Request headers.
    pub headers: &'a HeaderMap,
    /// Request path, without query.
    pub path: &'a str,
    /// Target authority, `host[:port]`.
    pub authority: Option<&'a str>,
    /// Address of the caller, `ip:port`.
    pub remote_addr: Option<&'a str>,
}

impl<'a> CallInfo<'a> {
    /// Borrow from an [http::Request]. The authority comes from the `host`
    /// header, or the uri when that is missing.
    pub fn from_request<B>(request: &'a http::Request<B>, remote_addr: Option<&'a str>) -> Self {
        let authority = request
            .headers()
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| request.uri().authority().map(|authority| authority.as_str()));

        Self {
            headers: request.headers(),
            path: request.uri().path(),
            authority,
            remote_addr,
        }
    }
}

/// Everything known about a call once it has been identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMetadata {
    /// Decoded trace context of the inbound call.
    pub trace_parent: TraceParent,
    /// Decoded trace state of the inbound call.
    pub trace_state: TraceStateHeader,
    /// Span minted by the proxy for this call.
    pub span_id: String,
    /// Identity of the call.
    pub uid: FaultUid,
    /// Wire protocol.
    pub protocol: Protocol,
    /// Whether the call is the entry point of its trace, i.e. no proxy
    /// forwarded anything on its way here.
    pub is_initial: bool,
}

impl RequestMetadata {
    /// Trace id, empty for untraced calls.
    #[inline]
    pub fn trace_id(&self) -> &str {
        &self.trace_parent.trace_id
    }

    /// `traceparent` value to send downstream.
    pub fn forward_traceparent(&self) -> Option<String> {
        self.trace_parent.child_header(&self.span_id)
    }

    /// `tracestate` value to send downstream, the inbound entries with this
    /// proxy's span stamped on front.
    pub fn forward_tracestate(&self) -> Option<String> {
        if self.trace_parent.is_untraced() {
            return None;
        }
        let state = self
            .trace_state
            .clone()
            .with_entry(PROXY_STATE_KEY, self.span_id.as_str());
        Some(state.encode())
    }
}

/// Derives call identities. Every derivation takes one occurrence index, so
/// deriving twice for the same logical call yields two different uids.
pub struct IdentityDeriver {
    identifier: HostIdentifier,
    service_name: String,
    grpc_path_prefix: String,
    counter: Arc<InvocationCounter>,
}

impl IdentityDeriver {
    /// New deriver.
    pub fn new(
        identifier: HostIdentifier,
        service_name: impl Into<String>,
        grpc_path_prefix: impl Into<String>,
        counter: Arc<InvocationCounter>,
    ) -> Self {
        Self {
            identifier,
            service_name: service_name.into(),
            grpc_path_prefix: grpc_path_prefix.into(),
            counter,
        }
    }

    /// The counter occurrence indexes are taken from.
    pub fn counter(&self) -> &Arc<InvocationCounter> {
        &self.counter
    }

    /// Logical operation of the call: the path, with the configured prefix
    /// stripped for grpc.
    pub fn signature(&self, call: &CallInfo<'_>, protocol: Protocol) -> String {
        match protocol {
            Protocol::Grpc => call
                .path
                .strip_prefix(&*self.grpc_path_prefix)
                .unwrap_or(call.path)
                .to_owned(),
            Protocol::Http => call.path.to_owned(),
        }
    }

    /// Calling service.
    pub fn origin(&self, call: &CallInfo<'_>) -> String {
        self.identifier.identify_addr(call.remote_addr)
    }

    /// Receiving service, falls back on the local service name when the call
    /// has no usable authority.
    pub fn destination(&self, call: &CallInfo<'_>) -> String {
        let destination = self.identifier.identify_addr(call.authority);
        if destination == NO_IDENTITY && !self.service_name.is_empty() {
            return self.service_name.clone();
        }
        destination
    }

    /// Identify the call.
    pub fn derive(&self, call: &CallInfo<'_>) -> RequestMetadata {
        let trace_parent = TraceParent::from_headers(call.headers);
        let trace_state = TraceStateHeader::from_headers(call.headers);
        let is_initial =
            !trace_parent.is_untraced() && trace_state.get(PROXY_STATE_KEY).is_none();
        let protocol = Protocol::from_headers(call.headers);
        let signature = self.signature(call, protocol);
        let origin = self.origin(call);
        let destination = self.destination(call);

        let count = self.counter.next_index(&InvocationKey::new(
            origin.as_str(),
            signature.as_str(),
            trace_parent.trace_id.as_str(),
        ));

        RequestMetadata {
            trace_parent,
            trace_state,
            span_id: generate_span_id(),
            uid: FaultUid {
                origin,
                destination,
                signature,
                count,
            },
            protocol,
            is_initial,
        }
    }
}

impl std::fmt::Debug for IdentityDeriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityDeriver")
            .field("identifier", &self.identifier)
            .field("service_name", &self.service_name)
            .field("grpc_path_prefix", &self.grpc_path_prefix)
            .finish()
    }
}
