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

//! One call, end to end.

use crate::{
    config::Config,
    error::Error,
    faultload::{Fault, Faultload},
    proxy::{
        collaborator::{Forward, Inject, Injection},
        matcher::{Decision, FaultMatcher},
        report::TraceReport,
        state::ProxyState,
        sweeper::Sweeping,
    },
    reporter::{CollectItem, DynReport, Report},
    trace::{
        identity::{CallInfo, HostIdentifier, IdentityDeriver, Lookup, RequestMetadata},
        invocation::InvocationCounter,
        propagation::{TRACEPARENT_HEADER_KEY, TRACESTATE_HEADER_KEY},
        registry::{TraceRegistry, TraceState},
    },
};
use bytes::Bytes;
use http::{HeaderValue, Response};
use std::sync::Arc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

pub(crate) type DynInject = dyn Inject + Send + Sync + 'static;

/// What the transport should do with the caller.
#[derive(Debug)]
pub enum Answer {
    /// Send this response.
    Respond(Response<Bytes>),
    /// Leave the caller hanging, or close on it.
    Drop,
    /// Forwarding failed; answer with a gateway error.
    Fail(Error),
}

/// Result of [FaultProxy::handle].
#[derive(Debug)]
pub struct Handled {
    /// Answer for the caller.
    pub answer: Answer,
    /// Report emitted for the call.
    pub report: TraceReport,
}

struct Inner {
    config: Config,
    deriver: IdentityDeriver,
    registry: TraceRegistry,
    matcher: FaultMatcher,
    injector: Box<DynInject>,
    reporter: Box<DynReport>,
}

/// Decision core of the proxy. Cheap to clone, every clone shares counters
/// and trace state.
#[derive(Clone)]
pub struct FaultProxy {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FaultProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultProxy")
            .field("config", &self.inner.config)
            .field("traces", &self.inner.registry.len())
            .finish()
    }
}

impl FaultProxy {
    /// New with the identity oracle, the fault executor and the collector.
    pub fn new(
        config: Config,
        lookup: impl Lookup + Send + Sync + 'static,
        injector: impl Inject + Send + Sync + 'static,
        reporter: impl Report + Send + Sync + 'static,
    ) -> Self {
        let deriver = IdentityDeriver::new(
            HostIdentifier::new(lookup, config.stack_prefix()),
            config.service_name(),
            config.grpc_path_prefix(),
            Arc::new(InvocationCounter::new()),
        );

        Self {
            inner: Arc::new(Inner {
                matcher: FaultMatcher::new(config.match_policy()),
                config,
                deriver,
                registry: TraceRegistry::new(),
                injector: Box::new(injector),
                reporter: Box::new(reporter),
            }),
        }
    }

    /// Get config.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get trace registry.
    #[inline]
    pub fn registry(&self) -> &TraceRegistry {
        &self.inner.registry
    }

    /// Get invocation counter.
    #[inline]
    pub fn counter(&self) -> &InvocationCounter {
        self.inner.deriver.counter()
    }

    /// Control path: start a trace from a faultload document.
    pub fn register_faultload(&self, body: &[u8]) -> crate::Result<Arc<TraceState>> {
        let faultload = Faultload::from_slice(body).inspect_err(|err| {
            warn!(?err, "failed to decode faultload");
        })?;
        Ok(self.inner.registry.register(faultload))
    }

    /// Control path: a trace is done, drop everything kept for it.
    pub fn complete_trace(&self, trace_id: &str) -> bool {
        let known = self.inner.registry.complete(trace_id).is_some();
        let keys = self.counter().evict_trace(trace_id);
        debug!(trace_id, known, keys, "trace completed");
        known
    }

    /// Drop state of traces idle for longer than the configured ttl. Returns
    /// the number of traces dropped.
    pub fn evict_expired(&self) -> usize {
        let ttl = self.inner.config.trace_ttl();
        let traces = self.inner.registry.evict_idle(ttl);
        for trace_id in &traces {
            self.counter().evict_trace(trace_id);
        }
        let keys = self.counter().evict_idle(ttl);
        if !traces.is_empty() || keys > 0 {
            info!(traces = traces.len(), keys, "evicted idle trace state");
        }
        traces.len()
    }

    /// Periodic [FaultProxy::evict_expired] in the background, see
    /// [Sweeping::spawn].
    pub fn sweeping(&self) -> Sweeping {
        Sweeping::new(self.clone())
    }

    /// Identify a call. Only the control path creates trace state, a call of
    /// a trace without faultload leaves nothing but its counter key behind.
    #[inline]
    pub fn identify(&self, call: &CallInfo<'_>) -> RequestMetadata {
        self.inner.deriver.derive(call)
    }

    /// Decide on an identified call.
    pub fn decide(&self, metadata: &RequestMetadata) -> Decision {
        if metadata.trace_parent.is_untraced() {
            return Decision::forward();
        }
        let trace = self.inner.registry.get(metadata.trace_id());
        self.inner.matcher.decide(&metadata.uid, trace.as_ref())
    }

    /// Handle one inbound call: identify, decide, forward or inject, capture
    /// and report.
    ///
    /// Failures of the call itself end up in the report and the [Answer];
    /// the error path is only taken on internal state machine misuse.
    pub async fn handle<B, F>(
        &self,
        mut request: http::Request<B>,
        remote_addr: Option<&str>,
        forwarder: &F,
    ) -> crate::Result<Handled>
    where
        B: Send + 'static,
        F: Forward<B> + ?Sized,
    {
        let mut state = ProxyState::new();

        let metadata = self.identify(&CallInfo::from_request(&request, remote_addr));
        if let Some(value) = metadata
            .forward_traceparent()
            .and_then(|value| HeaderValue::from_str(&value).ok())
        {
            request.headers_mut().insert(TRACEPARENT_HEADER_KEY, value);
        }
        if let Some(value) = metadata
            .forward_tracestate()
            .and_then(|value| HeaderValue::from_str(&value).ok())
        {
            request.headers_mut().insert(TRACESTATE_HEADER_KEY, value);
        }
        state.identified(metadata.clone())?;

        let decision = self.decide(&metadata);
        let fault = decision.injected.clone();
        state.decided(decision)?;

        let answer = match fault {
            None => {
                state.forwarding()?;
                self.forward(&mut state, request, forwarder, None).await
            }
            Some(fault) => {
                state.injecting()?;
                let begin = Instant::now();
                let injection = timeout(
                    self.inner.config.call_timeout(),
                    self.inner.injector.inject(&fault, &metadata),
                )
                .await;
                state.add_overhead(begin.elapsed());

                match injection {
                    Ok(Injection::Respond(response)) => {
                        state.capture_mut().record(&response);
                        Answer::Respond(response)
                    }
                    Ok(Injection::Forward) => {
                        state.forwarding()?;
                        self.forward(&mut state, request, forwarder, Some(&fault))
                            .await
                    }
                    Ok(Injection::Drop) => Answer::Drop,
                    Err(_) => {
                        warn!(uid = %metadata.uid, "fault injection timed out");
                        Answer::Fail(Error::Timeout(self.inner.config.call_timeout()))
                    }
                }
            }
        };

        state.captured()?;
        let report = state.into_report(self.inner.config.hash_body())?;
        self.inner
            .reporter
            .report(CollectItem::Trace(Box::new(report.clone())));

        Ok(Handled { answer, report })
    }

    async fn forward<B, F>(
        &self,
        state: &mut ProxyState,
        request: http::Request<B>,
        forwarder: &F,
        fault: Option<&Fault>,
    ) -> Answer
    where
        B: Send + 'static,
        F: Forward<B> + ?Sized,
    {
        let call_timeout = self.inner.config.call_timeout();
        let mut response = match timeout(call_timeout, forwarder.forward(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(?err, "forwarding failed");
                return Answer::Fail(Error::Forward(err));
            }
            Err(_) => {
                warn!(?call_timeout, "forwarding timed out");
                return Answer::Fail(Error::Timeout(call_timeout));
            }
        };

        if let Some(fault) = fault {
            self.inner.injector.tamper(fault, &mut response);
        }
        state.capture_mut().record(&response);
        Answer::Respond(response)
    }
}
