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

use async_trait::async_trait;
use bytes::Bytes;
use fit_proxy::{
    config::Config,
    faultload::{mode::FaultMode, uid::NO_IDENTITY},
    proxy::{
        collaborator::{BoxError, Forward, SyntheticInjector},
        handler::{Answer, FaultProxy, Handled},
        report::TraceReport,
    },
    reporter::{CollectItem, Report},
    trace::identity::StaticLookup,
    Error,
};
use futures_util::future::join_all;
use http::{Request, Response, StatusCode};
use std::{
    collections::LinkedList,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::oneshot, time::sleep};

const FRONTEND: Option<&str> = Some("10.0.0.1:50000");
const TRACEPARENT: &str = "00-abcd1234-span1-01";

#[derive(Default, Clone)]
struct MockReporter {
    items: Arc<Mutex<LinkedList<TraceReport>>>,
}

impl MockReporter {
    fn pop(&self) -> TraceReport {
        self.items.try_lock().unwrap().pop_back().unwrap()
    }

    fn len(&self) -> usize {
        self.items.try_lock().unwrap().len()
    }
}

impl Report for MockReporter {
    fn report(&self, item: CollectItem) {
        match item {
            CollectItem::Trace(data) => {
                self.items.try_lock().unwrap().push_back(*data);
            }
            _ => {}
        }
    }
}

#[derive(Default)]
struct Upstream {
    calls: AtomicUsize,
    traceparents: Mutex<Vec<Option<String>>>,
    tracestates: Mutex<Vec<Option<String>>>,
    delay: Option<Duration>,
    fail: bool,
}

#[async_trait]
impl Forward<Bytes> for Upstream {
    async fn forward(&self, request: Request<Bytes>) -> Result<Response<Bytes>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let traceparent = request
            .headers()
            .get("traceparent")
            .map(|value| value.to_str().unwrap().to_owned());
        self.traceparents.lock().unwrap().push(traceparent);
        let tracestate = request
            .headers()
            .get("tracestate")
            .map(|value| value.to_str().unwrap().to_owned());
        self.tracestates.lock().unwrap().push(tracestate);

        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        if self.fail {
            return Err("connection refused".into());
        }
        Ok(Response::new(Bytes::from_static(b"OK\n")))
    }
}

impl Upstream {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn proxy(config: Config, reporter: MockReporter) -> FaultProxy {
    let lookup = StaticLookup::new()
        .with_name("10.0.0.1", "frontend.shop.svc.cluster.local")
        .with_name("10.0.0.2", "orders.shop.svc.cluster.local");
    FaultProxy::new(config, lookup, SyntheticInjector, reporter)
}

fn request(path: &str, traceparent: Option<&str>) -> Request<Bytes> {
    let mut builder = Request::builder()
        .uri(format!("http://10.0.0.2:8080{}", path))
        .header("content-type", "application/json");
    if let Some(traceparent) = traceparent {
        builder = builder.header("traceparent", traceparent);
    }
    builder.body(Bytes::new()).unwrap()
}

fn faultload(signature: &str, count: Option<u64>, mode: &str) -> Vec<u8> {
    let count = count.map(|count| format!(r#", "count": {}"#, count)).unwrap_or_default();
    format!(
        r#"{{
            "trace_id": "abcd1234",
            "faults": [{{
                "uid": {{"origin": "frontend", "destination": "orders", "signature": "{}"{}}},
                "mode": {}
            }}]
        }}"#,
        signature, count, mode
    )
    .into_bytes()
}

fn response(handled: &Handled) -> &Response<Bytes> {
    match &handled.answer {
        Answer::Respond(response) => response,
        answer => panic!("expected a response, got {:?}", answer),
    }
}

#[tokio::test]
async fn forwards_unmatched_call() {
    let reporter = MockReporter::default();
    let proxy = proxy(Config::new("orders"), reporter.clone());
    let upstream = Upstream::default();
    proxy
        .register_faultload(&faultload("/other", None, r#"{"type": "abort"}"#))
        .unwrap();

    let handled = proxy
        .handle(
            request("/checkout", Some(TRACEPARENT)),
            Some("203.0.113.9:4000"),
            &upstream,
        )
        .await
        .unwrap();

    assert_eq!(response(&handled).status(), StatusCode::OK);
    assert_eq!(upstream.calls(), 1);

    let report = reporter.pop();
    assert_eq!(report, handled.report);
    assert_eq!(report.trace_id, "abcd1234");
    assert_eq!(report.parent_span_id, "span1");
    assert_eq!(report.uid.origin, "203.0.113.9");
    assert_eq!(report.uid.destination, "orders");
    assert_eq!(report.uid.signature, "/checkout");
    assert_eq!(report.uid.count, 0);
    assert!(report.is_initial);
    assert!(report.injected_fault.is_none());
    assert!(report.concurrent_to.is_empty());
    assert_eq!(report.response.status, Some(200));
    assert_eq!(report.response.body, "OK\n");
    assert!(report.response.complete);
    assert_eq!(
        upstream.traceparents.lock().unwrap()[0],
        Some(format!("00-abcd1234-{}-01", report.span_id))
    );
    assert_eq!(
        upstream.tracestates.lock().unwrap()[0],
        Some(format!("fit={}", report.span_id))
    );

    // Another request of the client enters the trace again.
    let handled = proxy
        .handle(request("/checkout", Some(TRACEPARENT)), None, &upstream)
        .await
        .unwrap();
    assert_eq!(handled.report.uid.origin, NO_IDENTITY);
    assert!(handled.report.is_initial);
}

/// Service behind a proxy calling the next proxied service. Like an
/// instrumented application it opens its own span, and passes the trace state
/// on.
struct Chained {
    next: FaultProxy,
    upstream: Upstream,
}

#[async_trait]
impl Forward<Bytes> for Chained {
    async fn forward(&self, request: Request<Bytes>) -> Result<Response<Bytes>, BoxError> {
        let mut builder = Request::builder()
            .uri("http://10.0.0.2:8080/orders")
            .header("traceparent", "00-abcd1234-00f067aa0ba902b7-01");
        if let Some(tracestate) = request.headers().get("tracestate") {
            builder = builder.header("tracestate", tracestate);
        }

        let handled = self
            .next
            .handle(builder.body(Bytes::new())?, FRONTEND, &self.upstream)
            .await?;
        match handled.answer {
            Answer::Respond(response) => Ok(response),
            _ => Err("orders unavailable".into()),
        }
    }
}

#[tokio::test]
async fn only_trace_entry_is_initial() {
    let reporter = MockReporter::default();
    let orders = proxy(Config::new("orders"), reporter.clone());
    let frontend = proxy(Config::new("frontend"), reporter.clone());
    let service = Chained {
        next: orders,
        upstream: Upstream::default(),
    };

    let entry = Request::builder()
        .uri("http://10.0.0.1:8080/checkout")
        .header("traceparent", TRACEPARENT)
        .header("tracestate", "congo=t61rcWkgMzE")
        .body(Bytes::new())
        .unwrap();
    let root = frontend
        .handle(entry, Some("203.0.113.9:4000"), &service)
        .await
        .unwrap()
        .report;

    assert_eq!(reporter.len(), 2);
    let mut reports = vec![reporter.pop(), reporter.pop()];
    reports.retain(|report| report.is_initial);
    assert_eq!(reports, vec![root.clone()]);
    assert_eq!(root.uid.signature, "/checkout");

    let forwarded = service.upstream.tracestates.lock().unwrap()[0].clone();
    let child_span = service.upstream.traceparents.lock().unwrap()[0].clone().unwrap();
    assert!(forwarded.unwrap().ends_with(",congo=t61rcWkgMzE"));
    assert!(!child_span.contains(&root.span_id));
}

#[tokio::test]
async fn injects_declared_occurrence_only() {
    let reporter = MockReporter::default();
    let proxy = proxy(Config::new("orders"), reporter.clone());
    let upstream = Upstream::default();
    proxy
        .register_faultload(&faultload(
            "/foo",
            Some(0),
            r#"{"type": "http_error", "status": 503}"#,
        ))
        .unwrap();

    let first = proxy
        .handle(request("/foo", Some(TRACEPARENT)), FRONTEND, &upstream)
        .await
        .unwrap();
    assert_eq!(response(&first).status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(upstream.calls(), 0);
    assert_eq!(first.report.uid.origin, "frontend");
    assert_eq!(first.report.uid.count, 0);
    assert_eq!(
        first.report.injected_fault.as_ref().map(|fault| &fault.mode),
        Some(&FaultMode::HttpError { status: 503 })
    );
    assert_eq!(first.report.response.status, Some(503));

    let second = proxy
        .handle(request("/foo", Some(TRACEPARENT)), FRONTEND, &upstream)
        .await
        .unwrap();
    assert_eq!(response(&second).status(), StatusCode::OK);
    assert_eq!(upstream.calls(), 1);
    assert_eq!(second.report.uid.count, 1);
    assert!(second.report.injected_fault.is_none());
    assert_eq!(reporter.len(), 2);
}

#[tokio::test]
async fn abort_reports_no_response() {
    let reporter = MockReporter::default();
    let proxy = proxy(Config::new("orders"), reporter.clone());
    let upstream = Upstream::default();
    proxy
        .register_faultload(&faultload("/foo", None, r#"{"type": "abort"}"#))
        .unwrap();

    let handled = proxy
        .handle(request("/foo", Some(TRACEPARENT)), FRONTEND, &upstream)
        .await
        .unwrap();

    assert!(matches!(handled.answer, Answer::Drop));
    assert_eq!(upstream.calls(), 0);
    let report = reporter.pop();
    assert!(report.injected_fault.is_some());
    assert_eq!(report.response.status, None);
    assert!(!report.response.complete);
    assert!(report.response.is_erroneous());
}

#[tokio::test(start_paused = true)]
async fn delay_is_overhead() {
    let reporter = MockReporter::default();
    let proxy = proxy(Config::new("orders"), reporter.clone());
    let upstream = Upstream::default();
    proxy
        .register_faultload(&faultload(
            "/foo",
            None,
            r#"{"type": "delay", "duration_ms": 200}"#,
        ))
        .unwrap();

    let handled = proxy
        .handle(request("/foo", Some(TRACEPARENT)), FRONTEND, &upstream)
        .await
        .unwrap();

    assert_eq!(response(&handled).status(), StatusCode::OK);
    assert_eq!(upstream.calls(), 1);
    assert!(handled.report.response.overhead_duration_ms >= 200.0);
    assert!(handled.report.response.duration_ms >= 200.0);
}

#[tokio::test]
async fn corrupt_mangles_forwarded_body() {
    let proxy = proxy(Config::new("orders"), MockReporter::default());
    let upstream = Upstream::default();
    proxy
        .register_faultload(&faultload("/foo", None, r#"{"type": "corrupt"}"#))
        .unwrap();

    let handled = proxy
        .handle(request("/foo", Some(TRACEPARENT)), FRONTEND, &upstream)
        .await
        .unwrap();

    let expected: Vec<u8> = b"OK\n".iter().map(|byte| !byte).collect();
    assert_eq!(response(&handled).body().as_ref(), expected.as_slice());
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn failed_forwarding_is_still_reported() {
    let reporter = MockReporter::default();
    let proxy = proxy(Config::new("orders"), reporter.clone());
    let upstream = Upstream {
        fail: true,
        ..Default::default()
    };

    let handled = proxy
        .handle(request("/checkout", Some(TRACEPARENT)), FRONTEND, &upstream)
        .await
        .unwrap();

    assert!(matches!(handled.answer, Answer::Fail(Error::Forward(_))));
    let report = reporter.pop();
    assert_eq!(report.uid.signature, "/checkout");
    assert!(!report.response.complete);
    assert_eq!(report.response.status, None);
}

#[tokio::test(start_paused = true)]
async fn slow_upstream_times_out() {
    let reporter = MockReporter::default();
    let proxy = proxy(
        Config::new("orders").with_call_timeout(Duration::from_secs(1)),
        reporter.clone(),
    );
    let upstream = Upstream {
        delay: Some(Duration::from_secs(5)),
        ..Default::default()
    };

    let handled = proxy
        .handle(request("/checkout", Some(TRACEPARENT)), FRONTEND, &upstream)
        .await
        .unwrap();

    assert!(matches!(
        handled.answer,
        Answer::Fail(Error::Timeout(timeout)) if timeout == Duration::from_secs(1)
    ));
    assert_eq!(reporter.len(), 1);
    assert!(!handled.report.response.complete);
}

#[tokio::test(start_paused = true)]
async fn overlapping_faults_are_concurrent() {
    let proxy = proxy(Config::new("orders"), MockReporter::default());
    let upstream = Upstream::default();
    proxy
        .register_faultload(&faultload(
            "*",
            None,
            r#"{"type": "delay", "duration_ms": 100}"#,
        ))
        .unwrap();

    let (a, b) = tokio::join!(
        proxy.handle(request("/a", Some(TRACEPARENT)), FRONTEND, &upstream),
        proxy.handle(request("/b", Some(TRACEPARENT)), FRONTEND, &upstream),
    );
    let (a, b) = (a.unwrap().report, b.unwrap().report);

    assert!(a.injected_fault.is_some() && b.injected_fault.is_some());
    assert_eq!(a.concurrent_to, vec![b.uid.clone()]);
    assert_eq!(b.concurrent_to, vec![a.uid.clone()]);

    let c = proxy
        .handle(request("/c", Some(TRACEPARENT)), FRONTEND, &upstream)
        .await
        .unwrap()
        .report;
    assert!(c.concurrent_to.is_empty());
}

#[tokio::test(start_paused = true)]
async fn fanout_takes_distinct_occurrences() {
    let proxy = proxy(Config::new("orders"), MockReporter::default());
    let upstream = Upstream::default();
    proxy
        .register_faultload(&faultload(
            "/fanout",
            None,
            r#"{"type": "delay", "duration_ms": 50}"#,
        ))
        .unwrap();

    let handled = join_all((0..4).map(|_| {
        proxy.handle(request("/fanout", Some(TRACEPARENT)), FRONTEND, &upstream)
    }))
    .await;

    let mut counts = Vec::new();
    for handled in handled {
        let report = handled.unwrap().report;
        assert_eq!(report.concurrent_to.len(), 3);
        assert!(!report.concurrent_to.contains(&report.uid));
        counts.push(report.uid.count);
    }
    counts.sort_unstable();
    assert_eq!(counts, [0, 1, 2, 3]);
}

#[tokio::test]
async fn control_path() {
    let proxy = proxy(Config::new("orders"), MockReporter::default());
    let upstream = Upstream::default();

    assert!(matches!(
        proxy.register_faultload(b"{\"faults\": ["),
        Err(Error::FaultloadDecode(_))
    ));
    proxy
        .register_faultload(&faultload("/other", None, r#"{"type": "abort"}"#))
        .unwrap();

    for count in 0..2 {
        let handled = proxy
            .handle(request("/x", Some(TRACEPARENT)), FRONTEND, &upstream)
            .await
            .unwrap();
        assert_eq!(handled.report.uid.count, count);
    }

    assert!(proxy.complete_trace("abcd1234"));
    assert!(proxy.registry().get("abcd1234").is_none());

    let handled = proxy
        .handle(request("/x", Some(TRACEPARENT)), FRONTEND, &upstream)
        .await
        .unwrap();
    assert_eq!(handled.report.uid.count, 0);
    assert!(handled.report.is_initial);
}

#[tokio::test]
async fn untraced_call_is_forwarded() {
    let proxy = proxy(Config::new("orders"), MockReporter::default());
    let upstream = Upstream::default();

    let handled = proxy
        .handle(request("/checkout", None), FRONTEND, &upstream)
        .await
        .unwrap();

    assert_eq!(response(&handled).status(), StatusCode::OK);
    assert_eq!(handled.report.trace_id, "");
    assert!(!handled.report.is_initial);
    assert_eq!(upstream.traceparents.lock().unwrap()[0], None);
    assert!(proxy.registry().is_empty());
}

#[tokio::test]
async fn hashed_body_and_eviction() {
    let proxy = proxy(
        Config::new("orders")
            .with_hash_body(true)
            .with_trace_ttl(Duration::ZERO),
        MockReporter::default(),
    );
    let upstream = Upstream::default();
    proxy
        .register_faultload(&faultload("/other", None, r#"{"type": "abort"}"#))
        .unwrap();

    let handled = proxy
        .handle(request("/checkout", Some(TRACEPARENT)), FRONTEND, &upstream)
        .await
        .unwrap();
    assert!(handled.report.response.body.is_empty());
    assert!(handled.report.response.body_hash.is_some());

    assert_eq!(proxy.registry().len(), 1);
    assert_eq!(proxy.counter().len(), 1);
    assert_eq!(proxy.evict_expired(), 1);
    assert!(proxy.registry().is_empty());
    assert!(proxy.counter().is_empty());
}

#[tokio::test(start_paused = true)]
async fn idle_traces_are_swept() {
    let proxy = proxy(
        Config::new("orders").with_trace_ttl(Duration::from_secs(60)),
        MockReporter::default(),
    );
    let upstream = Upstream::default();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let sweeping = proxy
        .sweeping()
        .with_period(Duration::from_secs(10))
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .spawn();

    proxy
        .register_faultload(&faultload("/other", None, r#"{"type": "abort"}"#))
        .unwrap();
    for n in 0..8 {
        let traceparent = format!("00-untracked{}-span1-01", n);
        proxy
            .handle(request("/checkout", Some(traceparent.as_str())), FRONTEND, &upstream)
            .await
            .unwrap();
    }

    // Traces without faultload get no state besides their counter key.
    assert_eq!(proxy.registry().len(), 1);
    assert_eq!(proxy.counter().len(), 8);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(proxy.counter().len(), 8);

    sleep(Duration::from_secs(60)).await;
    assert!(proxy.registry().is_empty());
    assert!(proxy.counter().is_empty());

    shutdown_tx.send(()).unwrap();
    sweeping.await.unwrap();
}
