// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//
use async_trait::async_trait;
use bytes::Bytes;
use fit_proxy::{
    config::Config,
    proxy::{
        collaborator::{BoxError, Forward, SyntheticInjector},
        handler::{Answer, FaultProxy},
        report::TraceReport,
    },
    reporter::{channel::ChannelReporter, print::PrintReporter, Report},
    trace::identity::StaticLookup,
};
use http::{Request, Response, StatusCode};
use std::{error::Error, path::PathBuf};
use structopt::StructOpt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

static CLIENT_ADDR: &str = "192.0.2.10:40000";
static FRONTEND_ADDR: &str = "10.0.0.1:43210";

static DEFAULT_FAULTLOAD: &str = r#"{
    "trace_id": "4bf92f3577b34da6a3ce929d0e0e4736",
    "faults": [
        {
            "uid": {"origin": "frontend", "destination": "orders", "signature": "/orders/create", "count": 0},
            "mode": {"type": "http_error", "status": 503}
        },
        {
            "uid": {"origin": "frontend", "destination": "orders", "signature": "/orders/create", "count": 2},
            "mode": {"type": "delay", "duration_ms": 250}
        }
    ]
}"#;

/// Terminal service, places orders.
struct Orders;

#[async_trait]
impl Forward<Bytes> for Orders {
    async fn forward(&self, request: Request<Bytes>) -> Result<Response<Bytes>, BoxError> {
        info!(path = request.uri().path(), "orders: placing order");
        Ok(Response::new(Bytes::from_static(b"{\"order\": \"placed\"}")))
    }
}

/// Entry service, calls orders through its proxy.
struct Frontend {
    orders: FaultProxy,
}

#[async_trait]
impl Forward<Bytes> for Frontend {
    async fn forward(&self, request: Request<Bytes>) -> Result<Response<Bytes>, BoxError> {
        let mut builder = Request::builder()
            .uri("http://10.0.0.2:8080/orders/create")
            .header("content-type", "application/json");
        for key in ["traceparent", "tracestate"] {
            if let Some(value) = request.headers().get(key) {
                builder = builder.header(key, value);
            }
        }
        let call = builder.body(Bytes::new())?;

        let handled = self.orders.handle(call, Some(FRONTEND_ADDR), &Orders).await?;
        let (status, body) = match handled.answer {
            Answer::Respond(response) if response.status().is_success() => {
                (StatusCode::OK, "checkout done".to_owned())
            }
            Answer::Respond(response) => (
                StatusCode::BAD_GATEWAY,
                format!("orders answered {}", response.status()),
            ),
            Answer::Drop => (StatusCode::BAD_GATEWAY, "orders hung up".to_owned()),
            Answer::Fail(err) => (StatusCode::GATEWAY_TIMEOUT, err.to_string()),
        };

        Ok(Response::builder().status(status).body(Bytes::from(body))?)
    }
}

#[derive(StructOpt)]
#[structopt(name = "fit-e2e")]
struct Opt {
    /// Faultload document to register, a built-in one when absent.
    #[structopt(short, long, parse(from_os_str))]
    faultload: Option<PathBuf>,

    /// Number of checkouts sent within the trace.
    #[structopt(short, long, default_value = "3")]
    requests: usize,

    /// Print reports as they happen instead of collecting them.
    #[structopt(long)]
    stream: bool,
}

fn proxies(reporter: impl Report + Clone + Send + Sync + 'static) -> (FaultProxy, FaultProxy) {
    let lookup = StaticLookup::new()
        .with_name("10.0.0.1", "frontend.shop.svc.cluster.local")
        .with_name("10.0.0.2", "orders.shop.svc.cluster.local");
    let frontend = FaultProxy::new(
        Config::new("frontend"),
        lookup.clone(),
        SyntheticInjector,
        reporter.clone(),
    );
    let orders = FaultProxy::new(Config::new("orders"), lookup, SyntheticInjector, reporter);
    (frontend, orders)
}

async fn run(
    frontend: &FaultProxy,
    orders: &FaultProxy,
    faultload: &[u8],
    requests: usize,
) -> Result<(), Box<dyn Error>> {
    let trace_id = frontend.register_faultload(faultload)?.trace_id().to_owned();
    orders.register_faultload(faultload)?;

    let service = Frontend {
        orders: orders.clone(),
    };
    for n in 0..requests {
        let request = Request::builder()
            .uri("http://10.0.0.1:8080/checkout")
            .header("traceparent", format!("00-{}-{:016x}-01", trace_id, n + 1))
            .body(Bytes::new())?;

        let handled = frontend.handle(request, Some(CLIENT_ADDR), &service).await?;
        match handled.answer {
            Answer::Respond(response) => info!(n, status = %response.status(), "checkout"),
            Answer::Drop => warn!(n, "checkout dropped"),
            Answer::Fail(err) => warn!(n, %err, "checkout failed"),
        }
    }

    frontend.complete_trace(&trace_id);
    orders.complete_trace(&trace_id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opt = Opt::from_args();
    let faultload = match &opt.faultload {
        Some(path) => tokio::fs::read(path).await?,
        None => DEFAULT_FAULTLOAD.as_bytes().to_vec(),
    };

    if opt.stream {
        let (frontend, orders) = proxies(PrintReporter::new());
        return run(&frontend, &orders, &faultload, opt.requests).await;
    }

    let reporter = ChannelReporter::new();
    let (collected_tx, mut collected_rx) = mpsc::unbounded_channel::<TraceReport>();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let reporting = reporter
        .reporting(collected_tx)?
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .spawn();

    let (frontend, orders) = proxies(reporter);
    let mut sweepings = Vec::new();
    for proxy in [&frontend, &orders] {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = proxy
            .sweeping()
            .with_graceful_shutdown(async move {
                stop_rx.await.ok();
            })
            .spawn();
        sweepings.push((stop_tx, handle));
    }
    run(&frontend, &orders, &faultload, opt.requests).await?;

    for (stop_tx, handle) in sweepings {
        stop_tx.send(()).ok();
        handle.await?;
    }

    shutdown_tx.send(()).ok();
    reporting.await?;

    while let Ok(report) = collected_rx.try_recv() {
        println!("{}", serde_json::to_string(&report)?);
    }

    Ok(())
}
