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

//! Queueing implementation of [Report], delivering reports in batches to a
//! [Collect] sink from a background task.

use crate::{
    proxy::report::TraceReport,
    reporter::{CollectItem, Report},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    error::Error,
    future::{pending, Future},
    mem::take,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    select,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::error;

type DynErrHandler = dyn Fn(&str, &dyn Error) + Send + Sync + 'static;

fn default_err_handle(message: &str, err: &dyn Error) {
    error!(?err, "{}", message);
}

/// Destination of reports, e.g. the trace analysis service.
#[async_trait]
pub trait Collect: Send + 'static {
    /// Deliver a batch of reports.
    async fn collect(
        &mut self,
        reports: Vec<TraceReport>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

#[async_trait]
impl Collect for UnboundedSender<TraceReport> {
    async fn collect(
        &mut self,
        reports: Vec<TraceReport>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        for report in reports {
            self.send(report)?;
        }
        Ok(())
    }
}

struct State {
    is_closing: AtomicBool,
}

impl State {
    fn is_closing(&self) -> bool {
        self.is_closing.load(Ordering::Relaxed)
    }
}

/// Reporter queueing reports for a background [Reporting] task.
pub struct ChannelReporter {
    state: Arc<State>,
    sender: UnboundedSender<CollectItem>,
    receiver: Arc<Mutex<Option<UnboundedReceiver<CollectItem>>>>,
    err_handle: Arc<DynErrHandler>,
}

impl Default for ChannelReporter {
    fn default() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(State {
                is_closing: Default::default(),
            }),
            sender,
            receiver: Arc::new(Mutex::new(Some(receiver))),
            err_handle: Arc::new(default_err_handle),
        }
    }
}

impl Clone for ChannelReporter {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            err_handle: self.err_handle.clone(),
        }
    }
}

impl ChannelReporter {
    /// New reporter, nothing is delivered until [ChannelReporter::reporting]
    /// is spawned.
    #[inline]
    pub fn new() -> Self {
        Default::default()
    }

    /// Set error handle. By default, errors are logged.
    pub fn with_err_handle(
        mut self,
        handle: impl Fn(&str, &dyn Error) + Send + Sync + 'static,
    ) -> Self {
        self.err_handle = Arc::new(handle);
        self
    }

    /// Build the delivery task towards `collector`. Only the first call gets
    /// the queue, later calls fail.
    pub fn reporting<S: Collect>(&self, collector: S) -> crate::Result<Reporting<S>> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| crate::Error::Other("reporting already started".into()))?;

        Ok(Reporting {
            state: self.state.clone(),
            receiver,
            collector,
            err_handle: self.err_handle.clone(),
            batch_size: 64,
            flush_interval: Duration::from_secs(1),
            shutdown_signal: Box::pin(pending()),
        })
    }
}

impl Report for ChannelReporter {
    fn report(&self, item: CollectItem) {
        if !self.state.is_closing() {
            if let Err(e) = self.sender.send(item) {
                (self.err_handle)("report collect item failed", &e);
            }
        }
    }
}

/// Handle of [ChannelReporter::reporting].
pub struct Reporting<S> {
    state: Arc<State>,
    receiver: UnboundedReceiver<CollectItem>,
    collector: S,
    err_handle: Arc<DynErrHandler>,
    batch_size: usize,
    flush_interval: Duration,
    shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send + Sync + 'static>>,
}

impl<S: Collect> Reporting<S> {
    /// Quit when shutdown_signal received, delivering what is queued.
    pub fn with_graceful_shutdown(
        mut self,
        shutdown_signal: impl Future<Output = ()> + Send + Sync + 'static,
    ) -> Self {
        self.shutdown_signal = Box::pin(shutdown_signal);
        self
    }

    /// Deliver once this many reports are queued, defaults to 64.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Deliver queued reports at least this often, defaults to 1s.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Spawn the reporting in background.
    pub fn spawn(self) -> ReportingJoinHandle {
        ReportingJoinHandle {
            handle: tokio::spawn(self.start()),
        }
    }

    async fn start(self) -> crate::Result<()> {
        let Reporting {
            state,
            mut receiver,
            mut collector,
            err_handle,
            batch_size,
            flush_interval,
            mut shutdown_signal,
        } = self;

        let mut batch = Vec::with_capacity(batch_size);
        let mut ticker = interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                item = receiver.recv() => {
                    match item {
                        Some(CollectItem::Trace(report)) => {
                            batch.push(*report);
                            if batch.len() >= batch_size {
                                deliver(&mut collector, &mut batch, &*err_handle).await;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    deliver(&mut collector, &mut batch, &*err_handle).await;
                }
                _ = &mut shutdown_signal => break,
            }
        }

        state.is_closing.store(true, Ordering::Relaxed);

        // Flush.
        while let Ok(CollectItem::Trace(report)) = receiver.try_recv() {
            batch.push(*report);
        }
        deliver(&mut collector, &mut batch, &*err_handle).await;

        Ok(())
    }
}

async fn deliver<S: Collect>(
    collector: &mut S,
    batch: &mut Vec<TraceReport>,
    err_handle: &DynErrHandler,
) {
    if batch.is_empty() {
        return;
    }
    if let Err(err) = collector.collect(take(batch)).await {
        err_handle("deliver trace reports failed", &*err);
    }
}

/// Handle of [Reporting::spawn].
pub struct ReportingJoinHandle {
    handle: JoinHandle<crate::Result<()>>,
}

impl Future for ReportingJoinHandle {
    type Output = crate::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|rs| rs?)
    }
}
