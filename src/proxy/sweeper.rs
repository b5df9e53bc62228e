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

//! Background expiry of idle trace state.

use crate::proxy::handler::FaultProxy;
use std::{
    future::{pending, Future},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    select,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::debug;

const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Handle of [FaultProxy::sweeping], runs [FaultProxy::evict_expired]
/// periodically.
pub struct Sweeping {
    proxy: FaultProxy,
    period: Duration,
    shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send + Sync + 'static>>,
}

impl Sweeping {
    pub(crate) fn new(proxy: FaultProxy) -> Self {
        let period = (proxy.config().trace_ttl() / 2).max(MIN_PERIOD);
        Self {
            proxy,
            period,
            shutdown_signal: Box::pin(pending()),
        }
    }

    /// Quit when shutdown_signal received.
    pub fn with_graceful_shutdown(
        mut self,
        shutdown_signal: impl Future<Output = ()> + Send + Sync + 'static,
    ) -> Self {
        self.shutdown_signal = Box::pin(shutdown_signal);
        self
    }

    /// Sweep this often, defaults to half the trace ttl and at least 1s.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period.max(Duration::from_millis(1));
        self
    }

    /// Spawn the sweeping in background.
    pub fn spawn(self) -> SweepingJoinHandle {
        SweepingJoinHandle {
            handle: tokio::spawn(self.start()),
        }
    }

    async fn start(self) -> crate::Result<()> {
        let Sweeping {
            proxy,
            period,
            mut shutdown_signal,
        } = self;

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticker.tick() => {
                    proxy.evict_expired();
                }
                _ = &mut shutdown_signal => break,
            }
        }

        debug!("sweeping stopped");
        Ok(())
    }
}

/// Handle of [Sweeping::spawn].
pub struct SweepingJoinHandle {
    handle: JoinHandle<crate::Result<()>>,
}

impl Future for SweepingJoinHandle {
    type Output = crate::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|rs| rs?)
    }
}
