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

//! Seams towards the transport and towards fault execution.

use crate::{
    faultload::{mode::FaultMode, Fault},
    trace::identity::RequestMetadata,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Response, StatusCode};
use std::{error::Error, ops::Deref, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::warn;

/// Boxed transport error.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Sends a call downstream. Implemented by the transport.
#[async_trait]
pub trait Forward<B: Send + 'static>: Send + Sync {
    /// Forward `request` unmodified, apart from the rewritten `traceparent`.
    async fn forward(&self, request: http::Request<B>) -> Result<Response<Bytes>, BoxError>;
}

#[async_trait]
impl<B: Send + 'static, T: Forward<B> + ?Sized> Forward<B> for Arc<T> {
    async fn forward(&self, request: http::Request<B>) -> Result<Response<Bytes>, BoxError> {
        Forward::forward(self.deref(), request).await
    }
}

/// What happens to a call after its fault was carried out.
#[derive(Debug)]
pub enum Injection {
    /// Answer with this instead of forwarding.
    Respond(Response<Bytes>),
    /// Forward after all; [Inject::tamper] gets to see the answer.
    Forward,
    /// Never answer.
    Drop,
}

/// Carries out faults.
#[async_trait]
pub trait Inject: Send + Sync {
    /// Run `fault` for the call, before anything is forwarded.
    async fn inject(&self, fault: &Fault, metadata: &RequestMetadata) -> Injection;

    /// Rewrite the forwarded answer of a call whose fault asked for
    /// [Injection::Forward].
    fn tamper(&self, _fault: &Fault, _response: &mut Response<Bytes>) {}
}

#[async_trait]
impl<T: Inject + ?Sized> Inject for Box<T> {
    async fn inject(&self, fault: &Fault, metadata: &RequestMetadata) -> Injection {
        Inject::inject(self.deref(), fault, metadata).await
    }

    fn tamper(&self, fault: &Fault, response: &mut Response<Bytes>) {
        Inject::tamper(self.deref(), fault, response)
    }
}

#[async_trait]
impl<T: Inject + ?Sized> Inject for Arc<T> {
    async fn inject(&self, fault: &Fault, metadata: &RequestMetadata) -> Injection {
        Inject::inject(self.deref(), fault, metadata).await
    }

    fn tamper(&self, fault: &Fault, response: &mut Response<Bytes>) {
        Inject::tamper(self.deref(), fault, response)
    }
}

/// Carries out every built in [FaultMode] in process.
///
/// `custom` faults are not understood and the call is forwarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticInjector;

#[async_trait]
impl Inject for SyntheticInjector {
    async fn inject(&self, fault: &Fault, metadata: &RequestMetadata) -> Injection {
        match &fault.mode {
            FaultMode::Delay { duration_ms } => {
                sleep(Duration::from_millis(*duration_ms)).await;
                Injection::Forward
            }
            FaultMode::HttpError { status } => {
                let status = StatusCode::from_u16(*status).unwrap_or_else(|_| {
                    warn!(status, uid = %metadata.uid, "invalid status in fault");
                    StatusCode::INTERNAL_SERVER_ERROR
                });
                let body = Bytes::from(status.canonical_reason().unwrap_or_default());
                let mut response = Response::new(body);
                *response.status_mut() = status;
                Injection::Respond(response)
            }
            FaultMode::Abort => Injection::Drop,
            FaultMode::Corrupt => Injection::Forward,
            FaultMode::Custom { .. } => {
                warn!(uid = %metadata.uid, "custom fault needs a custom injector, forwarding");
                Injection::Forward
            }
        }
    }

    fn tamper(&self, fault: &Fault, response: &mut Response<Bytes>) {
        if let FaultMode::Corrupt = fault.mode {
            let corrupted: Vec<u8> = response.body().iter().map(|byte| !byte).collect();
            *response.body_mut() = Bytes::from(corrupted);
        }
    }
}
