// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use bytestring::ByteString;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use restate_sdk_types::errors::{Code, Error};
use restate_sdk_types::journal::InvokeRequest;
use restate_sdk_types::retries::RetryPolicy;
use restate_sdk_types::time::MillisSinceEpoch;

use crate::handler::RpcRequestRef;

/// Journaled operations, as the machine exposes them to the context.
pub(crate) trait StateMachine {
    fn set(&self, key: Bytes, value: Bytes) -> Result<(), Error>;
    fn clear(&self, key: Bytes) -> Result<(), Error>;
    fn clear_all(&self) -> Result<(), Error>;
    fn get(&self, key: Bytes) -> Result<Option<Bytes>, Error>;
    fn state_keys(&self) -> Result<Vec<ByteString>, Error>;
    fn sleep_until(&self, wake_up_time: MillisSinceEpoch) -> Result<(), Error>;
    fn side_effect(
        &self,
        closure: &mut dyn FnMut() -> Result<Bytes, Error>,
        retry_policy: RetryPolicy,
    ) -> Result<Bytes, Error>;
    fn invoke(&self, request: InvokeRequest) -> Result<Bytes, Error>;
    fn background_invoke(
        &self,
        request: InvokeRequest,
        invoke_time: Option<MillisSinceEpoch>,
    ) -> Result<(), Error>;
}

/// The handler-facing façade over the journaled operations. One context
/// per invocation, never shared across invocations.
///
/// All operations go through the journal: on replay they return the
/// recorded result, on first execution they are recorded before the
/// handler observes their result. Between any two blocking operations the
/// invocation may have been suspended and resumed in a different process.
pub struct Context<'a> {
    machine: &'a dyn StateMachine,
    cancellation: CancellationToken,
}

impl<'a> Context<'a> {
    pub(crate) fn new(machine: &'a dyn StateMachine, cancellation: CancellationToken) -> Self {
        Self {
            machine,
            cancellation,
        }
    }

    /// Cancellation handle of the surrounding process, for handler code
    /// that wants to observe shutdown. The machine itself does not
    /// interpret it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Stores a state value.
    pub fn set(&self, key: &str, value: impl Into<Bytes>) -> Result<(), Error> {
        self.machine.set(copy_key(key), value.into())
    }

    /// Gets the state value associated with `key`, `None` if the key is
    /// not set.
    pub fn get(&self, key: &str) -> Result<Option<Bytes>, Error> {
        self.machine.get(copy_key(key))
    }

    /// Deletes a key.
    pub fn clear(&self, key: &str) -> Result<(), Error> {
        self.machine.clear(copy_key(key))
    }

    /// Drops all stored state of the invocation target.
    pub fn clear_all(&self) -> Result<(), Error> {
        self.machine.clear_all()
    }

    /// Lists the stored state keys.
    pub fn state_keys(&self) -> Result<Vec<ByteString>, Error> {
        self.machine.state_keys()
    }

    /// Sleeps for the given duration through the runtime's durable timer.
    pub fn sleep(&self, duration: Duration) -> Result<(), Error> {
        self.sleep_until(SystemTime::now() + duration)
    }

    /// Sleeps until the given point in time through the runtime's durable
    /// timer.
    pub fn sleep_until(&self, until: SystemTime) -> Result<(), Error> {
        self.machine.sleep_until(MillisSinceEpoch::from(until))
    }

    /// Runs a closure whose result is recorded in the journal: on replay
    /// the recorded result is returned and the closure is not executed
    /// again. Non-terminal failures of the closure are retried locally
    /// with the default retry policy.
    pub fn side_effect(
        &self,
        mut closure: impl FnMut() -> Result<Bytes, Error>,
    ) -> Result<Bytes, Error> {
        self.machine
            .side_effect(&mut closure, crate::default_side_effect_retry_policy())
    }

    /// As [`Context::side_effect`], with an explicit retry policy for
    /// non-terminal failures of the closure.
    pub fn side_effect_with_retry(
        &self,
        mut closure: impl FnMut() -> Result<Bytes, Error>,
        retry_policy: RetryPolicy,
    ) -> Result<Bytes, Error> {
        self.machine.side_effect(&mut closure, retry_policy)
    }

    /// Entry point for calling another service.
    pub fn service(&self, service: impl Into<ByteString>) -> ServiceClient<'_> {
        ServiceClient {
            ctx: self,
            service: service.into(),
        }
    }
}

fn copy_key(key: &str) -> Bytes {
    Bytes::copy_from_slice(key.as_bytes())
}

/// Proxy to a remote service.
pub struct ServiceClient<'a> {
    ctx: &'a Context<'a>,
    service: ByteString,
}

impl ServiceClient<'_> {
    /// Creates a call to a method of this service.
    pub fn method(&self, method: impl Into<ByteString>) -> MethodClient<'_> {
        MethodClient {
            ctx: self.ctx,
            service: self.service.clone(),
            method: method.into(),
        }
    }
}

/// Proxy to a method of a remote service.
pub struct MethodClient<'a> {
    ctx: &'a Context<'a>,
    service: ByteString,
    method: ByteString,
}

impl MethodClient<'_> {
    /// Makes the call and waits for the response. A failure of the callee
    /// surfaces with the callee's code and message.
    pub fn call(&self, key: &str, body: &impl Serialize) -> Result<Bytes, Error> {
        let parameter = encode_request(key, body)?;
        self.ctx.machine.invoke(InvokeRequest::new(
            self.service.clone(),
            self.method.clone(),
            parameter,
        ))
    }

    /// Runs the call in the background, optionally after a delay. Returns
    /// as soon as the call is journaled.
    pub fn send(&self, key: &str, body: &impl Serialize, delay: Option<Duration>) -> Result<(), Error> {
        let parameter = encode_request(key, body)?;
        let invoke_time = delay.map(|d| MillisSinceEpoch::from(SystemTime::now() + d));
        self.ctx.machine.background_invoke(
            InvokeRequest::new(self.service.clone(), self.method.clone(), parameter),
            invoke_time,
        )
    }
}

fn encode_request(key: &str, body: &impl Serialize) -> Result<Bytes, Error> {
    serde_json::to_vec(&RpcRequestRef { key, request: body })
        .map(Bytes::from)
        .map_err(|e| {
            Error::terminal(
                Code::InvalidArgument,
                format!("cannot serialize request: {e}"),
            )
        })
}
