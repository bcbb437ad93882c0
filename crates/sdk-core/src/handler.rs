// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use restate_sdk_types::errors::{Code, Error};

use crate::context::Context;

/// A registered invocation handler. The input is the raw invocation
/// argument; the returned bytes become the invocation result verbatim.
pub trait Handler {
    fn call(&self, ctx: &Context<'_>, input: Bytes) -> Result<Bytes, Error>;
}

impl<H: Handler + ?Sized> Handler for &H {
    fn call(&self, ctx: &Context<'_>, input: Bytes) -> Result<Bytes, Error> {
        (**self).call(ctx, input)
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn call(&self, ctx: &Context<'_>, input: Bytes) -> Result<Bytes, Error> {
        (**self).call(ctx, input)
    }
}

/// Request envelope of the service proxy: the target key plus the actual
/// argument. Un-keyed services carry an empty key.
#[derive(Serialize)]
pub(crate) struct RpcRequestRef<'a, T: ?Sized> {
    pub(crate) key: &'a str,
    pub(crate) request: &'a T,
}

#[derive(Deserialize)]
struct RpcRequest<I> {
    #[serde(default)]
    key: String,
    request: I,
}

/// Adapter from a typed `fn(ctx, input) -> output` to a [`Handler`],
/// mapping the argument and the return value through JSON. Decode
/// failures of the argument are terminal: retrying cannot fix a malformed
/// request.
pub struct UnKeyedHandler<F, I, O> {
    handler_fn: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<F, I, O> UnKeyedHandler<F, I, O> {
    pub fn new(handler_fn: F) -> Self {
        Self {
            handler_fn,
            _marker: PhantomData,
        }
    }
}

impl<F, I, O> Handler for UnKeyedHandler<F, I, O>
where
    F: Fn(&Context<'_>, I) -> Result<O, Error>,
    I: DeserializeOwned,
    O: Serialize,
{
    fn call(&self, ctx: &Context<'_>, input: Bytes) -> Result<Bytes, Error> {
        let request: RpcRequest<I> = decode_request(&input)?;
        let output = (self.handler_fn)(ctx, request.request)?;
        encode_response(&output)
    }
}

/// As [`UnKeyedHandler`], for handlers of keyed services: the key of the
/// request envelope is handed to the handler.
pub struct KeyedHandler<F, I, O> {
    handler_fn: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<F, I, O> KeyedHandler<F, I, O> {
    pub fn new(handler_fn: F) -> Self {
        Self {
            handler_fn,
            _marker: PhantomData,
        }
    }
}

impl<F, I, O> Handler for KeyedHandler<F, I, O>
where
    F: Fn(&Context<'_>, String, I) -> Result<O, Error>,
    I: DeserializeOwned,
    O: Serialize,
{
    fn call(&self, ctx: &Context<'_>, input: Bytes) -> Result<Bytes, Error> {
        let request: RpcRequest<I> = decode_request(&input)?;
        let output = (self.handler_fn)(ctx, request.key, request.request)?;
        encode_response(&output)
    }
}

fn decode_request<I: DeserializeOwned>(input: &[u8]) -> Result<RpcRequest<I>, Error> {
    serde_json::from_slice(input).map_err(|e| {
        Error::terminal(
            Code::InvalidArgument,
            format!("cannot decode request: {e}"),
        )
    })
}

fn encode_response<O: Serialize>(output: &O) -> Result<Bytes, Error> {
    serde_json::to_vec(output)
        .map(Bytes::from)
        .map_err(|e| Error::internal(format!("cannot serialize response: {e}")))
}

/// Named handlers of one service.
pub trait Router {
    /// Whether invocations of this service are keyed by the request
    /// envelope's key.
    fn is_keyed(&self) -> bool;

    fn resolve(&self, name: &str) -> Option<&(dyn Handler + Send + Sync)>;
}

#[derive(Default)]
pub struct UnKeyedRouter {
    handlers: HashMap<String, Box<dyn Handler + Send + Sync>>,
}

impl UnKeyedRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(
        mut self,
        name: impl Into<String>,
        handler: impl Handler + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }
}

impl Router for UnKeyedRouter {
    fn is_keyed(&self) -> bool {
        false
    }

    fn resolve(&self, name: &str) -> Option<&(dyn Handler + Send + Sync)> {
        self.handlers.get(name).map(|h| h.as_ref())
    }
}

#[derive(Default)]
pub struct KeyedRouter {
    handlers: HashMap<String, Box<dyn Handler + Send + Sync>>,
}

impl KeyedRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(
        mut self,
        name: impl Into<String>,
        handler: impl Handler + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }
}

impl Router for KeyedRouter {
    fn is_keyed(&self) -> bool {
        true
    }

    fn resolve(&self, name: &str) -> Option<&(dyn Handler + Send + Sync)> {
        self.handlers.get(name).map(|h| h.as_ref())
    }
}
