// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The invocation core of the Restate Rust SDK: the per-invocation state
//! machine that journals every effect of a handler through the service
//! protocol, replays recorded effects deterministically, and suspends the
//! invocation when a result is not available yet.

mod context;
mod error;
mod handler;
mod machine;
mod suspend;

pub use context::{Context, MethodClient, ServiceClient};
pub use error::MachineError;
pub use handler::{Handler, KeyedHandler, KeyedRouter, Router, UnKeyedHandler, UnKeyedRouter};
pub use machine::Machine;

pub use restate_sdk_types::errors::{Code, Error};
pub use restate_sdk_types::retries::RetryPolicy;

use std::time::Duration;

/// Retry policy applied to side effect closures when none is given:
/// exponential from 50 ms, doubling up to 10 s, at most 10 attempts. A
/// side effect that cannot reach a durable outcome within these bounds
/// yields the invocation back to the runtime.
pub fn default_side_effect_retry_policy() -> RetryPolicy {
    RetryPolicy::exponential(
        Duration::from_millis(50),
        2.0,
        Some(10),
        Some(Duration::from_secs(10)),
    )
}
