// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Shared types of the Restate Rust SDK: journal entries and completions,
//! user-facing error codes and retry policies.

pub mod errors;
pub mod journal;
pub mod retries;
pub mod time;
