// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A Restate journal is represented by entries, each of them recording a
//! specific action taken by the user code.

mod entries;
pub mod raw;

pub use entries::*;

use bytes::Bytes;
use bytestring::ByteString;

use crate::errors::Code;

/// Index of an entry in the journal. The input entry is at index 0.
pub type EntryIndex = u32;
