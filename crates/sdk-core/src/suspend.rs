// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The sentinel unwound through the handler stack to end a session early.
//! Handler stack frames are never resumed after the sentinel is thrown;
//! the next session reconstructs them by replay.

use std::panic::resume_unwind;

use restate_sdk_types::journal::EntryIndex;

use crate::error::MachineError;

pub(crate) enum Unwind {
    /// The operation at this journal index has no completion yet; the
    /// session ends with a suspension and is resumed by the runtime once
    /// the completion is available.
    Suspend(EntryIndex),
    /// The session is broken below the handler's abstraction (protocol
    /// failure or journal mismatch) and ends with a retryable error.
    Abort(MachineError),
}

/// Unwinds the handler stack to suspend the invocation on the given entry.
///
/// `resume_unwind` rather than `panic_any`: this is control flow, the
/// panic hook must not fire.
pub(crate) fn suspend(entry_index: EntryIndex) -> ! {
    resume_unwind(Box::new(Unwind::Suspend(entry_index)))
}

/// Unwinds the handler stack to fail the invocation with a retryable
/// error the handler is not allowed to observe.
pub(crate) fn abort(error: MachineError) -> ! {
    resume_unwind(Box::new(Unwind::Abort(error)))
}
