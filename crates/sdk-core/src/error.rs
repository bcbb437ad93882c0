// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use restate_sdk_protocol::message::MessageType;
use restate_sdk_protocol::stream::ProtocolError;
use restate_sdk_types::journal::raw::RawEntryCodecError;
use restate_sdk_types::journal::{EntryIndex, EntryType};

/// Fatal conditions of an invocation session. These occur below the
/// handler's abstraction: the session ends with a retryable error and the
/// runtime reinvokes with the journal prefix.
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("unexpected message {0:?}")]
    UnexpectedMessage(MessageType),
    #[error("unsupported protocol version {0}")]
    InvalidVersion(u16),
    #[error(
        "journal mismatch at index {entry_index}: the handler issued {expected}, the journal contains {actual}"
    )]
    JournalMismatch {
        entry_index: EntryIndex,
        expected: EntryType,
        actual: EntryType,
    },
    #[error("expected completion for entry {expected}, received completion for entry {actual}")]
    CompletionMismatch {
        expected: EntryIndex,
        actual: EntryIndex,
    },
    #[error(
        "expected acknowledgment for entry {expected}, received acknowledgment for entry {actual}"
    )]
    AckMismatch {
        expected: EntryIndex,
        actual: EntryIndex,
    },
    #[error("cannot decode completion payload: {0}")]
    CompletionDecode(#[from] prost::DecodeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    EntryCodec(#[from] RawEntryCodecError),
}
