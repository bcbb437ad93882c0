// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Raw entries carry the serialized payload next to a parsed header. The
//! replay prefix is stored raw and only deserialized when the matching
//! operation replays it.

use super::*;

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    header: RawEntryHeader,
    entry: Bytes,
}

impl RawEntry {
    pub fn new(header: RawEntryHeader, entry: impl Into<Bytes>) -> Self {
        Self {
            header,
            entry: entry.into(),
        }
    }

    pub fn header(&self) -> &RawEntryHeader {
        &self.header
    }

    pub fn ty(&self) -> EntryType {
        self.header.as_entry_type()
    }

    pub fn serialized_entry(&self) -> &Bytes {
        &self.entry
    }

    pub fn into_inner(self) -> (RawEntryHeader, Bytes) {
        (self.header, self.entry)
    }

    pub fn deserialize_entry<Codec: RawEntryCodec>(&self) -> Result<Entry, RawEntryCodecError> {
        Codec::deserialize(self.ty(), self.entry.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEntryHeader {
    PollInputStream { is_completed: bool },
    OutputStream,
    GetState { is_completed: bool },
    SetState,
    ClearState,
    GetStateKeys { is_completed: bool },
    ClearAllState,
    Sleep { is_completed: bool },
    Invoke { is_completed: bool },
    BackgroundInvoke,
    SideEffect,
    Awakeable { is_completed: bool },
    CompleteAwakeable,
    Custom { code: u16, requires_ack: bool },
}

impl RawEntryHeader {
    pub fn as_entry_type(&self) -> EntryType {
        match self {
            RawEntryHeader::PollInputStream { .. } => EntryType::PollInputStream,
            RawEntryHeader::OutputStream => EntryType::OutputStream,
            RawEntryHeader::GetState { .. } => EntryType::GetState,
            RawEntryHeader::SetState => EntryType::SetState,
            RawEntryHeader::ClearState => EntryType::ClearState,
            RawEntryHeader::GetStateKeys { .. } => EntryType::GetStateKeys,
            RawEntryHeader::ClearAllState => EntryType::ClearAllState,
            RawEntryHeader::Sleep { .. } => EntryType::Sleep,
            RawEntryHeader::Invoke { .. } => EntryType::Invoke,
            RawEntryHeader::BackgroundInvoke => EntryType::BackgroundInvoke,
            RawEntryHeader::SideEffect => EntryType::SideEffect,
            RawEntryHeader::Awakeable { .. } => EntryType::Awakeable,
            RawEntryHeader::CompleteAwakeable => EntryType::CompleteAwakeable,
            RawEntryHeader::Custom { .. } => EntryType::Custom,
        }
    }

    pub fn is_completed(&self) -> Option<bool> {
        match self {
            RawEntryHeader::PollInputStream { is_completed }
            | RawEntryHeader::GetState { is_completed }
            | RawEntryHeader::GetStateKeys { is_completed }
            | RawEntryHeader::Sleep { is_completed }
            | RawEntryHeader::Invoke { is_completed }
            | RawEntryHeader::Awakeable { is_completed } => Some(*is_completed),
            _ => None,
        }
    }
}

/// Codec between raw entry payloads and the [`Entry`] model.
pub trait RawEntryCodec {
    fn serialize(entry: Entry) -> RawEntry;

    fn deserialize(entry_type: EntryType, entry_value: Bytes)
        -> Result<Entry, RawEntryCodecError>;
}

#[derive(Debug, thiserror::Error)]
#[error("failed to decode {entry_type:?} entry: {kind}")]
pub struct RawEntryCodecError {
    entry_type: EntryType,
    kind: ErrorKind,
}

impl RawEntryCodecError {
    pub fn new(entry_type: EntryType, kind: ErrorKind) -> Self {
        Self { entry_type, kind }
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("decode error: {source}")]
    Decode {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("missing field '{0}'")]
    MissingField(&'static str),
}

impl fmt::Display for RawEntryHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.as_entry_type(), f)
    }
}
