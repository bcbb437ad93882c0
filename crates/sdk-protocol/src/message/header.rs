// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use restate_sdk_types::journal::EntryType;

const CUSTOM_MESSAGE_MASK: u16 = 0xFC00;
const VERSION_MASK: u64 = 0xFFFF_0000_0000;
const COMPLETED_MASK: u64 = 0x0001_0000_0000;
const REQUIRES_ACK_MASK: u64 = 0x8000_0000_0000;

type MessageTypeId = u16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Core,
    IO,
    State,
    Syscall,
    CustomEntry,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageType {
    Start,
    Completion,
    Suspension,
    Error,
    EntryAck,
    End,
    PollInputStreamEntry,
    OutputStreamEntry,
    GetStateEntry,
    SetStateEntry,
    ClearStateEntry,
    ClearAllStateEntry,
    GetStateKeysEntry,
    SleepEntry,
    InvokeEntry,
    BackgroundInvokeEntry,
    AwakeableEntry,
    CompleteAwakeableEntry,
    SideEffectEntry,
    CustomEntry(u16),
}

impl MessageType {
    fn kind(&self) -> MessageKind {
        match self {
            MessageType::Start
            | MessageType::Completion
            | MessageType::Suspension
            | MessageType::Error
            | MessageType::EntryAck
            | MessageType::End => MessageKind::Core,
            MessageType::PollInputStreamEntry | MessageType::OutputStreamEntry => MessageKind::IO,
            MessageType::GetStateEntry
            | MessageType::SetStateEntry
            | MessageType::ClearStateEntry
            | MessageType::ClearAllStateEntry
            | MessageType::GetStateKeysEntry => MessageKind::State,
            MessageType::SleepEntry
            | MessageType::InvokeEntry
            | MessageType::BackgroundInvokeEntry
            | MessageType::AwakeableEntry
            | MessageType::CompleteAwakeableEntry
            | MessageType::SideEffectEntry => MessageKind::Syscall,
            MessageType::CustomEntry(_) => MessageKind::CustomEntry,
        }
    }

    fn has_completed_flag(&self) -> bool {
        matches!(
            self,
            MessageType::PollInputStreamEntry
                | MessageType::GetStateEntry
                | MessageType::GetStateKeysEntry
                | MessageType::SleepEntry
                | MessageType::InvokeEntry
                | MessageType::AwakeableEntry
        )
    }

    fn has_protocol_version(&self) -> bool {
        matches!(self, MessageType::Start)
    }

    fn has_requires_ack_flag(&self) -> bool {
        matches!(
            self.kind(),
            MessageKind::State | MessageKind::IO | MessageKind::Syscall | MessageKind::CustomEntry
        )
    }
}

const START_MESSAGE_TYPE: u16 = 0x0000;
const COMPLETION_MESSAGE_TYPE: u16 = 0x0001;
const SUSPENSION_MESSAGE_TYPE: u16 = 0x0002;
const ERROR_MESSAGE_TYPE: u16 = 0x0003;
const ENTRY_ACK_MESSAGE_TYPE: u16 = 0x0004;
const END_MESSAGE_TYPE: u16 = 0x0005;
const POLL_INPUT_STREAM_ENTRY_MESSAGE_TYPE: u16 = 0x0400;
const OUTPUT_STREAM_ENTRY_MESSAGE_TYPE: u16 = 0x0401;
const GET_STATE_ENTRY_MESSAGE_TYPE: u16 = 0x0800;
const SET_STATE_ENTRY_MESSAGE_TYPE: u16 = 0x0801;
const CLEAR_STATE_ENTRY_MESSAGE_TYPE: u16 = 0x0802;
const CLEAR_ALL_STATE_ENTRY_MESSAGE_TYPE: u16 = 0x0803;
const GET_STATE_KEYS_ENTRY_MESSAGE_TYPE: u16 = 0x0804;
const SLEEP_ENTRY_MESSAGE_TYPE: u16 = 0x0C00;
const INVOKE_ENTRY_MESSAGE_TYPE: u16 = 0x0C01;
const BACKGROUND_INVOKE_ENTRY_MESSAGE_TYPE: u16 = 0x0C02;
const AWAKEABLE_ENTRY_MESSAGE_TYPE: u16 = 0x0C03;
const COMPLETE_AWAKEABLE_ENTRY_MESSAGE_TYPE: u16 = 0x0C04;
const SIDE_EFFECT_ENTRY_MESSAGE_TYPE: u16 = 0x0C05;

impl From<MessageType> for MessageTypeId {
    fn from(mt: MessageType) -> Self {
        match mt {
            MessageType::Start => START_MESSAGE_TYPE,
            MessageType::Completion => COMPLETION_MESSAGE_TYPE,
            MessageType::Suspension => SUSPENSION_MESSAGE_TYPE,
            MessageType::Error => ERROR_MESSAGE_TYPE,
            MessageType::EntryAck => ENTRY_ACK_MESSAGE_TYPE,
            MessageType::End => END_MESSAGE_TYPE,
            MessageType::PollInputStreamEntry => POLL_INPUT_STREAM_ENTRY_MESSAGE_TYPE,
            MessageType::OutputStreamEntry => OUTPUT_STREAM_ENTRY_MESSAGE_TYPE,
            MessageType::GetStateEntry => GET_STATE_ENTRY_MESSAGE_TYPE,
            MessageType::SetStateEntry => SET_STATE_ENTRY_MESSAGE_TYPE,
            MessageType::ClearStateEntry => CLEAR_STATE_ENTRY_MESSAGE_TYPE,
            MessageType::ClearAllStateEntry => CLEAR_ALL_STATE_ENTRY_MESSAGE_TYPE,
            MessageType::GetStateKeysEntry => GET_STATE_KEYS_ENTRY_MESSAGE_TYPE,
            MessageType::SleepEntry => SLEEP_ENTRY_MESSAGE_TYPE,
            MessageType::InvokeEntry => INVOKE_ENTRY_MESSAGE_TYPE,
            MessageType::BackgroundInvokeEntry => BACKGROUND_INVOKE_ENTRY_MESSAGE_TYPE,
            MessageType::AwakeableEntry => AWAKEABLE_ENTRY_MESSAGE_TYPE,
            MessageType::CompleteAwakeableEntry => COMPLETE_AWAKEABLE_ENTRY_MESSAGE_TYPE,
            MessageType::SideEffectEntry => SIDE_EFFECT_ENTRY_MESSAGE_TYPE,
            MessageType::CustomEntry(id) => id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown message code {0:#x}")]
pub struct UnknownMessageType(u16);

impl TryFrom<MessageTypeId> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(value: MessageTypeId) -> Result<Self, UnknownMessageType> {
        match value {
            START_MESSAGE_TYPE => Ok(MessageType::Start),
            COMPLETION_MESSAGE_TYPE => Ok(MessageType::Completion),
            SUSPENSION_MESSAGE_TYPE => Ok(MessageType::Suspension),
            ERROR_MESSAGE_TYPE => Ok(MessageType::Error),
            ENTRY_ACK_MESSAGE_TYPE => Ok(MessageType::EntryAck),
            END_MESSAGE_TYPE => Ok(MessageType::End),
            POLL_INPUT_STREAM_ENTRY_MESSAGE_TYPE => Ok(MessageType::PollInputStreamEntry),
            OUTPUT_STREAM_ENTRY_MESSAGE_TYPE => Ok(MessageType::OutputStreamEntry),
            GET_STATE_ENTRY_MESSAGE_TYPE => Ok(MessageType::GetStateEntry),
            SET_STATE_ENTRY_MESSAGE_TYPE => Ok(MessageType::SetStateEntry),
            CLEAR_STATE_ENTRY_MESSAGE_TYPE => Ok(MessageType::ClearStateEntry),
            CLEAR_ALL_STATE_ENTRY_MESSAGE_TYPE => Ok(MessageType::ClearAllStateEntry),
            GET_STATE_KEYS_ENTRY_MESSAGE_TYPE => Ok(MessageType::GetStateKeysEntry),
            SLEEP_ENTRY_MESSAGE_TYPE => Ok(MessageType::SleepEntry),
            INVOKE_ENTRY_MESSAGE_TYPE => Ok(MessageType::InvokeEntry),
            BACKGROUND_INVOKE_ENTRY_MESSAGE_TYPE => Ok(MessageType::BackgroundInvokeEntry),
            AWAKEABLE_ENTRY_MESSAGE_TYPE => Ok(MessageType::AwakeableEntry),
            COMPLETE_AWAKEABLE_ENTRY_MESSAGE_TYPE => Ok(MessageType::CompleteAwakeableEntry),
            SIDE_EFFECT_ENTRY_MESSAGE_TYPE => Ok(MessageType::SideEffectEntry),
            v if ((v & CUSTOM_MESSAGE_MASK) != 0) => Ok(MessageType::CustomEntry(v)),
            v => Err(UnknownMessageType(v)),
        }
    }
}

impl TryFrom<MessageType> for EntryType {
    type Error = MessageType;

    fn try_from(value: MessageType) -> Result<Self, Self::Error> {
        match value {
            MessageType::PollInputStreamEntry => Ok(EntryType::PollInputStream),
            MessageType::OutputStreamEntry => Ok(EntryType::OutputStream),
            MessageType::GetStateEntry => Ok(EntryType::GetState),
            MessageType::SetStateEntry => Ok(EntryType::SetState),
            MessageType::ClearStateEntry => Ok(EntryType::ClearState),
            MessageType::ClearAllStateEntry => Ok(EntryType::ClearAllState),
            MessageType::GetStateKeysEntry => Ok(EntryType::GetStateKeys),
            MessageType::SleepEntry => Ok(EntryType::Sleep),
            MessageType::InvokeEntry => Ok(EntryType::Invoke),
            MessageType::BackgroundInvokeEntry => Ok(EntryType::BackgroundInvoke),
            MessageType::AwakeableEntry => Ok(EntryType::Awakeable),
            MessageType::CompleteAwakeableEntry => Ok(EntryType::CompleteAwakeable),
            MessageType::SideEffectEntry => Ok(EntryType::SideEffect),
            MessageType::CustomEntry(_) => Ok(EntryType::Custom),
            MessageType::Start
            | MessageType::Completion
            | MessageType::Suspension
            | MessageType::Error
            | MessageType::EntryAck
            | MessageType::End => Err(value),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    ty: MessageType,
    length: u32,

    // --- Flags
    /// Only `Start` carries the protocol version in its flags.
    protocol_version: Option<u16>,
    /// Only completable entries have the completed flag. See
    /// [`MessageType::has_completed_flag`].
    completed_flag: Option<bool>,
    /// All entry messages may have the requires-ack flag.
    requires_ack_flag: Option<bool>,
}

impl MessageHeader {
    #[inline]
    pub fn new(ty: MessageType, length: u32) -> Self {
        Self::_new(ty, None, None, None, length)
    }

    #[inline]
    pub fn new_start(protocol_version: u16, length: u32) -> Self {
        Self::_new(MessageType::Start, Some(protocol_version), None, None, length)
    }

    #[inline]
    pub(super) fn new_entry_header(
        ty: MessageType,
        completed_flag: Option<bool>,
        requires_ack_flag: Option<bool>,
        length: u32,
    ) -> Self {
        debug_assert!(completed_flag.is_some() == ty.has_completed_flag());

        Self::_new(ty, None, completed_flag, requires_ack_flag, length)
    }

    #[inline]
    fn _new(
        ty: MessageType,
        protocol_version: Option<u16>,
        completed_flag: Option<bool>,
        requires_ack_flag: Option<bool>,
        length: u32,
    ) -> Self {
        MessageHeader {
            ty,
            length,
            protocol_version,
            completed_flag,
            requires_ack_flag,
        }
    }

    #[inline]
    pub fn message_kind(&self) -> MessageKind {
        self.ty.kind()
    }

    #[inline]
    pub fn message_type(&self) -> MessageType {
        self.ty
    }

    #[inline]
    pub fn protocol_version(&self) -> Option<u16> {
        self.protocol_version
    }

    #[inline]
    pub fn completed(&self) -> Option<bool> {
        self.completed_flag
    }

    #[inline]
    pub fn requires_ack(&self) -> Option<bool> {
        self.requires_ack_flag
    }

    #[inline]
    pub fn frame_length(&self) -> u32 {
        self.length
    }
}

macro_rules! read_flag_if {
    ($cond:expr, $value:expr, $mask:expr) => {
        if $cond {
            Some(($value & $mask) != 0)
        } else {
            None
        }
    };
}

impl TryFrom<u64> for MessageHeader {
    type Error = UnknownMessageType;

    /// Deserialize the protocol header.
    fn try_from(value: u64) -> Result<Self, Self::Error> {
        let ty_code = (value >> 48) as u16;
        let ty: MessageType = ty_code.try_into()?;

        let protocol_version = if ty.has_protocol_version() {
            Some(((value & VERSION_MASK) >> 32) as u16)
        } else {
            None
        };
        let completed_flag = read_flag_if!(ty.has_completed_flag(), value, COMPLETED_MASK);
        let requires_ack_flag = read_flag_if!(ty.has_requires_ack_flag(), value, REQUIRES_ACK_MASK);
        let length = value as u32;

        Ok(MessageHeader::_new(
            ty,
            protocol_version,
            completed_flag,
            requires_ack_flag,
            length,
        ))
    }
}

macro_rules! write_flag {
    ($flag:expr, $value:expr, $mask:expr) => {
        if let Some(true) = $flag {
            *$value |= $mask;
        }
    };
}

impl From<MessageHeader> for u64 {
    /// Serialize the protocol header.
    fn from(message_header: MessageHeader) -> Self {
        let mut res =
            ((u16::from(message_header.ty) as u64) << 48) | (message_header.length as u64);

        if let Some(version) = message_header.protocol_version {
            res |= (version as u64) << 32;
        }
        write_flag!(message_header.completed_flag, &mut res, COMPLETED_MASK);
        write_flag!(
            message_header.requires_ack_flag,
            &mut res,
            REQUIRES_ACK_MASK
        );

        res
    }
}

#[cfg(test)]
mod tests {
    use super::{MessageKind::*, MessageType::*, *};

    fn roundtrip(header: MessageHeader) -> MessageHeader {
        let serialized: u64 = header.into();
        serialized.try_into().unwrap()
    }

    #[test]
    fn start_carries_protocol_version() {
        let header = roundtrip(MessageHeader::new_start(1, 25));

        assert_eq!(header.message_type(), Start);
        assert_eq!(header.message_kind(), Core);
        assert_eq!(header.protocol_version(), Some(1));
        assert_eq!(header.completed(), None);
        assert_eq!(header.frame_length(), 25);
    }

    #[test]
    fn completion() {
        let header = roundtrip(MessageHeader::new(Completion, 22));

        assert_eq!(header.message_type(), Completion);
        assert_eq!(header.message_kind(), Core);
        assert_eq!(header.frame_length(), 22);
    }

    #[test]
    fn entry_ack() {
        let header = roundtrip(MessageHeader::new(EntryAck, 5));

        assert_eq!(header.message_type(), EntryAck);
        assert_eq!(header.message_kind(), Core);
        assert_eq!(header.completed(), None);
        assert_eq!(header.requires_ack(), None);
        assert_eq!(header.frame_length(), 5);
    }

    #[test]
    fn completed_get_state() {
        let header = roundtrip(MessageHeader::new_entry_header(
            GetStateEntry,
            Some(true),
            Some(false),
            10341,
        ));

        assert_eq!(header.message_type(), GetStateEntry);
        assert_eq!(header.message_kind(), State);
        assert_eq!(header.completed(), Some(true));
        assert_eq!(header.requires_ack(), Some(false));
        assert_eq!(header.frame_length(), 10341);
    }

    #[test]
    fn not_completed_sleep() {
        let header = roundtrip(MessageHeader::new_entry_header(
            SleepEntry,
            Some(false),
            Some(false),
            0,
        ));

        assert_eq!(header.message_type(), SleepEntry);
        assert_eq!(header.message_kind(), Syscall);
        assert_eq!(header.completed(), Some(false));
    }

    #[test]
    fn side_effect_with_requires_ack() {
        let header = roundtrip(MessageHeader::new_entry_header(
            SideEffectEntry,
            None,
            Some(true),
            77,
        ));

        assert_eq!(header.message_type(), SideEffectEntry);
        assert_eq!(header.requires_ack(), Some(true));
        assert_eq!(header.frame_length(), 77);
    }

    #[test]
    fn custom_entry() {
        let header = roundtrip(MessageHeader::new_entry_header(
            MessageType::CustomEntry(0xFC01),
            None,
            Some(true),
            10341,
        ));

        assert_eq!(header.message_type(), MessageType::CustomEntry(0xFC01));
        assert_eq!(header.message_kind(), MessageKind::CustomEntry);
        assert_eq!(header.requires_ack(), Some(true));
    }

    #[test]
    fn unknown_core_code_is_rejected() {
        assert!(MessageType::try_from(0x0006u16).is_err());
    }
}
