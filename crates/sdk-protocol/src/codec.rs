// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use crate::pb::protocol;

use bytes::{Buf, Bytes};
use prost::Message;
use restate_sdk_types::journal::raw::*;
use restate_sdk_types::journal::*;

/// This macro generates the pattern matching with arms per entry.
/// For each entry it first executes `Message#decode` and then `try_into()`.
/// It expects that for each `{...}Entry` there is a valid `TryFrom<{...}Message>` implementation with `Error = &'static str`.
/// These implementations are available in [`crate::pb_into`].
macro_rules! match_decode {
    ($ty:expr, $buf:expr, { $($variant:ident),* }) => {
        match $ty {
              $(EntryType::$variant { .. } => paste::paste! {
                  protocol::[<$variant EntryMessage>]::decode($buf)
                    .map_err(|e| RawEntryCodecError::new($ty, ErrorKind::Decode { source: e.into() }))
                    .and_then(|msg| msg.try_into().map_err(|f| RawEntryCodecError::new($ty, ErrorKind::MissingField(f))))
              },)*
             EntryType::Custom => Ok(Entry::Custom($buf.copy_to_bytes($buf.remaining()))),
        }
    };
}

#[derive(Debug, Default, Copy, Clone)]
pub struct ProtobufRawEntryCodec;

impl RawEntryCodec for ProtobufRawEntryCodec {
    fn serialize(entry: Entry) -> RawEntry {
        match entry {
            Entry::PollInputStream(entry) => RawEntry::new(
                RawEntryHeader::PollInputStream { is_completed: true },
                protocol::PollInputStreamEntryMessage {
                    result: Some(match entry.result {
                        EntryResult::Success(value) => {
                            protocol::poll_input_stream_entry_message::Result::Value(value)
                        }
                        EntryResult::Failure(code, message) => {
                            protocol::poll_input_stream_entry_message::Result::Failure(
                                failure(code, &message),
                            )
                        }
                    }),
                }
                .encode_to_vec(),
            ),
            Entry::OutputStream(entry) => RawEntry::new(
                RawEntryHeader::OutputStream,
                protocol::OutputStreamEntryMessage {
                    result: Some(match entry.result {
                        EntryResult::Success(value) => {
                            protocol::output_stream_entry_message::Result::Value(value)
                        }
                        EntryResult::Failure(code, message) => {
                            protocol::output_stream_entry_message::Result::Failure(failure(
                                code, &message,
                            ))
                        }
                    }),
                }
                .encode_to_vec(),
            ),
            Entry::GetState(entry) => RawEntry::new(
                RawEntryHeader::GetState {
                    is_completed: entry.is_completed(),
                },
                protocol::GetStateEntryMessage {
                    key: entry.key,
                    result: entry.value.map(|value| match value {
                        GetStateResult::Empty => protocol::get_state_entry_message::Result::Empty(()),
                        GetStateResult::Result(v) => {
                            protocol::get_state_entry_message::Result::Value(v)
                        }
                        GetStateResult::Failure(code, message) => {
                            protocol::get_state_entry_message::Result::Failure(failure(
                                code, &message,
                            ))
                        }
                    }),
                }
                .encode_to_vec(),
            ),
            Entry::SetState(entry) => RawEntry::new(
                RawEntryHeader::SetState,
                protocol::SetStateEntryMessage {
                    key: entry.key,
                    value: entry.value,
                }
                .encode_to_vec(),
            ),
            Entry::ClearState(entry) => RawEntry::new(
                RawEntryHeader::ClearState,
                protocol::ClearStateEntryMessage { key: entry.key }.encode_to_vec(),
            ),
            Entry::ClearAllState => RawEntry::new(
                RawEntryHeader::ClearAllState,
                protocol::ClearAllStateEntryMessage {}.encode_to_vec(),
            ),
            Entry::GetStateKeys(entry) => RawEntry::new(
                RawEntryHeader::GetStateKeys {
                    is_completed: entry.is_completed(),
                },
                protocol::GetStateKeysEntryMessage {
                    result: entry.value.map(|value| match value {
                        GetStateKeysResult::Result(keys) => {
                            protocol::get_state_keys_entry_message::Result::Value(
                                protocol::get_state_keys_entry_message::StateKeys { keys },
                            )
                        }
                        GetStateKeysResult::Failure(code, message) => {
                            protocol::get_state_keys_entry_message::Result::Failure(failure(
                                code, &message,
                            ))
                        }
                    }),
                }
                .encode_to_vec(),
            ),
            Entry::Sleep(entry) => RawEntry::new(
                RawEntryHeader::Sleep {
                    is_completed: entry.is_completed(),
                },
                protocol::SleepEntryMessage {
                    wake_up_time: entry.wake_up_time,
                    result: entry.result.map(|result| match result {
                        SleepResult::Fired => protocol::sleep_entry_message::Result::Empty(()),
                        SleepResult::Failure(code, message) => {
                            protocol::sleep_entry_message::Result::Failure(failure(code, &message))
                        }
                    }),
                }
                .encode_to_vec(),
            ),
            Entry::Invoke(entry) => RawEntry::new(
                RawEntryHeader::Invoke {
                    is_completed: entry.is_completed(),
                },
                protocol::InvokeEntryMessage {
                    service_name: String::from(&*entry.request.service_name),
                    method_name: String::from(&*entry.request.method_name),
                    parameter: entry.request.parameter,
                    result: entry.result.map(|result| match result {
                        EntryResult::Success(value) => {
                            protocol::invoke_entry_message::Result::Value(value)
                        }
                        EntryResult::Failure(code, message) => {
                            protocol::invoke_entry_message::Result::Failure(failure(
                                code, &message,
                            ))
                        }
                    }),
                }
                .encode_to_vec(),
            ),
            Entry::BackgroundInvoke(entry) => RawEntry::new(
                RawEntryHeader::BackgroundInvoke,
                protocol::BackgroundInvokeEntryMessage {
                    service_name: String::from(&*entry.request.service_name),
                    method_name: String::from(&*entry.request.method_name),
                    parameter: entry.request.parameter,
                    invoke_time: entry.invoke_time,
                }
                .encode_to_vec(),
            ),
            Entry::SideEffect(entry) => RawEntry::new(
                RawEntryHeader::SideEffect,
                protocol::SideEffectEntryMessage {
                    result: Some(match entry.result {
                        EntryResult::Success(value) => {
                            protocol::side_effect_entry_message::Result::Value(value)
                        }
                        EntryResult::Failure(code, message) => {
                            protocol::side_effect_entry_message::Result::Failure(failure(
                                code, &message,
                            ))
                        }
                    }),
                }
                .encode_to_vec(),
            ),
            Entry::Awakeable(entry) => RawEntry::new(
                RawEntryHeader::Awakeable {
                    is_completed: entry.is_completed(),
                },
                protocol::AwakeableEntryMessage {
                    result: entry.result.map(|result| match result {
                        EntryResult::Success(value) => {
                            protocol::awakeable_entry_message::Result::Value(value)
                        }
                        EntryResult::Failure(code, message) => {
                            protocol::awakeable_entry_message::Result::Failure(failure(
                                code, &message,
                            ))
                        }
                    }),
                }
                .encode_to_vec(),
            ),
            Entry::CompleteAwakeable(entry) => RawEntry::new(
                RawEntryHeader::CompleteAwakeable,
                protocol::CompleteAwakeableEntryMessage {
                    id: String::from(&*entry.id),
                    result: Some(match entry.result {
                        EntryResult::Success(value) => {
                            protocol::complete_awakeable_entry_message::Result::Value(value)
                        }
                        EntryResult::Failure(code, message) => {
                            protocol::complete_awakeable_entry_message::Result::Failure(failure(
                                code, &message,
                            ))
                        }
                    }),
                }
                .encode_to_vec(),
            ),
            Entry::Custom(payload) => RawEntry::new(
                RawEntryHeader::Custom {
                    code: 0xFC00,
                    requires_ack: false,
                },
                payload,
            ),
        }
    }

    fn deserialize(
        entry_type: EntryType,
        mut entry_value: Bytes,
    ) -> Result<Entry, RawEntryCodecError> {
        match_decode!(entry_type, entry_value, {
            PollInputStream,
            OutputStream,
            GetState,
            SetState,
            ClearState,
            ClearAllState,
            GetStateKeys,
            Sleep,
            Invoke,
            BackgroundInvoke,
            SideEffect,
            Awakeable,
            CompleteAwakeable
        })
    }
}

fn failure(code: restate_sdk_types::errors::Code, message: &bytestring::ByteString) -> protocol::Failure {
    protocol::Failure {
        code: code.into(),
        message: String::from(&**message),
    }
}
