// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use super::header::UnknownMessageType;
use super::*;

use std::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_utils::SegmentedBuf;
use prost::Message;
use restate_sdk_types::journal::raw::{RawEntry, RawEntryHeader};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("cannot decode message type {0:?}: {1}")]
    DecodeMessage(MessageType, #[source] prost::DecodeError),
    #[error(transparent)]
    UnknownMessageType(#[from] UnknownMessageType),
    #[error("hit message size limit: {0} >= {1}")]
    MessageSizeLimit(usize, usize),
}

// --- Message encoder

pub struct Encoder {
    protocol_version: u16,
}

impl Encoder {
    pub fn new(protocol_version: u16) -> Self {
        Self { protocol_version }
    }

    /// Encodes a message to bytes
    pub fn encode(&self, msg: ProtocolMessage) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len(&msg));
        self.encode_to_buf_mut(&mut buf, msg)
            .expect("encoding messages should be infallible");
        buf.freeze()
    }

    /// Includes header len
    pub fn encoded_len(&self, msg: &ProtocolMessage) -> usize {
        8 + msg.encoded_len()
    }

    fn encode_to_buf_mut(
        &self,
        mut buf: impl BufMut,
        msg: ProtocolMessage,
    ) -> Result<(), prost::EncodeError> {
        let header = generate_header(&msg, self.protocol_version);
        buf.put_u64(header.into());

        // prost::EncodeError can be triggered only by a buffer smaller than
        // required, and the buffer is sized with the length prost computed.
        encode_msg(&msg, &mut buf)
    }
}

fn generate_header(msg: &ProtocolMessage, protocol_version: u16) -> MessageHeader {
    let len: u32 = msg
        .encoded_len()
        .try_into()
        .expect("protocol messages can't be larger than u32");
    match msg {
        ProtocolMessage::Start(_) => MessageHeader::new_start(protocol_version, len),
        ProtocolMessage::Completion(_) => MessageHeader::new(MessageType::Completion, len),
        ProtocolMessage::Suspension(_) => MessageHeader::new(MessageType::Suspension, len),
        ProtocolMessage::Error(_) => MessageHeader::new(MessageType::Error, len),
        ProtocolMessage::EntryAck(_) => MessageHeader::new(MessageType::EntryAck, len),
        ProtocolMessage::End(_) => MessageHeader::new(MessageType::End, len),
        ProtocolMessage::UnparsedEntry(entry) => {
            let completed_flag = entry.header().is_completed();
            // Side effects demand an acknowledgment from the runtime,
            // other entries we produce do not.
            let requires_ack_flag = match entry.header() {
                RawEntryHeader::SideEffect => Some(true),
                RawEntryHeader::Custom { requires_ack, .. } => Some(*requires_ack),
                _ => Some(false),
            };
            MessageHeader::new_entry_header(
                raw_header_to_message_type(entry.header()),
                completed_flag,
                requires_ack_flag,
                len,
            )
        }
    }
}

fn encode_msg(msg: &ProtocolMessage, buf: &mut impl BufMut) -> Result<(), prost::EncodeError> {
    match msg {
        ProtocolMessage::Start(m) => m.encode(buf),
        ProtocolMessage::Completion(m) => m.encode(buf),
        ProtocolMessage::Suspension(m) => m.encode(buf),
        ProtocolMessage::Error(m) => m.encode(buf),
        ProtocolMessage::EntryAck(m) => m.encode(buf),
        ProtocolMessage::End(m) => m.encode(buf),
        ProtocolMessage::UnparsedEntry(entry) => {
            buf.put(entry.serialized_entry().clone());
            Ok(())
        }
    }
}

fn raw_header_to_message_type(entry_header: &RawEntryHeader) -> MessageType {
    match entry_header {
        RawEntryHeader::PollInputStream { .. } => MessageType::PollInputStreamEntry,
        RawEntryHeader::OutputStream => MessageType::OutputStreamEntry,
        RawEntryHeader::GetState { .. } => MessageType::GetStateEntry,
        RawEntryHeader::SetState => MessageType::SetStateEntry,
        RawEntryHeader::ClearState => MessageType::ClearStateEntry,
        RawEntryHeader::ClearAllState => MessageType::ClearAllStateEntry,
        RawEntryHeader::GetStateKeys { .. } => MessageType::GetStateKeysEntry,
        RawEntryHeader::Sleep { .. } => MessageType::SleepEntry,
        RawEntryHeader::Invoke { .. } => MessageType::InvokeEntry,
        RawEntryHeader::BackgroundInvoke => MessageType::BackgroundInvokeEntry,
        RawEntryHeader::SideEffect => MessageType::SideEffectEntry,
        RawEntryHeader::Awakeable { .. } => MessageType::AwakeableEntry,
        RawEntryHeader::CompleteAwakeable => MessageType::CompleteAwakeableEntry,
        RawEntryHeader::Custom { code, .. } => MessageType::CustomEntry(*code),
    }
}

// --- Message decoder

/// Stateful decoder to decode [`ProtocolMessage`]
pub struct Decoder {
    buf: SegmentedBuf<Bytes>,
    state: DecoderState,
    message_size_warning: usize,
    message_size_limit: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new(usize::MAX, None)
    }
}

impl Decoder {
    pub fn new(message_size_warning: usize, message_size_limit: Option<usize>) -> Self {
        Self {
            buf: SegmentedBuf::new(),
            state: DecoderState::WaitingHeader,
            message_size_warning,
            message_size_limit: message_size_limit.unwrap_or(usize::MAX),
        }
    }

    pub fn has_remaining(&self) -> bool {
        self.buf.has_remaining()
    }

    /// Concatenate a new chunk in the internal buffer.
    pub fn push(&mut self, buf: Bytes) {
        self.buf.push(buf)
    }

    /// Try to consume the next message in the internal buffer.
    pub fn consume_next(
        &mut self,
    ) -> Result<Option<(MessageHeader, ProtocolMessage)>, EncodingError> {
        loop {
            let remaining = self.buf.remaining();

            if remaining >= self.message_size_warning {
                warn!(
                    "Message size warning: {} >= {}. \
                    Generating very large messages can make the system unstable if configured with too little memory.",
                    remaining, self.message_size_warning
                );
            }
            if remaining >= self.message_size_limit {
                return Err(EncodingError::MessageSizeLimit(
                    remaining,
                    self.message_size_limit,
                ));
            }

            if remaining < self.state.needs_bytes() {
                return Ok(None);
            }

            if let Some(res) = self.state.decode(&mut self.buf)? {
                return Ok(Some(res));
            }
        }
    }
}

#[derive(Default)]
enum DecoderState {
    #[default]
    WaitingHeader,
    WaitingPayload(MessageHeader),
}

impl DecoderState {
    fn needs_bytes(&self) -> usize {
        match self {
            DecoderState::WaitingHeader => 8,
            DecoderState::WaitingPayload(h) => h.frame_length() as usize,
        }
    }

    fn decode(
        &mut self,
        mut buf: impl Buf,
    ) -> Result<Option<(MessageHeader, ProtocolMessage)>, EncodingError> {
        let mut res = None;

        *self = match mem::take(self) {
            DecoderState::WaitingHeader => DecoderState::WaitingPayload(buf.get_u64().try_into()?),
            DecoderState::WaitingPayload(h) => {
                let msg = decode_protocol_message(&h, buf.take(h.frame_length() as usize))
                    .map_err(|e| EncodingError::DecodeMessage(h.message_type(), e))?;
                res = Some((h, msg));
                DecoderState::WaitingHeader
            }
        };

        Ok(res)
    }
}

fn decode_protocol_message(
    header: &MessageHeader,
    mut buf: impl Buf,
) -> Result<ProtocolMessage, prost::DecodeError> {
    Ok(match header.message_type() {
        MessageType::Start => ProtocolMessage::Start(pb::protocol::StartMessage::decode(buf)?),
        MessageType::Completion => {
            ProtocolMessage::Completion(pb::protocol::CompletionMessage::decode(buf)?)
        }
        MessageType::Suspension => {
            ProtocolMessage::Suspension(pb::protocol::SuspensionMessage::decode(buf)?)
        }
        MessageType::Error => ProtocolMessage::Error(pb::protocol::ErrorMessage::decode(buf)?),
        MessageType::EntryAck => {
            ProtocolMessage::EntryAck(pb::protocol::EntryAckMessage::decode(buf)?)
        }
        MessageType::End => ProtocolMessage::End(pb::protocol::EndMessage::decode(buf)?),
        _ => ProtocolMessage::UnparsedEntry(RawEntry::new(
            message_header_to_raw_header(header),
            // This is a no-op copy if the Buf is an instance of Bytes.
            buf.copy_to_bytes(buf.remaining()),
        )),
    })
}

fn message_header_to_raw_header(message_header: &MessageHeader) -> RawEntryHeader {
    debug_assert!(
        !matches!(
            message_header.message_type(),
            MessageType::Start
                | MessageType::Completion
                | MessageType::Suspension
                | MessageType::Error
                | MessageType::EntryAck
                | MessageType::End
        ),
        "Message is not an entry type"
    );
    match message_header.message_type() {
        MessageType::Start
        | MessageType::Completion
        | MessageType::Suspension
        | MessageType::Error
        | MessageType::EntryAck
        | MessageType::End => unreachable!(),
        MessageType::PollInputStreamEntry => RawEntryHeader::PollInputStream {
            is_completed: message_header
                .completed()
                .expect("completed flag being present"),
        },
        MessageType::OutputStreamEntry => RawEntryHeader::OutputStream,
        MessageType::GetStateEntry => RawEntryHeader::GetState {
            is_completed: message_header
                .completed()
                .expect("completed flag being present"),
        },
        MessageType::SetStateEntry => RawEntryHeader::SetState,
        MessageType::ClearStateEntry => RawEntryHeader::ClearState,
        MessageType::ClearAllStateEntry => RawEntryHeader::ClearAllState,
        MessageType::GetStateKeysEntry => RawEntryHeader::GetStateKeys {
            is_completed: message_header
                .completed()
                .expect("completed flag being present"),
        },
        MessageType::SleepEntry => RawEntryHeader::Sleep {
            is_completed: message_header
                .completed()
                .expect("completed flag being present"),
        },
        MessageType::InvokeEntry => RawEntryHeader::Invoke {
            is_completed: message_header
                .completed()
                .expect("completed flag being present"),
        },
        MessageType::BackgroundInvokeEntry => RawEntryHeader::BackgroundInvoke,
        MessageType::SideEffectEntry => RawEntryHeader::SideEffect,
        MessageType::AwakeableEntry => RawEntryHeader::Awakeable {
            is_completed: message_header
                .completed()
                .expect("completed flag being present"),
        },
        MessageType::CompleteAwakeableEntry => RawEntryHeader::CompleteAwakeable,
        MessageType::CustomEntry(code) => RawEntryHeader::Custom {
            code,
            requires_ack: message_header
                .requires_ack()
                .expect("requires ack flag being present"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert2::let_assert;
    use restate_sdk_types::journal::{Completion, CompletionResult};

    #[test]
    fn fill_decoder_with_several_messages() {
        let protocol_version = 1;
        let encoder = Encoder::new(protocol_version);
        let mut decoder = Decoder::default();

        let expected_msg_0 = ProtocolMessage::new_start_message(
            "abc".into(),
            "abc".to_owned(),
            1,
            true,
            vec![],
        );
        let expected_msg_1: ProtocolMessage = RawEntry::new(
            RawEntryHeader::PollInputStream { is_completed: true },
            pb::protocol::PollInputStreamEntryMessage {
                result: Some(pb::protocol::poll_input_stream_entry_message::Result::Value(
                    Bytes::from_static(b"input"),
                )),
            }
            .encode_to_vec(),
        )
        .into();
        let expected_msg_2: ProtocolMessage =
            Completion::new(1, CompletionResult::Empty).into();

        decoder.push(encoder.encode(expected_msg_0.clone()));
        decoder.push(encoder.encode(expected_msg_1.clone()));
        decoder.push(encoder.encode(expected_msg_2.clone()));

        let (actual_msg_header_0, actual_msg_0) = decoder.consume_next().unwrap().unwrap();
        assert_eq!(
            actual_msg_header_0.protocol_version(),
            Some(protocol_version)
        );
        assert_eq!(actual_msg_header_0.message_type(), MessageType::Start);
        assert_eq!(actual_msg_0, expected_msg_0);

        let (actual_msg_header_1, actual_msg_1) = decoder.consume_next().unwrap().unwrap();
        assert_eq!(
            actual_msg_header_1.message_type(),
            MessageType::PollInputStreamEntry
        );
        assert_eq!(actual_msg_header_1.completed(), Some(true));
        assert_eq!(actual_msg_1, expected_msg_1);

        let (actual_msg_header_2, actual_msg_2) = decoder.consume_next().unwrap().unwrap();
        assert_eq!(actual_msg_header_2.message_type(), MessageType::Completion);
        assert_eq!(actual_msg_2, expected_msg_2);

        assert!(decoder.consume_next().unwrap().is_none());
    }

    #[test]
    fn decode_entry_ack() {
        let encoder = Encoder::new(1);
        let mut decoder = Decoder::default();

        decoder.push(encoder.encode(ProtocolMessage::new_entry_ack(2)));

        let (header, message) = decoder.consume_next().unwrap().unwrap();
        assert_eq!(header.message_type(), MessageType::EntryAck);
        assert_eq!(message, ProtocolMessage::new_entry_ack(2));
    }

    #[test]
    fn fill_decoder_with_partial_header() {
        partial_decoding_test(4)
    }

    #[test]
    fn fill_decoder_with_partial_body() {
        partial_decoding_test(10)
    }

    fn partial_decoding_test(split_index: usize) {
        let encoder = Encoder::new(1);
        let mut decoder = Decoder::default();

        let expected_msg: ProtocolMessage = RawEntry::new(
            RawEntryHeader::PollInputStream { is_completed: true },
            pb::protocol::PollInputStreamEntryMessage {
                result: Some(pb::protocol::poll_input_stream_entry_message::Result::Value(
                    Bytes::from_static(b"input"),
                )),
            }
            .encode_to_vec(),
        )
        .into();
        let expected_msg_encoded = encoder.encode(expected_msg.clone());

        decoder.push(expected_msg_encoded.slice(0..split_index));
        assert!(decoder.consume_next().unwrap().is_none());

        decoder.push(expected_msg_encoded.slice(split_index..));

        let (actual_msg_header, actual_msg) = decoder.consume_next().unwrap().unwrap();
        assert_eq!(
            actual_msg_header.message_type(),
            MessageType::PollInputStreamEntry
        );
        assert_eq!(actual_msg_header.completed(), Some(true));
        assert_eq!(actual_msg, expected_msg);

        assert!(decoder.consume_next().unwrap().is_none());
    }

    #[test]
    fn hit_message_size_limit() {
        let mut decoder = Decoder::new((u8::MAX / 2) as usize, Some(u8::MAX as usize));

        let encoder = Encoder::new(1);
        let msg = encoder.encode(
            RawEntry::new(
                RawEntryHeader::PollInputStream { is_completed: true },
                pb::protocol::PollInputStreamEntryMessage {
                    result: Some(pb::protocol::poll_input_stream_entry_message::Result::Value(
                        (0..=u8::MAX).collect::<Vec<_>>().into(),
                    )),
                }
                .encode_to_vec(),
            )
            .into(),
        );

        decoder.push(msg.clone());
        let_assert!(
            EncodingError::MessageSizeLimit(msg_size, limit) = decoder.consume_next().unwrap_err()
        );
        assert_eq!(msg_size, msg.len());
        assert_eq!(limit, u8::MAX as usize)
    }
}
