// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Drives complete invocation sessions against a machine over an
//! in-memory duplex stream and asserts on the emitted frames.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert2::let_assert;
use bytes::Bytes;
use googletest::assert_that;
use googletest::matchers::contains_substring;
use prost::Message as _;
use test_log::test;
use tokio_util::sync::CancellationToken;

use restate_sdk_core::{Code, Context, Error, Handler, Machine, MachineError};
use restate_sdk_protocol::codec::ProtobufRawEntryCodec;
use restate_sdk_protocol::message::{Decoder, Encoder, MessageHeader, ProtocolMessage};
use restate_sdk_protocol::pb::protocol;
use restate_sdk_protocol::PROTOCOL_VERSION;
use restate_sdk_types::journal::raw::RawEntryCodec;
use restate_sdk_types::journal::{
    Completion, CompletionResult, Entry, EntryResult, GetStateResult, SleepResult,
};

// -- In-memory duplex stream

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

struct MockConnection {
    input: io::Cursor<Vec<u8>>,
    output: SharedBuffer,
}

impl Read for MockConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for MockConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// -- Session builder: the frames the runtime sends to the SDK

struct Session {
    encoder: Encoder,
    frames: Vec<u8>,
}

impl Session {
    fn new() -> Self {
        Self {
            encoder: Encoder::new(PROTOCOL_VERSION),
            frames: Vec::new(),
        }
    }

    fn with_protocol_version(version: u16) -> Self {
        Self {
            encoder: Encoder::new(version),
            frames: Vec::new(),
        }
    }

    fn start(
        self,
        known_entries: u32,
        partial_state: bool,
        state: Vec<(&'static str, &'static [u8])>,
    ) -> Self {
        let state_map = state
            .into_iter()
            .map(|(key, value)| {
                (
                    Bytes::copy_from_slice(key.as_bytes()),
                    Bytes::copy_from_slice(value),
                )
            })
            .collect::<Vec<_>>();
        self.push(ProtocolMessage::new_start_message(
            Bytes::from_static(b"inv-1"),
            "inv-1".to_owned(),
            known_entries,
            partial_state,
            state_map,
        ))
    }

    fn input(self, argument: &'static [u8]) -> Self {
        self.entry(Entry::poll_input_stream(Bytes::from_static(argument)))
    }

    fn entry(self, entry: Entry) -> Self {
        self.push(ProtobufRawEntryCodec::serialize(entry).into())
    }

    fn completion(self, entry_index: u32, result: CompletionResult) -> Self {
        self.push(Completion::new(entry_index, result).into())
    }

    fn ack(self, entry_index: u32) -> Self {
        self.push(ProtocolMessage::new_entry_ack(entry_index))
    }

    fn push(mut self, message: ProtocolMessage) -> Self {
        self.frames.extend_from_slice(&self.encoder.encode(message));
        self
    }

    fn run<H: Handler>(
        self,
        handler: H,
    ) -> (Result<(), MachineError>, Vec<(MessageHeader, ProtocolMessage)>) {
        let output = SharedBuffer::default();
        let connection = MockConnection {
            input: io::Cursor::new(self.frames),
            output: output.clone(),
        };

        let machine = Machine::new(handler, connection);
        let result = machine.run(CancellationToken::new(), "Greeter/greet");

        let bytes = output.0.lock().unwrap().clone();
        let mut decoder = Decoder::default();
        decoder.push(bytes.into());
        let mut messages = Vec::new();
        while let Some(frame) = decoder.consume_next().unwrap() {
            messages.push(frame);
        }
        (result, messages)
    }
}

struct FnHandler<F>(F);

impl<F> Handler for FnHandler<F>
where
    F: Fn(&Context<'_>, Bytes) -> Result<Bytes, Error>,
{
    fn call(&self, ctx: &Context<'_>, input: Bytes) -> Result<Bytes, Error> {
        (self.0)(ctx, input)
    }
}

fn output_success(value: &'static [u8]) -> ProtocolMessage {
    ProtobufRawEntryCodec::serialize(Entry::output_stream(EntryResult::Success(
        Bytes::from_static(value),
    )))
    .into()
}

fn output_failure(code: Code, message: &str) -> ProtocolMessage {
    ProtobufRawEntryCodec::serialize(Entry::output_stream(EntryResult::Failure(
        code,
        message.into(),
    )))
    .into()
}

fn messages_of(frames: &[(MessageHeader, ProtocolMessage)]) -> Vec<&ProtocolMessage> {
    frames.iter().map(|(_, message)| message).collect()
}

// -- Sessions

#[test]
fn fresh_invocation_pure_compute() {
    let (result, frames) = Session::new()
        .start(1, false, vec![])
        .input(&[0x01])
        .run(FnHandler(|_ctx: &Context<'_>, input: Bytes| {
            Ok(Bytes::from(vec![input[0] * 2]))
        }));

    assert!(result.is_ok());
    assert_eq!(
        messages_of(&frames),
        vec![&output_success(&[0x02]), &ProtocolMessage::end()]
    );
}

#[test]
fn state_replay_emits_no_new_frames() {
    let (result, frames) = Session::new()
        .start(3, false, vec![("x", &[0x05])])
        .input(&[0x00])
        .entry(Entry::set_state(
            Bytes::from_static(b"x"),
            Bytes::from_static(&[0x07]),
        ))
        .entry(Entry::get_state(
            Bytes::from_static(b"x"),
            Some(GetStateResult::Result(Bytes::from_static(&[0x07]))),
        ))
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            ctx.set("x", Bytes::from_static(&[0x07]))?;
            let value = ctx.get("x")?.expect("x is set");
            assert_eq!(value, Bytes::from_static(&[0x07]));
            Ok(value)
        }));

    assert!(result.is_ok());
    assert_eq!(
        messages_of(&frames),
        vec![&output_success(&[0x07]), &ProtocolMessage::end()]
    );
}

#[test]
fn set_then_get_answers_from_the_cache() {
    let (result, frames) = Session::new()
        .start(1, false, vec![])
        .input(&[0x00])
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            ctx.set("x", Bytes::from_static(&[0x07]))?;
            let value = ctx.get("x")?.expect("x is set");
            Ok(value)
        }));

    assert!(result.is_ok());
    // The get is journaled as an already-completed entry carrying the
    // cached value: no round-trip to the runtime.
    assert_eq!(
        messages_of(&frames),
        vec![
            &ProtobufRawEntryCodec::serialize(Entry::set_state(
                Bytes::from_static(b"x"),
                Bytes::from_static(&[0x07])
            ))
            .into(),
            &ProtobufRawEntryCodec::serialize(Entry::get_state(
                Bytes::from_static(b"x"),
                Some(GetStateResult::Result(Bytes::from_static(&[0x07])))
            ))
            .into(),
            &output_success(&[0x07]),
            &ProtocolMessage::end(),
        ]
    );
}

#[test]
fn suspension_on_pending_sleep() {
    let (result, frames) = Session::new()
        .start(2, false, vec![])
        .input(&[0x00])
        .entry(Entry::sleep(60_000, None))
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            ctx.sleep(Duration::from_secs(60))?;
            Ok(Bytes::new())
        }));

    assert!(result.is_ok());
    // A suspension and nothing else, in particular no end message.
    assert_eq!(
        messages_of(&frames),
        vec![&ProtocolMessage::new_suspension_message(vec![1])]
    );
}

#[test]
fn journal_mismatch_fails_the_invocation() {
    let (result, frames) = Session::new()
        .start(2, false, vec![])
        .input(&[0x00])
        .entry(Entry::set_state(
            Bytes::from_static(b"k"),
            Bytes::from_static(&[0x01]),
        ))
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            // The journal recorded a set at this position.
            let value = ctx.get("k")?;
            Ok(value.unwrap_or_default())
        }));

    let_assert!(Err(MachineError::JournalMismatch { entry_index: 1, .. }) = result);

    let messages = messages_of(&frames);
    assert_eq!(messages.len(), 2);
    let_assert!(ProtocolMessage::Error(error) = messages[0]);
    assert_eq!(error.code, u32::from(Code::Internal));
    assert_that!(error.message, contains_substring("journal mismatch"));
    assert_eq!(messages[1], &ProtocolMessage::end());
}

#[test]
fn terminal_failure_completes_the_invocation() {
    let (result, frames) = Session::new()
        .start(1, false, vec![])
        .input(&[0x00])
        .run(FnHandler(|_ctx: &Context<'_>, _input| {
            Err(Error::terminal(Code::NotFound, "missing"))
        }));

    assert!(result.is_ok());
    assert_eq!(
        messages_of(&frames),
        vec![
            &output_failure(Code::NotFound, "missing"),
            &ProtocolMessage::end()
        ]
    );
}

#[test]
fn retryable_failure_emits_an_error() {
    let (result, frames) = Session::new()
        .start(1, false, vec![])
        .input(&[0x00])
        .run(FnHandler(|_ctx: &Context<'_>, _input| {
            Err(Error::new(Code::Unavailable, "downstream is down"))
        }));

    assert!(result.is_ok());
    let messages = messages_of(&frames);
    assert_eq!(messages.len(), 2);
    let_assert!(ProtocolMessage::Error(error) = messages[0]);
    assert_eq!(error.code, u32::from(Code::Unavailable));
    assert_eq!(error.message, "downstream is down");
    assert_eq!(messages[1], &ProtocolMessage::end());
}

#[test]
fn side_effect_journals_its_result() {
    let (result, frames) = Session::new()
        .start(1, false, vec![])
        .input(&[0x00])
        .ack(1)
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            ctx.side_effect(|| Ok(Bytes::from_static(&[0xAB])))
        }));

    assert!(result.is_ok());
    let messages = messages_of(&frames);
    assert_eq!(
        messages,
        vec![
            &ProtobufRawEntryCodec::serialize(Entry::side_effect(EntryResult::Success(
                Bytes::from_static(&[0xAB])
            )))
            .into(),
            &output_success(&[0xAB]),
            &ProtocolMessage::end(),
        ]
    );
    // The side effect entry demands an acknowledgment.
    assert_eq!(frames[0].0.requires_ack(), Some(true));
}

#[test]
fn replayed_side_effect_does_not_run_the_closure() {
    let closure_ran = AtomicBool::new(false);

    let (result, frames) = Session::new()
        .start(2, false, vec![])
        .input(&[0x00])
        .entry(Entry::side_effect(EntryResult::Success(
            Bytes::from_static(&[0xAB]),
        )))
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            let value = ctx.side_effect(|| {
                closure_ran.store(true, Ordering::SeqCst);
                Ok(Bytes::from_static(&[0xCD]))
            })?;
            // The recorded result wins over what the closure would return.
            assert_eq!(value, Bytes::from_static(&[0xAB]));
            Ok(value)
        }));

    assert!(result.is_ok());
    assert!(!closure_ran.load(Ordering::SeqCst));
    assert_eq!(
        messages_of(&frames),
        vec![&output_success(&[0xAB]), &ProtocolMessage::end()]
    );
}

#[test]
fn side_effect_terminal_failure_is_journaled() {
    let (result, frames) = Session::new()
        .start(1, false, vec![])
        .input(&[0x00])
        .ack(1)
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            ctx.side_effect(|| Err(Error::terminal(Code::NotFound, "missing")))
        }));

    assert!(result.is_ok());
    let messages = messages_of(&frames);
    assert_eq!(
        messages,
        vec![
            &ProtobufRawEntryCodec::serialize(Entry::side_effect(EntryResult::Failure(
                Code::NotFound,
                "missing".into()
            )))
            .into(),
            &output_failure(Code::NotFound, "missing"),
            &ProtocolMessage::end(),
        ]
    );
}

#[test]
fn side_effect_rejects_a_completion_in_place_of_an_ack() {
    let (result, _) = Session::new()
        .start(1, false, vec![])
        .input(&[0x00])
        .completion(1, CompletionResult::Empty)
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            ctx.side_effect(|| Ok(Bytes::from_static(&[0xAB])))
        }));

    // Acknowledgments and completions are distinct signals; a completion
    // here means the runtime and the handler disagree on the journal.
    let_assert!(Err(MachineError::UnexpectedMessage(_)) = result);
}

// -- Boundary behaviors

#[test]
fn get_on_partial_state_awaits_the_completion() {
    let (result, frames) = Session::new()
        .start(1, true, vec![])
        .input(&[0x00])
        .completion(1, CompletionResult::Empty)
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            // The key may exist remotely, the runtime answers: it does not.
            assert_eq!(ctx.get("k")?, None);
            Ok(Bytes::new())
        }));

    assert!(result.is_ok());
    let messages = messages_of(&frames);
    assert_eq!(
        messages[0],
        &ProtobufRawEntryCodec::serialize(Entry::get_state(Bytes::from_static(b"k"), None)).into()
    );
    assert_eq!(messages[1], &output_success(&[]));
    assert_eq!(messages[2], &ProtocolMessage::end());
}

#[test]
fn get_on_complete_state_answers_misses_locally() {
    let (result, frames) = Session::new()
        .start(1, false, vec![])
        .input(&[0x00])
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            assert_eq!(ctx.get("k")?, None);
            Ok(Bytes::new())
        }));

    assert!(result.is_ok());
    assert_eq!(
        messages_of(&frames)[0],
        &ProtobufRawEntryCodec::serialize(Entry::get_state(
            Bytes::from_static(b"k"),
            Some(GetStateResult::Empty)
        ))
        .into()
    );
}

#[test]
fn zero_duration_sleep_still_journals_and_awaits() {
    let (result, frames) = Session::new()
        .start(1, false, vec![])
        .input(&[0x00])
        .completion(1, CompletionResult::Empty)
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            ctx.sleep(Duration::ZERO)?;
            Ok(Bytes::new())
        }));

    assert!(result.is_ok());
    let messages = messages_of(&frames);
    assert_eq!(messages.len(), 3);
    let_assert!(ProtocolMessage::UnparsedEntry(entry) = messages[0]);
    let_assert!(
        Ok(Entry::Sleep(sleep)) = entry.deserialize_entry::<ProtobufRawEntryCodec>()
    );
    assert_eq!(sleep.result, None);
}

#[test]
fn replayed_fired_sleep_returns_immediately() {
    let (result, frames) = Session::new()
        .start(2, false, vec![])
        .input(&[0x00])
        .entry(Entry::sleep(60_000, Some(SleepResult::Fired)))
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            ctx.sleep(Duration::from_secs(60))?;
            Ok(Bytes::new())
        }));

    assert!(result.is_ok());
    assert_eq!(
        messages_of(&frames),
        vec![&output_success(&[]), &ProtocolMessage::end()]
    );
}

#[test]
fn state_keys_awaits_the_key_list() {
    let state_keys = protocol::get_state_keys_entry_message::StateKeys {
        keys: vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
    };

    let (result, _) = Session::new()
        .start(1, false, vec![])
        .input(&[0x00])
        .completion(
            1,
            CompletionResult::Success(state_keys.encode_to_vec().into()),
        )
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            let keys: Vec<String> = ctx
                .state_keys()?
                .iter()
                .map(|key| String::from(&**key))
                .collect();
            assert_eq!(keys, vec!["a", "b"]);
            Ok(Bytes::new())
        }));

    assert!(result.is_ok());
}

#[test]
fn call_awaits_the_response() {
    let (result, frames) = Session::new()
        .start(1, false, vec![])
        .input(&[0x00])
        .completion(1, CompletionResult::Success(Bytes::from_static(b"pong")))
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            ctx.service("Other").method("ping").call("", &"hi")
        }));

    assert!(result.is_ok());
    let messages = messages_of(&frames);
    let_assert!(ProtocolMessage::UnparsedEntry(entry) = messages[0]);
    let_assert!(
        Ok(Entry::Invoke(invoke)) = entry.deserialize_entry::<ProtobufRawEntryCodec>()
    );
    assert_eq!(&*invoke.request.service_name, "Other");
    assert_eq!(&*invoke.request.method_name, "ping");
    assert_eq!(invoke.result, None);
    assert_eq!(messages[1], &output_success(b"pong"));
}

#[test]
fn send_journals_without_awaiting() {
    let (result, frames) = Session::new()
        .start(1, false, vec![])
        .input(&[0x00])
        .run(FnHandler(|ctx: &Context<'_>, _input| {
            ctx.service("Other").method("ping").send("", &"hi", None)?;
            Ok(Bytes::new())
        }));

    assert!(result.is_ok());
    let messages = messages_of(&frames);
    assert_eq!(messages.len(), 3);
    let_assert!(ProtocolMessage::UnparsedEntry(entry) = messages[0]);
    let_assert!(
        Ok(Entry::BackgroundInvoke(invoke)) = entry.deserialize_entry::<ProtobufRawEntryCodec>()
    );
    assert_eq!(invoke.invoke_time, 0);
}

#[test]
fn handler_panic_becomes_a_retryable_error() {
    let (result, frames) = Session::new()
        .start(1, false, vec![])
        .input(&[0x00])
        .run(FnHandler(|_ctx: &Context<'_>, _input| {
            panic!("boom");
        }));

    assert!(result.is_ok());
    let messages = messages_of(&frames);
    assert_eq!(messages.len(), 2);
    let_assert!(ProtocolMessage::Error(error) = messages[0]);
    assert_eq!(error.code, u32::from(Code::Internal));
    assert_that!(error.message, contains_substring("boom"));
    assert_eq!(messages[1], &ProtocolMessage::end());
}

// -- Handshake failures

#[test]
fn unsupported_protocol_version_is_rejected() {
    let (result, frames) = Session::with_protocol_version(2)
        .start(1, false, vec![])
        .input(&[0x00])
        .run(FnHandler(|_ctx: &Context<'_>, _input| Ok(Bytes::new())));

    let_assert!(Err(MachineError::InvalidVersion(2)) = result);
    assert!(frames.is_empty());
}

#[test]
fn session_must_open_with_a_start_message() {
    let (result, frames) = Session::new()
        .completion(1, CompletionResult::Empty)
        .run(FnHandler(|_ctx: &Context<'_>, _input| Ok(Bytes::new())));

    let_assert!(Err(MachineError::UnexpectedMessage(_)) = result);
    assert!(frames.is_empty());
}

#[test]
fn truncated_replay_prefix_fails_the_session() {
    // The start message promises two entries, only the input arrives.
    let (result, frames) = Session::new()
        .start(2, false, vec![])
        .input(&[0x00])
        .run(FnHandler(|_ctx: &Context<'_>, _input| Ok(Bytes::new())));

    let_assert!(Err(MachineError::Protocol(_)) = result);
    assert!(frames.is_empty());
}
