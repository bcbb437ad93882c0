// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-invocation state machine. It bridges the handler's control flow
//! to the runtime's journal: operations the journal already contains are
//! replayed without touching the network, fresh operations are journaled
//! before the handler observes their result, and an operation whose
//! completion is not available yet suspends the session.

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use bytes::Bytes;
use bytestring::ByteString;
use parking_lot::Mutex;
use prost::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn};

use restate_sdk_protocol::codec::ProtobufRawEntryCodec;
use restate_sdk_protocol::message::ProtocolMessage;
use restate_sdk_protocol::pb::protocol;
use restate_sdk_protocol::stream::MessageStream;
use restate_sdk_protocol::PROTOCOL_VERSION;
use restate_sdk_types::errors::{Code, Error};
use restate_sdk_types::journal::raw::{RawEntry, RawEntryCodec};
use restate_sdk_types::journal::{
    Completion, CompletionResult, Entry, EntryIndex, EntryResult, EntryType, GetStateKeysResult,
    GetStateResult, InvokeRequest, SleepResult,
};
use restate_sdk_types::retries::RetryPolicy;
use restate_sdk_types::time::MillisSinceEpoch;

use crate::context::{Context, StateMachine};
use crate::error::MachineError;
use crate::handler::Handler;
use crate::suspend::{abort, suspend, Unwind};

/// Value of a key in the state cache. A key missing from the cache is
/// unknown when the state map is partial, known absent otherwise.
#[derive(Debug, Clone)]
enum StateValue {
    Present(Bytes),
    Absent,
}

struct Inner<S> {
    stream: MessageStream<S>,

    partial_state: bool,
    state: HashMap<Bytes, StateValue>,

    entries: Vec<RawEntry>,
    current_entry: usize,
}

/// One state machine per invocation. It exclusively owns the stream, the
/// journal prefix and the state cache for the lifetime of the invocation.
///
/// The mutex guards the journal position, the state cache and the
/// outgoing side of the stream. It is held across the completion read of
/// a fresh blocking operation: the handler is single-writer by
/// construction, no other operation may proceed until the current one
/// completes or suspends.
pub struct Machine<H, S> {
    handler: H,
    inner: Mutex<Inner<S>>,
}

impl<H, S> Machine<H, S>
where
    S: Read + Write,
{
    pub fn new(handler: H, stream: S) -> Self {
        Self {
            handler,
            inner: Mutex::new(Inner {
                stream: MessageStream::new(stream),
                partial_state: false,
                state: HashMap::new(),
                entries: Vec::new(),
                current_entry: 0,
            }),
        }
    }
}

impl<H, S> Machine<H, S>
where
    H: Handler,
    S: Read + Write,
{
    /// Runs the invocation session to its end: reads the start handshake
    /// and the replay prefix, executes the handler, and emits the session
    /// outcome.
    ///
    /// Errors returned here occurred below the handler's abstraction; the
    /// runtime will reinvoke with the journal prefix.
    pub fn run(&self, cancellation: CancellationToken, method: &str) -> Result<(), MachineError> {
        let (debug_id, input) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let (header, msg) = inner.stream.read()?;
            let ProtocolMessage::Start(start) = msg else {
                return Err(MachineError::UnexpectedMessage(header.message_type()));
            };
            let version = header.protocol_version().unwrap_or_default();
            if version != PROTOCOL_VERSION {
                return Err(MachineError::InvalidVersion(version));
            }

            inner.partial_state = start.partial_state;
            for entry in start.state_map {
                inner.state.insert(entry.key, StateValue::Present(entry.value));
            }

            let (header, msg) = inner.stream.read()?;
            let input_entry = match msg {
                ProtocolMessage::UnparsedEntry(raw) if raw.ty() == EntryType::PollInputStream => {
                    raw
                }
                _ => return Err(MachineError::UnexpectedMessage(header.message_type())),
            };

            // The poll input entry is journal position 0 and is not part
            // of the replay prefix.
            inner.entries = Vec::with_capacity(start.known_entries.saturating_sub(1) as usize);
            for _ in 1..start.known_entries {
                let (header, msg) = inner.stream.read()?;
                let ProtocolMessage::UnparsedEntry(raw) = msg else {
                    return Err(MachineError::UnexpectedMessage(header.message_type()));
                };
                trace!(message_type = ?header.message_type(), "Replay journal entry");
                inner.entries.push(raw);
            }

            let input = match input_entry.deserialize_entry::<ProtobufRawEntryCodec>()? {
                Entry::PollInputStream(input) => input,
                _ => unreachable!("the input entry type was checked above"),
            };

            (start.debug_id, input.result)
        };

        let span = info_span!(
            "invocation",
            restate.invocation.id = %debug_id,
            rpc.method = %method,
        );
        let _enter = span.enter();

        debug!("Start invocation");
        let result = self.invoke(&Context::new(self, cancellation), input);
        debug!("Invocation ended");
        result
    }

    /// Runs the handler and emits exactly one session outcome: output and
    /// end, a suspension, or an error.
    fn invoke(&self, ctx: &Context<'_>, input: EntryResult) -> Result<(), MachineError> {
        let handler_result = match input {
            EntryResult::Success(value) => {
                catch_unwind(AssertUnwindSafe(|| self.handler.call(ctx, value)))
            }
            // A failure recorded in the input entry completes the
            // invocation with that failure, the handler does not run.
            EntryResult::Failure(code, message) => Ok(Err(Error::terminal(code, message))),
        };

        let mut inner = self.inner.lock();
        match handler_result {
            Ok(result) => {
                let mut write_result = inner
                    .stream
                    .write(output_message(result))
                    .map_err(MachineError::from);
                if let Err(e) = &write_result {
                    warn!("Error sending output message: {e}");
                }
                // End is attempted even after a failed output write.
                if let Err(e) = inner.stream.write(ProtocolMessage::end()) {
                    warn!("Error sending end message: {e}");
                    if write_result.is_ok() {
                        write_result = Err(MachineError::from(e));
                    }
                }
                write_result
            }
            Err(panic) => match panic.downcast::<Unwind>() {
                Ok(unwind) => match *unwind {
                    Unwind::Suspend(entry_index) => {
                        debug!(restate.journal.index = entry_index, "Suspending invocation");
                        // No end message: the session is resumed by a
                        // future invocation carrying a longer journal.
                        inner
                            .stream
                            .write(ProtocolMessage::new_suspension_message(vec![entry_index]))
                            .map_err(MachineError::from)
                    }
                    Unwind::Abort(error) => {
                        warn!("Invocation failed: {error}");
                        let msg = protocol::ErrorMessage {
                            code: Code::Internal.into(),
                            message: error.to_string(),
                            description: String::new(),
                        };
                        if let Err(e) = inner.stream.write(ProtocolMessage::Error(msg)) {
                            warn!("Error sending failure message: {e}");
                        }
                        if let Err(e) = inner.stream.write(ProtocolMessage::end()) {
                            warn!("Error sending end message: {e}");
                        }
                        Err(error)
                    }
                },
                Err(panic) => {
                    warn!("Handler panicked: {}", panic_message(panic.as_ref()));
                    let msg = protocol::ErrorMessage {
                        code: Code::Internal.into(),
                        message: panic_message(panic.as_ref()),
                        description: Backtrace::force_capture().to_string(),
                    };
                    if let Err(e) = inner.stream.write(ProtocolMessage::Error(msg)) {
                        warn!("Error sending failure message: {e}");
                    }
                    if let Err(e) = inner.stream.write(ProtocolMessage::end()) {
                        warn!("Error sending end message: {e}");
                    }
                    Ok(())
                }
            },
        }
    }
}

impl<H, S> Machine<H, S>
where
    S: Read + Write,
{
    /// Either replays the journal entry at the current position or
    /// produces a new one.
    ///
    /// When a replay entry exists its kind must equal the kind the handler
    /// issues; a mismatch means the handler code diverged from the journal
    /// and is fatal. Replayed operations never touch the network; fresh
    /// operations are fully journaled before the handler observes their
    /// result.
    fn replay_or_new<T>(
        &self,
        expected: EntryType,
        replay: impl FnOnce(Entry, EntryIndex) -> Result<T, Error>,
        new: impl FnOnce(&mut Inner<S>, EntryIndex) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // Absolute journal position of this operation; the input entry
        // occupies position 0.
        let entry_index = inner.current_entry as EntryIndex + 1;

        let result = match inner.entries.get(inner.current_entry) {
            Some(raw) => {
                let actual = raw.ty();
                if actual != expected {
                    abort(MachineError::JournalMismatch {
                        entry_index,
                        expected,
                        actual,
                    });
                }
                trace!(restate.journal.index = entry_index, entry_type = %expected, "Replay entry");
                let entry = match raw.deserialize_entry::<ProtobufRawEntryCodec>() {
                    Ok(entry) => entry,
                    Err(e) => abort(e.into()),
                };
                replay(entry, entry_index)
            }
            None => {
                trace!(restate.journal.index = entry_index, entry_type = %expected, "New entry");
                new(inner, entry_index)
            }
        };

        inner.current_entry += 1;
        result
    }
}

impl<H, S: Read + Write> StateMachine for Machine<H, S> {
    fn set(&self, key: Bytes, value: Bytes) -> Result<(), Error> {
        self.replay_or_new(
            EntryType::SetState,
            |_, _| Ok(()),
            move |inner, _| {
                inner.write_entry(Entry::set_state(key.clone(), value.clone()));
                inner.state.insert(key, StateValue::Present(value));
                Ok(())
            },
        )
    }

    fn clear(&self, key: Bytes) -> Result<(), Error> {
        self.replay_or_new(
            EntryType::ClearState,
            |_, _| Ok(()),
            move |inner, _| {
                inner.write_entry(Entry::clear_state(key.clone()));
                inner.state.insert(key, StateValue::Absent);
                Ok(())
            },
        )
    }

    fn clear_all(&self) -> Result<(), Error> {
        self.replay_or_new(
            EntryType::ClearAllState,
            |_, _| Ok(()),
            |inner, _| {
                inner.write_entry(Entry::clear_all_state());
                // After dropping everything the cache fully describes the
                // user state.
                inner.state.clear();
                inner.partial_state = false;
                Ok(())
            },
        )
    }

    fn get(&self, key: Bytes) -> Result<Option<Bytes>, Error> {
        self.replay_or_new(
            EntryType::GetState,
            |entry, entry_index| {
                let Entry::GetState(entry) = entry else {
                    unreachable!("the entry type was checked")
                };
                match entry.value {
                    Some(GetStateResult::Result(value)) => Ok(Some(value)),
                    Some(GetStateResult::Empty) => Ok(None),
                    Some(GetStateResult::Failure(code, message)) => {
                        Err(Error::terminal(code, message))
                    }
                    None => suspend(entry_index),
                }
            },
            move |inner, entry_index| match inner.state.get(&key).cloned() {
                Some(StateValue::Present(value)) => {
                    inner.write_entry(Entry::get_state(
                        key,
                        Some(GetStateResult::Result(value.clone())),
                    ));
                    Ok(Some(value))
                }
                Some(StateValue::Absent) => {
                    inner.write_entry(Entry::get_state(key, Some(GetStateResult::Empty)));
                    Ok(None)
                }
                None if !inner.partial_state => {
                    // A complete state map answers misses authoritatively.
                    inner.write_entry(Entry::get_state(key, Some(GetStateResult::Empty)));
                    Ok(None)
                }
                None => {
                    // Unknown key under a partial state map: the key may
                    // still exist remotely.
                    inner.write_entry(Entry::get_state(key.clone(), None));
                    match inner.read_completion(entry_index) {
                        CompletionResult::Empty => {
                            inner.state.insert(key, StateValue::Absent);
                            Ok(None)
                        }
                        CompletionResult::Success(value) => {
                            inner.state.insert(key, StateValue::Present(value.clone()));
                            Ok(Some(value))
                        }
                        CompletionResult::Failure(code, message) => {
                            Err(Error::terminal(code, message))
                        }
                    }
                }
            },
        )
    }

    fn state_keys(&self) -> Result<Vec<ByteString>, Error> {
        self.replay_or_new(
            EntryType::GetStateKeys,
            |entry, entry_index| {
                let Entry::GetStateKeys(entry) = entry else {
                    unreachable!("the entry type was checked")
                };
                match entry.value {
                    Some(GetStateKeysResult::Result(keys)) => keys_to_strings(keys),
                    Some(GetStateKeysResult::Failure(code, message)) => {
                        Err(Error::terminal(code, message))
                    }
                    None => suspend(entry_index),
                }
            },
            |inner, entry_index| {
                inner.write_entry(Entry::get_state_keys(None));
                match inner.read_completion(entry_index) {
                    CompletionResult::Empty => Ok(Vec::new()),
                    CompletionResult::Success(buf) => {
                        match protocol::get_state_keys_entry_message::StateKeys::decode(buf) {
                            Ok(state_keys) => keys_to_strings(state_keys.keys),
                            Err(e) => abort(MachineError::CompletionDecode(e)),
                        }
                    }
                    CompletionResult::Failure(code, message) => Err(Error::terminal(code, message)),
                }
            },
        )
    }

    fn sleep_until(&self, wake_up_time: MillisSinceEpoch) -> Result<(), Error> {
        self.replay_or_new(
            EntryType::Sleep,
            |entry, entry_index| {
                let Entry::Sleep(entry) = entry else {
                    unreachable!("the entry type was checked")
                };
                match entry.result {
                    Some(SleepResult::Fired) => Ok(()),
                    Some(SleepResult::Failure(code, message)) => Err(Error::terminal(code, message)),
                    None => suspend(entry_index),
                }
            },
            move |inner, entry_index| {
                inner.write_entry(Entry::sleep(wake_up_time.into(), None));
                match inner.read_completion(entry_index) {
                    CompletionResult::Empty | CompletionResult::Success(_) => Ok(()),
                    CompletionResult::Failure(code, message) => Err(Error::terminal(code, message)),
                }
            },
        )
    }

    fn side_effect(
        &self,
        closure: &mut dyn FnMut() -> Result<Bytes, Error>,
        retry_policy: RetryPolicy,
    ) -> Result<Bytes, Error> {
        self.replay_or_new(
            EntryType::SideEffect,
            |entry, _| {
                // The recorded result is authoritative, the closure is not
                // executed again even if it is non-deterministic.
                let Entry::SideEffect(entry) = entry else {
                    unreachable!("the entry type was checked")
                };
                match entry.result {
                    EntryResult::Success(value) => Ok(value),
                    EntryResult::Failure(code, message) => Err(Error::terminal(code, message)),
                }
            },
            move |inner, entry_index| {
                let mut retries = retry_policy.into_iter();
                let result = loop {
                    match closure() {
                        Ok(value) => break EntryResult::Success(value),
                        Err(err) if err.is_terminal() => {
                            break EntryResult::Failure(err.code(), err.message().into())
                        }
                        Err(err) => match retries.next() {
                            Some(pause) => {
                                debug!("Side effect failed, retrying in {pause:?}: {err}");
                                thread::sleep(pause);
                            }
                            // Retries exhausted without a durable outcome:
                            // nothing is journaled, the whole invocation is
                            // retried by the runtime.
                            None => return Err(err),
                        },
                    }
                };
                inner.write_entry(Entry::side_effect(result.clone()));
                // The entry carries the requires-ack flag: the runtime
                // answers with an acknowledgment, not a completion. The
                // locally computed result is authoritative.
                inner.read_ack(entry_index);
                match result {
                    EntryResult::Success(value) => Ok(value),
                    EntryResult::Failure(code, message) => Err(Error::terminal(code, message)),
                }
            },
        )
    }

    fn invoke(&self, request: InvokeRequest) -> Result<Bytes, Error> {
        self.replay_or_new(
            EntryType::Invoke,
            |entry, entry_index| {
                let Entry::Invoke(entry) = entry else {
                    unreachable!("the entry type was checked")
                };
                match entry.result {
                    Some(EntryResult::Success(value)) => Ok(value),
                    Some(EntryResult::Failure(code, message)) => {
                        Err(Error::terminal(code, message))
                    }
                    None => suspend(entry_index),
                }
            },
            move |inner, entry_index| {
                inner.write_entry(Entry::invoke(request, None));
                match inner.read_completion(entry_index) {
                    CompletionResult::Empty => Ok(Bytes::new()),
                    CompletionResult::Success(value) => Ok(value),
                    CompletionResult::Failure(code, message) => Err(Error::terminal(code, message)),
                }
            },
        )
    }

    fn background_invoke(
        &self,
        request: InvokeRequest,
        invoke_time: Option<MillisSinceEpoch>,
    ) -> Result<(), Error> {
        self.replay_or_new(
            EntryType::BackgroundInvoke,
            |_, _| Ok(()),
            move |inner, _| {
                inner.write_entry(Entry::background_invoke(
                    request,
                    invoke_time.map(u64::from),
                ));
                Ok(())
            },
        )
    }
}

impl<S: Read + Write> Inner<S> {
    /// Journals a fresh entry. Failures here are below the handler's
    /// abstraction and unwind the session.
    fn write_entry(&mut self, entry: Entry) {
        let raw = ProtobufRawEntryCodec::serialize(entry);
        if let Err(e) = self.stream.write(raw.into()) {
            abort(e.into());
        }
    }

    /// Blocks until the completion for the given entry arrives. Any other
    /// message at this point means the handler and the runtime disagree on
    /// the journal.
    fn read_completion(&mut self, entry_index: EntryIndex) -> CompletionResult {
        let (header, message) = match self.stream.read() {
            Ok(res) => res,
            Err(e) => abort(e.into()),
        };
        match message {
            ProtocolMessage::Completion(completion) if completion.entry_index == entry_index => {
                Completion::from(completion).result
            }
            ProtocolMessage::Completion(completion) => abort(MachineError::CompletionMismatch {
                expected: entry_index,
                actual: completion.entry_index,
            }),
            _ => abort(MachineError::UnexpectedMessage(header.message_type())),
        }
    }

    /// Blocks until the entry flagged as requiring an acknowledgment is
    /// acked by the runtime.
    fn read_ack(&mut self, entry_index: EntryIndex) {
        let (header, message) = match self.stream.read() {
            Ok(res) => res,
            Err(e) => abort(e.into()),
        };
        match message {
            ProtocolMessage::EntryAck(ack) if ack.entry_index == entry_index => {}
            ProtocolMessage::EntryAck(ack) => abort(MachineError::AckMismatch {
                expected: entry_index,
                actual: ack.entry_index,
            }),
            _ => abort(MachineError::UnexpectedMessage(header.message_type())),
        }
    }
}

/// Converts the handler outcome into the message completing the session:
/// an output entry carrying the success value or the terminal failure, or
/// a retryable error message.
fn output_message(result: Result<Bytes, Error>) -> ProtocolMessage {
    match result {
        Ok(value) => {
            ProtobufRawEntryCodec::serialize(Entry::output_stream(EntryResult::Success(value)))
                .into()
        }
        Err(err) if err.is_terminal() => {
            warn!("Invocation completed with a failure: {err}");
            ProtobufRawEntryCodec::serialize(Entry::output_stream(EntryResult::Failure(
                err.code(),
                err.message().into(),
            )))
            .into()
        }
        Err(err) => {
            warn!("Invocation failed: {err}");
            ProtocolMessage::Error(protocol::ErrorMessage {
                code: err.code().into(),
                message: err.message().to_owned(),
                description: err.description().unwrap_or_default().to_owned(),
            })
        }
    }
}

fn keys_to_strings(keys: Vec<Bytes>) -> Result<Vec<ByteString>, Error> {
    keys.into_iter()
        .map(|key| {
            ByteString::try_from(key)
                .map_err(|e| Error::internal(format!("state key is not valid UTF-8: {e}")))
        })
        .collect()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}
