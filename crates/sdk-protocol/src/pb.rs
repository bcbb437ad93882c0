// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Hand-maintained mirror of the service protocol protobuf schema. Field
//! numbers must not change: they are the wire contract with the runtime.
//! By convention the result oneofs of completable entry messages use the
//! same tags (13, 14, 15) as `CompletionMessage`, so a completion payload
//! can be appended to an entry payload and decoded as the completed entry
//! (protobuf last-one-wins).

#![allow(clippy::all)]

pub mod protocol {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StartMessage {
        #[prost(bytes = "bytes", tag = "1")]
        pub id: ::prost::bytes::Bytes,
        #[prost(string, tag = "2")]
        pub debug_id: ::prost::alloc::string::String,
        #[prost(uint32, tag = "3")]
        pub known_entries: u32,
        #[prost(message, repeated, tag = "4")]
        pub state_map: ::prost::alloc::vec::Vec<start_message::StateEntry>,
        #[prost(bool, tag = "5")]
        pub partial_state: bool,
    }
    /// Nested message and enum types in `StartMessage`.
    pub mod start_message {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct StateEntry {
            #[prost(bytes = "bytes", tag = "1")]
            pub key: ::prost::bytes::Bytes,
            #[prost(bytes = "bytes", tag = "2")]
            pub value: ::prost::bytes::Bytes,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CompletionMessage {
        #[prost(uint32, tag = "1")]
        pub entry_index: u32,
        #[prost(oneof = "completion_message::Result", tags = "13, 14, 15")]
        pub result: ::core::option::Option<completion_message::Result>,
    }
    /// Nested message and enum types in `CompletionMessage`.
    pub mod completion_message {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Result {
            #[prost(message, tag = "13")]
            Empty(()),
            #[prost(bytes = "bytes", tag = "14")]
            Value(::prost::bytes::Bytes),
            #[prost(message, tag = "15")]
            Failure(super::Failure),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SuspensionMessage {
        #[prost(uint32, repeated, tag = "1")]
        pub entry_indexes: ::prost::alloc::vec::Vec<u32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ErrorMessage {
        #[prost(uint32, tag = "1")]
        pub code: u32,
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
        #[prost(string, tag = "3")]
        pub description: ::prost::alloc::string::String,
    }

    /// Acknowledgment that an entry flagged as requiring one has been
    /// durably received.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct EntryAckMessage {
        #[prost(uint32, tag = "1")]
        pub entry_index: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct EndMessage {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Failure {
        #[prost(uint32, tag = "1")]
        pub code: u32,
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PollInputStreamEntryMessage {
        #[prost(oneof = "poll_input_stream_entry_message::Result", tags = "14, 15")]
        pub result: ::core::option::Option<poll_input_stream_entry_message::Result>,
    }
    /// Nested message and enum types in `PollInputStreamEntryMessage`.
    pub mod poll_input_stream_entry_message {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Result {
            #[prost(bytes = "bytes", tag = "14")]
            Value(::prost::bytes::Bytes),
            #[prost(message, tag = "15")]
            Failure(super::Failure),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct OutputStreamEntryMessage {
        #[prost(oneof = "output_stream_entry_message::Result", tags = "14, 15")]
        pub result: ::core::option::Option<output_stream_entry_message::Result>,
    }
    /// Nested message and enum types in `OutputStreamEntryMessage`.
    pub mod output_stream_entry_message {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Result {
            #[prost(bytes = "bytes", tag = "14")]
            Value(::prost::bytes::Bytes),
            #[prost(message, tag = "15")]
            Failure(super::Failure),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetStateEntryMessage {
        #[prost(bytes = "bytes", tag = "1")]
        pub key: ::prost::bytes::Bytes,
        #[prost(oneof = "get_state_entry_message::Result", tags = "13, 14, 15")]
        pub result: ::core::option::Option<get_state_entry_message::Result>,
    }
    /// Nested message and enum types in `GetStateEntryMessage`.
    pub mod get_state_entry_message {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Result {
            #[prost(message, tag = "13")]
            Empty(()),
            #[prost(bytes = "bytes", tag = "14")]
            Value(::prost::bytes::Bytes),
            #[prost(message, tag = "15")]
            Failure(super::Failure),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SetStateEntryMessage {
        #[prost(bytes = "bytes", tag = "1")]
        pub key: ::prost::bytes::Bytes,
        #[prost(bytes = "bytes", tag = "3")]
        pub value: ::prost::bytes::Bytes,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ClearStateEntryMessage {
        #[prost(bytes = "bytes", tag = "1")]
        pub key: ::prost::bytes::Bytes,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ClearAllStateEntryMessage {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetStateKeysEntryMessage {
        #[prost(oneof = "get_state_keys_entry_message::Result", tags = "14, 15")]
        pub result: ::core::option::Option<get_state_keys_entry_message::Result>,
    }
    /// Nested message and enum types in `GetStateKeysEntryMessage`.
    pub mod get_state_keys_entry_message {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct StateKeys {
            #[prost(bytes = "bytes", repeated, tag = "1")]
            pub keys: ::prost::alloc::vec::Vec<::prost::bytes::Bytes>,
        }

        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Result {
            #[prost(message, tag = "14")]
            Value(StateKeys),
            #[prost(message, tag = "15")]
            Failure(super::Failure),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SleepEntryMessage {
        /// Wake up time, as milliseconds since the unix epoch.
        #[prost(uint64, tag = "1")]
        pub wake_up_time: u64,
        #[prost(oneof = "sleep_entry_message::Result", tags = "13, 15")]
        pub result: ::core::option::Option<sleep_entry_message::Result>,
    }
    /// Nested message and enum types in `SleepEntryMessage`.
    pub mod sleep_entry_message {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Result {
            #[prost(message, tag = "13")]
            Empty(()),
            #[prost(message, tag = "15")]
            Failure(super::Failure),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InvokeEntryMessage {
        #[prost(string, tag = "1")]
        pub service_name: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub method_name: ::prost::alloc::string::String,
        #[prost(bytes = "bytes", tag = "3")]
        pub parameter: ::prost::bytes::Bytes,
        #[prost(oneof = "invoke_entry_message::Result", tags = "14, 15")]
        pub result: ::core::option::Option<invoke_entry_message::Result>,
    }
    /// Nested message and enum types in `InvokeEntryMessage`.
    pub mod invoke_entry_message {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Result {
            #[prost(bytes = "bytes", tag = "14")]
            Value(::prost::bytes::Bytes),
            #[prost(message, tag = "15")]
            Failure(super::Failure),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BackgroundInvokeEntryMessage {
        #[prost(string, tag = "1")]
        pub service_name: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub method_name: ::prost::alloc::string::String,
        #[prost(bytes = "bytes", tag = "3")]
        pub parameter: ::prost::bytes::Bytes,
        /// Time when the invocation should be executed, as milliseconds
        /// since the unix epoch. Zero means immediately.
        #[prost(uint64, tag = "4")]
        pub invoke_time: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SideEffectEntryMessage {
        #[prost(oneof = "side_effect_entry_message::Result", tags = "14, 15")]
        pub result: ::core::option::Option<side_effect_entry_message::Result>,
    }
    /// Nested message and enum types in `SideEffectEntryMessage`.
    pub mod side_effect_entry_message {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Result {
            #[prost(bytes = "bytes", tag = "14")]
            Value(::prost::bytes::Bytes),
            #[prost(message, tag = "15")]
            Failure(super::Failure),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AwakeableEntryMessage {
        #[prost(oneof = "awakeable_entry_message::Result", tags = "14, 15")]
        pub result: ::core::option::Option<awakeable_entry_message::Result>,
    }
    /// Nested message and enum types in `AwakeableEntryMessage`.
    pub mod awakeable_entry_message {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Result {
            #[prost(bytes = "bytes", tag = "14")]
            Value(::prost::bytes::Bytes),
            #[prost(message, tag = "15")]
            Failure(super::Failure),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CompleteAwakeableEntryMessage {
        #[prost(string, tag = "1")]
        pub id: ::prost::alloc::string::String,
        #[prost(oneof = "complete_awakeable_entry_message::Result", tags = "14, 15")]
        pub result: ::core::option::Option<complete_awakeable_entry_message::Result>,
    }
    /// Nested message and enum types in `CompleteAwakeableEntryMessage`.
    pub mod complete_awakeable_entry_message {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Result {
            #[prost(bytes = "bytes", tag = "14")]
            Value(::prost::bytes::Bytes),
            #[prost(message, tag = "15")]
            Failure(super::Failure),
        }
    }
}
