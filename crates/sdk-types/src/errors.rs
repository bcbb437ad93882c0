// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::borrow::Cow;
use std::fmt;

/// Status code attached to invocation failures, mirroring the gRPC status
/// code space. The numeric values travel on the wire inside `Failure`
/// payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Code {
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<u16> for Code {
    fn from(value: u16) -> Self {
        match value {
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }
}

impl From<u32> for Code {
    fn from(value: u32) -> Self {
        u16::try_from(value).map(Code::from).unwrap_or(Code::Unknown)
    }
}

impl From<Code> for u16 {
    fn from(value: Code) -> Self {
        value as u16
    }
}

impl From<Code> for u32 {
    fn from(value: Code) -> Self {
        value as u32
    }
}

/// An invocation failure, as returned by handlers and journaled operations.
///
/// Two orthogonal classifications attach to every failure: the status
/// [`Code`] (default [`Code::Unknown`]) and whether the failure is
/// *terminal*. A terminal failure completes the invocation with a failure
/// result; a non-terminal failure makes the runtime retry the whole
/// invocation. By default failures are non-terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    code: Code,
    message: Cow<'static, str>,
    description: Option<Cow<'static, str>>,
    terminal: bool,
}

impl Error {
    pub const fn new_static(code: Code, message: &'static str) -> Self {
        Self {
            code,
            message: Cow::Borrowed(message),
            description: None,
            terminal: false,
        }
    }

    /// A retryable failure with the given code.
    pub fn new(code: Code, message: impl fmt::Display) -> Self {
        Self {
            code,
            message: Cow::Owned(message.to_string()),
            description: None,
            terminal: false,
        }
    }

    /// A terminal failure. The runtime will not retry the invocation but
    /// complete it with this failure as its result.
    pub fn terminal(code: Code, message: impl fmt::Display) -> Self {
        Self {
            terminal: true,
            ..Self::new(code, message)
        }
    }

    /// A retryable [`Code::Internal`] failure.
    pub fn internal(message: impl fmt::Display) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn with_description(mut self, description: impl fmt::Display) -> Self {
        self.description = Some(Cow::Owned(description.to_string()));
        self
    }

    pub fn with_code(mut self, code: Code) -> Self {
        self.code = code;
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.message)?;
        if let Some(description) = &self.description {
            write!(f, ".\n{description}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Error::new(Code::Unknown, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips_through_wire_repr() {
        for raw in 1u16..=16 {
            let code = Code::from(raw);
            assert_eq!(u16::from(code), raw);
        }
    }

    #[test]
    fn out_of_range_code_decodes_to_unknown() {
        assert_eq!(Code::from(0u16), Code::Unknown);
        assert_eq!(Code::from(17u16), Code::Unknown);
        assert_eq!(Code::from(u32::MAX), Code::Unknown);
    }

    #[test]
    fn errors_are_retryable_by_default() {
        assert!(!Error::new(Code::NotFound, "nope").is_terminal());
        assert!(Error::terminal(Code::NotFound, "nope").is_terminal());
    }
}
