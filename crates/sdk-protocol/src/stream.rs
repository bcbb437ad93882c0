// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Blocking transport of protocol messages over a duplex octet stream.

use std::io;
use std::io::{Read, Write};

use bytes::Bytes;
use tracing::trace;

use crate::message::{Decoder, Encoder, EncodingError, MessageHeader, ProtocolMessage};
use crate::PROTOCOL_VERSION;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("stream ended in the middle of a message")]
    UnexpectedEof,
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reads and writes framed protocol messages over a duplex stream.
///
/// There is no buffering beyond what a single frame requires: `read`
/// pulls from the stream only until one full message is decoded, `write`
/// pushes the encoded frame and flushes.
pub struct MessageStream<S> {
    stream: S,
    encoder: Encoder,
    decoder: Decoder,
}

impl<S: Read + Write> MessageStream<S> {
    pub fn new(stream: S) -> Self {
        Self::with_decoder(stream, Decoder::default())
    }

    pub fn with_message_size_limits(
        stream: S,
        message_size_warning: usize,
        message_size_limit: Option<usize>,
    ) -> Self {
        Self::with_decoder(
            stream,
            Decoder::new(message_size_warning, message_size_limit),
        )
    }

    fn with_decoder(stream: S, decoder: Decoder) -> Self {
        Self {
            stream,
            encoder: Encoder::new(PROTOCOL_VERSION),
            decoder,
        }
    }

    /// Blocks until a full frame is available, the stream ends or a frame
    /// cannot be decoded.
    pub fn read(&mut self) -> Result<(MessageHeader, ProtocolMessage), ProtocolError> {
        loop {
            if let Some((header, message)) = self.decoder.consume_next()? {
                trace!(message_type = ?header.message_type(), "Received message");
                return Ok((header, message));
            }

            let mut buf = [0u8; 4096];
            let read = match self.stream.read(&mut buf) {
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if read == 0 {
                return Err(ProtocolError::UnexpectedEof);
            }
            self.decoder.push(Bytes::copy_from_slice(&buf[..read]));
        }
    }

    /// Transmits a framed message. Short writes surface as io errors.
    pub fn write(&mut self, message: ProtocolMessage) -> Result<(), ProtocolError> {
        let buf = self.encoder.encode(message);
        self.stream.write_all(&buf)?;
        self.stream.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use restate_sdk_types::journal::{Completion, CompletionResult};

    struct Duplex {
        input: io::Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn read_spanning_multiple_chunks() {
        let encoder = Encoder::new(PROTOCOL_VERSION);
        let mut frames = Vec::new();
        frames.extend_from_slice(&encoder.encode(ProtocolMessage::new_start_message(
            "id".into(),
            "id".to_owned(),
            1,
            false,
            vec![],
        )));
        frames.extend_from_slice(
            &encoder.encode(Completion::new(1, CompletionResult::Empty).into()),
        );

        let mut stream = MessageStream::new(Duplex {
            input: io::Cursor::new(frames),
            output: Vec::new(),
        });

        let (header, _) = stream.read().unwrap();
        assert_eq!(header.protocol_version(), Some(PROTOCOL_VERSION));
        let (_, message) = stream.read().unwrap();
        assert_eq!(
            message,
            Completion::new(1, CompletionResult::Empty).into()
        );

        // The input is exhausted, a further read is a truncation.
        assert!(matches!(
            stream.read(),
            Err(ProtocolError::UnexpectedEof)
        ));
    }
}
