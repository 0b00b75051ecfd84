// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Newline-delimited JSON framing for ISP messages.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{message::IspMessage, Error};

/// Longest accepted line. A peer that streams more than this without a
/// newline is not speaking the protocol.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Frames one [`IspMessage`] per `\n`-terminated line.
///
/// A line that fails to parse as a message is logged and skipped rather
/// than surfaced as a stream error; a single malformed line must not cost
/// the orchestrator its session.
#[derive(Debug, Default)]
pub struct IspCodec {
    // Scan resumes here so partial lines are not rescanned on every read.
    next_index: usize,
}

impl Decoder for IspCodec {
    type Item = IspMessage;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<IspMessage>, Error> {
        loop {
            let Some(offset) = buf[self.next_index..].iter().position(|byte| *byte == b'\n')
            else {
                if buf.len() > MAX_FRAME_LENGTH {
                    return Err(Error::Framing(format!(
                        "line exceeds {MAX_FRAME_LENGTH} bytes"
                    )));
                }
                self.next_index = buf.len();
                return Ok(None);
            };

            let mut line = buf.split_to(self.next_index + offset + 1);
            self.next_index = 0;
            line.truncate(line.len() - 1);
            if line.ends_with(b"\r") {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice(&line) {
                Ok(message) => return Ok(Some(message)),
                Err(err) => {
                    log::warn!("dropping malformed message: {err}");
                    continue;
                }
            }
        }
    }
}

impl<'a> Encoder<&'a IspMessage> for IspCodec {
    type Error = Error;

    fn encode(&mut self, message: &'a IspMessage, buf: &mut BytesMut) -> Result<(), Error> {
        let json =
            serde_json::to_vec(message).map_err(|err| Error::Framing(err.to_string()))?;
        buf.reserve(json.len() + 1);
        buf.put_slice(&json);
        buf.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn decode_all(codec: &mut IspCodec, buf: &mut BytesMut) -> Vec<IspMessage> {
        let mut messages = Vec::new();
        while let Some(message) = codec.decode(buf).unwrap() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn decode_partial_line() {
        let mut codec = IspCodec::default();
        let mut buf = BytesMut::from(&br#"{"type":"STATUS","#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // the fragment stays buffered until the newline arrives
        assert!(!buf.is_empty());

        buf.extend_from_slice(b"\"timestamp\":1}\n");
        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message.kind, MessageType::Status);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_multiple_lines_in_one_buffer() {
        let mut codec = IspCodec::default();
        let mut buf = BytesMut::from(
            &b"{\"type\":\"STATUS\",\"timestamp\":1}\n{\"type\":\"METRICS\",\"timestamp\":2}\n"[..],
        );
        let messages = decode_all(&mut codec, &mut buf);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, MessageType::Status);
        assert_eq!(messages[1].kind, MessageType::Metrics);
    }

    #[test]
    fn malformed_and_empty_lines_are_skipped() {
        let mut codec = IspCodec::default();
        let mut buf = BytesMut::from(
            &b"this is not json\n\n\r\n{\"type\":\"HEARTBEAT\",\"timestamp\":3}\r\n"[..],
        );
        let messages = decode_all(&mut codec, &mut buf);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageType::Heartbeat);
    }

    #[test]
    fn oversized_line_is_a_framing_error() {
        let mut codec = IspCodec::default();
        let mut buf = BytesMut::from(vec![b'x'; MAX_FRAME_LENGTH + 1].as_slice());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = IspCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(&IspMessage::heartbeat(), &mut buf).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));
        let message: IspMessage = serde_json::from_slice(&buf[..buf.len() - 1]).unwrap();
        assert_eq!(message.kind, MessageType::Heartbeat);
    }
}
