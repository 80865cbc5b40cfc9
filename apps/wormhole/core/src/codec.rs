//! Envelope framing for the control channel.
//!
//! Every control message travels as a msgpack map
//! `{"type": <tag>, "payload": {<named fields>}}`. The envelope carries no
//! length prefix; its end is found by walking the msgpack structure.

use std::io::{self, Cursor};

use bytes::{Buf, BytesMut};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{self, Message};

/// Largest envelope accepted on a control connection.
pub const MAX_FRAME_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported message type {0}")]
    UnsupportedMessage(u8),
    #[error("truncated control envelope")]
    Truncated,
    #[error("{0} unexpected bytes after control envelope")]
    TrailingBytes(usize),
    #[error("control envelope exceeds {MAX_FRAME_LEN} bytes")]
    FrameTooLarge,
    #[error("malformed control envelope: {0}")]
    Malformed(#[source] rmp_serde::decode::Error),
    #[error("failed to encode control envelope: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Serialize)]
struct EnvelopeRef<'a, P> {
    #[serde(rename = "type")]
    kind: u8,
    payload: &'a P,
}

#[derive(Serialize)]
struct Empty {}

#[derive(Deserialize)]
struct Header {
    #[serde(rename = "type")]
    kind: u8,
    #[allow(dead_code)]
    payload: IgnoredAny,
}

#[derive(Deserialize)]
struct Body<P> {
    payload: P,
}

fn encode<P: Serialize>(kind: u8, payload: &P) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(&EnvelopeRef { kind, payload })?)
}

fn payload<P: DeserializeOwned>(frame: &[u8]) -> Result<P, CodecError> {
    rmp_serde::from_slice::<Body<P>>(frame)
        .map(|body| body.payload)
        .map_err(CodecError::Malformed)
}

fn is_truncation(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;
    match err {
        Error::InvalidMarkerRead(io) | Error::InvalidDataRead(io) => {
            io.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Decodes the envelope at the front of `buf`.
///
/// Returns the message and the number of bytes it occupied, or `None` when
/// `buf` only holds a prefix of an envelope.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>, CodecError> {
    let mut cursor = Cursor::new(buf);
    let header = {
        let mut de = rmp_serde::Deserializer::new(&mut cursor);
        match Header::deserialize(&mut de) {
            Ok(header) => header,
            Err(err) if is_truncation(&err) => return Ok(None),
            Err(err) => return Err(CodecError::Malformed(err)),
        }
    };
    let len = cursor.position() as usize;
    let frame = &buf[..len];

    let message = match header.kind {
        messages::AUTH_CONTROL => Message::AuthControl(payload(frame)?),
        messages::AUTH_TUNNEL => Message::AuthTunnel(payload(frame)?),
        messages::OPEN_TUNNEL => Message::OpenTunnel(payload(frame)?),
        messages::PING => Message::Ping,
        messages::PONG => Message::Pong,
        messages::SHUTDOWN => Message::Shutdown(payload(frame)?),
        messages::RELEASE => Message::Release(payload(frame)?),
        other => return Err(CodecError::UnsupportedMessage(other)),
    };
    Ok(Some((message, len)))
}

impl Message {
    /// Serializes the message into a tagged envelope.
    pub fn pack(&self) -> Result<Vec<u8>, CodecError> {
        let tag = self.tag();
        match self {
            Message::AuthControl(p) => encode(tag, p),
            Message::AuthTunnel(p) => encode(tag, p),
            Message::OpenTunnel(p) => encode(tag, p),
            Message::Ping | Message::Pong => encode(tag, &Empty {}),
            Message::Shutdown(p) => encode(tag, p),
            Message::Release(p) => encode(tag, p),
        }
    }

    /// Parses exactly one envelope. Partial input and leftover bytes are
    /// both errors.
    pub fn unpack(buf: &[u8]) -> Result<Self, CodecError> {
        let (message, used) = decode(buf)?.ok_or(CodecError::Truncated)?;
        if used != buf.len() {
            return Err(CodecError::TrailingBytes(buf.len() - used));
        }
        Ok(message)
    }
}

/// Stream codec for control connections.
///
/// Never yields a partial envelope and copes with several envelopes landing
/// in a single read.
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlCodec;

impl Decoder for ControlCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if src.is_empty() {
            return Ok(None);
        }
        match decode(src)? {
            Some((_, used)) if used > MAX_FRAME_LEN => Err(CodecError::FrameTooLarge),
            Some((message, used)) => {
                src.advance(used);
                Ok(Some(message))
            }
            None if src.len() >= MAX_FRAME_LEN => Err(CodecError::FrameTooLarge),
            None => {
                src.reserve(MAX_FRAME_LEN - src.len());
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::Truncated),
        }
    }
}

impl Encoder<Message> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let frame = item.pack()?;
        if frame.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
