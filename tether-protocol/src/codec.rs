//! Newline-delimited JSON framing for the bridge socket

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{RequestEnvelope, ResponseEnvelope};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// A line the server could not turn into text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

/// One decoded line on the server side
///
/// Unreadable lines are surfaced as `Invalid` instead of a codec error so the
/// connection survives and the router can answer with a `ParseError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Invalid(FrameError),
}

/// Shared line splitter with an oversized-frame discard mode
#[derive(Debug, Clone)]
struct LineFramer {
    max: usize,
    /// Offset already scanned for a newline
    next_index: usize,
    /// Inside an oversized frame, dropping bytes until the next newline
    discarding: bool,
    discarded: usize,
}

impl LineFramer {
    fn new(max: usize) -> Self {
        Self {
            max,
            next_index: 0,
            discarding: false,
            discarded: 0,
        }
    }

    fn decode(&mut self, src: &mut BytesMut) -> Option<Result<BytesMut, FrameError>> {
        loop {
            let start = self.next_index.min(src.len());
            let newline = src[start..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if self.discarding {
                    self.discarded += src.len();
                    src.clear();
                    self.next_index = 0;
                } else if src.len() > self.max {
                    self.discarding = true;
                    self.discarded = src.len();
                    src.clear();
                    self.next_index = 0;
                } else {
                    self.next_index = src.len();
                }
                return None;
            };

            let end = start + offset;
            self.next_index = 0;

            if self.discarding {
                let size = self.discarded + end;
                src.advance(end + 1);
                self.discarding = false;
                self.discarded = 0;
                return Some(Err(FrameError::TooLarge {
                    size,
                    max: self.max,
                }));
            }

            let mut line = src.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.len() > self.max {
                return Some(Err(FrameError::TooLarge {
                    size: line.len(),
                    max: self.max,
                }));
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Some(Ok(line));
        }
    }

    /// Flush an unterminated final line once the peer has closed
    fn decode_eof(&mut self, src: &mut BytesMut) -> Option<Result<BytesMut, FrameError>> {
        if let Some(frame) = self.decode(src) {
            return Some(frame);
        }

        if self.discarding {
            let size = self.discarded + src.len();
            src.clear();
            self.discarding = false;
            self.discarded = 0;
            return Some(Err(FrameError::TooLarge {
                size,
                max: self.max,
            }));
        }

        self.next_index = 0;
        let mut line = src.split();
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(Ok(line))
    }
}

/// Serialize one envelope as a JSON line
fn encode_line<T: serde::Serialize>(
    item: &T,
    max: usize,
    dst: &mut BytesMut,
) -> Result<(), CodecError> {
    let data = serde_json::to_vec(item)?;

    if data.len() > max {
        return Err(CodecError::MessageTooLarge {
            size: data.len(),
            max,
        });
    }

    dst.reserve(data.len() + 1);
    dst.put_slice(&data);
    dst.put_u8(b'\n');
    Ok(())
}

/// Codec for RequestEnvelope (decoding as raw frames) and ResponseEnvelope
/// (encoding). Used by the server side.
#[derive(Debug, Clone)]
pub struct ServerCodec {
    framer: LineFramer,
}

impl ServerCodec {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max: usize) -> Self {
        Self {
            framer: LineFramer::new(max),
        }
    }

    fn to_frame(line: Result<BytesMut, FrameError>) -> Frame {
        match line {
            Ok(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => Frame::Text(text),
                Err(_) => Frame::Invalid(FrameError::InvalidUtf8),
            },
            Err(e) => Frame::Invalid(e),
        }
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ServerCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.framer.decode(src).map(Self::to_frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.framer.decode_eof(src).map(Self::to_frame))
    }
}

impl Encoder<ResponseEnvelope> for ServerCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ResponseEnvelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_line(&item, self.framer.max, dst)
    }
}

/// Codec for RequestEnvelope (encoding) and ResponseEnvelope (decoding).
/// Used by the client side.
#[derive(Debug, Clone)]
pub struct ClientCodec {
    framer: LineFramer,
}

impl ClientCodec {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max: usize) -> Self {
        Self {
            framer: LineFramer::new(max),
        }
    }

    fn parse(line: Result<BytesMut, FrameError>) -> Result<ResponseEnvelope, CodecError> {
        match line {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(FrameError::TooLarge { size, max }) => {
                Err(CodecError::MessageTooLarge { size, max })
            }
            Err(FrameError::InvalidUtf8) => Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame is not valid UTF-8",
            ))),
        }
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ClientCodec {
    type Item = ResponseEnvelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.framer.decode(src).map(Self::parse).transpose()
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.framer.decode_eof(src).map(Self::parse).transpose()
    }
}

impl Encoder<RequestEnvelope> for ClientCodec {
    type Error = CodecError;

    fn encode(&mut self, item: RequestEnvelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_line(&item, self.framer.max, dst)
    }
}
