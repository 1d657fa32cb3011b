//! Newline-delimited JSON framing for the control channel.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use std::io;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Default cap on a single frame (1 MB).
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

/// Newline-delimited JSON codec.
///
/// Decodes frames into `T` and encodes any serializable value as one compact
/// JSON object followed by `\n`, so one codec type serves both directions of a
/// request/reply connection.
#[derive(Debug)]
pub struct NdJsonCodec<T> {
    _phantom: PhantomData<T>,
    max_length: usize,
    /// Bytes already scanned for a newline in the current partial frame.
    scanned: usize,
    /// Dropping the rest of an oversized line; holds its length so far.
    discarding: Option<usize>,
}

impl<T> NdJsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            _phantom: PhantomData,
            max_length,
            scanned: 0,
            discarding: None,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl<T> Default for NdJsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for NdJsonCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_length(self.max_length)
    }
}

fn too_large(len: usize, max: usize) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("Frame too large: {} > {}", len, max))
}

/// A line that could not be turned into a message. The stream stays in
/// sync, so callers may answer it and keep reading.
#[derive(Debug)]
pub enum MalformedFrame {
    /// The line did not parse.
    Json(serde_json::Error),
    /// The line exceeded the frame cap and was skipped.
    TooLarge { len: usize, max: usize },
}

impl std::fmt::Display for MalformedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MalformedFrame::Json(e) => write!(f, "malformed frame: {}", e),
            MalformedFrame::TooLarge { len, max } => write!(f, "frame too large: {} > {} bytes", len, max),
        }
    }
}

impl std::error::Error for MalformedFrame {}

/// One decoded frame. A frame that fails to parse is yielded as an item
/// rather than an error, since `Framed` ends the stream after any error.
pub type Decoded<T> = Result<T, MalformedFrame>;

impl<T: DeserializeOwned> Decoder for NdJsonCodec<T> {
    type Item = Decoded<T>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline_pos = src[self.scanned..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|pos| pos + self.scanned);

            if let Some(dropped) = self.discarding {
                let Some(pos) = newline_pos else {
                    self.discarding = Some(dropped + src.len());
                    src.clear();
                    self.scanned = 0;
                    return Ok(None);
                };
                src.advance(pos + 1);
                self.scanned = 0;
                self.discarding = None;
                return Ok(Some(Err(MalformedFrame::TooLarge {
                    len: dropped + pos,
                    max: self.max_length,
                })));
            }

            let Some(pos) = newline_pos else {
                if src.len() > self.max_length {
                    // skip to the end of this line without buffering it
                    self.discarding = Some(src.len());
                    src.clear();
                    self.scanned = 0;
                    return Ok(None);
                }
                self.scanned = src.len();
                return Ok(None);
            };

            self.scanned = 0;
            if pos > self.max_length {
                src.advance(pos + 1);
                return Ok(Some(Err(MalformedFrame::TooLarge {
                    len: pos,
                    max: self.max_length,
                })));
            }

            let line = src.split_to(pos);
            src.advance(1);

            // tolerate blank lines and CRLF endings
            let trimmed = line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }

            return Ok(Some(serde_json::from_slice(trimmed).map_err(MalformedFrame::Json)));
        }
    }
}

impl<T, U: Serialize> Encoder<U> for NdJsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: U, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if json.len() > self.max_length {
            return Err(too_large(json.len(), self.max_length));
        }

        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
