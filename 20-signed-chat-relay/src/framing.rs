//! Incremental parser for the length-prefixed stream transport.
//!
//! Each read is appended to a per-connection buffer and every complete frame
//! is cut off the front. After a pass the buffer is empty or holds the prefix
//! of a single frame that has not fully arrived.

use crate::{
    codec::{Codec, LENGTH_PREFIX, MAX_FRAME_LEN},
    error::CodecError,
    message::Envelope,
};

/// What one read produced.
#[derive(Debug)]
pub enum Feed {
    /// The peer closed the stream (zero-length read).
    Closed,
    /// Bytes were buffered but no frame is complete yet.
    Pending,
    /// Complete envelopes, in arrival order.
    Envelopes(Vec<Envelope>),
    /// The stream cannot be re-synchronised. `envelopes` holds what decoded
    /// cleanly ahead of the fault, in arrival order.
    Corrupt {
        envelopes: Vec<Envelope>,
        error: CodecError,
    },
}

#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and decodes every frame now complete.
    ///
    /// After `Feed::Corrupt` the buffer contents are unspecified and the
    /// connection should be dropped.
    pub fn feed(&mut self, codec: &Codec, chunk: &[u8]) -> Feed {
        if chunk.is_empty() {
            return Feed::Closed;
        }
        self.pending.extend_from_slice(chunk);

        let (bodies, mut fault) = split_frames(&mut self.pending);
        let mut envelopes = Vec::with_capacity(bodies.len());
        for body in &bodies {
            match codec.decode(body) {
                Ok(envelope) => envelopes.push(envelope),
                Err(error) => {
                    fault = Some(error);
                    break;
                }
            }
        }

        match fault {
            Some(error) => Feed::Corrupt { envelopes, error },
            None if envelopes.is_empty() => Feed::Pending,
            None => Feed::Envelopes(envelopes),
        }
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Removes every complete frame body from the front of `buffer`.
///
/// Stops at the first length prefix over [`MAX_FRAME_LEN`] and reports it
/// next to the bodies cut before it.
pub fn split_frames(buffer: &mut Vec<u8>) -> (Vec<Vec<u8>>, Option<CodecError>) {
    let mut bodies = Vec::new();
    let mut cursor = 0;
    let mut fault = None;

    while let Some(prefix) = buffer.get(cursor..cursor + LENGTH_PREFIX) {
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if len > MAX_FRAME_LEN {
            fault = Some(CodecError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
            break;
        }
        let start = cursor + LENGTH_PREFIX;
        let Some(body) = buffer.get(start..start + len) else {
            break;
        };
        bodies.push(body.to_vec());
        cursor = start + len;
    }

    buffer.drain(..cursor);
    (bodies, fault)
}
