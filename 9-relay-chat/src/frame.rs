//! Delimiter framing for the chat wire protocol.
//!
//! A frame is every byte up to, but not including, a single `0` byte.
//! Reads arrive in arbitrary chunks, so anything after the last delimiter
//! in a chunk is parked in a caller-owned accumulator and prefixed onto the
//! next chunk.

use bytes::{Bytes, BytesMut};

/// Byte that terminates every frame on the wire.
pub const DELIMITER: u8 = 0;

/// Capacity of the scratch buffer each read fills.
pub const READ_BUFFER_CAPACITY: usize = 4096;

/// Appends the delimiter to `payload`, producing a frame ready to send.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.extend_from_slice(payload);
    frame.push(DELIMITER);
    frame
}

/// Lazily splits `chunk` into complete frames, using `pending` to carry a
/// partial frame across calls.
///
/// Iteration may stop early; whatever was not scanned yet is discarded,
/// which is what a connection being torn down mid-chunk wants.
pub fn split_frames<'a>(pending: &'a mut BytesMut, chunk: &'a [u8]) -> Frames<'a> {
    Frames {
        pending,
        rest: chunk,
    }
}

/// Iterator returned by [`split_frames`].
pub struct Frames<'a> {
    pending: &'a mut BytesMut,
    rest: &'a [u8],
}

impl Iterator for Frames<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        let rest = self.rest;
        if rest.is_empty() {
            return None;
        }

        let Some(end) = rest.iter().position(|&byte| byte == DELIMITER) else {
            // No terminator left in this chunk: copy the tail out of the
            // caller's scratch buffer before it gets reused.
            self.pending.extend_from_slice(rest);
            self.rest = &[];
            return None;
        };

        let (body, tail) = rest.split_at(end);
        self.rest = &tail[1..];

        if self.pending.is_empty() {
            return Some(Bytes::copy_from_slice(body));
        }

        self.pending.extend_from_slice(body);
        Some(self.pending.split().freeze())
    }
}
