use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use tracing::{debug, trace};

use crate::checksum;
use crate::error::ProtocolError;
use crate::types::{Frame, FrameType};

/// First byte of every frame.
pub const START_MARKER: u8 = 0xAA;

/// Last byte of every frame.
pub const END_MARKER: u8 = 0x55;

/// Start marker + type + u16 length.
pub const HEADER_LEN: usize = 4;

/// Checksum + end marker.
pub const TRAILER_LEN: usize = 2;

/// Bytes a frame occupies on the wire beyond its payload.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + TRAILER_LEN;

/// Largest payload the length field can express.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Default reassembly capacity: exactly one maximum-size frame.
pub const DEFAULT_BUFFER_CAPACITY: usize = MAX_PAYLOAD_LEN + FRAME_OVERHEAD;

/// Encode a frame for transmission.
///
/// ```text
/// [0xAA] [type: u8] [length: u16 LE] [payload] [checksum: u8] [0x55]
/// ```
pub fn encode_frame(frame: &Frame) -> Bytes {
    let payload = frame.payload();
    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.extend_from_slice(&[START_MARKER, frame.frame_type().as_byte()]);
    buf.extend_from_slice(&frame.length().to_le_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&[frame.checksum(), END_MARKER]);
    buf.freeze()
}

/// Bounded accumulator for inbound bytes.
///
/// Never holds more than `capacity` bytes; `push` takes what fits and
/// reports how much that was.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl ReassemblyBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free room before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    /// Append as much of `data` as fits. Returns the number of bytes taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.remaining());
        self.buf.extend_from_slice(&data[..take]);
        take
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn advance(&mut self, n: usize) {
        self.buf.advance(n);
    }

    fn split_to(&mut self, n: usize) -> BytesMut {
        self.buf.split_to(n)
    }
}

/// Counters for everything the codec threw away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FramingStats {
    pub frames_decoded: u64,
    pub discarded_bytes: u64,
    pub checksum_errors: u64,
    pub end_marker_errors: u64,
    pub oversized: u64,
    pub overflows: u64,
}

/// Streaming frame decoder/encoder for one peer.
///
/// Owns the reassembly buffer, so partial frames survive across `feed` calls.
#[derive(Debug)]
pub struct FrameCodec {
    buffer: ReassemblyBuffer,
    max_payload_len: usize,
    stats: FramingStats,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_LEN, DEFAULT_BUFFER_CAPACITY)
    }
}

impl FrameCodec {
    /// `max_payload_len` is clamped to what the u16 length field can carry,
    /// `buffer_capacity` to at least one empty frame.
    pub fn new(max_payload_len: usize, buffer_capacity: usize) -> Self {
        Self {
            buffer: ReassemblyBuffer::with_capacity(buffer_capacity.max(FRAME_OVERHEAD)),
            max_payload_len: max_payload_len.min(MAX_PAYLOAD_LEN),
            stats: FramingStats::default(),
        }
    }

    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }

    pub fn stats(&self) -> FramingStats {
        self.stats
    }

    /// Bytes currently held waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Encode a frame, enforcing this codec's configured maximum.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let len = frame.payload().len();
        if len > self.max_payload_len {
            return Err(ProtocolError::FrameTooLarge {
                declared: len,
                max: self.max_payload_len,
            });
        }
        Ok(encode_frame(frame))
    }

    /// Feed raw bytes and iterate over the frames they complete.
    ///
    /// The iterator is lazy: input is moved into the bounded buffer only as
    /// room frees up. Framing errors are yielded as `Err` and decoding
    /// continues after them.
    /// Input not yet buffered when the iterator is dropped is discarded, so
    /// callers should drain it.
    pub fn feed<'a>(&'a mut self, input: &'a [u8]) -> Decoded<'a> {
        Decoded { codec: self, input }
    }

    /// Drop everything buffered (used when a session restarts).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Attempt to extract one frame from the head of the buffer.
    ///
    /// Returns `None` when more input is needed.
    fn try_decode(&mut self) -> Option<Result<Frame, ProtocolError>> {
        match self.buffer.as_slice().iter().position(|&b| b == START_MARKER) {
            Some(0) => {}
            Some(skip) => {
                trace!(skip, "discarding bytes before start marker");
                self.stats.discarded_bytes += skip as u64;
                self.buffer.advance(skip);
            }
            None => {
                self.stats.discarded_bytes += self.buffer.len() as u64;
                self.buffer.clear();
                return None;
            }
        }

        let head = self.buffer.as_slice();
        if head.len() < HEADER_LEN {
            return None;
        }

        let type_byte = head[1];
        let declared = u16::from_le_bytes([head[2], head[3]]) as usize;

        if declared > self.max_payload_len {
            debug!(declared, max = self.max_payload_len, "oversized frame, resynchronising");
            self.stats.oversized += 1;
            self.buffer.advance(1);
            return Some(Err(ProtocolError::FrameTooLarge {
                declared,
                max: self.max_payload_len,
            }));
        }

        let total = HEADER_LEN + declared + TRAILER_LEN;
        if head.len() < total {
            return None;
        }

        let end = head[total - 1];
        if end != END_MARKER {
            debug!(found = end, "missing end marker, resynchronising");
            self.stats.end_marker_errors += 1;
            self.buffer.advance(1);
            return Some(Err(ProtocolError::MissingEndMarker(end)));
        }

        let expected = head[HEADER_LEN + declared];
        let payload = &head[HEADER_LEN..HEADER_LEN + declared];
        if !checksum::verify(payload, expected) {
            let actual = checksum::additive(payload);
            debug!(expected, actual, "checksum mismatch, resynchronising");
            self.stats.checksum_errors += 1;
            self.buffer.advance(1);
            return Some(Err(ProtocolError::ChecksumMismatch { expected, actual }));
        }

        let mut raw = self.buffer.split_to(total);
        let frame_type = match FrameType::from_byte(type_byte) {
            Ok(frame_type) => frame_type,
            Err(e) => return Some(Err(e)),
        };

        raw.advance(HEADER_LEN);
        raw.truncate(declared);
        self.stats.frames_decoded += 1;
        Some(Frame::new(frame_type, raw.freeze()))
    }
}

/// Iterator returned by [`FrameCodec::feed`].
pub struct Decoded<'a> {
    codec: &'a mut FrameCodec,
    input: &'a [u8],
}

impl Iterator for Decoded<'_> {
    type Item = Result<Frame, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.codec.try_decode() {
                return Some(item);
            }

            if self.input.is_empty() {
                return None;
            }

            if self.codec.buffer.remaining() == 0 && !self.codec.buffer.is_empty() {
                // Head frame cannot complete within capacity.
                self.codec.stats.overflows += 1;
                self.codec.buffer.advance(1);
                return Some(Err(ProtocolError::BufferOverflow));
            }

            let taken = self.codec.buffer.push(self.input);
            self.input = &self.input[taken..];
        }
    }
}
