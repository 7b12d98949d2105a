//! Datagram encoding/decoding
//!
//! Implements the binary frame format with an additive one-byte checksum,
//! plus a streaming parser that recovers frame synchronization on a lossy
//! byte stream.
//!
//! Frame format (all multi-byte fields little-endian):
//! - 2 bytes: frame marker
//! - 2 bytes: total frame length (header + payload + checksum)
//! - 1 byte: source module address
//! - 1 byte: packet id (command number)
//! - 2 bytes: message sequence number
//! - 2 bytes: reference sequence number (correlates response to request)
//! - N bytes: payload
//! - 1 byte: checksum (low byte of the sum of all preceding bytes)

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use tracing::{debug, warn};

use super::{
    CHECKSUM_SIZE, FRAME_MARKER, HEADER_SIZE, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, MIN_FRAME_SIZE,
};

/// Reasons a byte slice fails to decode as a datagram.
///
/// Checksum mismatch is an expected outcome on a lossy bus; callers drop
/// the frame and resynchronize rather than treating it as fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the smallest legal frame.
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    /// The first two bytes are not the frame marker.
    #[error("bad frame marker")]
    BadMarker,

    /// The declared length field is outside the legal range or does not
    /// match the supplied byte count.
    #[error("bad frame length: {0}")]
    BadLength(u16),

    /// The trailing checksum does not match the frame contents.
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes.
        expected: u8,
        /// Checksum byte carried by the frame.
        actual: u8,
    },
}

/// One complete framed, checksummed unit on the wire.
///
/// Immutable once built: constructed freshly per transmit or per received
/// frame and never mutated after the checksum is computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Source module address.
    pub source: u8,
    /// Packet id (command number).
    pub packet_id: u8,
    /// Message sequence number; wraps modulo 2^16.
    pub msg_num: u16,
    /// Reference sequence number; a response carries the request's
    /// message number here. Correlation is by exact value match only.
    pub ref_num: u16,
    /// Command payload.
    pub payload: Vec<u8>,
}

impl Datagram {
    /// Build a datagram from its fields.
    ///
    /// The payload must fit in one frame; an oversized payload would
    /// encode a frame no receiver accepts.
    pub fn new(source: u8, packet_id: u8, msg_num: u16, ref_num: u16, payload: Vec<u8>) -> Self {
        debug_assert!(
            payload.len() <= MAX_PAYLOAD_SIZE,
            "payload of {} bytes exceeds the {} byte frame limit",
            payload.len(),
            MAX_PAYLOAD_SIZE
        );
        Self {
            source,
            packet_id,
            msg_num,
            ref_num,
            payload,
        }
    }

    /// Total encoded frame length, including header and checksum.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + CHECKSUM_SIZE
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.frame_len());
        bytes.extend_from_slice(&FRAME_MARKER);

        let mut len_bytes = [0u8; 2];
        LittleEndian::write_u16(&mut len_bytes, self.frame_len() as u16);
        bytes.extend_from_slice(&len_bytes);

        bytes.push(self.source);
        bytes.push(self.packet_id);

        let mut num_bytes = [0u8; 2];
        LittleEndian::write_u16(&mut num_bytes, self.msg_num);
        bytes.extend_from_slice(&num_bytes);
        LittleEndian::write_u16(&mut num_bytes, self.ref_num);
        bytes.extend_from_slice(&num_bytes);

        bytes.extend_from_slice(&self.payload);
        bytes.push(checksum(&bytes));
        bytes
    }

    /// Decode a complete frame.
    ///
    /// Validates the marker, the declared length, and the checksum.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < MIN_FRAME_SIZE {
            return Err(DecodeError::TooShort(data.len()));
        }
        if data[0..2] != FRAME_MARKER {
            return Err(DecodeError::BadMarker);
        }

        let declared = LittleEndian::read_u16(&data[2..4]);
        let declared_len = declared as usize;
        if declared_len < MIN_FRAME_SIZE
            || declared_len > MAX_FRAME_SIZE
            || declared_len != data.len()
        {
            return Err(DecodeError::BadLength(declared));
        }

        let expected = checksum(&data[..declared_len - 1]);
        let actual = data[declared_len - 1];
        if expected != actual {
            return Err(DecodeError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            source: data[4],
            packet_id: data[5],
            msg_num: LittleEndian::read_u16(&data[6..8]),
            ref_num: LittleEndian::read_u16(&data[8..10]),
            payload: data[HEADER_SIZE..declared_len - 1].to_vec(),
        })
    }
}

/// Low byte of the sum of all bytes.
fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Counters kept by [`FrameParser`] across its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Complete frames successfully decoded.
    pub frames: u64,
    /// Bytes discarded while hunting for the frame marker.
    pub garbage_bytes: u64,
    /// Frames dropped because their checksum did not match.
    pub checksum_failures: u64,
}

/// Streaming frame parser with byte-level resynchronization.
///
/// Feed received bytes one at a time; the parser hunts for the frame
/// marker whenever synchronization is lost, buffers the header and the
/// declared payload, verifies the checksum, and emits complete datagrams.
/// Sync loss and recovery are logged once per transition, not per byte.
pub struct FrameParser {
    buf: Vec<u8>,
    synchronized: bool,
    stats: ParserStats,
}

impl FrameParser {
    /// Create a parser in the unsynchronized state.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(MAX_FRAME_SIZE),
            synchronized: false,
            stats: ParserStats::default(),
        }
    }

    /// Lifetime counters.
    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Whether the parser currently believes it is on a frame boundary.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// Consume one received byte, returning a datagram if it completes one.
    pub fn push(&mut self, byte: u8) -> Option<Datagram> {
        self.buf.push(byte);
        loop {
            if !self.buf.is_empty() && self.buf[0] != FRAME_MARKER[0] {
                self.discard_front(1);
                continue;
            }
            if self.buf.len() >= 2 && self.buf[1] != FRAME_MARKER[1] {
                self.discard_front(1);
                continue;
            }
            if self.buf.len() < 4 {
                return None;
            }

            let declared = LittleEndian::read_u16(&self.buf[2..4]) as usize;
            if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&declared) {
                // Bogus length: the marker match was coincidental.
                self.discard_front(1);
                continue;
            }
            if self.buf.len() < declared {
                return None;
            }

            let frame: Vec<u8> = self.buf.drain(..declared).collect();
            match Datagram::decode(&frame) {
                Ok(datagram) => {
                    self.mark_synchronized();
                    self.stats.frames += 1;
                    return Some(datagram);
                }
                Err(DecodeError::ChecksumMismatch { expected, actual }) => {
                    self.stats.checksum_failures += 1;
                    debug!(
                        expected = format_args!("{expected:#04x}"),
                        actual = format_args!("{actual:#04x}"),
                        "dropping frame with bad checksum"
                    );
                    // Rescan from one byte past the marker: the corrupt
                    // frame may have swallowed the start of a real one.
                    self.mark_lost();
                    self.stats.garbage_bytes += 1;
                    let mut rest = frame;
                    rest.remove(0);
                    rest.append(&mut self.buf);
                    self.buf = rest;
                    continue;
                }
                Err(_) => {
                    self.discard_front(1);
                    continue;
                }
            }
        }
    }

    /// Consume a block of received bytes, collecting completed datagrams.
    pub fn extend(&mut self, bytes: &[u8]) -> Vec<Datagram> {
        let mut out = Vec::new();
        for &b in bytes {
            if let Some(d) = self.push(b) {
                out.push(d);
            }
        }
        out
    }

    fn discard_front(&mut self, n: usize) {
        self.buf.drain(..n);
        self.stats.garbage_bytes += n as u64;
        self.mark_lost();
    }

    fn mark_lost(&mut self) {
        if self.synchronized {
            warn!("frame synchronization lost, hunting for marker");
            self.synchronized = false;
        }
    }

    fn mark_synchronized(&mut self) {
        if !self.synchronized {
            debug!("frame synchronization acquired");
            self.synchronized = true;
        }
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(payload: Vec<u8>) -> Datagram {
        Datagram::new(173, 0x02, 7, 7, payload)
    }

    #[test]
    fn roundtrip_various_payload_lengths() {
        for len in [0usize, 1, 2, 17, 255, MAX_FRAME_SIZE - MIN_FRAME_SIZE] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 31) as u8).collect();
            let original = sample(payload);
            let encoded = original.encode();
            assert_eq!(encoded.len(), original.frame_len());
            let decoded = Datagram::decode(&encoded).expect("should decode");
            assert_eq!(original, decoded);
        }
    }

    #[test]
    #[should_panic(expected = "frame limit")]
    fn oversized_payload_rejected_at_construction() {
        let _ = sample(vec![0; MAX_PAYLOAD_SIZE + 1]);
    }

    #[test]
    fn corrupted_byte_fails_checksum() {
        let mut encoded = sample(vec![1, 2, 3, 4, 5]).encode();
        encoded[12] ^= 0xFF;
        match Datagram::decode(&encoded) {
            Err(DecodeError::ChecksumMismatch { .. }) => {}
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn bad_marker_rejected() {
        let mut encoded = sample(vec![]).encode();
        encoded[0] = 0x00;
        assert_eq!(Datagram::decode(&encoded), Err(DecodeError::BadMarker));
    }

    #[test]
    fn truncated_frame_rejected() {
        let encoded = sample(vec![9; 8]).encode();
        assert!(matches!(
            Datagram::decode(&encoded[..encoded.len() - 2]),
            Err(DecodeError::BadLength(_))
        ));
    }

    #[test]
    fn sequence_numbers_are_little_endian() {
        let d = Datagram::new(1, 0x01, 0x1234, 0xABCD, vec![]);
        let encoded = d.encode();
        assert_eq!(&encoded[6..8], &[0x34, 0x12]);
        assert_eq!(&encoded[8..10], &[0xCD, 0xAB]);
    }

    #[test]
    fn parser_decodes_back_to_back_frames() {
        let a = sample(vec![1, 2, 3]);
        let b = Datagram::new(2, 0x01, 8, 0, vec![]);
        let mut stream = a.encode();
        stream.extend_from_slice(&b.encode());

        let mut parser = FrameParser::new();
        let frames = parser.extend(&stream);
        assert_eq!(frames, vec![a, b]);
        assert_eq!(parser.stats().frames, 2);
        assert_eq!(parser.stats().garbage_bytes, 0);
    }

    #[test]
    fn parser_resynchronizes_past_garbage() {
        let valid = sample(vec![0xAA, 0xBB]);
        let mut stream = vec![0x00, 0xFF, 0x13, FRAME_MARKER[0], 0x99, 0x7A];
        let garbage_len = stream.len() as u64;
        stream.extend_from_slice(&valid.encode());

        let mut parser = FrameParser::new();
        let frames = parser.extend(&stream);
        assert_eq!(frames, vec![valid]);
        assert_eq!(parser.stats().garbage_bytes, garbage_len);
        assert!(parser.is_synchronized());
    }

    #[test]
    fn parser_drops_corrupt_frame_then_recovers() {
        let good = sample(vec![5, 6, 7]);
        let mut corrupt = good.encode();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x01;
        corrupt.extend_from_slice(&good.encode());

        let mut parser = FrameParser::new();
        let frames = parser.extend(&corrupt);
        assert_eq!(frames, vec![good]);
        assert_eq!(parser.stats().checksum_failures, 1);
    }

    #[test]
    fn parser_ignores_marker_with_bogus_length() {
        // Marker followed by a length field far beyond the maximum frame
        // size must not swallow the valid frame behind it.
        let valid = sample(vec![1]);
        let mut stream = vec![FRAME_MARKER[0], FRAME_MARKER[1], 0xFF, 0xFF];
        stream.extend_from_slice(&valid.encode());

        let mut parser = FrameParser::new();
        let frames = parser.extend(&stream);
        assert_eq!(frames, vec![valid]);
    }
}
