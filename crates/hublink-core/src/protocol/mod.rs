//! Wire protocol
//!
//! Implements the framed, checksummed request/response protocol spoken over
//! the RS485 bus: the datagram codec with stream resynchronization, the
//! logical message unit with completion tracking, and the keyed bus lock
//! that serializes request/response exchanges.

pub mod datagram;
pub mod error;
pub mod keyed_lock;
pub mod message;

pub use datagram::{Datagram, DecodeError, FrameParser, ParserStats};
pub use error::TransportError;
pub use keyed_lock::{LockKey, MessageKeyedLock};
pub use message::{next_message_key, Completion, Message, SendOutcome};

/// Two-byte marker that starts every frame on the wire.
pub const FRAME_MARKER: [u8; 2] = [0x44, 0x4B];

/// Size of the fixed frame header: marker (2), length (2), source address
/// (1), packet id (1), message number (2), reference number (2).
pub const HEADER_SIZE: usize = 10;

/// Size of the trailing checksum.
pub const CHECKSUM_SIZE: usize = 1;

/// Smallest legal frame: header plus checksum, no payload.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + CHECKSUM_SIZE;

/// Largest payload a single datagram may carry.
pub const MAX_PAYLOAD_SIZE: usize = 512;

/// Largest legal frame.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE + CHECKSUM_SIZE;

/// Address the host uses as the source of the frames it originates.
pub const HOST_ADDRESS: u8 = 0;

/// Liveness request; the peripheral answers with an ACK.
pub const PACKET_ID_PING: u8 = 0x01;

/// Positive acknowledgement; payload is command-specific response data.
pub const PACKET_ID_ACK: u8 = 0x02;

/// Active rejection; payload byte 0 carries the reject reason.
pub const PACKET_ID_NACK: u8 = 0x03;

/// Identity/capability query.
pub const PACKET_ID_QUERY_INTERFACE: u8 = 0x04;

/// Firmware version query.
pub const PACKET_ID_QUERY_VERSION: u8 = 0x05;

/// Tell the peripheral to enter its safe output state.
pub const PACKET_ID_FAIL_SAFE: u8 = 0x06;

/// Renumber the addressed module; payload byte 0 is the new address.
pub const PACKET_ID_CHANGE_ADDRESS: u8 = 0x07;

/// Broadcast discovery request; the destination field is ignored by
/// recipients.
pub const PACKET_ID_DISCOVERY: u8 = 0x7E;

/// Discovery reply, routed bus-wide rather than to an owning module.
/// Payload byte 0 bit 0 set means the replier is a parent module.
pub const PACKET_ID_DISCOVERY_RESPONSE: u8 = 0x7F;

/// Default baud rate for the USB serial link.
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default per-exchange response timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Interval between retransmissions while a response is outstanding,
/// in milliseconds.
pub const RESEND_INTERVAL_MS: u64 = 100;
