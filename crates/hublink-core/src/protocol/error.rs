//! Transport errors

use thiserror::Error;

use super::datagram::DecodeError;

/// Errors surfaced by the transport fabric.
///
/// Callers above this layer see one of four protocol outcomes — success,
/// timeout, rejected, transport-unavailable — plus lifecycle and lookup
/// errors. Retry/backoff policy belongs to the caller.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("serial port error: {0}")]
    Serial(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("response timeout")]
    Timeout,

    #[error("module {address} rejected the command: reason {reason}")]
    Nack {
        /// Address of the rejecting module.
        address: u8,
        /// Reject reason byte from the NACK payload.
        reason: u8,
    },

    #[error("transport unavailable")]
    TransportUnavailable,

    #[error("transport is not armed")]
    NotArmed,

    #[error("transport is already armed")]
    AlreadyArmed,

    #[error("transport is disengaged")]
    NotEngaged,

    #[error("transport latched abnormal shutdown")]
    AbnormalShutdown,

    #[error("no module known at address {0}")]
    ModuleNotFound(u8),

    #[error("module address {0} is already in use")]
    AddressInUse(u8),

    #[error("module {0} is closed")]
    ModuleClosed(u8),

    #[error("embedded module unreachable at address {0} after recovery")]
    EmbeddedModuleUnreachable(u8),

    #[error("system operation failed: {0}")]
    SystemOperation(String),

    #[error("frame decode error: {0}")]
    Decode(#[from] DecodeError),
}

impl TransportError {
    /// Whether this error represents an expected, caller-retryable
    /// protocol outcome rather than a transport or programming fault.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}
