//! Core error types and result handling
//!
//! The error taxonomy follows the structure of a serial Modbus exchange:
//! frame-level problems observable on the bus ([`ModbusError::Frame`],
//! [`ModbusError::Crc`], [`ModbusError::Timeout`]) are recoverable through
//! retransmission and resynchronization, while I/O failures and
//! [`ModbusError::Sync`] are terminal for the driver that hit them.
//!
//! Flag predicates ([`ModbusError::is_comm`], [`ModbusError::is_timeout`],
//! [`ModbusError::is_temporary`]) classify an error without matching on
//! its concrete variant, the way driver loops need to.

use std::io;

use thiserror::Error;

use crate::frame::{ExCode, FnCode};

/// Result type alias used throughout the crate
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors returned by the codec, the frame receiver and the drivers
#[derive(Debug, Error)]
pub enum ModbusError {
    /// The frame could not be received: undecodable prefix, unsupported
    /// function code, or a declared size beyond the ADU limit.
    #[error("frame reception error")]
    Frame,

    /// The received frame failed its CRC check
    #[error("bad frame CRC")]
    Crc,

    /// Frame reception timed out before the frame completed
    #[error("frame reception timed out")]
    Timeout,

    /// The bus would not go idle within the synchronization window
    #[error("failed to synchronize to the bus")]
    Sync,

    /// A byte-stream failure, wrapping the original error. Timeout
    /// introspection is preserved through the [`io::ErrorKind`].
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A field was malformed or out of range while packing
    #[error("pack error: {message}")]
    Pack { message: String },

    /// A field was malformed or out of range while unpacking
    #[error("unpack error: {message}")]
    Unpack { message: String },

    /// A byte that is not a Modbus function code
    #[error("invalid function code 0x{code:02x}")]
    InvalidFunction { code: u8 },

    /// A valid function code this implementation does not encode or decode
    #[error("unsupported function code {function}")]
    UnsupportedFunction { function: FnCode },

    /// An application-level error reply from a slave. Not a bus failure;
    /// the exchange itself completed.
    #[error("exception response [{function}: {exception}]")]
    Exception { function: FnCode, exception: ExCode },

    /// The response was received intact but does not answer the request
    #[error("bad or invalid response: {message}")]
    Response { message: String },
}

impl ModbusError {
    /// Create a pack error
    pub fn pack(message: impl Into<String>) -> Self {
        ModbusError::Pack {
            message: message.into(),
        }
    }

    /// Create an unpack error
    pub fn unpack(message: impl Into<String>) -> Self {
        ModbusError::Unpack {
            message: message.into(),
        }
    }

    /// Create a bad-response error
    pub fn response(message: impl Into<String>) -> Self {
        ModbusError::Response {
            message: message.into(),
        }
    }

    /// True for frame-level problems observable on the bus
    #[inline]
    pub fn is_comm(&self) -> bool {
        matches!(
            self,
            ModbusError::Frame | ModbusError::Crc | ModbusError::Timeout
        )
    }

    /// True if a deadline expired, either during frame reception or inside
    /// the wrapped byte-stream error.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        match self {
            ModbusError::Timeout => true,
            ModbusError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// True if retrying the operation may succeed at the protocol level
    #[inline]
    pub fn is_temporary(&self) -> bool {
        matches!(self, ModbusError::Timeout)
    }

    /// True for failures that make the driver unusable until the
    /// underlying byte stream is replaced.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, ModbusError::Io(_) | ModbusError::Sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comm_flags() {
        assert!(ModbusError::Frame.is_comm());
        assert!(ModbusError::Crc.is_comm());
        assert!(ModbusError::Timeout.is_comm());
        assert!(!ModbusError::Sync.is_comm());
        assert!(!ModbusError::pack("x").is_comm());
    }

    #[test]
    fn timeout_flags() {
        assert!(ModbusError::Timeout.is_timeout());
        assert!(ModbusError::Timeout.is_temporary());
        assert!(!ModbusError::Crc.is_timeout());

        let io_tmo = ModbusError::Io(io::Error::new(io::ErrorKind::TimedOut, "deadline"));
        assert!(io_tmo.is_timeout());
        assert!(io_tmo.is_fatal());

        let io_other = ModbusError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(!io_other.is_timeout());
    }

    #[test]
    fn fatal_flags() {
        assert!(ModbusError::Sync.is_fatal());
        assert!(!ModbusError::Timeout.is_fatal());
        assert!(!ModbusError::Frame.is_fatal());
    }
}
