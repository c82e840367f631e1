//! Error types for the antplus library.

use thiserror::Error;

/// The main error type for antplus operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding/decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// No compatible ANT stick was found.
    #[error("no compatible ANT device found")]
    NoDevice,

    /// The device was found but the startup handshake failed.
    #[error("device startup failed: {reason}")]
    Startup { reason: String },

    /// Command timed out waiting for response.
    #[error("command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The device is not open.
    #[error("device not open")]
    NotOpen,

    /// All channel slots are in use.
    #[error("no free channel available")]
    NoFreeChannel,

    /// A frame was submitted to a channel it does not address.
    #[error("frame addresses channel {got}, expected channel {expected}")]
    InvalidChannel { expected: u8, got: u8 },

    /// The operation is not valid in the channel's current role.
    #[error("invalid channel state: {0}")]
    InvalidState(&'static str),

    /// The device rejected a command or reported a transfer failure.
    #[error("command 0x{msg_id:02x} failed with code 0x{code:02x}")]
    CommandFailed { msg_id: u8, code: u8 },

    /// A newer request with the same message id replaced this one before it was sent.
    #[error("command 0x{msg_id:02x} superseded by a newer request")]
    Superseded { msg_id: u8 },

    /// The channel queue was flushed before a response arrived.
    #[error("command flushed before completion")]
    Flushed,

    /// Helper-process bridge error.
    #[error("bridge error: {message}")]
    Bridge { message: String },

    /// Internal channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    /// Builds a [`Error::Timeout`] from a duration.
    #[must_use]
    pub fn timeout(timeout: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Frame-specific errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Frame too short to contain sync, length, message id and checksum.
    #[error("frame too short: need at least 4 bytes, got {0}")]
    TooShort(usize),

    /// First byte is not the sync byte.
    #[error("missing sync byte: got 0x{0:02x}")]
    MissingSync(u8),

    /// Payload exceeds what a single length byte can describe.
    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// Incomplete frame data.
    #[error("incomplete frame: expected {expected} bytes, got {got}")]
    Incomplete { expected: usize, got: usize },

    /// Checksum mismatch.
    #[error("checksum mismatch: expected 0x{expected:02x}, got 0x{got:02x}")]
    Checksum { expected: u8, got: u8 },
}

/// Result type alias for antplus operations.
pub type Result<T> = std::result::Result<T, Error>;
