//! Frame encoding and decoding for the ANT serial protocol.
//!
//! The wire format is:
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────────────┬──────────┐
//! │   0xA4   │  length  │  msg id  │     payload     │ checksum │
//! │  1 byte  │  1 byte  │  1 byte  │  length bytes   │  1 byte  │
//! └──────────┴──────────┴──────────┴─────────────────┴──────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Frame sync byte.
pub const SYNC: u8 = 0xA4;

/// Maximum payload size a single length byte can describe.
pub const MAX_PAYLOAD_SIZE: usize = 255;

/// Number of framing bytes around the payload (sync, length, msg id, checksum).
pub const FRAME_OVERHEAD: usize = 4;

/// Computes the frame checksum over `data`.
///
/// Each step XORs the next byte into the accumulator and reduces it modulo
/// `0xFF`, so an intermediate value of `0xFF` becomes `0`. Deployed sticks
/// expect exactly this fold.
#[must_use]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| (acc ^ b) % 0xFF)
}

/// Encodes a message into a complete frame.
///
/// # Errors
///
/// Returns [`FrameError::TooLarge`] if the payload does not fit a length byte.
pub fn encode(msg_id: u8, payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(encode_checked(msg_id, payload))
}

/// Encodes a payload already known to fit a length byte.
pub(crate) fn encode_checked(msg_id: u8, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);
    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.put_u8(SYNC);
    buf.put_u8(payload.len() as u8);
    buf.put_u8(msg_id);
    buf.put_slice(payload);
    let sum = checksum(&buf);
    buf.put_u8(sum);
    buf.freeze()
}

/// Decodes a complete frame into its message id and payload.
///
/// Validates the sync byte, the declared length against the buffer and the
/// trailing checksum.
pub fn decode(frame: &[u8]) -> Result<(u8, Bytes), FrameError> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(FrameError::TooShort(frame.len()));
    }
    if frame[0] != SYNC {
        return Err(FrameError::MissingSync(frame[0]));
    }

    let len = usize::from(frame[1]);
    let expected = len + FRAME_OVERHEAD;
    if frame.len() < expected {
        return Err(FrameError::Incomplete {
            expected,
            got: frame.len(),
        });
    }

    let sum = checksum(&frame[..len + 3]);
    if sum != frame[len + 3] {
        return Err(FrameError::Checksum {
            expected: sum,
            got: frame[len + 3],
        });
    }

    Ok((frame[2], Bytes::copy_from_slice(&frame[3..len + 3])))
}

/// Applies the acceptance rule for frames received from the device.
///
/// A received frame needs a sync byte, at least four bytes, and at least
/// `declared length + 3` bytes. The checksum byte is not required: the helper
/// bridge and some firmware deliver frames without it.
pub fn validate_received(frame: &[u8]) -> Result<(), FrameError> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(FrameError::TooShort(frame.len()));
    }
    if frame[0] != SYNC {
        return Err(FrameError::MissingSync(frame[0]));
    }
    let expected = usize::from(frame[1]) + 3;
    if frame.len() < expected {
        return Err(FrameError::Incomplete {
            expected,
            got: frame.len(),
        });
    }
    Ok(())
}

/// Reassembles frames from an arbitrary stream of byte chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    leftover: BytesMut,
}

impl FrameDecoder {
    /// Creates a new frame decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            leftover: BytesMut::new(),
        }
    }

    /// Feeds a chunk into the decoder and returns every complete frame.
    ///
    /// Bytes that do not yet form a complete frame are kept for the next call.
    /// A buffer that does not start with the sync byte is reported but still
    /// parsed, so a single corrupt chunk does not stall the stream.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        if chunk.is_empty() {
            return Vec::new();
        }

        self.leftover.extend_from_slice(chunk);
        let mut data = std::mem::take(&mut self.leftover);

        if data[0] != SYNC {
            tracing::warn!("sync missing: {}", hex::encode(&data));
        }

        let mut frames = Vec::new();
        loop {
            if data.is_empty() {
                break;
            }
            if data.len() == 1 {
                self.leftover = data;
                break;
            }
            let size = usize::from(data[1]) + FRAME_OVERHEAD;
            if size > data.len() {
                self.leftover = data;
                break;
            }
            frames.push(data.split_to(size).freeze());
        }
        frames
    }

    /// Returns the number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.leftover.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.leftover.clear();
    }
}
