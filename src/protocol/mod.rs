//! Protocol definitions for ANT communication.
//!
//! This module contains the low-level protocol pieces:
//! - Frame encoding/decoding and stream reassembly
//! - Message ids, channel types and event codes
//! - Command builders

pub mod command;
pub mod frame;
pub mod message;

pub use frame::{FrameDecoder, SYNC, checksum, decode as decode_frame, encode as encode_frame};
pub use message::{ChannelType, MessageId, code};
