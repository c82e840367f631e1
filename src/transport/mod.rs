//! Transport layer for ANT USB sticks.
//!
//! A transport moves raw bytes between the stick and the device dispatcher.
//! Two implementations exist: a direct serial port ([`SerialTransport`]) and a
//! line-oriented bridge to a helper process ([`BridgeTransport`]).

pub mod bridge;
pub mod serial;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Result;

/// Capacity of the inbound data channel of a transport.
pub const INBOUND_CAPACITY: usize = 256;

/// Data received from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// An arbitrary chunk of the byte stream; must be reassembled into frames.
    Bytes(Bytes),
    /// One already delimited frame.
    Frame(Bytes),
}

/// Trait for transport implementations.
pub trait Transport: Send + Sync + 'static {
    /// Opens the transport.
    ///
    /// Returns the receiver of inbound data. The receiver ends when the
    /// transport is closed or the connection is lost.
    fn open(&mut self) -> BoxFuture<'_, Result<mpsc::Receiver<Inbound>>>;

    /// Closes the transport.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Writes one complete frame (sync byte through checksum).
    fn write(&mut self, frame: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Returns true if the transport is open.
    fn is_open(&self) -> bool;
}

pub use bridge::{BridgeConfig, BridgeTransport};
pub use serial::{AntStick, SerialConfig, SerialTransport, discover};
