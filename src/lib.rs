//! # antplus
//!
//! An async client library for ANT+ sensors (power meters, heart rate
//! monitors, smart trainers, speed and cadence sensors) behind an ANT USB
//! stick.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Serial transport with USB stick discovery, or a line bridge to a helper process
//! - Per-channel command queue with acknowledgement and timeout handling
//! - Decoders for six ANT+ profiles with rollover-safe counters and idle detection
//!
//! ## Quick Start
//!
//! ```no_run
//! use antplus::{AntDevice, Event, SerialConfig};
//! use antplus::sensors::HeartRateSensor;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), antplus::Error> {
//!     let mut device = AntDevice::serial(SerialConfig::default());
//!     device.open().await?;
//!
//!     let channel = device.get_channel().ok_or(antplus::Error::NoFreeChannel)?;
//!     let mut events = channel.subscribe();
//!     channel.start_sensor(HeartRateSensor::new(0)).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let Event::Data { device_id, state, .. } = event {
//!             println!("{device_id}: {state:?}");
//!         }
//!     }
//!
//!     device.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Frame codec, reassembly, message ids and command builders
//! - [`transport`] - Serial port and helper-process bridge
//! - [`device`] - Startup handshake, channel slots and frame routing
//! - [`channel`] - Scanner/sensor lifecycle and the outbound command queue
//! - [`sensors`] - Decoder framework and ANT+ profiles
//! - [`event`] - Events published by channels

pub mod channel;
pub mod device;
pub mod error;
pub mod event;
pub mod protocol;
pub mod sensors;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use channel::{Channel, ChannelOptions, Role};
pub use device::{AntDevice, Capabilities, DeviceConfig, PendingReply};
pub use error::{Error, FrameError, Result};
pub use event::{Event, EventDispatcher, EventFilter, Subscription};
pub use protocol::{ChannelType, FrameDecoder, MessageId};
pub use sensors::{ChannelConfig, DeviceData, Profile, Sensor, SensorDecoder, SensorState};
pub use transport::{
    AntStick, BridgeConfig, BridgeTransport, SerialConfig, SerialTransport, Transport, discover,
};
pub use types::{BatteryStatus, CommonState};
