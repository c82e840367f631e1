//! Command builders for the ANT serial protocol.
//!
//! Every builder is a pure function mapping its parameters to a complete,
//! checksummed frame. Multi-byte fields are packed little-endian.

use bytes::Bytes;

use super::frame::encode_checked;
use super::message::{ANT_PLUS_NETWORK_KEY, ChannelType, DEFAULT_NETWORK, MessageId};

fn build(msg_id: MessageId, payload: &[u8]) -> Bytes {
    encode_checked(msg_id.into(), payload)
}

/// Resets the device.
#[must_use]
pub fn reset_system() -> Bytes {
    build(MessageId::SystemReset, &[0x00])
}

/// Asks the device to send message `msg_id` for `channel`.
#[must_use]
pub fn request_message(channel: u8, msg_id: MessageId) -> Bytes {
    build(MessageId::RequestMessage, &[channel, msg_id.into()])
}

/// Installs the ANT+ network key on the default network.
#[must_use]
pub fn set_network_key() -> Bytes {
    let mut payload = [0u8; 9];
    payload[0] = DEFAULT_NETWORK;
    payload[1..].copy_from_slice(&ANT_PLUS_NETWORK_KEY);
    build(MessageId::NetworkKey, &payload)
}

/// Assigns `channel` with the given type on the default network.
#[must_use]
pub fn assign_channel(channel: u8, channel_type: ChannelType) -> Bytes {
    build(
        MessageId::AssignChannel,
        &[channel, channel_type.into(), DEFAULT_NETWORK],
    )
}

/// Unassigns `channel`.
#[must_use]
pub fn unassign_channel(channel: u8) -> Bytes {
    build(MessageId::UnassignChannel, &[channel])
}

/// Sets the channel id. A zero device id or type acts as a wildcard.
#[must_use]
pub fn set_device(channel: u8, device_id: u16, device_type: u8, transmission_type: u8) -> Bytes {
    let [lo, hi] = device_id.to_le_bytes();
    build(
        MessageId::ChannelId,
        &[channel, lo, hi, device_type, transmission_type],
    )
}

/// Sets the search timeout in 2.5 s ticks (`0xFF` = never).
#[must_use]
pub fn set_search_timeout(channel: u8, timeout: u8) -> Bytes {
    build(MessageId::SearchTimeout, &[channel, timeout])
}

/// Sets the channel message period in 1/32768 s units.
#[must_use]
pub fn set_period(channel: u8, period: u16) -> Bytes {
    let [lo, hi] = period.to_le_bytes();
    build(MessageId::ChannelPeriod, &[channel, lo, hi])
}

/// Sets the RF frequency as an offset from 2400 MHz.
#[must_use]
pub fn set_frequency(channel: u8, frequency: u8) -> Bytes {
    build(MessageId::ChannelFrequency, &[channel, frequency])
}

/// Enables extended receive messages.
#[must_use]
pub fn enable_rx_ext() -> Bytes {
    build(MessageId::EnableExtRx, &[0x00, 0x01])
}

/// Configures which extended fields the device appends to data messages.
#[must_use]
pub fn lib_config(channel: u8, flags: u8) -> Bytes {
    build(MessageId::LibConfig, &[channel, flags])
}

/// Opens `channel`.
#[must_use]
pub fn open_channel(channel: u8) -> Bytes {
    build(MessageId::OpenChannel, &[channel])
}

/// Opens channel 0 in continuous scan mode.
#[must_use]
pub fn open_rx_scan() -> Bytes {
    build(MessageId::OpenRxScan, &[0x00, 0x01])
}

/// Closes `channel`.
#[must_use]
pub fn close_channel(channel: u8) -> Bytes {
    build(MessageId::CloseChannel, &[channel])
}

/// Wraps an 8-byte data page as an acknowledged message.
#[must_use]
pub fn acknowledged_data(channel: u8, data: &[u8; 8]) -> Bytes {
    build(MessageId::AcknowledgedData, &data_payload(channel, data))
}

/// Wraps an 8-byte data page as a broadcast message.
#[must_use]
pub fn broadcast_data(channel: u8, data: &[u8; 8]) -> Bytes {
    build(MessageId::BroadcastData, &data_payload(channel, data))
}

fn data_payload(channel: u8, data: &[u8; 8]) -> [u8; 9] {
    let mut payload = [0u8; 9];
    payload[0] = channel;
    payload[1..].copy_from_slice(data);
    payload
}
