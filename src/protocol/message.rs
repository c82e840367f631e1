//! Message ids, channel types and event codes of the ANT serial protocol.
//!
//! All values are fixed by the radio protocol and must be reproduced bit-exact.

/// Byte offset of the payload length in a frame.
pub const INDEX_MSG_LEN: usize = 1;
/// Byte offset of the message id in a frame.
pub const INDEX_MSG_ID: usize = 2;
/// Byte offset of the channel number in a frame.
pub const INDEX_CHANNEL: usize = 3;
/// Byte offset of the first data byte (after the channel number).
pub const INDEX_DATA: usize = 4;
/// Byte offset of the extended data flag byte in broadcast/acknowledged/burst frames.
pub const INDEX_EXT_BEGIN: usize = 12;

/// Network number used for all ANT+ channels.
pub const DEFAULT_NETWORK: u8 = 0;

/// The public ANT+ network key.
pub const ANT_PLUS_NETWORK_KEY: [u8; 8] = [0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45];

/// Search timeout value meaning "never time out".
pub const SEARCH_TIMEOUT_NEVER: u8 = 0xFF;

/// Library config flags: enable channel id, RSSI and timestamp in extended data.
pub const LIB_CONFIG_EXTENDED: u8 = 0xE0;

/// RF frequency offset from 2400 MHz used by ANT+ (2457 MHz).
pub const DEFAULT_FREQUENCY: u8 = 57;

/// Channel-event `msg` value marking an RF event rather than a command reply.
pub const EVENT_RF: u8 = 0x01;

/// Extended data flag: channel id follows.
pub const EXT_FLAG_CHANNEL_ID: u8 = 0x80;
/// Extended data flag: RSSI measurement follows.
pub const EXT_FLAG_RSSI: u8 = 0x40;
/// RSSI measurement type for dBm values.
pub const RSSI_MEASUREMENT_DBM: u8 = 0x20;

/// Message ids used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    /// Channel event or command response.
    ChannelEvent = 0x40,
    /// Unassign channel.
    UnassignChannel = 0x41,
    /// Assign channel.
    AssignChannel = 0x42,
    /// Set channel period.
    ChannelPeriod = 0x43,
    /// Set channel search timeout.
    SearchTimeout = 0x44,
    /// Set channel RF frequency.
    ChannelFrequency = 0x45,
    /// Set network key.
    NetworkKey = 0x46,
    /// Reset the system.
    SystemReset = 0x4A,
    /// Open channel.
    OpenChannel = 0x4B,
    /// Close channel.
    CloseChannel = 0x4C,
    /// Request a message from the device.
    RequestMessage = 0x4D,
    /// Broadcast data.
    BroadcastData = 0x4E,
    /// Acknowledged data.
    AcknowledgedData = 0x4F,
    /// Burst data.
    BurstData = 0x50,
    /// Set channel id.
    ChannelId = 0x51,
    /// Channel status.
    ChannelStatus = 0x52,
    /// Device capabilities.
    Capabilities = 0x54,
    /// Open channel in continuous scan mode.
    OpenRxScan = 0x5B,
    /// Enable extended receive messages.
    EnableExtRx = 0x66,
    /// Library configuration.
    LibConfig = 0x6E,
    /// Startup notification sent after reset.
    Startup = 0x6F,
}

impl MessageId {
    /// Attempts to parse a message id from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x40 => Some(Self::ChannelEvent),
            0x41 => Some(Self::UnassignChannel),
            0x42 => Some(Self::AssignChannel),
            0x43 => Some(Self::ChannelPeriod),
            0x44 => Some(Self::SearchTimeout),
            0x45 => Some(Self::ChannelFrequency),
            0x46 => Some(Self::NetworkKey),
            0x4A => Some(Self::SystemReset),
            0x4B => Some(Self::OpenChannel),
            0x4C => Some(Self::CloseChannel),
            0x4D => Some(Self::RequestMessage),
            0x4E => Some(Self::BroadcastData),
            0x4F => Some(Self::AcknowledgedData),
            0x50 => Some(Self::BurstData),
            0x51 => Some(Self::ChannelId),
            0x52 => Some(Self::ChannelStatus),
            0x54 => Some(Self::Capabilities),
            0x5B => Some(Self::OpenRxScan),
            0x66 => Some(Self::EnableExtRx),
            0x6E => Some(Self::LibConfig),
            0x6F => Some(Self::Startup),
            _ => None,
        }
    }

    /// Returns true for the three sensor payload delivery modes.
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(
            self,
            Self::BroadcastData | Self::AcknowledgedData | Self::BurstData
        )
    }
}

impl From<MessageId> for u8 {
    fn from(id: MessageId) -> Self {
        id as Self
    }
}

/// Channel types for the assign command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ChannelType {
    /// Bidirectional slave (the usual sensor receiver).
    #[default]
    Receive = 0x00,
    /// Bidirectional master.
    Transmit = 0x10,
    /// Shared bidirectional slave.
    SharedReceive = 0x20,
    /// Shared bidirectional master.
    SharedTransmit = 0x30,
    /// Receive only.
    ReceiveOnly = 0x40,
    /// Transmit only.
    TransmitOnly = 0x50,
}

impl ChannelType {
    /// Attempts to parse a channel type from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Receive),
            0x10 => Some(Self::Transmit),
            0x20 => Some(Self::SharedReceive),
            0x30 => Some(Self::SharedTransmit),
            0x40 => Some(Self::ReceiveOnly),
            0x50 => Some(Self::TransmitOnly),
            _ => None,
        }
    }
}

impl From<ChannelType> for u8 {
    fn from(t: ChannelType) -> Self {
        t as Self
    }
}

/// Channel event and response codes.
pub mod code {
    /// Command accepted.
    pub const RESPONSE_NO_ERROR: u8 = 0x00;
    /// Search timed out without finding a master.
    pub const EVENT_RX_SEARCH_TIMEOUT: u8 = 0x01;
    /// Expected message was not received.
    pub const EVENT_RX_FAIL: u8 = 0x02;
    /// Broadcast message transmitted.
    pub const EVENT_TX: u8 = 0x03;
    /// Burst or acknowledged receive failed.
    pub const EVENT_TRANSFER_RX_FAILED: u8 = 0x04;
    /// Acknowledged or burst transfer completed.
    pub const EVENT_TRANSFER_TX_COMPLETED: u8 = 0x05;
    /// Acknowledged or burst transfer failed.
    pub const EVENT_TRANSFER_TX_FAILED: u8 = 0x06;
    /// Channel closed.
    pub const EVENT_CHANNEL_CLOSED: u8 = 0x07;
    /// Lost contact with the master, searching again.
    pub const EVENT_RX_FAIL_GO_TO_SEARCH: u8 = 0x08;
    /// Two channels drifted into each other.
    pub const EVENT_CHANNEL_COLLISION: u8 = 0x09;
    /// Burst transfer started.
    pub const EVENT_TRANSFER_TX_START: u8 = 0x0A;
    /// A transfer is already in progress.
    pub const TRANSFER_IN_PROGRESS: u8 = 0x1F;
    /// Burst sequence number out of order.
    pub const TRANSFER_SEQUENCE_NUMBER_ERROR: u8 = 0x20;
    /// Burst transfer error.
    pub const TRANSFER_IN_ERROR: u8 = 0x21;
    /// Message larger than the device accepts.
    pub const MESSAGE_SIZE_EXCEEDS_LIMIT: u8 = 0x27;
    /// Invalid message.
    pub const INVALID_MESSAGE: u8 = 0x28;

    /// Returns true for RF event codes that fail the in-flight command.
    #[must_use]
    pub const fn is_transfer_failure(code: u8) -> bool {
        matches!(
            code,
            EVENT_TRANSFER_TX_FAILED
                | TRANSFER_IN_PROGRESS
                | TRANSFER_SEQUENCE_NUMBER_ERROR
                | TRANSFER_IN_ERROR
                | MESSAGE_SIZE_EXCEEDS_LIMIT
                | INVALID_MESSAGE
                | EVENT_CHANNEL_CLOSED
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_from_byte() {
        assert_eq!(MessageId::from_byte(0x4E), Some(MessageId::BroadcastData));
        assert_eq!(MessageId::from_byte(0x6F), Some(MessageId::Startup));
        assert_eq!(MessageId::from_byte(0xFF), None);
        assert_eq!(u8::from(MessageId::OpenRxScan), 0x5B);
    }

    #[test]
    fn test_is_data() {
        assert!(MessageId::BroadcastData.is_data());
        assert!(MessageId::BurstData.is_data());
        assert!(!MessageId::ChannelEvent.is_data());
    }

    #[test]
    fn test_channel_type_round_trip() {
        for byte in [0x00, 0x10, 0x20, 0x30, 0x40, 0x50] {
            let t = ChannelType::from_byte(byte).unwrap();
            assert_eq!(u8::from(t), byte);
        }
        assert_eq!(ChannelType::from_byte(0x01), None);
    }

    #[test]
    fn test_transfer_failure_codes() {
        assert!(code::is_transfer_failure(code::EVENT_CHANNEL_CLOSED));
        assert!(code::is_transfer_failure(code::TRANSFER_IN_PROGRESS));
        assert!(!code::is_transfer_failure(code::EVENT_TRANSFER_TX_COMPLETED));
        assert!(!code::is_transfer_failure(code::EVENT_RX_FAIL));
    }
}
