//! Identity and battery fields shared by every sensor profile.

/// Battery condition reported by the common battery pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BatteryStatus {
    /// Fresh battery.
    New,
    /// Good.
    Good,
    /// Ok.
    Ok,
    /// Low, replace soon.
    Low,
    /// Critical.
    Critical,
    /// Reserved status value (0 or 6).
    Reserved,
    /// Not reported or invalid.
    #[default]
    Invalid,
}

impl BatteryStatus {
    /// Parses the 3-bit battery status field.
    #[must_use]
    pub const fn from_flags(flags: u8) -> Self {
        match flags & 0x07 {
            1 => Self::New,
            2 => Self::Good,
            3 => Self::Ok,
            4 => Self::Low,
            5 => Self::Critical,
            7 => Self::Invalid,
            _ => Self::Reserved,
        }
    }
}

/// Fields every decoded sensor carries regardless of profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommonState {
    /// Device id from the channel id (extended data).
    pub device_id: u16,
    /// Channel the device was received on.
    pub channel: u8,
    /// Manufacturer id.
    pub manufacturer_id: Option<u16>,
    /// Serial number.
    pub serial_number: Option<u32>,
    /// Hardware revision.
    pub hardware_version: Option<u8>,
    /// Software revision; the supplemental revision is added as thousandths.
    pub software_version: Option<f64>,
    /// Model number.
    pub model_number: Option<u16>,
    /// Cumulative operating time in seconds.
    pub operating_time: Option<u32>,
    /// Battery level (HR only).
    pub battery_level: Option<u8>,
    /// Battery voltage in volts.
    pub battery_voltage: Option<f64>,
    /// Battery status.
    pub battery_status: BatteryStatus,
    /// Received signal strength in dBm.
    pub rssi: Option<i8>,
    /// Receiver search threshold in dBm.
    pub threshold: Option<i8>,
}

impl CommonState {
    /// Creates the common fields for a newly seen device.
    #[must_use]
    pub fn new(device_id: u16, channel: u8) -> Self {
        Self {
            device_id,
            channel,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_status_from_flags() {
        assert_eq!(BatteryStatus::from_flags(1), BatteryStatus::New);
        assert_eq!(BatteryStatus::from_flags(4), BatteryStatus::Low);
        assert_eq!(BatteryStatus::from_flags(0), BatteryStatus::Reserved);
        assert_eq!(BatteryStatus::from_flags(6), BatteryStatus::Reserved);
        assert_eq!(BatteryStatus::from_flags(7), BatteryStatus::Invalid);
    }

    #[test]
    fn test_common_state_new() {
        let common = CommonState::new(4711, 2);
        assert_eq!(common.device_id, 4711);
        assert_eq!(common.channel, 2);
        assert_eq!(common.battery_status, BatteryStatus::Invalid);
        assert!(common.manufacturer_id.is_none());
    }
}
