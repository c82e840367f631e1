//! Sensor decoder framework and ANT+ profiles.
//!
//! A [`Sensor`] is attached to a channel and turns data frames into
//! per-device state snapshots. All profiles share one implementation of the
//! framing rules in [`SensorDecoder`]: channel and device-type filtering, lazy
//! state creation, signal strength capture and the wildcard emission filter.
//! Each profile only supplies a [`ProfileDecoder`] for its data pages.

pub mod cadence;
pub mod common;
pub mod fitness_equipment;
pub mod heart_rate;
pub mod power;
pub mod speed;
pub mod speed_cadence;

use std::collections::HashMap;
use std::fmt;

use tokio::time::Instant;

use crate::protocol::message::{
    ChannelType, DEFAULT_FREQUENCY, EVENT_RF, EXT_FLAG_RSSI, INDEX_CHANNEL, INDEX_DATA,
    INDEX_EXT_BEGIN, INDEX_MSG_ID, MessageId, RSSI_MEASUREMENT_DBM, SEARCH_TIMEOUT_NEVER, code,
};
use crate::types::CommonState;

pub use cadence::{BikeCadence, BikeCadenceSensor, CadenceState};
pub use fitness_equipment::{
    EquipmentType, FitnessEquipment, FitnessEquipmentControl, FitnessEquipmentSensor,
    FitnessEquipmentState, HeartRateSource, PairedDevice, TargetStatus, TrainerState,
};
pub use heart_rate::{HeartRate, HeartRateSensor, HeartRateState};
pub use power::{BicyclePower, BicyclePowerSensor, BicyclePowerState};
pub use speed::{BikeSpeed, BikeSpeedSensor, SpeedState};
pub use speed_cadence::{SpeedCadence, SpeedCadenceSensor, SpeedCadenceState};

/// Device id meaning "pair with the first device that answers".
pub const WILDCARD_DEVICE_ID: u16 = 0;

/// Minimum frame length carrying the channel id in its extended data.
const MIN_DATA_FRAME_LEN: usize = INDEX_EXT_BEGIN + 4;

/// Minimum frame length carrying RSSI and threshold after the channel id.
const MIN_RSSI_FRAME_LEN: usize = INDEX_EXT_BEGIN + 8;

/// ANT+ device profiles supported by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    /// Bicycle power meter.
    BicyclePower,
    /// Heart rate monitor.
    HeartRate,
    /// Fitness equipment (smart trainers, treadmills, ...).
    FitnessEquipment,
    /// Bike speed sensor.
    BikeSpeed,
    /// Bike cadence sensor.
    BikeCadence,
    /// Combined bike speed and cadence sensor.
    SpeedCadence,
}

impl Profile {
    /// All supported profiles.
    pub const ALL: [Self; 6] = [
        Self::BicyclePower,
        Self::HeartRate,
        Self::FitnessEquipment,
        Self::BikeSpeed,
        Self::BikeCadence,
        Self::SpeedCadence,
    ];

    /// Returns the ANT+ device type code.
    #[must_use]
    pub const fn device_type(self) -> u8 {
        match self {
            Self::BicyclePower => 0x0B,
            Self::HeartRate => 0x78,
            Self::FitnessEquipment => 0x11,
            Self::BikeSpeed => 0x7B,
            Self::BikeCadence => 0x7A,
            Self::SpeedCadence => 0x79,
        }
    }

    /// Returns the short profile tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::BicyclePower => "PWR",
            Self::HeartRate => "HR",
            Self::FitnessEquipment => "FE",
            Self::BikeSpeed => "SPD",
            Self::BikeCadence => "CAD",
            Self::SpeedCadence => "SC",
        }
    }

    /// Returns the channel period in 1/32768 s units.
    #[must_use]
    pub const fn period(self) -> u16 {
        match self {
            Self::BicyclePower => 8182,
            Self::HeartRate => 8070,
            Self::FitnessEquipment => 8192,
            Self::BikeSpeed => 8118,
            Self::BikeCadence => 8102,
            Self::SpeedCadence => 8086,
        }
    }

    /// Looks up a profile by its device type code.
    #[must_use]
    pub const fn from_device_type(device_type: u8) -> Option<Self> {
        match device_type {
            0x0B => Some(Self::BicyclePower),
            0x78 => Some(Self::HeartRate),
            0x11 => Some(Self::FitnessEquipment),
            0x7B => Some(Self::BikeSpeed),
            0x7A => Some(Self::BikeCadence),
            0x79 => Some(Self::SpeedCadence),
            _ => None,
        }
    }

    /// Returns the default channel configuration for this profile.
    #[must_use]
    pub const fn channel_config(self) -> ChannelConfig {
        ChannelConfig::new(self.period())
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Radio settings used when opening a sensor channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Channel type for the assign command.
    pub channel_type: ChannelType,
    /// Transmission type for the channel id.
    pub transmission_type: u8,
    /// Search timeout in 2.5 s ticks.
    pub search_timeout: u8,
    /// RF frequency offset from 2400 MHz.
    pub frequency: u8,
    /// Message period in 1/32768 s units.
    pub period: u16,
}

impl ChannelConfig {
    /// Creates the ANT+ default configuration with the given period.
    #[must_use]
    pub const fn new(period: u16) -> Self {
        Self {
            channel_type: ChannelType::Receive,
            transmission_type: 0,
            search_timeout: SEARCH_TIMEOUT_NEVER,
            frequency: DEFAULT_FREQUENCY,
            period,
        }
    }

    /// Sets the search timeout.
    #[must_use]
    pub const fn search_timeout(mut self, timeout: u8) -> Self {
        self.search_timeout = timeout;
        self
    }

    /// Sets the transmission type.
    #[must_use]
    pub const fn transmission_type(mut self, transmission_type: u8) -> Self {
        self.transmission_type = transmission_type;
        self
    }
}

/// Snapshot of one device's decoded state.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorState {
    /// Bicycle power meter.
    BicyclePower(BicyclePowerState),
    /// Heart rate monitor.
    HeartRate(HeartRateState),
    /// Fitness equipment.
    FitnessEquipment(Box<FitnessEquipmentState>),
    /// Bike speed sensor.
    BikeSpeed(SpeedState),
    /// Bike cadence sensor.
    BikeCadence(CadenceState),
    /// Combined speed and cadence sensor.
    SpeedCadence(SpeedCadenceState),
}

impl SensorState {
    /// Returns the profile this state belongs to.
    #[must_use]
    pub const fn profile(&self) -> Profile {
        match self {
            Self::BicyclePower(_) => Profile::BicyclePower,
            Self::HeartRate(_) => Profile::HeartRate,
            Self::FitnessEquipment(_) => Profile::FitnessEquipment,
            Self::BikeSpeed(_) => Profile::BikeSpeed,
            Self::BikeCadence(_) => Profile::BikeCadence,
            Self::SpeedCadence(_) => Profile::SpeedCadence,
        }
    }

    /// Returns the fields common to all profiles.
    #[must_use]
    pub fn common(&self) -> &CommonState {
        match self {
            Self::BicyclePower(s) => &s.common,
            Self::HeartRate(s) => &s.common,
            Self::FitnessEquipment(s) => &s.common,
            Self::BikeSpeed(s) => &s.common,
            Self::BikeCadence(s) => &s.common,
            Self::SpeedCadence(s) => &s.common,
        }
    }
}

/// A decoded update for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceData {
    /// Profile of the decoder that produced the update.
    pub profile: Profile,
    /// Device id of the sender.
    pub device_id: u16,
    /// State after applying the update.
    pub state: SensorState,
}

/// A sensor that can be attached to a channel.
pub trait Sensor: Send {
    /// Returns the sensor's profile.
    fn profile(&self) -> Profile;

    /// Returns the configured device id (0 = wildcard).
    fn device_id(&self) -> u16;

    /// Returns the channel configuration used to open the sensor channel.
    fn channel_config(&self) -> ChannelConfig {
        self.profile().channel_config()
    }

    /// Handles a data frame received on `channel`.
    ///
    /// Returns an update when the frame was decoded for a device this sensor
    /// reports on.
    fn on_message(&mut self, channel: u8, frame: &[u8], now: Instant) -> Option<DeviceData>;

    /// Handles a channel event received on `channel`.
    fn on_event(&mut self, channel: u8, msg_id: u8, code: u8) {
        let _ = (channel, msg_id, code);
    }

    /// Returns the current state of a device, if it has been seen.
    fn snapshot(&self, device_id: u16) -> Option<SensorState>;
}

/// Page decoding for one ANT+ profile.
pub trait ProfileDecoder: Send + 'static {
    /// Decoded per-device state.
    type State: Clone + Send;
    /// Per-device bookkeeping that is not part of the public snapshot.
    type Context: Default + Send;

    /// The profile decoded by this implementation.
    const PROFILE: Profile;

    /// Creates the state for a newly seen device.
    fn new_state(common: CommonState) -> Self::State;

    /// Returns the common fields of a state.
    fn common_mut(state: &mut Self::State) -> &mut CommonState;

    /// Applies one 8-byte data page.
    fn decode(&self, page: &[u8; 8], state: &mut Self::State, ctx: &mut Self::Context, now: Instant);

    /// Wraps a state into the profile-independent snapshot.
    fn snapshot(state: &Self::State) -> SensorState;
}

struct Tracked<S, C> {
    state: S,
    ctx: C,
}

/// Generic sensor over a profile decoder.
///
/// Keeps one state record per device id for the lifetime of the decoder.
pub struct SensorDecoder<P: ProfileDecoder> {
    device_id: u16,
    decoder: P,
    devices: HashMap<u16, Tracked<P::State, P::Context>>,
}

impl<P: ProfileDecoder + Default> SensorDecoder<P> {
    /// Creates a sensor for `device_id` (0 = wildcard) with default decoder settings.
    #[must_use]
    pub fn new(device_id: u16) -> Self {
        Self::with_decoder(device_id, P::default())
    }
}

impl<P: ProfileDecoder> SensorDecoder<P> {
    /// Creates a sensor for `device_id` with a configured decoder.
    #[must_use]
    pub fn with_decoder(device_id: u16, decoder: P) -> Self {
        Self {
            device_id,
            decoder,
            devices: HashMap::new(),
        }
    }

    /// Returns the decoder settings.
    #[must_use]
    pub const fn decoder(&self) -> &P {
        &self.decoder
    }

    /// Returns the decoder settings for modification.
    pub fn decoder_mut(&mut self) -> &mut P {
        &mut self.decoder
    }

    /// Returns the state of a device, if it has been seen.
    #[must_use]
    pub fn state(&self, device_id: u16) -> Option<&P::State> {
        self.devices.get(&device_id).map(|t| &t.state)
    }

    /// Returns the ids of all devices seen so far.
    #[must_use]
    pub fn device_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.devices.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl<P: ProfileDecoder> Sensor for SensorDecoder<P> {
    fn profile(&self) -> Profile {
        P::PROFILE
    }

    fn device_id(&self) -> u16 {
        self.device_id
    }

    fn on_message(&mut self, channel: u8, frame: &[u8], now: Instant) -> Option<DeviceData> {
        if frame.len() < MIN_DATA_FRAME_LEN {
            return None;
        }
        if frame[INDEX_CHANNEL] != channel {
            return None;
        }
        if frame[INDEX_EXT_BEGIN + 3] != P::PROFILE.device_type() {
            return None;
        }
        if !MessageId::from_byte(frame[INDEX_MSG_ID]).is_some_and(MessageId::is_data) {
            return None;
        }

        let device_id = u16::from_le_bytes([frame[INDEX_EXT_BEGIN + 1], frame[INDEX_EXT_BEGIN + 2]]);
        let tracked = self.devices.entry(device_id).or_insert_with(|| {
            tracing::debug!("{}: new device {} on channel {}", P::PROFILE, device_id, channel);
            Tracked {
                state: P::new_state(CommonState::new(device_id, channel)),
                ctx: P::Context::default(),
            }
        });

        if frame[INDEX_EXT_BEGIN] & EXT_FLAG_RSSI != 0
            && frame.len() >= MIN_RSSI_FRAME_LEN
            && frame[INDEX_EXT_BEGIN + 5] == RSSI_MEASUREMENT_DBM
        {
            let common = P::common_mut(&mut tracked.state);
            common.rssi = Some(i8::from_le_bytes([frame[INDEX_EXT_BEGIN + 6]]));
            common.threshold = Some(i8::from_le_bytes([frame[INDEX_EXT_BEGIN + 7]]));
        }

        let mut page = [0u8; 8];
        page.copy_from_slice(&frame[INDEX_DATA..INDEX_EXT_BEGIN]);
        self.decoder.decode(&page, &mut tracked.state, &mut tracked.ctx, now);

        if self.device_id != WILDCARD_DEVICE_ID && self.device_id != device_id {
            return None;
        }
        Some(DeviceData {
            profile: P::PROFILE,
            device_id,
            state: P::snapshot(&tracked.state),
        })
    }

    fn on_event(&mut self, channel: u8, msg_id: u8, code: u8) {
        if msg_id == EVENT_RF
            && matches!(
                code,
                code::RESPONSE_NO_ERROR
                    | code::EVENT_TX
                    | code::EVENT_TRANSFER_RX_FAILED
                    | code::EVENT_TRANSFER_TX_COMPLETED
            )
        {
            return;
        }
        tracing::debug!(
            "{}: channel {} event msg=0x{:02x} code=0x{:02x} (device {})",
            P::PROFILE,
            channel,
            msg_id,
            code,
            self.device_id
        );
    }

    fn snapshot(&self, device_id: u16) -> Option<SensorState> {
        self.state(device_id).map(P::snapshot)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const FE_DISTANCE_37: &str = "a4144e001019fd259d270035e067121105100068004886";

    fn frame(hex: &str) -> Vec<u8> {
        hex::decode(hex).unwrap()
    }

    #[test]
    fn test_profile_lookup() {
        for profile in Profile::ALL {
            assert_eq!(Profile::from_device_type(profile.device_type()), Some(profile));
        }
        assert_eq!(Profile::from_device_type(0x01), None);
        assert_eq!(Profile::FitnessEquipment.to_string(), "FE");
    }

    #[test]
    fn test_default_channel_config() {
        let config = Profile::BicyclePower.channel_config();
        assert_eq!(config.channel_type, ChannelType::Receive);
        assert_eq!(config.transmission_type, 0);
        assert_eq!(config.search_timeout, 0xFF);
        assert_eq!(config.frequency, 57);
        assert_eq!(config.period, 8182);
    }

    #[test]
    fn test_filters_channel_and_device_type() {
        let now = Instant::now();
        let mut sensor = FitnessEquipmentSensor::new(4711);
        // wrong channel
        assert!(sensor.on_message(1, &frame(FE_DISTANCE_37), now).is_none());
        // power decoder ignores FE frames
        let mut power = BicyclePowerSensor::new(0);
        assert!(power.on_message(0, &frame(FE_DISTANCE_37), now).is_none());
        assert!(power.device_ids().is_empty());

        let data = sensor.on_message(0, &frame(FE_DISTANCE_37), now).unwrap();
        assert_eq!(data.profile, Profile::FitnessEquipment);
        assert_eq!(data.device_id, 4711);
    }

    #[test]
    fn test_short_frames_are_ignored() {
        let now = Instant::now();
        let mut sensor = FitnessEquipmentSensor::new(0);
        let full = frame(FE_DISTANCE_37);
        for len in 0..MIN_DATA_FRAME_LEN {
            assert!(sensor.on_message(0, &full[..len], now).is_none());
        }
        assert!(sensor.on_message(0, &frame("a40340000102e4"), now).is_none());
    }

    #[test]
    fn test_explicit_device_id_filters_emission() {
        let now = Instant::now();
        let mut sensor = FitnessEquipmentSensor::new(1234);
        assert!(sensor.on_message(0, &frame(FE_DISTANCE_37), now).is_none());
        // the state is still tracked
        assert!(sensor.state(4711).is_some());
        assert!(sensor.snapshot(4711).is_some());
    }

    #[test]
    fn test_rssi_capture() {
        let now = Instant::now();
        let mut data = frame(FE_DISTANCE_37);
        data[12] = 0xC0;
        data[17] = 0x20;
        data[18] = 0xC4; // -60 dBm
        data[19] = 0xB0; // -80 dBm
        let mut sensor = FitnessEquipmentSensor::new(0);
        let update = sensor.on_message(0, &data, now).unwrap();
        assert_eq!(update.state.common().rssi, Some(-60));
        assert_eq!(update.state.common().threshold, Some(-80));
    }

    #[test]
    fn test_non_data_message_ignored() {
        let now = Instant::now();
        let mut data = frame(FE_DISTANCE_37);
        data[2] = 0x40;
        let mut sensor = FitnessEquipmentSensor::new(0);
        assert!(sensor.on_message(0, &data, now).is_none());
    }

    #[test]
    fn test_on_event_does_not_panic() {
        let mut sensor = BicyclePowerSensor::new(30529);
        let event = frame("a40340000102e4");
        sensor.on_event(0, event[4], event[5]);
    }
}
