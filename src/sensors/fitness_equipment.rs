//! Fitness equipment profile (device type 0x11).
//!
//! Besides decoding the trainer's broadcast pages this module provides
//! [`FitnessEquipmentControl`], which sends the control pages (user
//! configuration, resistance, target power, wind and track resistance) as
//! acknowledged data on the sensor's channel.

use std::time::Duration;

use tokio::time::Instant;

use super::common::{MOD_U8, MOD_U16, decode_global_page, rollover_delta, u16_at};
use super::{Profile, ProfileDecoder, SensorDecoder, SensorState};
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::protocol::command;
use crate::protocol::message::code;
use crate::types::CommonState;

/// Default timeout for control pages.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Kind of equipment reported on the general data page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquipmentType {
    /// Treadmill.
    Treadmill,
    /// Elliptical.
    Elliptical,
    /// Stationary bike.
    StationaryBike,
    /// Rower.
    Rower,
    /// Climber.
    Climber,
    /// Nordic skier.
    NordicSkier,
    /// Trainer or stationary bike with control.
    Trainer,
    /// Anything else.
    General,
}

impl EquipmentType {
    /// Parses the 5-bit equipment type field.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x1F {
            19 => Self::Treadmill,
            20 => Self::Elliptical,
            21 => Self::StationaryBike,
            22 => Self::Rower,
            23 => Self::Climber,
            24 => Self::NordicSkier,
            25 => Self::Trainer,
            _ => Self::General,
        }
    }
}

/// Source of the heart rate reported by the equipment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartRateSource {
    /// Hand contact sensors.
    HandContact,
    /// 5 kHz EM chest strap.
    Em,
    /// ANT+ heart rate monitor.
    AntPlus,
}

/// Equipment state machine reported in the capability/state nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    /// Off.
    Off,
    /// Ready, waiting for a session.
    Ready,
    /// In use.
    InUse,
    /// Session finished or paused.
    Finished,
}

impl TrainerState {
    /// Parses the 3-bit state field.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x07 {
            1 => Some(Self::Off),
            2 => Some(Self::Ready),
            3 => Some(Self::InUse),
            4 => Some(Self::Finished),
            _ => None,
        }
    }
}

/// Whether the trainer is operating at its target power.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    /// Operating at the target or no target set.
    OnTarget,
    /// Speed too low to reach the target power.
    LowSpeed,
    /// Speed too high to reach the target power.
    HighSpeed,
}

/// A device paired with the equipment (page 0x56).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairedDevice {
    /// Device id.
    pub id: u16,
    /// Device type.
    pub device_type: u8,
    /// Whether the pairing is active.
    pub paired: bool,
}

/// Decoded state of a piece of fitness equipment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitnessEquipmentState {
    /// Common fields.
    pub common: CommonState,

    /// Temperature during calibration (°C).
    pub temperature: Option<f64>,
    /// Zero offset calibration result.
    pub zero_offset: Option<u16>,
    /// Spin-down time calibration result (ms).
    pub spin_down_time: Option<u16>,

    /// Equipment type.
    pub equipment_type: Option<EquipmentType>,
    /// Elapsed time (s), accumulated across rollovers.
    pub elapsed_time: Option<f64>,
    /// Distance travelled (m), accumulated across rollovers.
    pub distance: Option<u32>,
    /// Real speed (m/s).
    pub real_speed: Option<f64>,
    /// Virtual speed (m/s).
    pub virtual_speed: Option<f64>,
    /// Heart rate (bpm).
    pub heart_rate: Option<u8>,
    /// Source of the heart rate.
    pub heart_rate_source: Option<HeartRateSource>,
    /// Equipment state.
    pub state: Option<TrainerState>,

    /// Cycle length (m).
    pub cycle_length: Option<f64>,
    /// Incline (%).
    pub incline: Option<f64>,
    /// Resistance level (0.5 % units).
    pub resistance: Option<u8>,

    /// Metabolic equivalents.
    pub mets: Option<f64>,
    /// Caloric burn rate (kcal/h).
    pub caloric_burn_rate: Option<f64>,
    /// Accumulated calories (kcal).
    pub calories: Option<u8>,

    /// Cadence (rpm).
    pub cadence: Option<u8>,
    /// Accumulated power (W), accumulated across rollovers.
    pub accumulated_power: Option<u32>,
    /// Instantaneous power (W).
    pub instantaneous_power: Option<u16>,
    /// Average power over the last events (W).
    pub average_power: Option<f64>,
    /// Trainer status bit field.
    pub trainer_status: Option<u8>,
    /// Target power status.
    pub target_status: Option<TargetStatus>,

    /// Maximum resistance (N).
    pub max_resistance: Option<u16>,
    /// Supported control modes bit field (basic resistance, target power, simulation).
    pub capabilities: Option<u8>,

    /// Devices paired with the equipment.
    pub paired_devices: Vec<PairedDevice>,
}

impl FitnessEquipmentState {
    /// Clears the session fields when the equipment returns to ready.
    fn reset_session(&mut self) {
        self.elapsed_time = None;
        self.distance = None;
        self.real_speed = None;
        self.virtual_speed = None;
        self.heart_rate = None;
        self.heart_rate_source = None;
        self.cycle_length = None;
        self.incline = None;
        self.resistance = None;
        self.mets = None;
        self.caloric_burn_rate = None;
        self.calories = None;
        self.cadence = None;
        self.accumulated_power = None;
        self.instantaneous_power = None;
        self.average_power = None;
        self.trainer_status = None;
        self.target_status = None;
    }

    /// Returns true when the equipment supports target power control.
    #[must_use]
    pub fn supports_target_power(&self) -> bool {
        self.capabilities.is_some_and(|c| c & 0x02 != 0)
    }

    /// Returns true when the equipment supports simulation (track/wind resistance).
    #[must_use]
    pub fn supports_simulation(&self) -> bool {
        self.capabilities.is_some_and(|c| c & 0x04 != 0)
    }
}

/// Last trainer power event count, used to gate the average power.
#[derive(Debug, Default)]
pub struct FitnessEquipmentContext {
    power_events: Option<u8>,
}

/// Page decoder for fitness equipment.
#[derive(Debug, Clone, Copy, Default)]
pub struct FitnessEquipment;

/// Sensor for fitness equipment.
pub type FitnessEquipmentSensor = SensorDecoder<FitnessEquipment>;

/// Adds a wrapped counter reading to an accumulated total.
fn accumulate(total: u32, raw: u32, modulus: u32) -> u32 {
    let old = total % modulus;
    total + rollover_delta(old, raw, modulus)
}

impl FitnessEquipment {
    fn decode_calibration(page: &[u8; 8], state: &mut FitnessEquipmentState) {
        if page[3] != 0xFF {
            state.temperature = Some(-25.0 + f64::from(page[3]) * 0.5);
        }
        if page[1] & 0x40 != 0 {
            state.zero_offset = Some(u16_at(page, 4));
        }
        if page[1] & 0x80 != 0 {
            state.spin_down_time = Some(u16_at(page, 6));
        }
    }

    fn decode_general(page: &[u8; 8], state: &mut FitnessEquipmentState) {
        let flags = page[7];
        state.equipment_type = Some(EquipmentType::from_bits(page[1]));

        if page[6] != 0xFF {
            let source = match flags & 0x03 {
                3 => Some(HeartRateSource::HandContact),
                2 => Some(HeartRateSource::Em),
                1 => Some(HeartRateSource::AntPlus),
                _ => None,
            };
            state.heart_rate = source.map(|_| page[6]);
            state.heart_rate_source = source;
        }

        // 0.25 s units, rolls over at 64 s
        let elapsed = f64::from(page[2]) / 4.0;
        let total = state.elapsed_time.unwrap_or(0.0);
        let old = total % 64.0;
        let delta = if old > elapsed { elapsed + 64.0 - old } else { elapsed - old };
        state.elapsed_time = Some(total + delta);

        state.distance = (flags & 0x04 != 0)
            .then(|| accumulate(state.distance.unwrap_or(0), u32::from(page[3]), MOD_U8));

        let speed = f64::from(u16_at(page, 4)) / 1000.0;
        if flags & 0x08 != 0 {
            state.virtual_speed = Some(speed);
            state.real_speed = None;
        } else {
            state.virtual_speed = None;
            state.real_speed = Some(speed);
        }
    }

    fn decode_settings(page: &[u8; 8], state: &mut FitnessEquipmentState) {
        if page[3] != 0xFF {
            state.cycle_length = Some(f64::from(page[3]) / 100.0);
        }
        let incline = i16::from_le_bytes([page[4], page[5]]);
        if (-10_000..=10_000).contains(&incline) {
            state.incline = Some(f64::from(incline) / 100.0);
        }
        if page[6] != 0xFF {
            state.resistance = Some(page[6]);
        }
    }

    fn decode_metabolic(page: &[u8; 8], state: &mut FitnessEquipmentState) {
        let mets = u16_at(page, 2);
        if mets != 0xFFFF {
            state.mets = Some(f64::from(mets) / 100.0);
        }
        let burn_rate = u16_at(page, 4);
        if burn_rate != 0xFFFF {
            state.caloric_burn_rate = Some(f64::from(burn_rate) / 10.0);
        }
        if page[7] & 0x01 != 0 {
            state.calories = Some(page[6]);
        }
    }

    fn decode_trainer(
        page: &[u8; 8],
        state: &mut FitnessEquipmentState,
        ctx: &mut FitnessEquipmentContext,
    ) {
        let events = page[1];
        let old_events = ctx.power_events.unwrap_or(0);
        ctx.power_events = Some(events);

        if page[2] != 0xFF {
            state.cadence = Some(page[2]);
        }

        let power = u16_at(page, 5) & 0x0FFF;
        if power != 0x0FFF {
            state.instantaneous_power = Some(power);
            let raw = u32::from(u16_at(page, 3));
            let total = state.accumulated_power.unwrap_or(0);
            let accumulated = accumulate(total, raw, MOD_U16);
            let power_delta = accumulated - total;
            let event_delta = rollover_delta(u32::from(old_events), u32::from(events), MOD_U8);
            if event_delta > 0 {
                state.average_power = Some(f64::from(power_delta) / f64::from(event_delta));
            }
            state.accumulated_power = Some(accumulated);
        }

        state.trainer_status = Some(page[6] >> 4);
        state.target_status = match page[7] & 0x03 {
            0 => Some(TargetStatus::OnTarget),
            1 => Some(TargetStatus::LowSpeed),
            2 => Some(TargetStatus::HighSpeed),
            _ => None,
        };
    }

    fn decode_paired_devices(page: &[u8; 8], state: &mut FitnessEquipmentState) {
        if page[1] == 0 {
            state.paired_devices.clear();
        }
        if page[2] > 0 {
            state.paired_devices.push(PairedDevice {
                id: u16_at(page, 4),
                device_type: page[7],
                paired: page[3] & 0x80 != 0,
            });
        }
    }
}

impl ProfileDecoder for FitnessEquipment {
    type State = FitnessEquipmentState;
    type Context = FitnessEquipmentContext;

    const PROFILE: Profile = Profile::FitnessEquipment;

    fn new_state(common: CommonState) -> Self::State {
        FitnessEquipmentState {
            common,
            ..FitnessEquipmentState::default()
        }
    }

    fn common_mut(state: &mut Self::State) -> &mut CommonState {
        &mut state.common
    }

    fn decode(&self, page: &[u8; 8], state: &mut Self::State, ctx: &mut Self::Context, _now: Instant) {
        let previous = state.state;
        let flags = match page[0] {
            0x01 => {
                Self::decode_calibration(page, state);
                None
            }
            0x10 => {
                Self::decode_general(page, state);
                Some(page[7])
            }
            0x11 => {
                Self::decode_settings(page, state);
                Some(page[7])
            }
            0x12 => {
                Self::decode_metabolic(page, state);
                Some(page[7])
            }
            0x19 => {
                Self::decode_trainer(page, state, ctx);
                Some(page[7])
            }
            0x36 => {
                let max = u16_at(page, 5);
                state.max_resistance = (max != 0xFFFF).then_some(max);
                state.capabilities = Some(page[7] & 0x07);
                None
            }
            0x56 => {
                Self::decode_paired_devices(page, state);
                None
            }
            _ => {
                decode_global_page(page, &mut state.common);
                None
            }
        };

        if let Some(flags) = flags {
            let next = TrainerState::from_bits((flags & 0x70) >> 4);
            state.state = next;
            if next == Some(TrainerState::Ready) && previous != Some(TrainerState::Ready) {
                state.reset_session();
            }
        }
    }

    fn snapshot(state: &Self::State) -> SensorState {
        SensorState::FitnessEquipment(Box::new(state.clone()))
    }
}

/// Builds the user configuration page (0x37).
///
/// Weights are in kg, the wheel diameter in m. `None` sends the "not set" value.
/// The bike weight is a 12-bit field: its low nibble shares byte 4 with the
/// diameter offset and byte 5 carries the upper eight bits.
#[must_use]
pub fn user_configuration_page(
    user_weight: Option<f64>,
    bike_weight: Option<f64>,
    wheel_diameter: Option<f64>,
    gear_ratio: Option<f64>,
) -> [u8; 8] {
    let user = user_weight.map_or(0xFFFF, |w| (w * 100.0) as u16);
    let bike = bike_weight.map_or(0x0FFF, |w| (w * 20.0) as u16);
    let (diameter, offset) = wheel_diameter.map_or((0xFF, 0xFF), |d| {
        let mm = (d * 1000.0) as u32;
        ((mm / 10) as u8, (mm % 10) as u8)
    });
    let gear = gear_ratio.map_or(0x00, |g| (g / 0.03) as u8);

    let [user_lo, user_hi] = user.to_le_bytes();
    [
        0x37,
        user_lo,
        user_hi,
        0xFF,
        (((bike & 0x0F) as u8) << 4) | (offset & 0x0F),
        ((bike >> 4) & 0xFF) as u8,
        diameter,
        gear,
    ]
}

/// Builds the basic resistance page (0x30). `resistance` is in percent.
#[must_use]
pub fn basic_resistance_page(resistance: Option<f64>) -> [u8; 8] {
    let value = (resistance.unwrap_or(0.0) / 0.5) as u8;
    [0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, value]
}

/// Builds the target power page (0x31). `power` is in watts.
#[must_use]
pub fn target_power_page(power: Option<f64>) -> [u8; 8] {
    let [lo, hi] = ((power.unwrap_or(0.0) * 4.0) as u16).to_le_bytes();
    [0x31, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, lo, hi]
}

/// Builds the wind resistance page (0x32).
///
/// Coefficient in kg/m, wind speed in km/h, drafting factor 0-1.
#[must_use]
pub fn wind_resistance_page(
    coefficient: Option<f64>,
    wind_speed: Option<f64>,
    drafting_factor: Option<f64>,
) -> [u8; 8] {
    let coefficient = coefficient.map_or(0xFF, |c| (c / 0.01) as u8);
    let wind_speed = wind_speed.map_or(0xFF, |s| (s + 127.0) as u8);
    let drafting = drafting_factor.map_or(0xFF, |d| (d / 0.01) as u8);
    [0x32, 0xFF, 0xFF, 0xFF, 0xFF, coefficient, wind_speed, drafting]
}

/// Builds the track resistance page (0x33). `slope` is in percent.
#[must_use]
pub fn track_resistance_page(slope: Option<f64>, rolling_resistance: Option<f64>) -> [u8; 8] {
    let [lo, hi] = slope
        .map_or(0xFFFF, |s| ((s + 200.0) / 0.01) as u16)
        .to_le_bytes();
    let rolling = rolling_resistance.map_or(0xFF, |r| (r / 0.000_05) as u8);
    [0x33, 0xFF, 0xFF, 0xFF, 0xFF, lo, hi, rolling]
}

/// Sends control pages to a trainer on an open sensor channel.
#[derive(Debug, Clone)]
pub struct FitnessEquipmentControl {
    channel: Channel,
    send_timeout: Duration,
}

impl FitnessEquipmentControl {
    /// Creates a control handle for the trainer on `channel`.
    #[must_use]
    pub const fn new(channel: Channel) -> Self {
        Self {
            channel,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Sets the timeout for each control page.
    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Sends the rider and bike configuration.
    pub async fn send_user_configuration(
        &self,
        user_weight: Option<f64>,
        bike_weight: Option<f64>,
        wheel_diameter: Option<f64>,
        gear_ratio: Option<f64>,
    ) -> Result<()> {
        let page = user_configuration_page(user_weight, bike_weight, wheel_diameter, gear_ratio);
        self.send("user configuration", page).await
    }

    /// Sets the basic resistance in percent.
    pub async fn send_basic_resistance(&self, resistance: f64) -> Result<()> {
        self.send("basic resistance", basic_resistance_page(Some(resistance)))
            .await
    }

    /// Sets the target power in watts (ERG mode).
    pub async fn send_target_power(&self, power: f64) -> Result<()> {
        self.send("target power", target_power_page(Some(power))).await
    }

    /// Sets the wind resistance simulation parameters.
    pub async fn send_wind_resistance(
        &self,
        coefficient: Option<f64>,
        wind_speed: Option<f64>,
        drafting_factor: Option<f64>,
    ) -> Result<()> {
        let page = wind_resistance_page(coefficient, wind_speed, drafting_factor);
        self.send("wind resistance", page).await
    }

    /// Sets the track resistance simulation parameters.
    pub async fn send_track_resistance(
        &self,
        slope: Option<f64>,
        rolling_resistance: Option<f64>,
    ) -> Result<()> {
        let page = track_resistance_page(slope, rolling_resistance);
        self.send("track resistance", page).await
    }

    async fn send(&self, label: &str, page: [u8; 8]) -> Result<()> {
        let frame = command::acknowledged_data(self.channel.number(), &page);
        let started = Instant::now();
        tracing::debug!("FE: sending {} {}", label, hex::encode(page));

        let mut result = self
            .channel
            .send_message(frame.clone(), Some(self.send_timeout))
            .await;
        if let Err(Error::CommandFailed { code: c, .. }) = &result
            && *c == code::TRANSFER_IN_PROGRESS
        {
            tracing::debug!("FE: {} hit a transfer in progress, resending", label);
            result = self.channel.send_message(frame, Some(self.send_timeout)).await;
        }

        match &result {
            Ok(()) => tracing::debug!("FE: {} acknowledged after {:?}", label, started.elapsed()),
            Err(e) => tracing::warn!("FE: {} failed after {:?}: {}", label, started.elapsed(), e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::Sensor;
    use crate::sensors::testing::data_frame;

    const DISTANCE_37: &str = "a4144e001019fd259d270035e067121105100068004886";
    const DISTANCE_38: &str = "a4144e001019fd269d270035e067121105100068004886";

    fn fe_frame(page: [u8; 8]) -> Vec<u8> {
        data_frame(0, page, 4711, 0x11)
    }

    fn state(sensor: &FitnessEquipmentSensor) -> &FitnessEquipmentState {
        sensor.state(4711).unwrap()
    }

    #[test]
    fn test_general_page_fixture() {
        let mut sensor = FitnessEquipmentSensor::new(0);
        let now = Instant::now();
        sensor.on_message(0, &hex::decode(DISTANCE_37).unwrap(), now).unwrap();
        let s = state(&sensor);
        assert_eq!(s.equipment_type, Some(EquipmentType::Trainer));
        assert_eq!(s.distance, Some(37));
        assert_eq!(s.elapsed_time, Some(63.25));
        assert_eq!(s.real_speed, Some(10.141));
        assert_eq!(s.virtual_speed, None);
        assert_eq!(s.heart_rate, Some(0));
        assert_eq!(s.heart_rate_source, Some(HeartRateSource::AntPlus));
        assert_eq!(s.state, Some(TrainerState::InUse));

        sensor.on_message(0, &hex::decode(DISTANCE_38).unwrap(), now).unwrap();
        assert_eq!(state(&sensor).distance, Some(38));
    }

    #[test]
    fn test_distance_and_elapsed_rollover() {
        let mut sensor = FitnessEquipmentSensor::new(0);
        let now = Instant::now();
        // in use, distance supported
        sensor.on_message(0, &fe_frame([0x10, 25, 252, 250, 0, 0, 0xFF, 0x34]), now);
        sensor.on_message(0, &fe_frame([0x10, 25, 4, 10, 0, 0, 0xFF, 0x34]), now);
        let s = state(&sensor);
        assert_eq!(s.distance, Some(266));
        assert_eq!(s.elapsed_time, Some(65.0));
    }

    #[test]
    fn test_distance_cleared_without_capability() {
        let mut sensor = FitnessEquipmentSensor::new(0);
        let now = Instant::now();
        sensor.on_message(0, &fe_frame([0x10, 25, 0, 10, 0, 0, 0xFF, 0x34]), now);
        assert_eq!(state(&sensor).distance, Some(10));
        sensor.on_message(0, &fe_frame([0x10, 25, 0, 12, 0xE8, 0x03, 0xFF, 0x38]), now);
        let s = state(&sensor);
        assert_eq!(s.distance, None);
        assert_eq!(s.virtual_speed, Some(1.0));
        assert_eq!(s.real_speed, None);
    }

    #[test]
    fn test_ready_resets_session() {
        let mut sensor = FitnessEquipmentSensor::new(0);
        let now = Instant::now();
        sensor.on_message(0, &fe_frame([0x10, 25, 40, 100, 0, 0, 0xFF, 0x34]), now);
        sensor.on_message(0, &fe_frame([0x19, 1, 90, 0x10, 0x00, 0xC8, 0x00, 0x30]), now);
        assert_eq!(state(&sensor).cadence, Some(90));

        // back to ready clears the session after the page is applied
        sensor.on_message(0, &fe_frame([0x11, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 20, 0x20]), now);
        let s = state(&sensor);
        assert_eq!(s.state, Some(TrainerState::Ready));
        assert_eq!(s.cadence, None);
        assert_eq!(s.distance, None);
        assert_eq!(s.resistance, None);

        // staying ready keeps new values
        sensor.on_message(0, &fe_frame([0x11, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 20, 0x20]), now);
        assert_eq!(state(&sensor).resistance, Some(20));
    }

    #[test]
    fn test_trainer_page() {
        let mut sensor = FitnessEquipmentSensor::new(0);
        let now = Instant::now();
        // events 1, cadence 85, acc power 100, power 200, status 0x5, target low speed
        sensor.on_message(0, &fe_frame([0x19, 1, 85, 100, 0, 0xC8, 0x50, 0x31]), now);
        let s = state(&sensor);
        assert_eq!(s.cadence, Some(85));
        assert_eq!(s.instantaneous_power, Some(200));
        assert_eq!(s.accumulated_power, Some(100));
        assert_eq!(s.average_power, Some(100.0));
        assert_eq!(s.trainer_status, Some(5));
        assert_eq!(s.target_status, Some(TargetStatus::LowSpeed));

        // two events and 200 W accumulated since the last page
        sensor.on_message(0, &fe_frame([0x19, 3, 85, 0x2C, 0x01, 0xC8, 0x00, 0x30]), now);
        let s = state(&sensor);
        assert_eq!(s.accumulated_power, Some(300));
        assert_eq!(s.average_power, Some(100.0));

        // repeated event count leaves the average untouched
        sensor.on_message(0, &fe_frame([0x19, 3, 85, 0x2C, 0x01, 0xC8, 0x00, 0x30]), now);
        assert_eq!(state(&sensor).average_power, Some(100.0));
    }

    #[test]
    fn test_settings_and_metabolic_pages() {
        let mut sensor = FitnessEquipmentSensor::new(0);
        let now = Instant::now();
        // incline -2.5 %
        let [lo, hi] = (-250i16).to_le_bytes();
        sensor.on_message(0, &fe_frame([0x11, 0xFF, 0xFF, 150, lo, hi, 40, 0x30]), now);
        sensor.on_message(0, &fe_frame([0x12, 0xFF, 0xE8, 0x03, 0x64, 0x00, 12, 0x31]), now);
        let s = state(&sensor);
        assert_eq!(s.cycle_length, Some(1.5));
        assert_eq!(s.incline, Some(-2.5));
        assert_eq!(s.resistance, Some(40));
        assert_eq!(s.mets, Some(10.0));
        assert_eq!(s.caloric_burn_rate, Some(10.0));
        assert_eq!(s.calories, Some(12));
    }

    #[test]
    fn test_calibration_and_capabilities() {
        let mut sensor = FitnessEquipmentSensor::new(0);
        let now = Instant::now();
        sensor.on_message(0, &fe_frame([0x01, 0xC0, 0x00, 100, 0x10, 0x00, 0xD0, 0x07]), now);
        sensor.on_message(0, &fe_frame([0x36, 0xFF, 0xFF, 0xFF, 0xFF, 0xE8, 0x03, 0x07]), now);
        let s = state(&sensor);
        assert_eq!(s.temperature, Some(25.0));
        assert_eq!(s.zero_offset, Some(16));
        assert_eq!(s.spin_down_time, Some(2000));
        assert_eq!(s.max_resistance, Some(1000));
        assert!(s.supports_target_power());
        assert!(s.supports_simulation());
    }

    #[test]
    fn test_paired_devices() {
        let mut sensor = FitnessEquipmentSensor::new(0);
        let now = Instant::now();
        sensor.on_message(0, &fe_frame([0x56, 0, 2, 0x80, 0x39, 0x30, 0x05, 0x78]), now);
        sensor.on_message(0, &fe_frame([0x56, 1, 2, 0x00, 0x10, 0x00, 0x05, 0x0B]), now);
        assert_eq!(state(&sensor).paired_devices.len(), 2);
        assert!(state(&sensor).paired_devices[0].paired);
        assert_eq!(state(&sensor).paired_devices[1].device_type, 0x0B);

        sensor.on_message(0, &fe_frame([0x56, 0, 1, 0x80, 0x39, 0x30, 0x05, 0x78]), now);
        assert_eq!(
            state(&sensor).paired_devices,
            vec![PairedDevice { id: 12345, device_type: 0x78, paired: true }]
        );
    }

    #[test]
    fn test_control_pages() {
        assert_eq!(
            user_configuration_page(Some(75.0), Some(10.0), Some(0.5), None),
            [0x37, 0x4C, 0x1D, 0xFF, 0x80, 0x0C, 50, 0x00]
        );
        assert_eq!(
            user_configuration_page(None, None, None, None),
            [0x37, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]
        );
        // 15 kg = 300 * 0.05 kg spans all twelve bits
        assert_eq!(
            user_configuration_page(None, Some(15.0), Some(0.5), None),
            [0x37, 0xFF, 0xFF, 0xFF, 0xC0, 0x12, 50, 0x00]
        );
        assert_eq!(
            user_configuration_page(None, None, None, None)[4..6],
            [0xFF, 0xFF]
        );
        assert_eq!(basic_resistance_page(Some(20.0)), [0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 40]);
        assert_eq!(target_power_page(Some(250.0)), [0x31, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xE8, 0x03]);
        assert_eq!(
            wind_resistance_page(Some(0.5), Some(0.0), Some(1.0)),
            [0x32, 0xFF, 0xFF, 0xFF, 0xFF, 50, 127, 100]
        );
        assert_eq!(
            track_resistance_page(Some(0.0), None),
            [0x33, 0xFF, 0xFF, 0xFF, 0xFF, 0x20, 0x4E, 0xFF]
        );
    }

    #[tokio::test]
    async fn test_control_resends_on_transfer_in_progress() {
        use crate::channel::ChannelOptions;
        use crate::protocol::frame::encode;

        let (tx, mut written) = tokio::sync::mpsc::unbounded_channel();
        let channel = Channel::new(0, tx, ChannelOptions::default());
        let control = FitnessEquipmentControl::new(channel.clone());
        let task = tokio::spawn(async move { control.send_target_power(250.0).await });

        let rf_event = |code: u8| encode(0x40, &[0, 0x01, code]).unwrap();
        let expected = command::acknowledged_data(0, &target_power_page(Some(250.0)));

        assert_eq!(written.recv().await.unwrap(), expected);
        channel.handle_frame(&rf_event(code::TRANSFER_IN_PROGRESS));
        assert_eq!(written.recv().await.unwrap(), expected);
        channel.handle_frame(&rf_event(code::EVENT_TRANSFER_TX_COMPLETED));
        task.await.unwrap().unwrap();
    }
}
