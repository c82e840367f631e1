//! Bicycle power profile (device type 0x0B).

use std::f64::consts::PI;

use tokio::time::Instant;

use super::common::{
    EventCounter, MOD_U8, MOD_U16, Reading, cadence_idle_delay, decode_global_page,
    rollover_delta, u16_at, u16_be_at,
};
use super::{Profile, ProfileDecoder, SensorDecoder, SensorState};
use crate::types::CommonState;

/// Crank torque frequency time stamps tick at 1/2000 s.
const CTF_TIME_UNIT: f64 = 0.0005;

/// Standard crank torque periods tick at 1/2048 s.
const CRANK_PERIOD_UNIT: f64 = 2048.0;

/// Standard crank torque accumulates in 1/32 Nm.
const TORQUE_UNIT: f64 = 32.0;

/// Decoded state of a bicycle power meter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BicyclePowerState {
    /// Common fields.
    pub common: CommonState,
    /// Pedal power balance in percent.
    pub pedal_power: Option<u8>,
    /// Right pedal contribution in percent, when the meter knows which pedal.
    pub right_pedal_power: Option<u8>,
    /// Left pedal contribution in percent.
    pub left_pedal_power: Option<u8>,
    /// Instantaneous cadence reported by the meter (rpm).
    pub cadence: Option<u8>,
    /// Accumulated power (W, rolls over at 65536).
    pub accumulated_power: Option<u16>,
    /// Instantaneous power (W).
    pub power: Option<u16>,
    /// Crank torque frequency zero offset (Hz) from calibration.
    pub zero_offset: u16,
    /// Last torque page event count.
    pub event_count: Option<u8>,
    /// Last crank torque frequency time stamp.
    pub time_stamp: Option<u16>,
    /// Last crank torque frequency slope (1/10 Nm/Hz).
    pub slope: Option<u16>,
    /// Last crank torque frequency tick count.
    pub torque_ticks_stamp: Option<u16>,
    /// Cadence computed from torque pages (rpm).
    pub calculated_cadence: Option<f64>,
    /// Torque computed from torque pages (Nm).
    pub calculated_torque: Option<f64>,
    /// Power computed from torque pages (W).
    pub calculated_power: Option<f64>,
}

impl BicyclePowerState {
    fn set_calculated(&mut self, cadence: f64, torque: f64, power: f64) {
        self.calculated_cadence = Some(cadence);
        self.calculated_torque = Some(torque);
        self.calculated_power = Some(power);
    }
}

/// Per-device counters carried between power pages.
#[derive(Debug, Default)]
pub struct PowerContext {
    torque_events: EventCounter,
    crank: Option<(u16, u16)>,
}

/// Page decoder for bicycle power meters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BicyclePower;

/// Sensor for bicycle power meters.
pub type BicyclePowerSensor = SensorDecoder<BicyclePower>;

impl BicyclePower {
    fn decode_standard_power(page: &[u8; 8], state: &mut BicyclePowerState) {
        let pedal = page[2];
        if pedal == 0xFF {
            state.pedal_power = None;
            state.right_pedal_power = None;
            state.left_pedal_power = None;
        } else {
            let balance = pedal & 0x7F;
            state.pedal_power = Some(balance);
            if pedal & 0x80 != 0 {
                state.right_pedal_power = Some(balance);
                state.left_pedal_power = Some(100u8.saturating_sub(balance));
            } else {
                state.right_pedal_power = None;
                state.left_pedal_power = None;
            }
        }
        state.cadence = (page[3] != 0xFF).then_some(page[3]);
        state.accumulated_power = Some(u16_at(page, 4));
        state.power = Some(u16_at(page, 6));
    }

    fn decode_crank_torque_frequency(
        page: &[u8; 8],
        state: &mut BicyclePowerState,
        ctx: &mut PowerContext,
        now: Instant,
    ) {
        let events = page[1];
        let slope = u16_be_at(page, 2);
        let time_stamp = u16_be_at(page, 4);
        let ticks = u16_be_at(page, 6);

        match ctx.torque_events.record(u32::from(events), now) {
            Reading::First => {}
            Reading::Changed(prev_events) => {
                if let (Some(old_time), Some(old_ticks)) =
                    (state.time_stamp, state.torque_ticks_stamp)
                    && old_time != time_stamp
                {
                    let elapsed = f64::from(rollover_delta(
                        u32::from(old_time),
                        u32::from(time_stamp),
                        MOD_U16,
                    )) * CTF_TIME_UNIT;
                    let tick_delta =
                        rollover_delta(u32::from(old_ticks), u32::from(ticks), MOD_U16);
                    let event_delta = rollover_delta(prev_events, u32::from(events), MOD_U8);

                    if slope > 0 && tick_delta > 0 {
                        let cadence = (60.0 / (elapsed / f64::from(event_delta))).round();
                        let torque_frequency = f64::from(tick_delta) / elapsed
                            - f64::from(state.zero_offset);
                        let torque = torque_frequency / (f64::from(slope) / 10.0);
                        state.set_calculated(cadence, torque, torque * cadence * PI / 30.0);
                    }
                }
            }
            Reading::Repeated(unchanged) => {
                Self::apply_idle(state, unchanged);
                return;
            }
        }

        state.event_count = Some(events);
        state.slope = Some(slope);
        state.time_stamp = Some(time_stamp);
        state.torque_ticks_stamp = Some(ticks);
    }

    fn decode_crank_torque(
        page: &[u8; 8],
        state: &mut BicyclePowerState,
        ctx: &mut PowerContext,
        now: Instant,
    ) {
        let events = page[1];
        let period = u16_at(page, 4);
        let torque = u16_at(page, 6);
        if page[3] != 0xFF {
            state.cadence = Some(page[3]);
        }

        match ctx.torque_events.record(u32::from(events), now) {
            Reading::First => {}
            Reading::Changed(prev_events) => {
                if let Some((old_period, old_torque)) = ctx.crank {
                    let event_delta =
                        f64::from(rollover_delta(prev_events, u32::from(events), MOD_U8));
                    let period_delta =
                        rollover_delta(u32::from(old_period), u32::from(period), MOD_U16);
                    let torque_delta =
                        rollover_delta(u32::from(old_torque), u32::from(torque), MOD_U16);
                    if period_delta > 0 {
                        let seconds = f64::from(period_delta) / CRANK_PERIOD_UNIT;
                        let cadence = 60.0 * event_delta / seconds;
                        let angular_velocity = 2.0 * PI * event_delta / seconds;
                        let avg_torque = f64::from(torque_delta) / (TORQUE_UNIT * event_delta);
                        state.set_calculated(cadence, avg_torque, avg_torque * angular_velocity);
                    }
                }
            }
            Reading::Repeated(unchanged) => {
                Self::apply_idle(state, unchanged);
                return;
            }
        }

        state.event_count = Some(events);
        ctx.crank = Some((period, torque));
    }

    /// Torque pages repeat the last event while the crank stands still.
    fn apply_idle(state: &mut BicyclePowerState, unchanged: std::time::Duration) {
        let stalled = state
            .calculated_cadence
            .and_then(cadence_idle_delay)
            .is_some_and(|delay| unchanged > delay);
        if stalled {
            state.set_calculated(0.0, 0.0, 0.0);
        }
    }
}

impl ProfileDecoder for BicyclePower {
    type State = BicyclePowerState;
    type Context = PowerContext;

    const PROFILE: Profile = Profile::BicyclePower;

    fn new_state(common: CommonState) -> Self::State {
        BicyclePowerState {
            common,
            ..BicyclePowerState::default()
        }
    }

    fn common_mut(state: &mut Self::State) -> &mut CommonState {
        &mut state.common
    }

    fn decode(&self, page: &[u8; 8], state: &mut Self::State, ctx: &mut Self::Context, now: Instant) {
        match page[0] {
            0x01 => {
                if page[1] == 0x10 && page[2] == 0x01 {
                    state.zero_offset = u16_at(page, 6);
                }
            }
            0x10 => Self::decode_standard_power(page, state),
            0x12 => Self::decode_crank_torque(page, state, ctx, now),
            0x20 => Self::decode_crank_torque_frequency(page, state, ctx, now),
            _ => {
                decode_global_page(page, &mut state.common);
            }
        }
    }

    fn snapshot(state: &Self::State) -> SensorState {
        SensorState::BicyclePower(state.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sensors::Sensor;
    use crate::sensors::testing::data_frame;

    fn power_frame(page: [u8; 8]) -> Vec<u8> {
        data_frame(0, page, 60916, 0x0B)
    }

    fn state(sensor: &BicyclePowerSensor) -> &BicyclePowerState {
        sensor.state(60916).unwrap()
    }

    #[test]
    fn test_manufacturer_info_and_channel() {
        let frame = hex::decode("a4144e0050ffffff82002300e0f4ed0b0510006800ad1cce").unwrap();
        let mut sensor = BicyclePowerSensor::new(60916);
        let update = sensor.on_message(0, &frame, Instant::now()).unwrap();

        assert_eq!(update.device_id, 60916);
        let state = state(&sensor);
        assert_eq!(state.common.manufacturer_id, Some(130));
        assert_eq!(state.common.channel, 0);
    }

    #[test]
    fn test_standard_power_page() {
        let mut sensor = BicyclePowerSensor::new(0);
        let now = Instant::now();
        sensor.on_message(0, &power_frame([0x10, 0x01, 0x80 | 48, 90, 0x10, 0x27, 0xFA, 0x00]), now);
        let s = state(&sensor);
        assert_eq!(s.pedal_power, Some(48));
        assert_eq!(s.right_pedal_power, Some(48));
        assert_eq!(s.left_pedal_power, Some(52));
        assert_eq!(s.cadence, Some(90));
        assert_eq!(s.accumulated_power, Some(10000));
        assert_eq!(s.power, Some(250));

        sensor.on_message(0, &power_frame([0x10, 0x02, 0xFF, 0xFF, 0x10, 0x27, 0xFA, 0x00]), now);
        let s = state(&sensor);
        assert_eq!(s.pedal_power, None);
        assert_eq!(s.right_pedal_power, None);
        assert_eq!(s.cadence, None);
    }

    #[test]
    fn test_crank_torque_frequency() {
        let mut sensor = BicyclePowerSensor::new(0);
        let t0 = Instant::now();
        // event 1, slope 100, time 0, ticks 0 (big endian fields)
        sensor.on_message(0, &power_frame([0x20, 1, 0x00, 0x64, 0, 0, 0, 0]), t0);
        assert_eq!(state(&sensor).calculated_power, None);

        // event 2, one second later (2000 * 0.5 ms), 100 ticks
        sensor.on_message(
            0,
            &power_frame([0x20, 2, 0x00, 0x64, 0x07, 0xD0, 0x00, 0x64]),
            t0 + Duration::from_secs(1),
        );
        let s = state(&sensor);
        assert_eq!(s.calculated_cadence, Some(60.0));
        assert_eq!(s.calculated_torque, Some(10.0));
        assert!((s.calculated_power.unwrap() - 20.0 * PI).abs() < 1e-9);
    }

    #[test]
    fn test_crank_torque_frequency_idle() {
        let mut sensor = BicyclePowerSensor::new(0);
        let t0 = Instant::now();
        let second = [0x20, 2, 0x00, 0x64, 0x07, 0xD0, 0x00, 0x64];
        sensor.on_message(0, &power_frame([0x20, 1, 0x00, 0x64, 0, 0, 0, 0]), t0);
        sensor.on_message(0, &power_frame(second), t0 + Duration::from_secs(1));

        // 60 rpm gives a delay of 125000 / 60 ms; within it the values hold
        sensor.on_message(0, &power_frame(second), t0 + Duration::from_secs(2));
        assert_eq!(state(&sensor).calculated_cadence, Some(60.0));

        sensor.on_message(0, &power_frame(second), t0 + Duration::from_secs(4));
        let s = state(&sensor);
        assert_eq!(s.calculated_cadence, Some(0.0));
        assert_eq!(s.calculated_power, Some(0.0));
    }

    #[test]
    fn test_calibration_offset_applies() {
        let mut sensor = BicyclePowerSensor::new(0);
        let t0 = Instant::now();
        sensor.on_message(0, &power_frame([0x01, 0x10, 0x01, 0, 0, 0, 50, 0]), t0);
        assert_eq!(state(&sensor).zero_offset, 50);

        sensor.on_message(0, &power_frame([0x20, 1, 0x00, 0x64, 0, 0, 0, 0]), t0);
        sensor.on_message(
            0,
            &power_frame([0x20, 2, 0x00, 0x64, 0x07, 0xD0, 0x00, 0x64]),
            t0 + Duration::from_secs(1),
        );
        // (100 Hz - 50 Hz) / 10 Nm/Hz
        assert_eq!(state(&sensor).calculated_torque, Some(5.0));
    }

    #[test]
    fn test_standard_crank_torque() {
        let mut sensor = BicyclePowerSensor::new(0);
        let t0 = Instant::now();
        sensor.on_message(0, &power_frame([0x12, 10, 0, 90, 0, 0, 0, 0]), t0);
        // one revolution in 2048/2048 s, 320/32 = 10 Nm
        sensor.on_message(
            0,
            &power_frame([0x12, 11, 1, 60, 0x00, 0x08, 0x40, 0x01]),
            t0 + Duration::from_secs(1),
        );
        let s = state(&sensor);
        assert_eq!(s.cadence, Some(60));
        assert_eq!(s.calculated_cadence, Some(60.0));
        assert_eq!(s.calculated_torque, Some(10.0));
        assert!((s.calculated_power.unwrap() - 20.0 * PI).abs() < 1e-9);
    }
}
