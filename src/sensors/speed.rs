//! Bike speed sensor profile (device type 0x7B).

use tokio::time::Instant;

use super::common::{
    DEFAULT_WHEEL_CIRCUMFERENCE, Revolution, RevolutionCounter, SPEED_IDLE_DELAY, apply_battery,
    decode_global_page, decode_legacy_page, page_number, u16_at, wheel_speed,
};
use super::{Profile, ProfileDecoder, SensorDecoder, SensorState};
use crate::types::CommonState;

/// Decoded state of a bike speed sensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeedState {
    /// Common fields.
    pub common: CommonState,
    /// Whether the wheel is moving, from the motion page.
    pub motion: Option<bool>,
    /// Last speed event time (1/1024 s).
    pub speed_event_time: Option<u16>,
    /// Cumulative wheel revolutions as sent by the sensor.
    pub cumulative_speed_revolution_count: Option<u16>,
    /// Distance covered since the previous event (m).
    pub calculated_distance: Option<f64>,
    /// Distance covered since the device was first seen (m).
    pub total_distance: f64,
    /// Speed (m/s).
    pub calculated_speed: Option<f64>,
}

/// Page decoder for bike speed sensors.
#[derive(Debug, Clone, Copy)]
pub struct BikeSpeed {
    wheel_circumference: f64,
}

/// Sensor for bike speed sensors.
pub type BikeSpeedSensor = SensorDecoder<BikeSpeed>;

impl Default for BikeSpeed {
    fn default() -> Self {
        Self::new(DEFAULT_WHEEL_CIRCUMFERENCE)
    }
}

impl BikeSpeed {
    /// Creates a decoder for a wheel with the given circumference in meters.
    #[must_use]
    pub const fn new(wheel_circumference: f64) -> Self {
        Self {
            wheel_circumference,
        }
    }

    /// Returns the wheel circumference in meters.
    #[must_use]
    pub const fn wheel_circumference(&self) -> f64 {
        self.wheel_circumference
    }

    /// Sets the wheel circumference in meters.
    pub const fn set_wheel_circumference(&mut self, wheel_circumference: f64) {
        self.wheel_circumference = wheel_circumference;
    }
}

/// Applies the background pages shared by speed and cadence sensors.
///
/// Returns the motion flag when the page is the motion page.
pub(crate) fn decode_background(page: &[u8; 8], common: &mut CommonState) -> Option<bool> {
    let page_no = page_number(page[0]);
    if decode_legacy_page(page_no, page, common) {
        return None;
    }
    match page_no {
        4 => apply_battery(common, page[2], page[3]),
        // bit 0 is the stop indicator
        5 => return Some(page[1] & 0x01 == 0),
        _ => {
            decode_global_page(page, common);
        }
    }
    None
}

impl ProfileDecoder for BikeSpeed {
    type State = SpeedState;
    type Context = RevolutionCounter;

    const PROFILE: Profile = Profile::BikeSpeed;

    fn new_state(common: CommonState) -> Self::State {
        SpeedState {
            common,
            ..SpeedState::default()
        }
    }

    fn common_mut(state: &mut Self::State) -> &mut CommonState {
        &mut state.common
    }

    fn decode(&self, page: &[u8; 8], state: &mut Self::State, ctx: &mut Self::Context, now: Instant) {
        if let Some(motion) = decode_background(page, &mut state.common) {
            state.motion = Some(motion);
        }

        let event_time = u16_at(page, 4);
        let count = u16_at(page, 6);
        match ctx.record(event_time, count, now) {
            Revolution::First => {}
            Revolution::Advanced { revolutions, ticks } => {
                let distance = self.wheel_circumference * f64::from(revolutions);
                state.calculated_distance = Some(distance);
                state.total_distance += distance;
                state.calculated_speed = Some(wheel_speed(self.wheel_circumference, revolutions, ticks));
            }
            Revolution::Repeated(unchanged) => {
                if unchanged > SPEED_IDLE_DELAY {
                    state.calculated_speed = Some(0.0);
                }
            }
        }
        state.speed_event_time = Some(event_time);
        state.cumulative_speed_revolution_count = Some(count);

        if state.motion == Some(false) {
            state.calculated_speed = Some(0.0);
        }
    }

    fn snapshot(state: &Self::State) -> SensorState {
        SensorState::BikeSpeed(state.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sensors::Sensor;
    use crate::sensors::testing::data_frame;
    use crate::types::BatteryStatus;

    const DEVICE: u16 = 2345;

    fn speed_frame(page_no: u8, event_time: u16, count: u16) -> Vec<u8> {
        let [t0, t1] = event_time.to_le_bytes();
        let [c0, c1] = count.to_le_bytes();
        data_frame(0, [page_no, 0xFF, 0xFF, 0xFF, t0, t1, c0, c1], DEVICE, 0x7B)
    }

    fn state(sensor: &BikeSpeedSensor) -> &SpeedState {
        sensor.state(DEVICE).unwrap()
    }

    #[test]
    fn test_speed_from_revolutions() {
        let t0 = Instant::now();
        let mut sensor = BikeSpeedSensor::with_decoder(0, BikeSpeed::new(2.0));
        sensor.on_message(0, &speed_frame(0, 1024, 10), t0);
        assert_eq!(state(&sensor).calculated_speed, None);

        sensor.on_message(0, &speed_frame(0, 2048, 15), t0 + Duration::from_secs(1));
        let s = state(&sensor);
        assert_eq!(s.calculated_distance, Some(10.0));
        assert_eq!(s.total_distance, 10.0);
        assert_eq!(s.calculated_speed, Some(10.0));
    }

    #[test]
    fn test_default_wheel_circumference() {
        let t0 = Instant::now();
        let mut sensor = BikeSpeedSensor::new(0);
        assert_eq!(sensor.decoder().wheel_circumference(), 2.118);
        sensor.on_message(0, &speed_frame(0, 0, 0), t0);
        sensor.on_message(0, &speed_frame(0, 1024, 1), t0 + Duration::from_secs(1));
        let speed = state(&sensor).calculated_speed.unwrap();
        assert!((speed - 2.118).abs() < 1e-9);

        sensor.decoder_mut().set_wheel_circumference(2.0);
        sensor.on_message(0, &speed_frame(0, 2048, 2), t0 + Duration::from_secs(2));
        assert_eq!(state(&sensor).calculated_speed, Some(2.0));
    }

    #[test]
    fn test_idle_after_fixed_delay() {
        let t0 = Instant::now();
        let mut sensor = BikeSpeedSensor::with_decoder(0, BikeSpeed::new(2.0));
        sensor.on_message(0, &speed_frame(0, 0, 0), t0);
        sensor.on_message(0, &speed_frame(0, 1024, 5), t0 + Duration::from_millis(1000));

        sensor.on_message(0, &speed_frame(0, 1024, 5), t0 + Duration::from_millis(3500));
        assert_eq!(state(&sensor).calculated_speed, Some(10.0));

        sensor.on_message(0, &speed_frame(0, 1024, 5), t0 + Duration::from_millis(4500));
        assert_eq!(state(&sensor).calculated_speed, Some(0.0));
    }

    #[test]
    fn test_motion_page_stops_speed() {
        let t0 = Instant::now();
        let mut sensor = BikeSpeedSensor::with_decoder(0, BikeSpeed::new(2.0));
        sensor.on_message(0, &speed_frame(0, 0, 0), t0);
        sensor.on_message(0, &speed_frame(0, 1024, 5), t0);
        assert_eq!(state(&sensor).calculated_speed, Some(10.0));

        let mut frame = speed_frame(0x85, 1024, 5);
        frame[5] = 0x01;
        sensor.on_message(0, &frame, t0);
        let s = state(&sensor);
        assert_eq!(s.motion, Some(false));
        assert_eq!(s.calculated_speed, Some(0.0));
    }

    #[test]
    fn test_rollover_and_battery() {
        let t0 = Instant::now();
        let mut sensor = BikeSpeedSensor::with_decoder(0, BikeSpeed::new(2.0));
        sensor.on_message(0, &speed_frame(0, 65024, 65535), t0);
        sensor.on_message(0, &speed_frame(0, 512, 1), t0);
        assert_eq!(state(&sensor).calculated_speed, Some(4.0));

        let mut frame = speed_frame(0x04, 512, 1);
        frame[6] = 0x80;
        frame[7] = 0x13;
        sensor.on_message(0, &frame, t0);
        let s = state(&sensor);
        assert_eq!(s.common.battery_voltage, Some(3.5));
        assert_eq!(s.common.battery_status, BatteryStatus::New);
    }
}
