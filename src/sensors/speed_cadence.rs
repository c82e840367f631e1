//! Combined bike speed and cadence profile (device type 0x79).
//!
//! The combined sensor has no page byte: every message carries both the
//! crank and the wheel event.

use tokio::time::Instant;

use super::cadence::apply_cadence;
use super::common::{
    DEFAULT_WHEEL_CIRCUMFERENCE, Revolution, RevolutionCounter, SPEED_IDLE_DELAY, u16_at,
    wheel_speed,
};
use super::{Profile, ProfileDecoder, SensorDecoder, SensorState};
use crate::types::CommonState;

/// Decoded state of a combined speed and cadence sensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeedCadenceState {
    /// Common fields.
    pub common: CommonState,
    /// Last cadence event time (1/1024 s).
    pub cadence_event_time: Option<u16>,
    /// Cumulative crank revolutions.
    pub cumulative_cadence_revolution_count: Option<u16>,
    /// Last speed event time (1/1024 s).
    pub speed_event_time: Option<u16>,
    /// Cumulative wheel revolutions.
    pub cumulative_speed_revolution_count: Option<u16>,
    /// Cadence (rpm).
    pub calculated_cadence: Option<f64>,
    /// Distance covered since the previous wheel event (m).
    pub calculated_distance: Option<f64>,
    /// Distance covered since the device was first seen (m).
    pub total_distance: f64,
    /// Speed (m/s).
    pub calculated_speed: Option<f64>,
}

/// Crank and wheel revolution counters of one sensor.
#[derive(Debug, Default)]
pub struct SpeedCadenceContext {
    crank: RevolutionCounter,
    wheel: RevolutionCounter,
}

/// Page decoder for combined speed and cadence sensors.
#[derive(Debug, Clone, Copy)]
pub struct SpeedCadence {
    wheel_circumference: f64,
}

/// Sensor for combined speed and cadence sensors.
pub type SpeedCadenceSensor = SensorDecoder<SpeedCadence>;

impl Default for SpeedCadence {
    fn default() -> Self {
        Self::new(DEFAULT_WHEEL_CIRCUMFERENCE)
    }
}

impl SpeedCadence {
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

impl ProfileDecoder for SpeedCadence {
    type State = SpeedCadenceState;
    type Context = SpeedCadenceContext;

    const PROFILE: Profile = Profile::SpeedCadence;

    fn new_state(common: CommonState) -> Self::State {
        SpeedCadenceState {
            common,
            ..SpeedCadenceState::default()
        }
    }

    fn common_mut(state: &mut Self::State) -> &mut CommonState {
        &mut state.common
    }

    fn decode(&self, page: &[u8; 8], state: &mut Self::State, ctx: &mut Self::Context, now: Instant) {
        let cadence_time = u16_at(page, 0);
        let cadence_count = u16_at(page, 2);
        apply_cadence(
            &mut state.calculated_cadence,
            ctx.crank.record(cadence_time, cadence_count, now),
        );
        state.cadence_event_time = Some(cadence_time);
        state.cumulative_cadence_revolution_count = Some(cadence_count);

        let speed_time = u16_at(page, 4);
        let speed_count = u16_at(page, 6);
        match ctx.wheel.record(speed_time, speed_count, now) {
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
        state.speed_event_time = Some(speed_time);
        state.cumulative_speed_revolution_count = Some(speed_count);
    }

    fn snapshot(state: &Self::State) -> SensorState {
        SensorState::SpeedCadence(state.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sensors::Sensor;
    use crate::sensors::testing::data_frame;

    const DEVICE: u16 = 4242;

    fn sc_frame(cadence_time: u16, cadence_count: u16, speed_time: u16, speed_count: u16) -> Vec<u8> {
        let mut page = [0u8; 8];
        page[0..2].copy_from_slice(&cadence_time.to_le_bytes());
        page[2..4].copy_from_slice(&cadence_count.to_le_bytes());
        page[4..6].copy_from_slice(&speed_time.to_le_bytes());
        page[6..8].copy_from_slice(&speed_count.to_le_bytes());
        data_frame(0, page, DEVICE, 0x79)
    }

    #[test]
    fn test_speed_and_cadence() {
        let t0 = Instant::now();
        let mut sensor = SpeedCadenceSensor::with_decoder(0, SpeedCadence::new(2.0));
        sensor.on_message(0, &sc_frame(0, 0, 0, 0), t0);
        let update = sensor
            .on_message(0, &sc_frame(1024, 1, 1024, 3), t0 + Duration::from_secs(1))
            .unwrap();
        match update.state {
            SensorState::SpeedCadence(s) => {
                assert_eq!(s.calculated_cadence, Some(60.0));
                assert_eq!(s.calculated_speed, Some(6.0));
                assert_eq!(s.calculated_distance, Some(6.0));
                assert_eq!(s.total_distance, 6.0);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_independent_idle() {
        let t0 = Instant::now();
        let mut sensor = SpeedCadenceSensor::with_decoder(0, SpeedCadence::new(2.0));
        sensor.on_message(0, &sc_frame(0, 0, 0, 0), t0);
        sensor.on_message(0, &sc_frame(1024, 1, 1024, 3), t0);

        // crank stops, wheel keeps turning
        sensor.on_message(0, &sc_frame(1024, 1, 2048, 6), t0 + Duration::from_millis(2500));
        let s = sensor.state(DEVICE).unwrap();
        assert_eq!(s.calculated_cadence, Some(0.0));
        assert_eq!(s.calculated_speed, Some(6.0));
        assert_eq!(s.total_distance, 12.0);

        // wheel stops
        sensor.on_message(0, &sc_frame(1024, 1, 2048, 6), t0 + Duration::from_millis(6000));
        assert_eq!(sensor.state(DEVICE).unwrap().calculated_speed, Some(0.0));
    }
}
