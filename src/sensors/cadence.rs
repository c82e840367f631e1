//! Bike cadence sensor profile (device type 0x7A).

use tokio::time::Instant;

use super::common::{Revolution, RevolutionCounter, cadence_idle_delay, crank_cadence, u16_at};
use super::speed::decode_background;
use super::{Profile, ProfileDecoder, SensorDecoder, SensorState};
use crate::types::CommonState;

/// Decoded state of a bike cadence sensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CadenceState {
    /// Common fields.
    pub common: CommonState,
    /// Whether the crank is moving, from the motion page.
    pub motion: Option<bool>,
    /// Last cadence event time (1/1024 s).
    pub cadence_event_time: Option<u16>,
    /// Cumulative crank revolutions as sent by the sensor.
    pub cumulative_cadence_revolution_count: Option<u16>,
    /// Cadence (rpm).
    pub calculated_cadence: Option<f64>,
}

/// Applies a cadence event to the calculated cadence.
pub(crate) fn apply_cadence(calculated: &mut Option<f64>, event: Revolution) {
    match event {
        Revolution::First => {}
        Revolution::Advanced { revolutions, ticks } => {
            *calculated = Some(crank_cadence(revolutions, ticks));
        }
        Revolution::Repeated(unchanged) => {
            let stalled = calculated
                .and_then(cadence_idle_delay)
                .is_some_and(|delay| unchanged > delay);
            if stalled {
                *calculated = Some(0.0);
            }
        }
    }
}

/// Page decoder for bike cadence sensors.
#[derive(Debug, Clone, Copy, Default)]
pub struct BikeCadence;

/// Sensor for bike cadence sensors.
pub type BikeCadenceSensor = SensorDecoder<BikeCadence>;

impl ProfileDecoder for BikeCadence {
    type State = CadenceState;
    type Context = RevolutionCounter;

    const PROFILE: Profile = Profile::BikeCadence;

    fn new_state(common: CommonState) -> Self::State {
        CadenceState {
            common,
            ..CadenceState::default()
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
        apply_cadence(&mut state.calculated_cadence, ctx.record(event_time, count, now));
        state.cadence_event_time = Some(event_time);
        state.cumulative_cadence_revolution_count = Some(count);

        if state.motion == Some(false) {
            state.calculated_cadence = Some(0.0);
        }
    }

    fn snapshot(state: &Self::State) -> SensorState {
        SensorState::BikeCadence(state.clone())
    }
}
