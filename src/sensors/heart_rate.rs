//! Heart rate monitor profile (device type 0x78).
//!
//! Older monitors only send the default data page with no page number; the
//! page byte of such monitors never toggles. Background pages are only
//! decoded once the page byte has been seen to change, after which the
//! monitor is treated as using the extended format for good.

use tokio::time::Instant;

use super::common::{
    MOD_EVENT_TIME, MOD_U8, apply_battery, decode_legacy_page, page_number, rollover_delta, u16_at,
};
use super::{Profile, ProfileDecoder, SensorDecoder, SensorState};
use crate::types::CommonState;

/// Decoded state of a heart rate monitor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartRateState {
    /// Common fields.
    pub common: CommonState,
    /// Time of the last heart beat event (1/1024 s).
    pub beat_time: Option<u16>,
    /// Heart beat count.
    pub beat_count: Option<u8>,
    /// Computed heart rate (bpm).
    pub computed_heart_rate: Option<u8>,
    /// Heart rate derived from the beat time and count deltas (bpm).
    pub beat_interval_heart_rate: Option<f64>,
    /// Time of the previous heart beat event (1/1024 s).
    pub previous_beat: Option<u16>,
    /// Average heart rate over the last interval (bpm).
    pub interval_average: Option<u8>,
    /// Maximum heart rate over the last interval (bpm).
    pub interval_max: Option<u8>,
    /// Average heart rate over the session (bpm).
    pub session_average: Option<u8>,
    /// Supported features bit field.
    pub supported_features: Option<u8>,
    /// Enabled features bit field.
    pub enabled_features: Option<u8>,
}

/// Page format detection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PageFormat {
    /// No page seen yet.
    #[default]
    Init,
    /// Page byte has not changed so far; treat pages as the default format.
    Standard,
    /// Page byte toggled; background pages are decoded.
    Extended,
}

/// Page-format detector and last beat reading of one monitor.
#[derive(Debug, Default)]
pub struct HeartRateContext {
    format: PageFormat,
    last_page: u8,
    last_beat: Option<(u16, u8)>,
}

/// Page decoder for heart rate monitors.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartRate;

/// Sensor for heart rate monitors.
pub type HeartRateSensor = SensorDecoder<HeartRate>;

impl HeartRate {
    fn decode_background(page: &[u8; 8], state: &mut HeartRateState) {
        let page_no = page_number(page[0]);
        if decode_legacy_page(page_no, page, &mut state.common) {
            return;
        }
        match page_no {
            4 => state.previous_beat = Some(u16_at(page, 2)),
            5 => {
                state.interval_average = Some(page[1]);
                state.interval_max = Some(page[2]);
                state.session_average = Some(page[3]);
            }
            6 => {
                state.supported_features = Some(page[2]);
                state.enabled_features = Some(page[3]);
            }
            7 => {
                if page[1] != 0xFF {
                    state.common.battery_level = Some(page[1]);
                }
                apply_battery(&mut state.common, page[2], page[3]);
            }
            _ => {}
        }
    }
}

impl ProfileDecoder for HeartRate {
    type State = HeartRateState;
    type Context = HeartRateContext;

    const PROFILE: Profile = Profile::HeartRate;

    fn new_state(common: CommonState) -> Self::State {
        HeartRateState {
            common,
            ..HeartRateState::default()
        }
    }

    fn common_mut(state: &mut Self::State) -> &mut CommonState {
        &mut state.common
    }

    fn decode(&self, page: &[u8; 8], state: &mut Self::State, ctx: &mut Self::Context, _now: Instant) {
        match ctx.format {
            PageFormat::Init => ctx.format = PageFormat::Standard,
            PageFormat::Standard | PageFormat::Extended
                if page[0] != ctx.last_page || ctx.format == PageFormat::Extended =>
            {
                ctx.format = PageFormat::Extended;
                Self::decode_background(page, state);
            }
            PageFormat::Standard | PageFormat::Extended => {}
        }

        let beat_time = u16_at(page, 4);
        let beat_count = page[6];
        if let Some((old_time, old_count)) = ctx.last_beat
            && old_count != beat_count
        {
            let beats = rollover_delta(u32::from(old_count), u32::from(beat_count), MOD_U8);
            let ticks = rollover_delta(u32::from(old_time), u32::from(beat_time), MOD_EVENT_TIME);
            if ticks > 0 {
                state.beat_interval_heart_rate =
                    Some(60.0 * f64::from(beats) * 1024.0 / f64::from(ticks));
            }
        }
        ctx.last_beat = Some((beat_time, beat_count));

        state.beat_time = Some(beat_time);
        state.beat_count = Some(beat_count);
        state.computed_heart_rate = Some(page[7]);
        ctx.last_page = page[0];
    }

    fn snapshot(state: &Self::State) -> SensorState {
        SensorState::HeartRate(state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::Sensor;
    use crate::sensors::testing::data_frame;
    use crate::types::BatteryStatus;

    const DEVICE: u16 = 31000;

    fn hr_frame(page: [u8; 8]) -> Vec<u8> {
        data_frame(0, page, DEVICE, 0x78)
    }

    #[test]
    fn test_default_page() {
        let mut sensor = HeartRateSensor::new(0);
        let update = sensor
            .on_message(0, &hr_frame([0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x04, 7, 72]), Instant::now())
            .unwrap();
        match update.state {
            SensorState::HeartRate(s) => {
                assert_eq!(s.beat_time, Some(1024));
                assert_eq!(s.beat_count, Some(7));
                assert_eq!(s.computed_heart_rate, Some(72));
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_background_pages_need_toggle() {
        let now = Instant::now();
        let mut sensor = HeartRateSensor::new(DEVICE);
        // first page only moves the detector to the standard format
        sensor.on_message(0, &hr_frame([0x02, 0x05, 0x01, 0x00, 0, 0, 1, 60]), now);
        assert_eq!(sensor.state(DEVICE).unwrap().common.manufacturer_id, None);

        // same page byte: still standard
        sensor.on_message(0, &hr_frame([0x02, 0x05, 0x01, 0x00, 0, 0, 2, 61]), now);
        assert_eq!(sensor.state(DEVICE).unwrap().common.manufacturer_id, None);

        // toggled page byte switches to extended
        sensor.on_message(0, &hr_frame([0x82, 0x05, 0x01, 0x00, 0, 0, 3, 62]), now);
        let s = sensor.state(DEVICE).unwrap();
        assert_eq!(s.common.manufacturer_id, Some(5));
        assert_eq!(s.common.serial_number, Some(u32::from(DEVICE) | 1 << 16));
        assert_eq!(s.computed_heart_rate, Some(62));

        // extended stays on even when the byte repeats
        sensor.on_message(0, &hr_frame([0x82, 0x09, 0x01, 0x00, 0, 0, 4, 63]), now);
        assert_eq!(sensor.state(DEVICE).unwrap().common.manufacturer_id, Some(9));
    }

    #[test]
    fn test_beat_interval_heart_rate() {
        let now = Instant::now();
        let mut sensor = HeartRateSensor::new(0);
        sensor.on_message(0, &hr_frame([0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 10, 60]), now);
        assert_eq!(sensor.state(DEVICE).unwrap().beat_interval_heart_rate, None);

        // two beats in 2048/1024 s
        sensor.on_message(0, &hr_frame([0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x08, 12, 60]), now);
        assert_eq!(sensor.state(DEVICE).unwrap().beat_interval_heart_rate, Some(60.0));

        // beat time wraps at 65536
        sensor.on_message(0, &hr_frame([0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 13, 60]), now);
        let bpm = sensor.state(DEVICE).unwrap().beat_interval_heart_rate.unwrap();
        assert!((bpm - 60.0 * 1024.0 / 63_488.0).abs() < 1e-9);
    }

    #[test]
    fn test_battery_page() {
        let now = Instant::now();
        let mut sensor = HeartRateSensor::new(0);
        sensor.on_message(0, &hr_frame([0x04, 0, 0, 0, 0, 0, 0, 60]), now);
        sensor.on_message(0, &hr_frame([0x87, 80, 0x40, 0x33, 0, 0, 0, 60]), now);
        let s = sensor.state(DEVICE).unwrap();
        assert_eq!(s.common.battery_level, Some(80));
        assert_eq!(s.common.battery_voltage, Some(3.25));
        assert_eq!(s.common.battery_status, BatteryStatus::Ok);
    }

    #[test]
    fn test_feature_pages() {
        let now = Instant::now();
        let mut sensor = HeartRateSensor::new(0);
        sensor.on_message(0, &hr_frame([0x00; 8]), now);
        sensor.on_message(0, &hr_frame([0x04, 0xFF, 0x00, 0x02, 0, 0, 0, 0]), now);
        sensor.on_message(0, &hr_frame([0x85, 70, 150, 90, 0, 0, 0, 0]), now);
        sensor.on_message(0, &hr_frame([0x06, 0xFF, 0x03, 0x01, 0, 0, 0, 0]), now);
        let s = sensor.state(DEVICE).unwrap();
        assert_eq!(s.previous_beat, Some(512));
        assert_eq!(s.interval_average, Some(70));
        assert_eq!(s.interval_max, Some(150));
        assert_eq!(s.session_average, Some(90));
        assert_eq!(s.supported_features, Some(3));
        assert_eq!(s.enabled_features, Some(1));
    }
}
