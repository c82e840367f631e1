//! Page layouts and counter arithmetic shared by several profiles.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::{BatteryStatus, CommonState};

/// Modulus of an 8-bit counter.
pub const MOD_U8: u32 = 256;

/// Modulus of a 16-bit counter.
pub const MOD_U16: u32 = 65_536;

/// Modulus of a 1/1024 s event time (wraps every 64 s).
pub const MOD_EVENT_TIME: u32 = 1024 * 64;

/// Toggle bit of the page byte; ignored for page dispatch.
pub const PAGE_TOGGLE: u8 = 0x80;

/// How long an unchanged speed event time is trusted before speed is inferred as zero.
pub const SPEED_IDLE_DELAY: Duration = Duration::from_millis(3000);

/// Returns the page number with the toggle bit cleared.
#[must_use]
pub const fn page_number(byte: u8) -> u8 {
    byte & !PAGE_TOGGLE
}

/// Computes `new - old` for a counter that wraps at `modulus`.
#[must_use]
pub const fn rollover_delta(old: u32, new: u32, modulus: u32) -> u32 {
    if new < old {
        new + modulus - old
    } else {
        new - old
    }
}

/// Returns how long an unchanged cadence-like counter is trusted.
///
/// Roughly two crank revolutions at the last seen cadence (`125000 / rpm` ms).
#[must_use]
pub fn cadence_idle_delay(last_cadence: f64) -> Option<Duration> {
    (last_cadence > 0.0).then(|| Duration::from_secs_f64(125.0 / last_cadence))
}

pub(crate) const fn u16_at(page: &[u8; 8], i: usize) -> u16 {
    u16::from_le_bytes([page[i], page[i + 1]])
}

pub(crate) const fn u16_be_at(page: &[u8; 8], i: usize) -> u16 {
    u16::from_be_bytes([page[i], page[i + 1]])
}

pub(crate) const fn u24_at(page: &[u8; 8], i: usize) -> u32 {
    u32::from_le_bytes([page[i], page[i + 1], page[i + 2], 0])
}

pub(crate) const fn u32_at(page: &[u8; 8], i: usize) -> u32 {
    u32::from_le_bytes([page[i], page[i + 1], page[i + 2], page[i + 3]])
}

/// Outcome of recording a counter reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// No earlier reading exists.
    First,
    /// The value changed; holds the previous value.
    Changed(u32),
    /// The value repeated; holds how long it has been unchanged.
    Repeated(Duration),
}

/// Tracks when an event counter last advanced.
#[derive(Debug, Clone, Default)]
pub struct EventCounter {
    last: Option<u32>,
    changed_at: Option<Instant>,
}

impl EventCounter {
    /// Records a new reading taken at `now`.
    pub fn record(&mut self, value: u32, now: Instant) -> Reading {
        match (self.last, self.changed_at) {
            (Some(last), Some(at)) if last == value => {
                Reading::Repeated(now.saturating_duration_since(at))
            }
            (last, _) => {
                self.last = Some(value);
                self.changed_at = Some(now);
                last.map_or(Reading::First, Reading::Changed)
            }
        }
    }

    /// Returns the last recorded value.
    #[must_use]
    pub const fn last(&self) -> Option<u32> {
        self.last
    }
}

/// Wheel circumference of a 700c road wheel in meters.
pub const DEFAULT_WHEEL_CIRCUMFERENCE: f64 = 2.118;

/// Outcome of recording a revolution event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Revolution {
    /// No earlier event exists.
    First,
    /// New event; revolutions and 1/1024 s ticks since the previous one.
    Advanced {
        /// Revolutions since the previous event.
        revolutions: u32,
        /// Event time delta in 1/1024 s.
        ticks: u32,
    },
    /// Event time repeated; holds how long it has been unchanged.
    Repeated(Duration),
}

/// Tracks an (event time, cumulative revolution count) pair as sent by
/// speed and cadence sensors.
#[derive(Debug, Clone, Default)]
pub struct RevolutionCounter {
    time: EventCounter,
    count: u16,
}

impl RevolutionCounter {
    /// Records a new event time and revolution count taken at `now`.
    pub fn record(&mut self, event_time: u16, count: u16, now: Instant) -> Revolution {
        match self.time.record(u32::from(event_time), now) {
            Reading::First => {
                self.count = count;
                Revolution::First
            }
            Reading::Changed(prev) => {
                let revolutions = rollover_delta(u32::from(self.count), u32::from(count), MOD_U16);
                self.count = count;
                Revolution::Advanced {
                    revolutions,
                    ticks: rollover_delta(prev, u32::from(event_time), MOD_EVENT_TIME),
                }
            }
            Reading::Repeated(unchanged) => Revolution::Repeated(unchanged),
        }
    }
}

/// Speed in m/s for `revolutions` of a wheel over `ticks` of 1/1024 s.
#[must_use]
pub fn wheel_speed(circumference: f64, revolutions: u32, ticks: u32) -> f64 {
    circumference * f64::from(revolutions) * 1024.0 / f64::from(ticks)
}

/// Cadence in rpm for `revolutions` of the crank over `ticks` of 1/1024 s.
#[must_use]
pub fn crank_cadence(revolutions: u32, ticks: u32) -> f64 {
    60.0 * f64::from(revolutions) * 1024.0 / f64::from(ticks)
}

/// Applies the battery voltage and status fields.
///
/// `descriptive` carries the coarse voltage in bits 0-3 (`0x0F` = invalid) and
/// the status in bits 4-6.
pub fn apply_battery(common: &mut CommonState, fractional: u8, descriptive: u8) {
    let coarse = descriptive & 0x0F;
    common.battery_voltage =
        (coarse != 0x0F).then(|| f64::from(coarse) + f64::from(fractional) / 256.0);
    common.battery_status = BatteryStatus::from_flags((descriptive & 0x70) >> 4);
}

/// Decodes the legacy common pages 1-3 used by heart rate, speed and cadence sensors.
///
/// Returns false for any other page.
pub fn decode_legacy_page(page_no: u8, page: &[u8; 8], common: &mut CommonState) -> bool {
    match page_no {
        1 => common.operating_time = Some(u24_at(page, 1) * 2),
        2 => {
            common.manufacturer_id = Some(u16::from(page[1]));
            common.serial_number =
                Some(u32::from(common.device_id) | (u32::from(u16_at(page, 2)) << 16));
        }
        3 => {
            common.hardware_version = Some(page[1]);
            common.software_version = Some(f64::from(page[2]));
            common.model_number = Some(u16::from(page[3]));
        }
        _ => return false,
    }
    true
}

/// Decodes the global common pages 0x50-0x52.
///
/// Returns false for any other page.
pub fn decode_global_page(page: &[u8; 8], common: &mut CommonState) -> bool {
    match page[0] {
        0x50 => {
            common.hardware_version = Some(page[3]);
            common.manufacturer_id = Some(u16_at(page, 4));
            common.model_number = Some(u16_at(page, 6));
        }
        0x51 => {
            let supplemental = page[2];
            let mut version = f64::from(page[3]);
            if supplemental != 0xFF {
                version += f64::from(supplemental) / 1000.0;
            }
            common.software_version = Some(version);
            let serial = u32_at(page, 4);
            if serial != u32::MAX {
                common.serial_number = Some(serial);
            }
        }
        0x52 => {
            let descriptive = page[7];
            let resolution = if descriptive & 0x80 != 0 { 2 } else { 16 };
            common.operating_time = Some(u24_at(page, 3) * resolution);
            apply_battery(common, page[6], descriptive);
        }
        _ => return false,
    }
    true
}
