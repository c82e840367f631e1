//! Value types shared across sensor profiles.

pub mod device;

pub use device::{BatteryStatus, CommonState};
