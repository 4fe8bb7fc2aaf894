/*!
 * Human units to vendor encodings.
 *
 * The vendor encodes ISO, shutter speed and aperture as values from lookup
 * tables that are not part of this crate. [`PlaceholderEncoder`] stands in
 * until a table-driven encoder is plugged in through [`UnitEncoder`].
 */
use std::fmt::Debug;

use crate::device::{DeviceError, Result};

/// Converts human exposure units into raw property values
pub trait UnitEncoder: Send + Sync + Debug {
    /// ISO sensitivity, e.g. 100
    fn iso(&self, iso: u32) -> Result<u64>;

    /// Exposure time in seconds, e.g. 1/125
    fn shutter_speed(&self, seconds: f64) -> Result<u64>;

    /// Aperture as an f-number, e.g. 2.8
    fn aperture(&self, f_number: f64) -> Result<u64>;
}

/// Placeholder encoding; not the vendor's real tables
///
/// ISO is passed through, the f-number is scaled by 100 and the shutter speed
/// becomes its reciprocal, both rounded to the nearest integer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderEncoder;

fn positive(name: &str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(DeviceError::InvalidValue(format!(
            "{} must be a positive number, got {}",
            name, value
        )))
    }
}

impl UnitEncoder for PlaceholderEncoder {
    fn iso(&self, iso: u32) -> Result<u64> {
        if iso == 0 {
            return Err(DeviceError::InvalidValue("ISO must be positive".to_string()));
        }
        Ok(u64::from(iso))
    }

    fn shutter_speed(&self, seconds: f64) -> Result<u64> {
        let reciprocal = (1.0 / positive("shutter speed", seconds)?).round();
        if reciprocal < 1.0 {
            return Err(DeviceError::InvalidValue(format!(
                "shutter speed {}s is too long for this encoding",
                seconds
            )));
        }
        Ok(reciprocal as u64)
    }

    fn aperture(&self, f_number: f64) -> Result<u64> {
        Ok((positive("f-number", f_number)? * 100.0).round() as u64)
    }
}
