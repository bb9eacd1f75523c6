use crate::errors::{Error, Result};
use crate::model::{Patch, TelemetryRecord};

const LAT_MIN: f64 = -90.0;
const LAT_MAX: f64 = 90.0;
const LON_MIN: f64 = -180.0;
const LON_MAX: f64 = 180.0;
const TEMP_MIN: f64 = -60.0;
const TEMP_MAX: f64 = 85.0;
const PRESSURE_MIN: f64 = 300.0;
const PRESSURE_MAX: f64 = 1100.0;
const ALTITUDE_MIN: f64 = -500.0;
const ALTITUDE_MAX: f64 = 9000.0;
const BATTERY_MIN: i64 = 0;
const BATTERY_MAX: i64 = 100;

fn check_range<T>(name: &str, patch: &Patch<T>, min: T, max: T) -> Result<()>
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    if let Patch::Set(value) = patch {
        if *value < min || *value > max {
            return Err(Error::Validation(format!(
                "{} {} out of range [{}, {}]",
                name, value, min, max
            )));
        }
    }
    Ok(())
}

/// Validates the fields a record carries. Absent fields are not checked.
pub fn validate(record: &TelemetryRecord) -> Result<()> {
    if record.device_id().is_none() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    check_range("Latitude", &record.latitude, LAT_MIN, LAT_MAX)?;
    check_range("Longitude", &record.longitude, LON_MIN, LON_MAX)?;
    check_range("Temperature", &record.temperature, TEMP_MIN, TEMP_MAX)?;
    check_range("Pressure", &record.pressure, PRESSURE_MIN, PRESSURE_MAX)?;
    check_range("Altitude", &record.altitude, ALTITUDE_MIN, ALTITUDE_MAX)?;
    check_range("Battery", &record.battery, BATTERY_MIN, BATTERY_MAX)?;

    Ok(())
}
