//! Presentation helpers for telemetry fields.
//!
//! Formatting lives outside the cache: the cache only stores records, and
//! this adapter turns whatever fields are present into display strings.
//! Missing or mistyped fields render as [`UNAVAILABLE`] instead of failing.

use serde_json::Value;

use crate::telemetry::TelemetryRecord;

/// Placeholder for a field that is absent or has the wrong type.
pub const UNAVAILABLE: &str = "N/A";

/// Altitude of the air vehicle.
pub const ALTITUDE: &str = "/airVehicleLocation/altitude";
/// GeoJSON point coordinates are `[longitude, latitude]`.
pub const LONGITUDE: &str = "/airVehicleLocation/location/geometry/coordinates/0";
pub const LATITUDE: &str = "/airVehicleLocation/location/geometry/coordinates/1";
pub const CAMERA_MODEL: &str = "/cameraModel";

#[derive(Clone, Copy, Debug, Default)]
pub struct TelemetryFormatter {
    precision: Option<usize>,
}

impl TelemetryFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render numbers with a fixed number of decimal places.
    pub fn with_precision(precision: usize) -> Self {
        Self {
            precision: Some(precision),
        }
    }

    /// Render any scalar field. Objects, arrays and nulls are unavailable.
    pub fn field(&self, record: Option<&TelemetryRecord>, pointer: &str) -> String {
        match record.and_then(|record| record.get(pointer)) {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Bool(flag)) => flag.to_string(),
            Some(Value::Number(number)) => match (self.precision, number.as_f64()) {
                (Some(precision), Some(value)) => format!("{:.*}", precision, value),
                _ => number.to_string(),
            },
            _ => UNAVAILABLE.to_string(),
        }
    }

    /// Render a numeric field. Non-numeric values are unavailable.
    pub fn number(&self, record: Option<&TelemetryRecord>, pointer: &str) -> String {
        match record.and_then(|record| record.f64_at(pointer)) {
            Some(value) => match self.precision {
                Some(precision) => format!("{:.*}", precision, value),
                None => value.to_string(),
            },
            None => UNAVAILABLE.to_string(),
        }
    }

    /// One-line overlay text for a fused update.
    pub fn summary(&self, record: Option<&TelemetryRecord>) -> String {
        format!(
            "Altitude: {}, LatLon: {}, {}, Camera: {}",
            self.number(record, ALTITUDE),
            self.number(record, LATITUDE),
            self.number(record, LONGITUDE),
            self.field(record, CAMERA_MODEL),
        )
    }
}
