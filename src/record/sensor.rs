// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sensor payload shapes.
//!
//! The record envelope ([`super::TypedRecord`]) carries `timestamp`,
//! `device_id` and metadata; these structs hold only the per-kind body.

use serde::{Deserialize, Serialize};

use super::{require_finite, require_range, ValidationError};

// Motion sensors

/// Three-axis reading shared by accelerometer, gyroscope and magnetometer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisReading {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f32>,
}

impl AxisReading {
    #[must_use]
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z, accuracy: None }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_finite("x", self.x.into())?;
        require_finite("y", self.y.into())?;
        require_finite("z", self.z.into())?;
        if let Some(a) = self.accuracy {
            require_finite("accuracy", a.into())?;
        }
        Ok(())
    }
}

// Location

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellites: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl GpsFix {
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            accuracy: None,
            speed: None,
            bearing: None,
            satellites: None,
            provider: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_range("latitude", self.latitude, -90.0, 90.0)?;
        require_range("longitude", self.longitude, -180.0, 180.0)?;
        if let Some(alt) = self.altitude {
            require_finite("altitude", alt)?;
        }
        for (field, v) in [("accuracy", self.accuracy), ("speed", self.speed)] {
            if let Some(v) = v {
                require_range(field, v.into(), 0.0, f64::MAX)?;
            }
        }
        if let Some(b) = self.bearing {
            require_range("bearing", b.into(), 0.0, 360.0)?;
        }
        if let Some(s) = self.satellites {
            if s < 0 {
                return Err(ValidationError::new("satellites", "must not be negative"));
            }
        }
        Ok(())
    }
}

// Health

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRate {
    pub bpm: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rr_intervals: Option<Vec<f32>>,
}

impl HeartRate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(0..=400).contains(&self.bpm) {
            return Err(ValidationError::new("bpm", "must be within 0..=400"));
        }
        validate_confidence(self.confidence)?;
        if let Some(rr) = &self.rr_intervals {
            rr.iter().try_for_each(|v| require_finite("rr_intervals", (*v).into()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcgTrace {
    pub voltage: Vec<f32>,
    pub time: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rhythm_classification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<f32>,
}

impl EcgTrace {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.voltage.is_empty() {
            return Err(ValidationError::new("voltage", "trace must not be empty"));
        }
        if self.voltage.len() != self.time.len() {
            return Err(ValidationError::new(
                "time",
                format!(
                    "{} samples but {} timestamps",
                    self.voltage.len(),
                    self.time.len()
                ),
            ));
        }
        self.voltage
            .iter()
            .chain(self.time.iter())
            .try_for_each(|v| require_finite("voltage", (*v).into()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloodOxygen {
    pub spo2: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_values: Option<Vec<f32>>,
}

impl BloodOxygen {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(0..=100).contains(&self.spo2) {
            return Err(ValidationError::new("spo2", "must be within 0..=100"));
        }
        validate_confidence(self.confidence)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stress {
    pub stress_score: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stress_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hrv: Option<f32>,
}

impl Stress {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(0..=100).contains(&self.stress_score) {
            return Err(ValidationError::new("stress_score", "must be within 0..=100"));
        }
        if let Some(hrv) = self.hrv {
            require_range("hrv", hrv.into(), 0.0, f64::MAX)?;
        }
        Ok(())
    }
}

// Environment

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proximity {
    pub distance: f32,
    pub near: bool,
}

/// Scalar environmental reading (light in lux, pressure in hPa,
/// temperature in °C, humidity in %).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Light {
    pub lux: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pressure {
    pub hectopascals: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    pub celsius: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Humidity {
    pub percentage: f32,
}

// Activity and audio

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCount {
    pub steps: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioLevel {
    pub db: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_db: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
}

// System

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub percentage: i32,
    pub charging: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionType {
    Unknown,
    None,
    Wifi,
    Cellular2g,
    Cellular3g,
    Cellular4g,
    Cellular5g,
    Ethernet,
    Vpn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub connection_type: ConnectionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roaming: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cellular_technology: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_metered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_servers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenState {
    pub screen_on: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<String>,
}

// Camera

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CameraType {
    Unknown,
    Front,
    BackMain,
    BackWide,
    BackTelephoto,
}

/// Normalized bounding box, all coordinates in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<BoundingBox>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<BoundingBox>,
    /// Known entity this face was matched to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraFrame {
    pub camera_type: CameraType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_level: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objects: Option<Vec<DetectedObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_detection: Option<Vec<DetectedFace>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_distance: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom_level: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_mode: Option<String>,
}

impl CameraFrame {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for obj in self.objects.iter().flatten() {
            if obj.label.trim().is_empty() {
                return Err(ValidationError::new("objects.label", "must not be empty"));
            }
            validate_confidence(Some(obj.confidence))?;
            validate_bounds(obj.bounds.as_ref())?;
        }
        for face in self.face_detection.iter().flatten() {
            validate_confidence(Some(face.confidence))?;
            validate_bounds(face.bounds.as_ref())?;
        }
        if let Some(z) = self.zoom_level {
            require_range("zoom_level", z.into(), 0.0, f64::MAX)?;
        }
        Ok(())
    }
}

impl Proximity {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_range("distance", self.distance.into(), 0.0, f64::MAX)
    }
}

impl Light {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_range("lux", self.lux.into(), 0.0, f64::MAX)
    }
}

impl Pressure {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_range("hectopascals", self.hectopascals.into(), 0.0, f64::MAX)
    }
}

impl Temperature {
    pub fn validate(&self) -> Result<(), ValidationError> {
        // Absolute zero is the only hard floor
        require_range("celsius", self.celsius.into(), -273.15, f64::MAX)
    }
}

impl Humidity {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_range("percentage", self.percentage.into(), 0.0, 100.0)
    }
}

impl StepCount {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.steps < 0 {
            return Err(ValidationError::new("steps", "must not be negative"));
        }
        validate_confidence(self.confidence)
    }
}

impl AudioLevel {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_finite("db", self.db.into())?;
        if let Some(peak) = self.peak_db {
            require_finite("peak_db", peak.into())?;
        }
        if let Some(v) = self.volume {
            require_range("volume", v.into(), 0.0, f64::MAX)?;
        }
        Ok(())
    }
}

impl Battery {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(0..=100).contains(&self.percentage) {
            return Err(ValidationError::new("percentage", "must be within 0..=100"));
        }
        Ok(())
    }
}

impl NetworkState {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(servers) = &self.dns_servers {
            if servers.iter().any(|s| s.trim().is_empty()) {
                return Err(ValidationError::new("dns_servers", "entries must not be empty"));
            }
        }
        Ok(())
    }
}

impl ScreenState {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(b) = self.brightness {
            if b < 0 {
                return Err(ValidationError::new("brightness", "must not be negative"));
            }
        }
        Ok(())
    }
}

fn validate_confidence(confidence: Option<f32>) -> Result<(), ValidationError> {
    match confidence {
        Some(c) => require_range("confidence", c.into(), 0.0, 1.0),
        None => Ok(()),
    }
}

fn validate_bounds(bounds: Option<&BoundingBox>) -> Result<(), ValidationError> {
    let Some(b) = bounds else { return Ok(()) };
    for v in [b.x, b.y, b.width, b.height] {
        require_range("bounds", v.into(), 0.0, 1.0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_bounds() {
        assert!(GpsFix::new(37.77, -122.41).validate().is_ok());
        assert!(GpsFix::new(91.0, 0.0).validate().is_err());
        assert!(GpsFix::new(0.0, -181.0).validate().is_err());
        assert!(GpsFix::new(f64::NAN, 0.0).validate().is_err());

        let mut fix = GpsFix::new(0.0, 0.0);
        fix.bearing = Some(400.0);
        assert!(fix.validate().is_err());
    }

    #[test]
    fn test_ecg_length_mismatch() {
        let trace = EcgTrace {
            voltage: vec![0.1, 0.2, 0.3],
            time: vec![0.0, 0.004],
            rhythm_classification: None,
            heart_rate: None,
        };
        let err = trace.validate().unwrap_err();
        assert_eq!(err.field, "time");
    }

    #[test]
    fn test_camera_confidence_checked() {
        let frame = CameraFrame {
            camera_type: CameraType::BackMain,
            light_level: None,
            scene_type: None,
            objects: Some(vec![DetectedObject {
                label: "cup".into(),
                confidence: 1.5,
                bounds: None,
            }]),
            face_detection: None,
            focus_distance: None,
            flash_state: None,
            zoom_level: None,
            capture_mode: None,
        };
        assert!(frame.validate().is_err());
    }

    #[test]
    fn test_axis_rejects_infinity() {
        assert!(AxisReading::new(0.0, f32::INFINITY, 0.0).validate().is_err());
        assert!(AxisReading::new(0.5, -0.3, 9.8).validate().is_ok());
    }
}
