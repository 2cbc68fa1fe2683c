// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The closed set of record bodies.
//!
//! Serialized adjacently tagged (`{"kind": "gps", "data": {...}}`) so a
//! stored body names its own kind without a side table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::note::{EntityReference, Note};
use super::sensor::*;
use super::ValidationError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Accelerometer(AxisReading),
    Gyroscope(AxisReading),
    Magnetometer(AxisReading),
    Gps(GpsFix),
    HeartRate(HeartRate),
    Ecg(EcgTrace),
    BloodOxygen(BloodOxygen),
    Stress(Stress),
    Proximity(Proximity),
    Light(Light),
    Pressure(Pressure),
    Temperature(Temperature),
    Humidity(Humidity),
    StepCount(StepCount),
    AudioLevel(AudioLevel),
    Battery(Battery),
    Network(NetworkState),
    ScreenState(ScreenState),
    Camera(CameraFrame),
    Note(Note),
    EntityReference(EntityReference),
}

impl Payload {
    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Accelerometer(_) => PayloadKind::Accelerometer,
            Self::Gyroscope(_) => PayloadKind::Gyroscope,
            Self::Magnetometer(_) => PayloadKind::Magnetometer,
            Self::Gps(_) => PayloadKind::Gps,
            Self::HeartRate(_) => PayloadKind::HeartRate,
            Self::Ecg(_) => PayloadKind::Ecg,
            Self::BloodOxygen(_) => PayloadKind::BloodOxygen,
            Self::Stress(_) => PayloadKind::Stress,
            Self::Proximity(_) => PayloadKind::Proximity,
            Self::Light(_) => PayloadKind::Light,
            Self::Pressure(_) => PayloadKind::Pressure,
            Self::Temperature(_) => PayloadKind::Temperature,
            Self::Humidity(_) => PayloadKind::Humidity,
            Self::StepCount(_) => PayloadKind::StepCount,
            Self::AudioLevel(_) => PayloadKind::AudioLevel,
            Self::Battery(_) => PayloadKind::Battery,
            Self::Network(_) => PayloadKind::Network,
            Self::ScreenState(_) => PayloadKind::ScreenState,
            Self::Camera(_) => PayloadKind::Camera,
            Self::Note(_) => PayloadKind::Note,
            Self::EntityReference(_) => PayloadKind::EntityReference,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Accelerometer(v) | Self::Gyroscope(v) | Self::Magnetometer(v) => v.validate(),
            Self::Gps(v) => v.validate(),
            Self::HeartRate(v) => v.validate(),
            Self::Ecg(v) => v.validate(),
            Self::BloodOxygen(v) => v.validate(),
            Self::Stress(v) => v.validate(),
            Self::Proximity(v) => v.validate(),
            Self::Light(v) => v.validate(),
            Self::Pressure(v) => v.validate(),
            Self::Temperature(v) => v.validate(),
            Self::Humidity(v) => v.validate(),
            Self::StepCount(v) => v.validate(),
            Self::AudioLevel(v) => v.validate(),
            Self::Battery(v) => v.validate(),
            Self::Network(v) => v.validate(),
            Self::ScreenState(v) => v.validate(),
            Self::Camera(v) => v.validate(),
            Self::Note(v) => v.validate(),
            Self::EntityReference(v) => v.validate(),
        }
    }

    /// Short human-readable rendering, used when a record is reduced to
    /// a text summary.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Accelerometer(v) => format!("accelerometer x={:.2} y={:.2} z={:.2}", v.x, v.y, v.z),
            Self::Gyroscope(v) => format!("gyroscope x={:.2} y={:.2} z={:.2}", v.x, v.y, v.z),
            Self::Magnetometer(v) => format!("magnetometer x={:.2} y={:.2} z={:.2}", v.x, v.y, v.z),
            Self::Gps(v) => format!("location {:.5}, {:.5}", v.latitude, v.longitude),
            Self::HeartRate(v) => format!("heart rate {} bpm", v.bpm),
            Self::Ecg(v) => match &v.rhythm_classification {
                Some(rhythm) => format!("ecg trace, {} samples, {rhythm}", v.voltage.len()),
                None => format!("ecg trace, {} samples", v.voltage.len()),
            },
            Self::BloodOxygen(v) => format!("blood oxygen {}%", v.spo2),
            Self::Stress(v) => format!("stress score {}", v.stress_score),
            Self::Proximity(v) => {
                format!("proximity {:.1} ({})", v.distance, if v.near { "near" } else { "far" })
            }
            Self::Light(v) => format!("light {:.1} lux", v.lux),
            Self::Pressure(v) => format!("pressure {:.1} hPa", v.hectopascals),
            Self::Temperature(v) => format!("temperature {:.1} C", v.celsius),
            Self::Humidity(v) => format!("humidity {:.1}%", v.percentage),
            Self::StepCount(v) => format!("{} steps", v.steps),
            Self::AudioLevel(v) => format!("audio level {:.1} dB", v.db),
            Self::Battery(v) => format!(
                "battery {}%{}",
                v.percentage,
                if v.charging { ", charging" } else { "" }
            ),
            Self::Network(v) => format!("network {:?}", v.connection_type),
            Self::ScreenState(v) => format!("screen {}", if v.screen_on { "on" } else { "off" }),
            Self::Camera(v) => {
                let objects = v.objects.as_ref().map_or(0, Vec::len);
                let faces = v.face_detection.as_ref().map_or(0, Vec::len);
                format!("camera {:?}, {objects} objects, {faces} faces", v.camera_type)
            }
            Self::Note(v) => {
                let preview: String = v.content.chars().take(80).collect();
                format!("note: {preview}")
            }
            Self::EntityReference(v) => format!("saw entity {}", v.entity_id),
        }
    }

    /// Serialized JSON size, used for footprint and batch sizing.
    pub(crate) fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |v| v.len())
    }
}

/// Discriminant of [`Payload`], also the unit of the table-kind binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Accelerometer,
    Gyroscope,
    Magnetometer,
    Gps,
    HeartRate,
    Ecg,
    BloodOxygen,
    Stress,
    Proximity,
    Light,
    Pressure,
    Temperature,
    Humidity,
    StepCount,
    AudioLevel,
    Battery,
    Network,
    ScreenState,
    Camera,
    Note,
    EntityReference,
}

impl PayloadKind {
    pub const ALL: [PayloadKind; 21] = [
        Self::Accelerometer,
        Self::Gyroscope,
        Self::Magnetometer,
        Self::Gps,
        Self::HeartRate,
        Self::Ecg,
        Self::BloodOxygen,
        Self::Stress,
        Self::Proximity,
        Self::Light,
        Self::Pressure,
        Self::Temperature,
        Self::Humidity,
        Self::StepCount,
        Self::AudioLevel,
        Self::Battery,
        Self::Network,
        Self::ScreenState,
        Self::Camera,
        Self::Note,
        Self::EntityReference,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accelerometer => "accelerometer",
            Self::Gyroscope => "gyroscope",
            Self::Magnetometer => "magnetometer",
            Self::Gps => "gps",
            Self::HeartRate => "heart_rate",
            Self::Ecg => "ecg",
            Self::BloodOxygen => "blood_oxygen",
            Self::Stress => "stress",
            Self::Proximity => "proximity",
            Self::Light => "light",
            Self::Pressure => "pressure",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::StepCount => "step_count",
            Self::AudioLevel => "audio_level",
            Self::Battery => "battery",
            Self::Network => "network",
            Self::ScreenState => "screen_state",
            Self::Camera => "camera",
            Self::Note => "note",
            Self::EntityReference => "entity_reference",
        }
    }

    /// Everything except notes and entity references comes from a sensor.
    #[must_use]
    pub fn is_sensor(self) -> bool {
        !matches!(self, Self::Note | Self::EntityReference)
    }

    /// Kinds whose payloads can be averaged when downsampling.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        !matches!(
            self,
            Self::Ecg
                | Self::Network
                | Self::ScreenState
                | Self::Camera
                | Self::Note
                | Self::EntityReference
        )
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ValidationError::new("kind", format!("unknown payload kind `{s}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacent_tagging() {
        let p = Payload::Gps(GpsFix::new(51.5, -0.12));
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["kind"], "gps");
        assert_eq!(json["data"]["latitude"], 51.5);

        let back: Payload = serde_json::from_value(json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in PayloadKind::ALL {
            assert_eq!(kind.as_str().parse::<PayloadKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert!("sonar".parse::<PayloadKind>().is_err());
    }

    #[test]
    fn test_validate_dispatches() {
        let bad = Payload::BloodOxygen(BloodOxygen { spo2: 140, confidence: None, raw_values: None });
        assert_eq!(bad.validate().unwrap_err().field, "spo2");

        let steps = Payload::StepCount(StepCount { steps: -1, activity_type: None, confidence: None });
        assert!(steps.validate().is_err());
    }

    #[test]
    fn test_describe() {
        let p = Payload::Battery(Battery {
            percentage: 80,
            charging: true,
            power_source: None,
            temperature: None,
            voltage: None,
            current: None,
        });
        assert_eq!(p.describe(), "battery 80%, charging");
        assert_eq!(p.kind(), PayloadKind::Battery);
        assert!(p.kind().is_numeric());
        assert!(!PayloadKind::Camera.is_numeric());
    }
}
