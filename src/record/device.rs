// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PayloadKind, ValidationError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    #[default]
    Unknown,
    Headphone,
    Speaker,
    Car,
    Keyboard,
    Mouse,
    Gamepad,
    Watch,
    Phone,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScreenDetails {
    pub width: i32,
    pub height: i32,
    pub density: f32,
    pub refresh_rate: i32,
}

/// Hardware feature flags reported by a device at registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCapabilities {
    pub has_camera: bool,
    pub has_microphone: bool,
    pub has_gps: bool,
    pub has_accelerometer: bool,
    pub has_gyroscope: bool,
    pub has_magnetometer: bool,
    pub has_proximity: bool,
    pub has_light: bool,
    pub has_pressure: bool,
    pub has_temperature: bool,
    pub has_humidity: bool,
    pub has_step_counter: bool,
    pub has_heart_rate: bool,
    pub has_ecg: bool,
    pub has_blood_oxygen: bool,
    pub has_stress: bool,
    pub has_compass: bool,
    pub screen_details: ScreenDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub user_id: String,
    pub device_type: DeviceType,
    pub os_type: String,
    pub os_version: String,
    pub app_version: String,
    #[serde(default)]
    pub available_sensors: BTreeSet<PayloadKind>,
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    #[must_use]
    pub fn new(device_id: impl Into<String>, user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
            device_type: DeviceType::default(),
            os_type: String::new(),
            os_version: String::new(),
            app_version: String::new(),
            available_sensors: BTreeSet::new(),
            capabilities: DeviceCapabilities::default(),
            created_at: now,
            last_seen: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.device_id.trim().is_empty() {
            return Err(ValidationError::new("device_id", "must not be empty"));
        }
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::new("user_id", "must not be empty"));
        }
        if let Some(kind) = self.available_sensors.iter().find(|k| !k.is_sensor()) {
            return Err(ValidationError::new(
                "available_sensors",
                format!("`{kind}` is not a sensor kind"),
            ));
        }
        Ok(())
    }

    /// Advance `last_seen`. Older timestamps are ignored.
    ///
    /// Returns true when the value moved.
    pub fn touch(&mut self, at: DateTime<Utc>) -> bool {
        if at > self.last_seen {
            self.last_seen = at;
            true
        } else {
            false
        }
    }
}
