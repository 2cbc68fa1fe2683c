// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded, typed metadata attached to records, entities and configs.
//!
//! Devices send free-form key/value annotations (sample rates, firmware
//! build, calibration ids). They are accepted only as a closed set of value
//! shapes with validated keys, so nothing downstream has to handle
//! arbitrary JSON.
//!
//! # Example
//!
//! ```
//! use loom_store::record::{Metadata, MetadataValue};
//!
//! let mut meta = Metadata::new();
//! meta.insert("sample_rate", MetadataValue::Int(100)).unwrap();
//! assert!(meta.insert("bad key!", MetadataValue::Bool(true)).is_err());
//! assert_eq!(meta.get("sample_rate"), Some(&MetadataValue::Int(100)));
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ValidationError;

/// Maximum number of entries in one metadata map
pub const MAX_METADATA_ENTRIES: usize = 32;
/// Maximum key length in bytes
pub const MAX_METADATA_KEY_LEN: usize = 64;
/// Maximum length of a text value in bytes
pub const MAX_METADATA_TEXT_LEN: usize = 4096;
/// Maximum elements in a list value
pub const MAX_METADATA_LIST_LEN: usize = 64;

/// A single metadata value.
///
/// Lists may hold scalars only; nested lists and maps are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<MetadataValue>),
}

impl MetadataValue {
    fn validate(&self, key: &str, nested: bool) -> Result<(), ValidationError> {
        match self {
            Self::Bool(_) | Self::Int(_) => Ok(()),
            Self::Float(f) if !f.is_finite() => Err(ValidationError::new(
                format!("metadata.{key}"),
                "float values must be finite",
            )),
            Self::Float(_) => Ok(()),
            Self::Text(s) if s.len() > MAX_METADATA_TEXT_LEN => Err(ValidationError::new(
                format!("metadata.{key}"),
                format!("text longer than {MAX_METADATA_TEXT_LEN} bytes"),
            )),
            Self::Text(_) => Ok(()),
            Self::List(_) if nested => Err(ValidationError::new(
                format!("metadata.{key}"),
                "lists cannot be nested",
            )),
            Self::List(items) => {
                if items.len() > MAX_METADATA_LIST_LEN {
                    return Err(ValidationError::new(
                        format!("metadata.{key}"),
                        format!("list longer than {MAX_METADATA_LIST_LEN} elements"),
                    ));
                }
                items.iter().try_for_each(|v| v.validate(key, true))
            }
        }
    }

    /// Approximate in-memory footprint
    pub(crate) fn size_bytes(&self) -> usize {
        match self {
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 8,
            Self::Text(s) => s.len(),
            Self::List(items) => items.iter().map(Self::size_bytes).sum(),
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Validated metadata map.
///
/// Deserialization goes through the same checks as [`Metadata::insert`],
/// so a `Metadata` value is always within bounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, MetadataValue>", into = "BTreeMap<String, MetadataValue>")]
pub struct Metadata(BTreeMap<String, MetadataValue>);

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Insert a value, replacing any previous value for the key.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Result<(), ValidationError> {
        let key = key.into();
        let value = value.into();
        validate_key(&key)?;
        value.validate(&key, false)?;
        if !self.0.contains_key(&key) && self.0.len() >= MAX_METADATA_ENTRIES {
            return Err(ValidationError::new(
                "metadata",
                format!("more than {MAX_METADATA_ENTRIES} entries"),
            ));
        }
        self.0.insert(key, value);
        Ok(())
    }

    /// Builder-style insert.
    pub fn with(
        mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Result<Self, ValidationError> {
        self.insert(key, value)?;
        Ok(self)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<MetadataValue> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn size_bytes(&self) -> usize {
        self.0.iter().map(|(k, v)| k.len() + v.size_bytes()).sum()
    }
}

fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() || key.len() > MAX_METADATA_KEY_LEN {
        return Err(ValidationError::new(
            "metadata",
            format!("key must be 1..={MAX_METADATA_KEY_LEN} bytes"),
        ));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(ValidationError::new(
            "metadata",
            format!("key `{key}` may only contain [A-Za-z0-9_.-]"),
        ));
    }
    Ok(())
}

impl TryFrom<BTreeMap<String, MetadataValue>> for Metadata {
    type Error = ValidationError;

    fn try_from(map: BTreeMap<String, MetadataValue>) -> Result<Self, Self::Error> {
        let mut meta = Metadata::new();
        for (k, v) in map {
            meta.insert(k, v)?;
        }
        Ok(meta)
    }
}

impl From<Metadata> for BTreeMap<String, MetadataValue> {
    fn from(meta: Metadata) -> Self {
        meta.0
    }
}
