//! Merge-then-validate for partial settings updates.
//!
//! A patch is a JSON object whose keys are camelCase field names of one
//! category.  [`apply_patch`] rejects unknown keys, reports values of the wrong
//! type against the key that carried them, and finally checks the numeric
//! ranges of the merged record.  Nothing is returned unless the whole merged
//! record is valid.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    AndroidSdkSettings, AppearanceSettings, DevicesSettings, FilesSettings, LogcatSettings,
    SettingsCategory,
};

/// One validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// camelCase field name, or `category.field` for whole-document checks.
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// A settings category record.
pub trait CategoryRecord: Serialize + DeserializeOwned + Clone {
    const CATEGORY: SettingsCategory;

    /// Range and format checks on an already well-typed record.
    fn validate(&self) -> Vec<FieldError>;
}

/// Merge `patch` over `current` and validate the result.
pub fn apply_patch<T: CategoryRecord>(current: &T, patch: &Value) -> Result<T, Vec<FieldError>> {
    let Value::Object(patch) = patch else {
        return Err(vec![FieldError::new("", "settings update must be an object")]);
    };

    let base = match serde_json::to_value(current) {
        Ok(Value::Object(map)) => map,
        _ => return Err(vec![FieldError::new("", "settings record is not an object")]),
    };

    let unknown: Vec<FieldError> = patch
        .keys()
        .filter(|key| !base.contains_key(key.as_str()))
        .map(|key| FieldError::new(key.as_str(), format!("unknown {} setting", T::CATEGORY)))
        .collect();
    if !unknown.is_empty() {
        return Err(unknown);
    }

    let merged = match serde_json::from_value::<T>(Value::Object(merge(&base, patch))) {
        Ok(merged) => merged,
        Err(err) => return Err(type_errors::<T>(&base, patch, &err)),
    };

    let errors = merged.validate();
    if errors.is_empty() {
        Ok(merged)
    } else {
        Err(errors)
    }
}

fn merge(base: &Map<String, Value>, patch: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Attribute a deserialization failure to the patched keys that cause it.
fn type_errors<T: CategoryRecord>(
    base: &Map<String, Value>,
    patch: &Map<String, Value>,
    whole: &serde_json::Error,
) -> Vec<FieldError> {
    let errors: Vec<FieldError> = patch
        .iter()
        .filter_map(|(key, value)| {
            let mut single = base.clone();
            single.insert(key.clone(), value.clone());
            serde_json::from_value::<T>(Value::Object(single))
                .err()
                .map(|err| FieldError::new(key.as_str(), format!("invalid value: {err}")))
        })
        .collect();

    if errors.is_empty() {
        vec![FieldError::new("", format!("invalid value: {whole}"))]
    } else {
        errors
    }
}

fn check_range(errors: &mut Vec<FieldError>, field: &str, value: u32, min: u32, max: u32) {
    if value < min || value > max {
        errors.push(FieldError::new(
            field,
            format!("must be between {min} and {max}"),
        ));
    }
}

// ── Per-category rules ────────────────────────────────────────────────────────

impl CategoryRecord for AppearanceSettings {
    const CATEGORY: SettingsCategory = SettingsCategory::Appearance;

    fn validate(&self) -> Vec<FieldError> {
        // The theme enum is fully checked by deserialization.
        Vec::new()
    }
}

impl CategoryRecord for AndroidSdkSettings {
    const CATEGORY: SettingsCategory = SettingsCategory::AndroidSdk;

    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_range(&mut errors, "avdRefreshInterval", self.avd_refresh_interval, 10, 300);
        errors
    }
}

impl CategoryRecord for DevicesSettings {
    const CATEGORY: SettingsCategory = SettingsCategory::Devices;

    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_range(&mut errors, "pollingInterval", self.polling_interval, 1, 10);
        check_range(
            &mut errors,
            "connectionTimeout",
            self.connection_timeout,
            1_000,
            30_000,
        );
        check_range(
            &mut errors,
            "wirelessDiscoveryInterval",
            self.wireless_discovery_interval,
            10,
            300,
        );
        errors
    }
}

impl CategoryRecord for FilesSettings {
    const CATEGORY: SettingsCategory = SettingsCategory::Files;

    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_range(
            &mut errors,
            "transferChunkSize",
            self.transfer_chunk_size,
            512,
            10_240,
        );
        errors
    }
}

impl CategoryRecord for LogcatSettings {
    const CATEGORY: SettingsCategory = SettingsCategory::Logcat;

    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_range(&mut errors, "bufferSize", self.buffer_size, 100, 10_000);
        errors
    }
}
