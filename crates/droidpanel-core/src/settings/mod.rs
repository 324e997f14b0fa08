//! Application settings schema.
//!
//! Settings are grouped into five fixed categories.  Each category is its own
//! struct with per-field defaults, so a settings file written by an older build
//! (missing newer fields) still loads.  Field names are camelCase on the wire
//! and in the settings file:
//!
//! ```toml
//! [devices]
//! pollingInterval = 3
//! autoRefresh = true
//! autoDiscoverUSB = true
//!
//! [android-sdk]
//! sdkPath = "/opt/android-sdk"
//! avdRefreshInterval = 30
//! ```
//!
//! Updates arrive as partial JSON objects.  [`AppSettings::apply_category_patch`]
//! merges the patch over the current category record and validates the result
//! before anything is replaced; see [`validation`] for the rules.

pub mod validation;

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub use validation::{CategoryRecord, FieldError};

/// The five settings categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SettingsCategory {
    Appearance,
    AndroidSdk,
    Devices,
    Files,
    Logcat,
}

impl SettingsCategory {
    pub const ALL: [SettingsCategory; 5] = [
        SettingsCategory::Appearance,
        SettingsCategory::AndroidSdk,
        SettingsCategory::Devices,
        SettingsCategory::Files,
        SettingsCategory::Logcat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingsCategory::Appearance => "appearance",
            SettingsCategory::AndroidSdk => "android-sdk",
            SettingsCategory::Devices => "devices",
            SettingsCategory::Files => "files",
            SettingsCategory::Logcat => "logcat",
        }
    }
}

impl fmt::Display for SettingsCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a category name is not one of the five known categories.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown settings category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for SettingsCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingsCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

// ── Schema types ──────────────────────────────────────────────────────────────

/// The complete settings document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub appearance: AppearanceSettings,
    #[serde(default, rename = "android-sdk")]
    pub android_sdk: AndroidSdkSettings,
    #[serde(default)]
    pub devices: DevicesSettings,
    #[serde(default)]
    pub files: FilesSettings,
    #[serde(default)]
    pub logcat: LogcatSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppearanceSettings {
    #[serde(default)]
    pub theme: Theme,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AndroidSdkSettings {
    /// SDK root.  Empty means "detect".
    #[serde(default)]
    pub sdk_path: String,
    /// Seconds between emulator image refreshes.
    #[serde(default = "default_avd_refresh_interval", deserialize_with = "rounded_u32")]
    pub avd_refresh_interval: u32,
}

/// Device discovery and connection behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicesSettings {
    /// Seconds between connected-session and USB polls.
    #[serde(default = "default_polling_interval", deserialize_with = "rounded_u32")]
    pub polling_interval: u32,
    /// Background polling of the connected-session and USB sources.
    #[serde(default = "default_true")]
    pub auto_refresh: bool,
    /// Upper bound, in milliseconds, on each connect or pair call.
    #[serde(default = "default_connection_timeout", deserialize_with = "rounded_u32")]
    pub connection_timeout: u32,
    /// Reconnect the most recently used paired device at startup.
    #[serde(default)]
    pub auto_reconnect_paired: bool,
    #[serde(default = "default_true", rename = "autoDiscoverUSB")]
    pub auto_discover_usb: bool,
    #[serde(default)]
    pub auto_discover_wireless: bool,
    /// Seconds between wireless discovery polls.
    #[serde(default = "default_wireless_discovery_interval", deserialize_with = "rounded_u32")]
    pub wireless_discovery_interval: u32,
    /// List discovered wireless devices that are not paired yet.
    #[serde(default = "default_true")]
    pub show_unpaired_devices: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesSettings {
    #[serde(default)]
    pub download_path: String,
    #[serde(default)]
    pub show_hidden: bool,
    #[serde(default = "default_transfer_chunk_size", deserialize_with = "rounded_u32")]
    pub transfer_chunk_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Verbose,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogcatSettings {
    #[serde(default)]
    pub default_level: LogLevel,
    #[serde(default = "default_buffer_size", deserialize_with = "rounded_u32")]
    pub buffer_size: u32,
    #[serde(default = "default_true")]
    pub auto_scroll: bool,
}

/// Reads any non-negative number and rounds it to the nearest whole unit.
///
/// The settings form sends plain JSON numbers, so `2.5` arrives for a field
/// stored in whole seconds; range checks run on the rounded value.
fn rounded_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < 0.0 || value.round() > f64::from(u32::MAX) {
        return Err(de::Error::custom(format!(
            "expected a non-negative number, got {value}"
        )));
    }
    Ok(value.round() as u32)
}

// ── Default value functions (required by serde) ───────────────────────────────

fn default_true() -> bool {
    true
}
fn default_avd_refresh_interval() -> u32 {
    30
}
fn default_polling_interval() -> u32 {
    3
}
fn default_connection_timeout() -> u32 {
    5_000
}
fn default_wireless_discovery_interval() -> u32 {
    30
}
fn default_transfer_chunk_size() -> u32 {
    1_024
}
fn default_buffer_size() -> u32 {
    1_000
}

impl Default for AndroidSdkSettings {
    fn default() -> Self {
        Self {
            sdk_path: String::new(),
            avd_refresh_interval: default_avd_refresh_interval(),
        }
    }
}

impl Default for DevicesSettings {
    fn default() -> Self {
        Self {
            polling_interval: default_polling_interval(),
            auto_refresh: true,
            connection_timeout: default_connection_timeout(),
            auto_reconnect_paired: false,
            auto_discover_usb: true,
            auto_discover_wireless: false,
            wireless_discovery_interval: default_wireless_discovery_interval(),
            show_unpaired_devices: true,
        }
    }
}

impl Default for FilesSettings {
    fn default() -> Self {
        Self {
            download_path: String::new(),
            show_hidden: false,
            transfer_chunk_size: default_transfer_chunk_size(),
        }
    }
}

impl Default for LogcatSettings {
    fn default() -> Self {
        Self {
            default_level: LogLevel::default(),
            buffer_size: default_buffer_size(),
            auto_scroll: true,
        }
    }
}

// ── Whole-document operations ─────────────────────────────────────────────────

impl AppSettings {
    /// The category record as a JSON object with camelCase keys.
    pub fn category_value(&self, category: SettingsCategory) -> Value {
        let value = match category {
            SettingsCategory::Appearance => serde_json::to_value(&self.appearance),
            SettingsCategory::AndroidSdk => serde_json::to_value(&self.android_sdk),
            SettingsCategory::Devices => serde_json::to_value(&self.devices),
            SettingsCategory::Files => serde_json::to_value(&self.files),
            SettingsCategory::Logcat => serde_json::to_value(&self.logcat),
        };
        // Plain structs of strings, numbers and bools always serialize.
        value.unwrap_or(Value::Null)
    }

    /// Merge `patch` over one category and validate the merged record.
    ///
    /// Returns a new document with only that category replaced, or every field
    /// error found.  `self` is never modified.
    pub fn apply_category_patch(
        &self,
        category: SettingsCategory,
        patch: &Value,
    ) -> Result<AppSettings, Vec<FieldError>> {
        let mut next = self.clone();
        match category {
            SettingsCategory::Appearance => {
                next.appearance = validation::apply_patch(&self.appearance, patch)?
            }
            SettingsCategory::AndroidSdk => {
                next.android_sdk = validation::apply_patch(&self.android_sdk, patch)?
            }
            SettingsCategory::Devices => {
                next.devices = validation::apply_patch(&self.devices, patch)?
            }
            SettingsCategory::Files => next.files = validation::apply_patch(&self.files, patch)?,
            SettingsCategory::Logcat => {
                next.logcat = validation::apply_patch(&self.logcat, patch)?
            }
        }
        Ok(next)
    }

    /// Dry-run validation of a single field value.
    pub fn validate_field(
        &self,
        category: SettingsCategory,
        field: &str,
        value: Value,
    ) -> Result<(), FieldError> {
        let mut patch = serde_json::Map::new();
        patch.insert(field.to_string(), value);
        match self.apply_category_patch(category, &Value::Object(patch)) {
            Ok(_) => Ok(()),
            Err(errors) => Err(errors
                .iter()
                .find(|e| e.field == field)
                .or_else(|| errors.first())
                .cloned()
                .unwrap_or_else(|| FieldError::new(field, "invalid value"))),
        }
    }

    /// Validate every category.  Field paths are prefixed with the category
    /// name (`devices.pollingInterval`).
    pub fn validate(&self) -> Vec<FieldError> {
        let per_category = [
            (SettingsCategory::Appearance, self.appearance.validate()),
            (SettingsCategory::AndroidSdk, self.android_sdk.validate()),
            (SettingsCategory::Devices, self.devices.validate()),
            (SettingsCategory::Files, self.files.validate()),
            (SettingsCategory::Logcat, self.logcat.validate()),
        ];
        per_category
            .into_iter()
            .flat_map(|(category, errors)| {
                errors
                    .into_iter()
                    .map(move |e| FieldError::new(format!("{category}.{}", e.field), e.message))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_match_documented_values() {
        let settings = AppSettings::default();

        assert_eq!(settings.appearance.theme, Theme::System);
        assert_eq!(settings.android_sdk.avd_refresh_interval, 30);
        assert_eq!(settings.devices.polling_interval, 3);
        assert!(settings.devices.auto_refresh);
        assert_eq!(settings.devices.connection_timeout, 5_000);
        assert!(!settings.devices.auto_reconnect_paired);
        assert!(settings.devices.auto_discover_usb);
        assert!(!settings.devices.auto_discover_wireless);
        assert_eq!(settings.devices.wireless_discovery_interval, 30);
        assert!(settings.devices.show_unpaired_devices);
        assert_eq!(settings.files.transfer_chunk_size, 1_024);
        assert_eq!(settings.logcat.default_level, LogLevel::Info);
        assert_eq!(settings.logcat.buffer_size, 1_000);
        assert!(settings.validate().is_empty());
    }

    #[test]
    fn test_category_names_round_trip_through_from_str() {
        for category in SettingsCategory::ALL {
            assert_eq!(category.as_str().parse::<SettingsCategory>(), Ok(category));
        }
        assert!("network".parse::<SettingsCategory>().is_err());
    }

    #[test]
    fn test_devices_category_uses_upper_case_usb_key() {
        let value = AppSettings::default().category_value(SettingsCategory::Devices);
        assert_eq!(value["autoDiscoverUSB"], json!(true));
        assert_eq!(value["pollingInterval"], json!(3));
    }

    #[test]
    fn test_apply_patch_replaces_only_target_category() {
        // Arrange
        let settings = AppSettings::default();

        // Act
        let next = settings
            .apply_category_patch(SettingsCategory::Devices, &json!({ "pollingInterval": 5 }))
            .unwrap();

        // Assert
        assert_eq!(next.devices.polling_interval, 5);
        assert!(next.devices.auto_refresh, "unpatched fields keep their value");
        assert_eq!(next.logcat, settings.logcat);
    }

    #[test]
    fn test_apply_patch_reports_out_of_range_field() {
        let settings = AppSettings::default();

        let errors = settings
            .apply_category_patch(SettingsCategory::Devices, &json!({ "pollingInterval": 999 }))
            .unwrap_err();

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "pollingInterval");
        assert_eq!(settings.devices.polling_interval, 3);
    }

    #[test]
    fn test_validate_field_accepts_value_in_range() {
        let settings = AppSettings::default();
        assert!(settings
            .validate_field(SettingsCategory::Logcat, "bufferSize", json!(5_000))
            .is_ok());
    }

    #[test]
    fn test_validate_field_rejects_bad_enum_value() {
        let settings = AppSettings::default();

        let err = settings
            .validate_field(SettingsCategory::Appearance, "theme", json!("neon"))
            .unwrap_err();

        assert_eq!(err.field, "theme");
    }

    #[test]
    fn test_document_validation_prefixes_category() {
        let mut settings = AppSettings::default();
        settings.android_sdk.avd_refresh_interval = 5;

        let errors = settings.validate();

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "android-sdk.avdRefreshInterval");
    }

    #[test]
    fn test_partial_document_fills_missing_fields_with_defaults() {
        let settings: AppSettings = serde_json::from_value(json!({
            "devices": { "pollingInterval": 7 }
        }))
        .unwrap();

        assert_eq!(settings.devices.polling_interval, 7);
        assert!(settings.devices.auto_discover_usb);
        assert_eq!(settings.files, FilesSettings::default());
    }
}
