//! SettingsStore: the persisted settings document.
//!
//! # File format
//!
//! One TOML table per category, with camelCase keys:
//!
//! ```toml
//! [appearance]
//! theme = "system"
//!
//! [android-sdk]
//! sdkPath = ""
//! avdRefreshInterval = 30
//!
//! [devices]
//! pollingInterval = 3
//! autoRefresh = true
//! connectionTimeout = 5000
//! autoReconnectPaired = false
//! autoDiscoverUSB = true
//! autoDiscoverWireless = false
//! wirelessDiscoveryInterval = 30
//! showUnpairedDevices = true
//! ```
//!
//! Missing keys and missing tables take their defaults.  A file that cannot be
//! read, does not parse, or holds an out-of-range value is ignored as a whole
//! and the compiled-in defaults are used instead.
//!
//! # Update discipline
//!
//! [`SettingsStore::update_category`] merges, validates, persists, and only then
//! publishes.  Updates are serialized by an async mutex held across the write,
//! so two concurrent updates can never interleave their read-modify-write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use droidpanel_core::settings::{AppSettings, FieldError, SettingsCategory, UnknownCategory};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{read_optional, write_atomically, StoreError, SETTINGS_FILE};
use crate::application::ports::PersistenceError;

/// Errors returned by settings updates.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The merged category failed validation; nothing was changed.
    #[error("invalid settings: {}", summarize(.0))]
    Validation(Vec<FieldError>),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    UnknownCategory(#[from] UnknownCategory),
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Owner of the live settings document.
pub struct SettingsStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
    /// Last validation errors per category, for form display.
    errors: Mutex<HashMap<SettingsCategory, Vec<FieldError>>>,
    current: watch::Sender<AppSettings>,
}

impl SettingsStore {
    /// Opens the store backed by `settings.toml` inside `dir`.
    pub async fn open(dir: &Path) -> Self {
        Self::load(dir.join(SETTINGS_FILE)).await
    }

    /// Loads the document at `path`, falling back to defaults on any problem.
    pub async fn load(path: PathBuf) -> Self {
        let settings = match read_document(&path).await {
            Ok(Some(settings)) => {
                info!(path = %path.display(), "settings loaded");
                settings
            }
            Ok(None) => {
                debug!(path = %path.display(), "no settings file; using defaults");
                AppSettings::default()
            }
            Err(err) => {
                warn!("{err}; using default settings");
                AppSettings::default()
            }
        };
        Self::with_settings(path, settings)
    }

    fn with_settings(path: PathBuf, settings: AppSettings) -> Self {
        let (current, _) = watch::channel(settings);
        Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
            errors: Mutex::new(HashMap::new()),
            current,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the whole document.
    pub fn settings(&self) -> AppSettings {
        self.current.borrow().clone()
    }

    /// Receives every committed document.
    pub fn subscribe(&self) -> watch::Receiver<AppSettings> {
        self.current.subscribe()
    }

    /// The current record of one category as a camelCase JSON object.
    pub fn get_category(&self, category: SettingsCategory) -> Value {
        self.current.borrow().category_value(category)
    }

    /// Merge `patch` into one category, validate, persist, then publish.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Validation`] with every field error when the
    /// merged record is invalid, or [`SettingsError::Persistence`] when the
    /// write failed.  In both cases the live settings are unchanged.
    pub async fn update_category(
        &self,
        category: SettingsCategory,
        patch: &Value,
    ) -> Result<(), SettingsError> {
        let _guard = self.write_lock.lock().await;

        let current = self.settings();
        let next = match current.apply_category_patch(category, patch) {
            Ok(next) => next,
            Err(errors) => {
                debug!(%category, count = errors.len(), "settings update rejected");
                self.set_errors(category, errors.clone());
                return Err(SettingsError::Validation(errors));
            }
        };

        if next != current {
            self.persist(&next).await?;
            self.current.send_replace(next);
            info!(%category, "settings updated");
        }
        self.set_errors(category, Vec::new());
        Ok(())
    }

    /// Dry-run validation of one form field.
    pub fn validate_field(
        &self,
        category: SettingsCategory,
        field: &str,
        value: Value,
    ) -> Result<(), FieldError> {
        self.current.borrow().validate_field(category, field, value)
    }

    /// Restore and persist the compiled-in defaults.
    pub async fn reset_to_defaults(&self) -> Result<(), SettingsError> {
        let _guard = self.write_lock.lock().await;
        let defaults = AppSettings::default();
        self.persist(&defaults).await?;
        self.current.send_replace(defaults);
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("settings reset to defaults");
        Ok(())
    }

    /// Field errors from the last rejected update of `category`.
    pub fn category_errors(&self, category: SettingsCategory) -> Vec<FieldError> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
            .cloned()
            .unwrap_or_default()
    }

    /// The error for one field from the last rejected update, if any.
    pub fn field_error(&self, category: SettingsCategory, field: &str) -> Option<FieldError> {
        self.category_errors(category)
            .into_iter()
            .find(|e| e.field == field)
    }

    fn set_errors(&self, category: SettingsCategory, errors: Vec<FieldError>) {
        let mut all = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        if errors.is_empty() {
            all.remove(&category);
        } else {
            all.insert(category, errors);
        }
    }

    async fn persist(&self, settings: &AppSettings) -> Result<(), PersistenceError> {
        let content =
            toml::to_string_pretty(settings).map_err(|e| PersistenceError::Encode {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        write_atomically(&self.path, &content).await.map_err(|err| {
            error!("failed to save settings: {err}");
            err
        })
    }
}

async fn read_document(path: &Path) -> Result<Option<AppSettings>, StoreError> {
    let Some(content) = read_optional(path).await? else {
        return Ok(None);
    };
    let settings: AppSettings = toml::from_str(&content).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let errors = settings.validate();
    if !errors.is_empty() {
        return Err(StoreError::Invalid {
            path: path.to_path_buf(),
            message: summarize(&errors),
        });
    }
    Ok(Some(settings))
}
