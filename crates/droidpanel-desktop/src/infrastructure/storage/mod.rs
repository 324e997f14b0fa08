//! Storage infrastructure: settings and paired-device persistence.
//!
//! Both stores keep one TOML file in the platform config directory:
//!
//! - Windows:  `%APPDATA%\DroidPanel\`
//! - Linux:    `~/.config/droidpanel/`
//! - macOS:    `~/Library/Application Support/DroidPanel/`
//!
//! | File                  | Store                                    |
//! |-----------------------|------------------------------------------|
//! | `settings.toml`       | [`settings::SettingsStore`]              |
//! | `paired-devices.toml` | [`paired_devices::PairedDeviceStore`]    |
//!
//! Every write goes to a temporary sibling file first and is then renamed over
//! the target, so a crash mid-write never leaves a truncated file behind.

pub mod paired_devices;
pub mod settings;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::application::ports::PersistenceError;

/// File name of the settings document.
pub const SETTINGS_FILE: &str = "settings.toml";

/// File name of the paired device list.
pub const PAIRED_DEVICES_FILE: &str = "paired-devices.toml";

/// Errors raised while loading a store from disk.
///
/// Loading never fails the application: callers log these and fall back to
/// defaults.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The file parsed but its content failed validation.
    #[error("invalid content in {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

/// Determines the platform-appropriate directory for the store files.
///
/// # Errors
///
/// Returns [`StoreError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, StoreError> {
    platform_config_dir().ok_or(StoreError::NoPlatformConfigDir)
}

/// Resolves the platform config directory including the `DroidPanel`
/// subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("DroidPanel"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("droidpanel"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("DroidPanel")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

/// Reads a file, returning `Ok(None)` when it does not exist.
pub(crate) async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `contents` to `path` via a temporary sibling and a rename.
///
/// Creates the parent directory if it does not exist.
pub(crate) async fn write_atomically(path: &Path, contents: &str) -> Result<(), PersistenceError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(io_error(dir))?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp, contents).await.map_err(io_error(&tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(io_error(path))?;
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError {
    let path = path.to_path_buf();
    move |source| PersistenceError::Io { path, source }
}
