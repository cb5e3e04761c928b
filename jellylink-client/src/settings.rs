use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// `settings.json` holds a single address; anything bigger is corrupt.
pub const MAX_SETTINGS_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SavedSettings {
    #[serde(default)]
    pub jellyfin_server: Option<String>,
}

#[derive(Debug, Error)]
pub enum SettingsLoadError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SettingsSaveError {
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
}

/// Durable home of the resolved server address.
pub trait SettingsStore: Send + Sync {
    fn server_address(&self) -> Option<String>;
    fn set_server_address(&self, address: &str) -> Result<(), SettingsSaveError>;
}

#[derive(Debug)]
pub struct JsonSettingsStore {
    path: PathBuf,
    cached: Mutex<SavedSettings>,
}

impl JsonSettingsStore {
    /// Opens the store, treating a missing or unreadable file as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cached = match load_settings_from_path(&path) {
            Ok(settings) => settings,
            Err(SettingsLoadError::Metadata(err)) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no saved settings yet");
                SavedSettings::default()
            }
            Err(err) => {
                warn!(path = %path.display(), "saved settings ignored: {err}");
                SavedSettings::default()
            }
        };
        Self {
            path,
            cached: Mutex::new(cached),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn server_address(&self) -> Option<String> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .jellyfin_server
            .clone()
    }

    fn set_server_address(&self, address: &str) -> Result<(), SettingsSaveError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let updated = SavedSettings {
            jellyfin_server: Some(address.to_owned()),
        };
        save_settings_with_retry(&self.path, &updated)?;
        *cached = updated;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    address: Mutex<Option<String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn server_address(&self) -> Option<String> {
        self.address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_server_address(&self, address: &str) -> Result<(), SettingsSaveError> {
        *self.address.lock().unwrap_or_else(PoisonError::into_inner) = Some(address.to_owned());
        Ok(())
    }
}

pub fn parse_settings_json(data: &str) -> Result<SavedSettings, serde_json::Error> {
    serde_json::from_str::<SavedSettings>(data)
}

pub fn load_settings_from_path(path: &Path) -> Result<SavedSettings, SettingsLoadError> {
    let meta = fs::metadata(path).map_err(SettingsLoadError::Metadata)?;
    if meta.len() > MAX_SETTINGS_BYTES {
        return Err(SettingsLoadError::TooLarge {
            size: meta.len(),
            max: MAX_SETTINGS_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(SettingsLoadError::Read)?;
    parse_settings_json(&data).map_err(SettingsLoadError::Parse)
}

pub fn save_settings_to_path(path: &Path, settings: &SavedSettings) -> Result<(), SettingsSaveError> {
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(settings).map_err(SettingsSaveError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(SettingsSaveError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(SettingsSaveError::Rename)?;
    Ok(())
}

pub fn save_settings_with_retry(
    path: &Path,
    settings: &SavedSettings,
) -> Result<(), SettingsSaveError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt = 1;
    loop {
        match save_settings_to_path(path, settings) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                warn!(attempt, path = %path.display(), "settings save failed: {err}");
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
