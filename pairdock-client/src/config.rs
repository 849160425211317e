use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use pairdock_core::{DEFAULT_SCHEME, DEFAULT_SERVER_PORT};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::PairingSettings;

/// `config.json` is expected to be tiny; refuse anything larger.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;
pub const MAX_DEVICE_NAME_LEN: usize = 128;
pub const MAX_KEY_FILE_BYTES: u64 = 1024;

const CONFIG_FILE_NAME: &str = "config.json";
const KEY_FILE_NAME: &str = "pairing.key";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub device_name: Option<String>,
    /// Interface to advertise, e.g. `en0`. `None` picks automatically.
    #[serde(default)]
    pub network_adapter: Option<String>,
    #[serde(default)]
    pub plus: bool,
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_owned()
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            device_name: None,
            network_adapter: None,
            plus: false,
            scheme: default_scheme(),
        }
    }
}

impl PairingConfig {
    pub fn settings(&self) -> PairingSettings {
        PairingSettings {
            port: Some(self.port),
            device_name: self.device_name.clone(),
            network_adapter: self.network_adapter.clone(),
            plus: self.plus,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("cannot stat {}: {source}", path.display())]
    Metadata { path: PathBuf, source: io::Error },
    #[error("{} is too large: {size} bytes (max {max})", path.display())]
    TooLarge { path: PathBuf, size: u64, max: u64 },
    #[error("cannot read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ConfigSaveError {
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("config serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cannot write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("cannot restrict permissions on {}: {source}", path.display())]
    Permissions { path: PathBuf, source: io::Error },
    #[error("cannot move {} into place: {source}", path.display())]
    Rename { path: PathBuf, source: io::Error },
}

pub fn validate_config(cfg: &PairingConfig) -> Result<(), String> {
    let mut errors: Vec<String> = Vec::new();

    if cfg.port == 0 {
        errors.push("Port must be between 1 and 65535.".to_string());
    }

    if let Some(name) = cfg.device_name.as_deref()
        && name.chars().count() > MAX_DEVICE_NAME_LEN
    {
        errors.push(format!(
            "Device name is too long ({} > {} chars).",
            name.chars().count(),
            MAX_DEVICE_NAME_LEN
        ));
    }

    if !is_scheme_token(&cfg.scheme) {
        errors.push(format!(
            "Scheme `{}` must start with a letter and contain only letters, digits, `+`, `-` or `.`.",
            cfg.scheme
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join(" "))
    }
}

fn is_scheme_token(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

pub fn config_dir() -> PathBuf {
    let dir = if let Some(override_dir) = std::env::var_os("PAIRDOCK_CONFIG_DIR") {
        PathBuf::from(override_dir)
    } else if let Some(base) = std::env::var_os("LOCALAPPDATA") {
        PathBuf::from(base).join("Pairdock")
    } else if let Some(base) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(base).join("pairdock")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".config").join("pairdock")
    } else {
        PathBuf::from(".")
    };
    let _ = fs::create_dir_all(&dir);
    dir
}

pub fn config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE_NAME)
}

pub fn key_path() -> PathBuf {
    config_dir().join(KEY_FILE_NAME)
}

pub fn parse_config_json(data: &str) -> Result<PairingConfig, ConfigLoadError> {
    let cfg = serde_json::from_str::<PairingConfig>(data)?;
    validate_config(&cfg).map_err(ConfigLoadError::Invalid)?;
    Ok(cfg)
}

fn read_bounded(path: &Path, max: u64) -> Result<String, ConfigLoadError> {
    let size = fs::metadata(path)
        .map_err(|source| ConfigLoadError::Metadata {
            path: path.to_owned(),
            source,
        })?
        .len();
    if size > max {
        return Err(ConfigLoadError::TooLarge {
            path: path.to_owned(),
            size,
            max,
        });
    }
    fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
        path: path.to_owned(),
        source,
    })
}

/// `Ok(None)` when no config has been saved yet.
pub fn load_config_from_path(path: &Path) -> Result<Option<PairingConfig>, ConfigLoadError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = read_bounded(path, MAX_CONFIG_BYTES)?;
    parse_config_json(&data).map(Some)
}

pub fn save_config_to_path(path: &Path, cfg: &PairingConfig) -> Result<(), ConfigSaveError> {
    validate_config(cfg).map_err(ConfigSaveError::Invalid)?;
    let payload = serde_json::to_string_pretty(cfg)?;
    write_replacing(path, payload.as_bytes(), FileAccess::Shared)
}

pub fn save_config_with_retry(path: &Path, cfg: &PairingConfig) -> Result<(), ConfigSaveError> {
    with_retry(|| save_config_to_path(path, cfg))
}

/// Previously issued pairing key, if one was saved.
pub fn load_key_from_path(path: &Path) -> Result<Option<String>, ConfigLoadError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = read_bounded(path, MAX_KEY_FILE_BYTES)?;
    let key = data.trim();
    Ok((!key.is_empty()).then(|| key.to_owned()))
}

/// Saves the pairing key readable by the current user only. The file never
/// exists on disk with wider permissions, not even as the temp copy.
pub fn save_key_with_retry(path: &Path, key: &str) -> Result<(), ConfigSaveError> {
    with_retry(|| write_replacing(path, key.as_bytes(), FileAccess::OwnerOnly))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileAccess {
    Shared,
    OwnerOnly,
}

/// Writes `bytes` to a sibling temp file, then renames it over `path` so
/// readers see either the old contents or the new, never a torn write.
fn write_replacing(path: &Path, bytes: &[u8], access: FileAccess) -> Result<(), ConfigSaveError> {
    let tmp = path.with_extension("tmp");
    let write_err = |source| ConfigSaveError::Write {
        path: tmp.clone(),
        source,
    };

    let mut file = open_for_replace(&tmp, access).map_err(write_err)?;
    if access == FileAccess::OwnerOnly {
        // A stale temp file keeps its old mode; `mode` only applies on create.
        restrict_to_owner(&file).map_err(|source| ConfigSaveError::Permissions {
            path: tmp.clone(),
            source,
        })?;
    }
    file.write_all(bytes).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    fs::rename(&tmp, path).map_err(|source| ConfigSaveError::Rename {
        path: path.to_owned(),
        source,
    })
}

#[cfg(unix)]
fn open_for_replace(tmp: &Path, access: FileAccess) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    if access == FileAccess::OwnerOnly {
        options.mode(0o600);
    }
    options.open(tmp)
}

#[cfg(not(unix))]
fn open_for_replace(tmp: &Path, _access: FileAccess) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp)
}

#[cfg(unix)]
fn restrict_to_owner(file: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_file: &fs::File) -> io::Result<()> {
    Ok(())
}

fn with_retry<F>(mut attempt_save: F) -> Result<(), ConfigSaveError>
where
    F: FnMut() -> Result<(), ConfigSaveError>,
{
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt = 1;
    loop {
        match attempt_save() {
            Ok(()) => return Ok(()),
            // Validation will not succeed on a second try.
            Err(err @ ConfigSaveError::Invalid(_)) => return Err(err),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(_) => {
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
