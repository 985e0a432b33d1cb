//! Load and persist user preferences. File: $PEERCONN_CONFIG or ~/.config/peerconn/config.toml.
//! Env overrides: PEERCONN_NAME, PEERCONN_DOWNLOAD_DIR.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to peers (default "ME").
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Received files land in a per-day subdirectory of this directory.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Bound on waiting for the peer's key share (default 5).
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Bound on waiting for the next file chunk (default 3).
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// Bound on dialing one channel (default 5).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Where `save` writes; not serialized.
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

fn default_display_name() -> String {
    "ME".to_string()
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_handshake_timeout_secs() -> u64 {
    5
}
fn default_chunk_timeout_secs() -> u64 {
    3
}
fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            download_dir: default_download_dir(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            path: None,
        }
    }
}

impl Config {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Read a config file. A missing file yields defaults bound to that path.
    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        let mut c = if path.exists() {
            let s = std::fs::read_to_string(path)?;
            toml::from_str::<Config>(&s)?
        } else {
            Config::default()
        };
        c.path = Some(path.to_path_buf());
        Ok(c)
    }

    /// Write the config back to its path, creating parent directories.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoPath)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(s) = std::env::var("PEERCONN_NAME") {
            if !s.is_empty() {
                self.display_name = s;
            }
        }
        if let Ok(s) = std::env::var("PEERCONN_DOWNLOAD_DIR") {
            if !s.is_empty() {
                self.download_dir = PathBuf::from(s);
            }
        }
    }
}

/// Load config: defaults, then the config file (if present), then env vars.
/// An unreadable file falls back to defaults so the host can still start.
pub fn load() -> Config {
    let path = config_path();
    let mut c = match &path {
        Some(p) => Config::load_from(p).unwrap_or_else(|e| {
            tracing::warn!(path = %p.display(), error = %e, "ignoring unreadable config file");
            Config {
                path: Some(p.clone()),
                ..Config::default()
            }
        }),
        None => Config::default(),
    };
    c.apply_env();
    c
}

fn config_path() -> Option<PathBuf> {
    if let Some(p) = std::env::var_os("PEERCONN_CONFIG") {
        return Some(PathBuf::from(p));
    }
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/peerconn/config.toml"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("config has no file path")]
    NoPath,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let c = Config::load_from(&path).unwrap();
        assert_eq!(c.display_name, "ME");
        assert_eq!(c.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(c.chunk_timeout(), Duration::from_secs(3));
        assert_eq!(c.path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "display_name = \"alice\"\n").unwrap();
        let c = Config::load_from(&path).unwrap();
        assert_eq!(c.display_name, "alice");
        assert_eq!(c.download_dir, PathBuf::from("downloads"));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut c = Config::load_from(&path).unwrap();
        c.display_name = "bob".into();
        c.download_dir = dir.path().join("dl");
        c.save().unwrap();
        let back = Config::load_from(&path).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn unknown_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "colour = \"blue\"\n").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn save_without_path_fails() {
        assert!(matches!(Config::default().save(), Err(ConfigError::NoPath)));
    }
}
