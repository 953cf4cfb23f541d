// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::bluetooth::{LineEnding, DEFAULT_READ_BUFFER_SIZE};

const APP_DIR: &str = "rfcomm-terminal";

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Terminal settings.
    pub terminal: TerminalConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Adapter name such as `hci0`. The default adapter when unset.
    pub adapter: Option<String>,

    /// Name advertised while listening. The adapter keeps its own when unset.
    pub alias: Option<String>,

    /// Start in listen mode.
    pub listen_on_start: bool,

    /// Watch for devices on startup.
    pub discover_on_start: bool,

    /// RFCOMM channel for the listening service.
    pub rfcomm_channel: u16,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            alias: None,
            listen_on_start: false,
            discover_on_start: true,
            rfcomm_channel: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Line ending written for line breaks in text input.
    pub line_ending: LineEnding,

    /// Interpret input as hex byte pairs.
    pub hex_input: bool,

    /// Bytes requested per read.
    pub read_buffer_size: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            line_ending: LineEnding::default(),
            hex_input: false,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, writing the defaults there if missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            let config = Self::default();
            config.save_to(path)?;
            config
        };

        config.normalize();
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    fn normalize(&mut self) {
        // A zero-sized buffer would read nothing forever
        self.terminal.read_buffer_size = self.terminal.read_buffer_size.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
        assert!(config.bluetooth.discover_on_start);
        assert_eq!(config.bluetooth.rfcomm_channel, 1);
        assert_eq!(config.terminal.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[terminal]\nline_ending = \"crlf\"\nread_buffer_size = 0\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.terminal.line_ending, LineEnding::CrLf);
        assert_eq!(config.terminal.read_buffer_size, 1);
        assert!(!config.terminal.hex_input);
        assert_eq!(config.bluetooth, BluetoothConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.bluetooth.adapter = Some("hci1".to_string());
        config.bluetooth.alias = Some("bench-terminal".to_string());
        config.terminal.hex_input = true;
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[terminal]\nline_ending = \"lfcr\"\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
