//! Configuration management for the SFU group call client
//!
//! Every tunable has a default matching the server's expectations; values can
//! be overridden through `SFU_CLIENT_*` environment variables or a `.env` file.
// Copyright 2025 Francisco F. Pinochet
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


use config::{Config, ConfigBuilder, Environment};
use config::builder::DefaultState;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Prefix of the environment variables read by [`ClientConfig::from_env`]
pub const ENV_PREFIX: &str = "SFU_CLIENT";

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Environment file error: {0}")]
    EnvFile(#[from] dotenvy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Default media server URL, used when `connect` is not given one
    pub sfu_url: Option<String>,
    /// Base URL of the telemetry collector; reports go to `<stats_url>/stats`
    pub stats_url: Option<String>,
    pub log_level: Option<String>,
    /// Linear reconnect backoff step
    pub reconnect_step_ms: u64,
    pub reconnect_cap_ms: u64,
    /// Delay between distributing a rotated key and encrypting with it
    pub rotate_key_use_delay_ms: u64,
    /// A participant rejoining within this window does not trigger key rotation
    pub peer_reconnect_no_rotation_ms: u64,
    /// Number of audio slots able to carry speakers
    pub max_active_speakers: usize,
    /// Number of video slots able to carry inbound video
    pub max_input_video_tracks: usize,
    pub stats_interval_ms: u64,
    /// Session age after which a transport failure without any stats sample
    /// is reported as "no media path"
    pub no_media_path_timeout_ms: u64,
    pub mic_silence_warning_ms: u64,
    pub speaker_detector_tick_ms: u64,
    pub speaker_min_change_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sfu_url: None,
            stats_url: None,
            log_level: Some("info".to_string()),
            reconnect_step_ms: 500,
            reconnect_cap_ms: 2000,
            rotate_key_use_delay_ms: 100,
            peer_reconnect_no_rotation_ms: 1000,
            max_active_speakers: 20,
            max_input_video_tracks: 20,
            stats_interval_ms: 1000,
            no_media_path_timeout_ms: 6000,
            mic_silence_warning_ms: 16000,
            speaker_detector_tick_ms: 200,
            speaker_min_change_interval_ms: 4000,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let settings = Self::defaults_builder()?
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .try_parsing(true),
            )
            .build()?;
        Self::finish(settings)
    }

    /// Load configuration from a `.env` style file without touching the
    /// process environment
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let mut builder = Self::defaults_builder()?;
        let prefix = format!("{}_", ENV_PREFIX);
        for item in dotenvy::from_path_iter(path.as_ref())? {
            let (key, value) = item?;
            if let Some(name) = key.strip_prefix(&prefix) {
                builder = builder.set_override(name.to_lowercase(), value)?;
            }
        }
        Self::finish(builder.build()?)
    }

    fn defaults_builder() -> Result<ConfigBuilder<DefaultState>, ConfigLoadError> {
        let defaults = Config::try_from(&ClientConfig::default())?;
        Ok(Config::builder().add_source(defaults))
    }

    fn finish(settings: Config) -> Result<Self, ConfigLoadError> {
        let config: ClientConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the client cannot work with
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.reconnect_cap_ms < self.reconnect_step_ms {
            return Err(ConfigLoadError::Invalid(format!(
                "reconnect_cap_ms ({}) is below reconnect_step_ms ({})",
                self.reconnect_cap_ms, self.reconnect_step_ms
            )));
        }
        // mid 2 is the outbound audio slot, which also receives
        if self.max_active_speakers < 1 {
            return Err(ConfigLoadError::Invalid(
                "max_active_speakers must be at least 1".to_string(),
            ));
        }
        // mids 0 and 1 are the outbound video slots, which also receive
        if self.max_input_video_tracks < 2 {
            return Err(ConfigLoadError::Invalid(
                "max_input_video_tracks must be at least 2".to_string(),
            ));
        }
        if self.stats_interval_ms == 0 || self.speaker_detector_tick_ms == 0 {
            return Err(ConfigLoadError::Invalid(
                "timer periods must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn reconnect_step(&self) -> Duration {
        Duration::from_millis(self.reconnect_step_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }

    pub fn rotate_key_use_delay(&self) -> Duration {
        Duration::from_millis(self.rotate_key_use_delay_ms)
    }

    pub fn peer_reconnect_no_rotation(&self) -> Duration {
        Duration::from_millis(self.peer_reconnect_no_rotation_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn no_media_path_timeout(&self) -> Duration {
        Duration::from_millis(self.no_media_path_timeout_ms)
    }

    pub fn mic_silence_warning(&self) -> Duration {
        Duration::from_millis(self.mic_silence_warning_ms)
    }

    pub fn speaker_detector_tick(&self) -> Duration {
        Duration::from_millis(self.speaker_detector_tick_ms)
    }

    pub fn speaker_min_change_interval(&self) -> Duration {
        Duration::from_millis(self.speaker_min_change_interval_ms)
    }
}
