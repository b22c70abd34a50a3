//! Configuration loading for the Murf adapter
//!
//! Settings come from .env files, environment variables and YAML files.
//! Priority: YAML > ENV vars > .env values > defaults. The `.env` file is loaded
//! into the environment by the binary at startup.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//!
//! # Example
//! ```rust,no_run
//! use waav_tts_murf::config::MurfSettings;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let settings = MurfSettings::from_env()?;
//!
//! // Load from YAML file with environment variable base
//! let settings = MurfSettings::from_file(Path::new("murf.yaml"))?;
//! let tts_config = settings.to_tts_config()?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

mod env;
mod yaml;

pub use yaml::{MurfYaml, YamlConfig};

use crate::core::tts::base::{ReconnectionConfig, TTSError};
use crate::core::tts::murf::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_SAMPLE_RATE, DEFAULT_STYLE, DEFAULT_VARIATION,
    DEFAULT_VOICE_ID, MURF_TTS_URL, MurfAudioFormat, MurfChannelType, MurfModel, MurfTtsConfig,
    Pronunciation,
};

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {name} ({value:?}): {reason}")]
    InvalidEnv {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid value for murf.{field}: {reason}")]
    InvalidYaml { field: &'static str, reason: String },

    #[error("Murf API key is required (set MURF_API_KEY or murf.api_key)")]
    MissingApiKey,

    #[error(transparent)]
    Invalid(#[from] TTSError),
}

/// Resolved Murf settings
#[derive(Clone)]
pub struct MurfSettings {
    pub api_key: String,
    pub url: String,
    pub voice_id: String,
    pub style: Option<String>,
    pub model: MurfModel,
    pub sample_rate: u32,
    pub format: MurfAudioFormat,
    pub channel_type: MurfChannelType,
    pub locale: Option<String>,
    pub rate: i32,
    pub pitch: i32,
    pub variation: i32,
    pub pronunciation_dictionary: BTreeMap<String, Pronunciation>,
    pub reconnection: ReconnectionConfig,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    pub keepalive_interval_secs: Option<u64>,
}

impl Default for MurfSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: MURF_TTS_URL.to_string(),
            voice_id: DEFAULT_VOICE_ID.to_string(),
            style: Some(DEFAULT_STYLE.to_string()),
            model: MurfModel::default(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            format: MurfAudioFormat::default(),
            channel_type: MurfChannelType::default(),
            locale: None,
            rate: 0,
            pitch: 0,
            variation: DEFAULT_VARIATION,
            pronunciation_dictionary: BTreeMap::new(),
            reconnection: ReconnectionConfig::default(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: None,
            keepalive_interval_secs: None,
        }
    }
}

impl std::fmt::Debug for MurfSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MurfSettings")
            .field("api_key", &"[REDACTED]")
            .field("url", &self.url)
            .field("voice_id", &self.voice_id)
            .field("style", &self.style)
            .field("model", &self.model)
            .field("sample_rate", &self.sample_rate)
            .field("format", &self.format)
            .field("channel_type", &self.channel_type)
            .field("locale", &self.locale)
            .field("rate", &self.rate)
            .field("pitch", &self.pitch)
            .field("variation", &self.variation)
            .field("pronunciation_dictionary", &self.pronunciation_dictionary)
            .field("reconnection", &self.reconnection)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("keepalive_interval_secs", &self.keepalive_interval_secs)
            .finish()
    }
}

/// Zeroize the API key when settings are dropped.
impl Drop for MurfSettings {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.api_key.zeroize();
    }
}

impl MurfSettings {
    /// Load settings from environment variables over defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        settings.apply_env(env::EnvConfig::load()?);
        Ok(settings)
    }

    /// Load settings from a YAML file with environment variables as the base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = YamlConfig::from_file(path)?;
        let mut settings = Self::from_env()?;
        if let Some(murf) = yaml.murf {
            settings.apply_yaml(murf)?;
        }
        Ok(settings)
    }

    fn apply_env(&mut self, env: env::EnvConfig) {
        if let Some(api_key) = env.api_key {
            self.api_key = api_key;
        }
        if let Some(url) = env.url {
            self.url = url;
        }
        if let Some(voice_id) = env.voice_id {
            self.voice_id = voice_id;
        }
        if env.style.is_some() {
            self.style = env.style;
        }
        if let Some(model) = env.model {
            self.model = model;
        }
        if let Some(sample_rate) = env.sample_rate {
            self.sample_rate = sample_rate;
        }
        if let Some(format) = env.format {
            self.format = format;
        }
        if let Some(channel_type) = env.channel_type {
            self.channel_type = channel_type;
        }
        if env.locale.is_some() {
            self.locale = env.locale;
        }
        if let Some(rate) = env.rate {
            self.rate = rate;
        }
        if let Some(pitch) = env.pitch {
            self.pitch = pitch;
        }
        if let Some(variation) = env.variation {
            self.variation = variation;
        }
    }

    fn apply_yaml(&mut self, mut yaml: MurfYaml) -> Result<(), ConfigError> {
        if let Some(api_key) = yaml.api_key.take() {
            self.api_key = api_key;
        }
        if let Some(url) = yaml.url {
            self.url = url;
        }
        if let Some(voice_id) = yaml.voice_id {
            self.voice_id = voice_id;
        }
        if yaml.style.is_some() {
            self.style = yaml.style;
        }
        if let Some(model) = yaml.model {
            self.model = parse_field("model", &model)?;
        }
        if let Some(sample_rate) = yaml.sample_rate {
            self.sample_rate = sample_rate;
        }
        if let Some(format) = yaml.format {
            self.format = parse_field("format", &format)?;
        }
        if let Some(channel_type) = yaml.channel_type {
            self.channel_type = parse_field("channel_type", &channel_type)?;
        }
        if yaml.locale.is_some() {
            self.locale = yaml.locale;
        }
        if let Some(rate) = yaml.rate {
            self.rate = rate;
        }
        if let Some(pitch) = yaml.pitch {
            self.pitch = pitch;
        }
        if let Some(variation) = yaml.variation {
            self.variation = variation;
        }
        if let Some(dictionary) = yaml.pronunciation_dictionary {
            self.pronunciation_dictionary = dictionary;
        }
        if let Some(reconnection) = yaml.reconnection {
            self.reconnection = reconnection;
        }
        if let Some(secs) = yaml.connect_timeout_secs {
            self.connect_timeout_secs = secs;
        }
        if yaml.idle_timeout_secs.is_some() {
            self.idle_timeout_secs = yaml.idle_timeout_secs;
        }
        if yaml.keepalive_interval_secs.is_some() {
            self.keepalive_interval_secs = yaml.keepalive_interval_secs;
        }
        Ok(())
    }

    /// Build and validate a session configuration from these settings
    pub fn to_tts_config(&self) -> Result<MurfTtsConfig, ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }

        let mut config = MurfTtsConfig::new(self.api_key.clone())
            .with_url(self.url.clone())
            .with_voice_id(self.voice_id.clone())
            .with_model(self.model)
            .with_sample_rate(self.sample_rate)
            .with_format(self.format)
            .with_channel_type(self.channel_type)
            .with_rate(self.rate)
            .with_pitch(self.pitch)
            .with_variation(self.variation)
            .with_reconnection(self.reconnection.clone())
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        config.style = self.style.clone();
        config.multi_native_locale = self.locale.clone();
        config.pronunciation_dictionary = self.pronunciation_dictionary.clone();
        if let Some(secs) = self.idle_timeout_secs.filter(|s| *s > 0) {
            config = config.with_idle_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.keepalive_interval_secs.filter(|s| *s > 0) {
            config = config.with_keepalive(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_field<T>(field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = TTSError>,
{
    value.parse::<T>().map_err(|e| ConfigError::InvalidYaml {
        field,
        reason: e.to_string(),
    })
}
