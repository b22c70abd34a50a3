use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use super::ConfigError;
use crate::core::tts::base::ReconnectionConfig;
use crate::core::tts::murf::Pronunciation;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present here
/// override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// murf:
///   api_key: "your-murf-api-key"
///   url: "wss://global.api.murf.ai/v1/speech/stream-input"
///   voice_id: "en-US-natalie"
///   style: "Promo"
///   model: "GEN2"
///   sample_rate: 24000
///   format: "PCM"
///   channel_type: "MONO"
///   locale: "en-US"
///   rate: 5
///   pitch: -5
///   variation: 2
///   pronunciation_dictionary:
///     live:
///       type: "IPA"
///       pronunciation: "laɪv"
///   connect_timeout_secs: 10
///   idle_timeout_secs: 300
///   keepalive_interval_secs: 20
///   reconnection:
///     max_attempts: 3
///     initial_delay_ms: 500
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub murf: Option<MurfYaml>,
}

/// Murf configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MurfYaml {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub voice_id: Option<String>,
    pub style: Option<String>,
    pub model: Option<String>,
    pub sample_rate: Option<u32>,
    pub format: Option<String>,
    pub channel_type: Option<String>,
    pub locale: Option<String>,
    pub rate: Option<i32>,
    pub pitch: Option<i32>,
    pub variation: Option<i32>,
    pub pronunciation_dictionary: Option<BTreeMap<String, Pronunciation>>,
    pub connect_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub keepalive_interval_secs: Option<u64>,
    pub reconnection: Option<ReconnectionConfig>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - Fields have invalid types
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: YamlConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}
