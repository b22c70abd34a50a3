use std::env;
use std::fmt::Display;
use std::str::FromStr;

use super::ConfigError;
use crate::core::tts::murf::{MurfAudioFormat, MurfChannelType, MurfModel};

/// Murf configuration read from environment variables
///
/// Empty or whitespace-only variables are treated as unset.
#[derive(Debug, Default)]
pub struct EnvConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub voice_id: Option<String>,
    pub style: Option<String>,
    pub model: Option<MurfModel>,
    pub sample_rate: Option<u32>,
    pub format: Option<MurfAudioFormat>,
    pub channel_type: Option<MurfChannelType>,
    pub locale: Option<String>,
    pub rate: Option<i32>,
    pub pitch: Option<i32>,
    pub variation: Option<i32>,
}

impl EnvConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: var("MURF_API_KEY"),
            url: var("MURF_WS_URL"),
            voice_id: var("MURF_VOICE_ID"),
            style: var("MURF_STYLE"),
            model: parse("MURF_MODEL")?,
            sample_rate: parse("MURF_SAMPLE_RATE")?,
            format: parse("MURF_FORMAT")?,
            channel_type: parse("MURF_CHANNEL_TYPE")?,
            locale: var("MURF_LOCALE"),
            rate: parse("MURF_RATE")?,
            pitch: parse("MURF_PITCH")?,
            variation: parse("MURF_VARIATION")?,
        })
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    var(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidEnv {
                    name,
                    value,
                    reason: e.to_string(),
                })
        })
        .transpose()
}
