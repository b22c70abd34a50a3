//! Murf TTS configuration types.
//!
//! This module defines the configuration structures for the Murf streaming TTS
//! provider: the model, audio format and channel enums, the pronunciation
//! dictionary, validation of the documented parameter ranges, and WebSocket URL
//! construction.
//!
//! Session-level parameters (sample rate, format, channel type, model) travel in
//! the WebSocket URL and are fixed for the life of one socket. Voice-level
//! parameters (voice, style, rate, pitch, variation, locale, pronunciations) are
//! sent with every text message and can change between contexts.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::messages::VoiceConfig;
use super::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_SAMPLE_RATE, DEFAULT_STYLE, DEFAULT_VARIATION,
    DEFAULT_VOICE_ID, MAX_PITCH, MAX_RATE, MAX_VARIATION, MIN_PITCH, MIN_RATE, MIN_VARIATION,
    MURF_TTS_URL, SUPPORTED_SAMPLE_RATES,
};
use crate::core::tts::base::{ReconnectionConfig, TTSError, TTSResult};
use crate::utils::url_validation::validate_websocket_url;

// =============================================================================
// Model
// =============================================================================

/// Murf synthesis model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MurfModel {
    /// Falcon - the primary low-latency streaming model (default)
    #[default]
    #[serde(rename = "FALCON")]
    Falcon,
    /// Gen2 - the alternate model with multi-native locales and variation control
    #[serde(rename = "GEN2")]
    Gen2,
}

impl MurfModel {
    /// Returns the Murf API string for this model.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Falcon => "FALCON",
            Self::Gen2 => "GEN2",
        }
    }

    /// Returns all available models.
    pub const fn all() -> &'static [Self] {
        &[Self::Falcon, Self::Gen2]
    }
}

impl FromStr for MurfModel {
    type Err = TTSError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_uppercase();
        Self::all()
            .iter()
            .copied()
            .find(|model| model.as_str() == wanted)
            .ok_or_else(|| {
                TTSError::InvalidConfiguration(format!(
                    "model must be one of {}, got {wanted}",
                    one_of(Self::all())
                ))
            })
    }
}

impl std::fmt::Display for MurfModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Audio Format
// =============================================================================

/// Murf audio output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MurfAudioFormat {
    /// Raw 16-bit little-endian PCM (default)
    #[default]
    Pcm,
    /// WAV container
    Wav,
    /// MP3
    Mp3,
    /// FLAC lossless
    Flac,
    /// G.711 A-law
    Alaw,
    /// G.711 mu-law
    Ulaw,
    /// OGG container
    Ogg,
}

impl MurfAudioFormat {
    /// Returns the Murf API format string.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pcm => "PCM",
            Self::Wav => "WAV",
            Self::Mp3 => "MP3",
            Self::Flac => "FLAC",
            Self::Alaw => "ALAW",
            Self::Ulaw => "ULAW",
            Self::Ogg => "OGG",
        }
    }

    /// Returns the bytes per sample for uncompressed formats.
    ///
    /// Returns `None` for compressed or containerised formats.
    #[inline]
    pub const fn bytes_per_sample(&self) -> Option<usize> {
        match self {
            Self::Pcm => Some(2),
            Self::Alaw | Self::Ulaw => Some(1),
            _ => None,
        }
    }

    /// Returns all available formats.
    pub const fn all() -> &'static [Self] {
        &[
            Self::Pcm,
            Self::Wav,
            Self::Mp3,
            Self::Flac,
            Self::Alaw,
            Self::Ulaw,
            Self::Ogg,
        ]
    }
}

impl FromStr for MurfAudioFormat {
    type Err = TTSError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_uppercase();
        Self::all()
            .iter()
            .copied()
            .find(|format| format.as_str() == wanted)
            .ok_or_else(|| {
                TTSError::InvalidConfiguration(format!(
                    "format must be one of {}, got {wanted}",
                    one_of(Self::all())
                ))
            })
    }
}

impl std::fmt::Display for MurfAudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Joins enum values for an error message, e.g. `PCM, WAV`.
fn one_of<T: std::fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Channel Type
// =============================================================================

/// Murf output channel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MurfChannelType {
    #[default]
    Mono,
    Stereo,
}

impl MurfChannelType {
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mono => "MONO",
            Self::Stereo => "STEREO",
        }
    }

    #[inline]
    pub const fn num_channels(&self) -> u16 {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
        }
    }
}

impl FromStr for MurfChannelType {
    type Err = TTSError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "MONO" => Ok(Self::Mono),
            "STEREO" => Ok(Self::Stereo),
            other => Err(TTSError::InvalidConfiguration(format!(
                "channel_type must be one of MONO, STEREO, got {other}"
            ))),
        }
    }
}

impl std::fmt::Display for MurfChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Pronunciation Dictionary
// =============================================================================

/// How a pronunciation hint should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PronunciationType {
    /// International Phonetic Alphabet transcription
    #[serde(rename = "IPA")]
    Ipa,
    /// Spell the word as the given text
    #[serde(rename = "SAY_AS")]
    SayAs,
}

/// Pronunciation hint for a single word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pronunciation {
    #[serde(rename = "type")]
    pub kind: PronunciationType,
    pub pronunciation: String,
}

impl Pronunciation {
    pub fn ipa(pronunciation: impl Into<String>) -> Self {
        Self {
            kind: PronunciationType::Ipa,
            pronunciation: pronunciation.into(),
        }
    }

    pub fn say_as(pronunciation: impl Into<String>) -> Self {
        Self {
            kind: PronunciationType::SayAs,
            pronunciation: pronunciation.into(),
        }
    }
}

// =============================================================================
// Murf TTS Configuration
// =============================================================================

/// Murf streaming TTS configuration.
///
/// # Parameters
///
/// - **voice_id**: Voice to synthesize with (default `en-UK-ruby`)
/// - **style**: Voice style (default `Conversational`)
/// - **rate** / **pitch**: Speed and pitch offsets in [-50, 50]
/// - **variation**: Pause/pitch/speed variation in [0, 5] (Gen2)
/// - **model**: `FALCON` (default) or `GEN2`
/// - **sample_rate**: 8000, 16000, 24000, 44100 (default) or 48000 Hz
/// - **channel_type**: `MONO` (default) or `STEREO`
/// - **format**: `PCM` (default), `WAV`, `MP3`, `FLAC`, `ALAW`, `ULAW`, `OGG`
/// - **multi_native_locale**: Output language for Gen2 (e.g. `en-US`)
/// - **pronunciation_dictionary**: Word to pronunciation hints
///
/// # Example
///
/// ```rust,ignore
/// use waav_tts_murf::core::tts::murf::{MurfTtsConfig, MurfModel};
///
/// let config = MurfTtsConfig::new("your-api-key")
///     .with_voice_id("en-US-natalie")
///     .with_model(MurfModel::Gen2)
///     .with_sample_rate(24000);
/// config.validate()?;
/// ```
///
/// The API key is redacted from `Debug` output and zeroized on drop.
#[derive(Clone, PartialEq)]
pub struct MurfTtsConfig {
    /// Murf API key, sent in the `api-key` upgrade header
    pub api_key: String,

    /// WebSocket endpoint
    pub url: String,

    pub voice_id: String,

    pub style: Option<String>,

    /// Speed offset (-50 to 50)
    pub rate: i32,

    /// Pitch offset (-50 to 50)
    pub pitch: i32,

    /// Variation in pause, pitch and speed (0 to 5)
    pub variation: i32,

    pub model: MurfModel,

    /// Output sample rate in Hz
    pub sample_rate: u32,

    pub channel_type: MurfChannelType,

    pub format: MurfAudioFormat,

    /// Output language for Gen2 (e.g. "en-US", "en-UK")
    pub multi_native_locale: Option<String>,

    pub pronunciation_dictionary: BTreeMap<String, Pronunciation>,

    /// Reconnection policy applied after an unexpected socket loss
    pub reconnection: ReconnectionConfig,

    /// Upper bound on a single WebSocket handshake
    pub connect_timeout: Duration,

    /// Close the session after this long without traffic and without an active context
    pub idle_timeout: Option<Duration>,

    /// Send a WebSocket ping at this interval
    pub keepalive_interval: Option<Duration>,
}

impl Default for MurfTtsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: MURF_TTS_URL.to_string(),
            voice_id: DEFAULT_VOICE_ID.to_string(),
            style: Some(DEFAULT_STYLE.to_string()),
            rate: 0,
            pitch: 0,
            variation: DEFAULT_VARIATION,
            model: MurfModel::default(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channel_type: MurfChannelType::default(),
            format: MurfAudioFormat::default(),
            multi_native_locale: None,
            pronunciation_dictionary: BTreeMap::new(),
            reconnection: ReconnectionConfig::default(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            idle_timeout: None,
            keepalive_interval: None,
        }
    }
}

impl std::fmt::Debug for MurfTtsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MurfTtsConfig")
            .field("api_key", &"[REDACTED]")
            .field("url", &self.url)
            .field("voice_id", &self.voice_id)
            .field("style", &self.style)
            .field("rate", &self.rate)
            .field("pitch", &self.pitch)
            .field("variation", &self.variation)
            .field("model", &self.model)
            .field("sample_rate", &self.sample_rate)
            .field("channel_type", &self.channel_type)
            .field("format", &self.format)
            .field("multi_native_locale", &self.multi_native_locale)
            .field("pronunciation_dictionary", &self.pronunciation_dictionary)
            .field("reconnection", &self.reconnection)
            .field("connect_timeout", &self.connect_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .finish()
    }
}

impl Drop for MurfTtsConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.api_key.zeroize();
    }
}

impl MurfTtsConfig {
    /// Creates a config with defaults and the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.api_key = api_key.into();
        config
    }

    #[inline]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    #[inline]
    pub fn with_voice_id(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = voice_id.into();
        self
    }

    #[inline]
    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    /// Sets the rate. Not clamped; out-of-range values fail validation.
    #[inline]
    pub fn with_rate(mut self, rate: i32) -> Self {
        self.rate = rate;
        self
    }

    /// Sets the pitch. Not clamped; out-of-range values fail validation.
    #[inline]
    pub fn with_pitch(mut self, pitch: i32) -> Self {
        self.pitch = pitch;
        self
    }

    #[inline]
    pub fn with_variation(mut self, variation: i32) -> Self {
        self.variation = variation;
        self
    }

    #[inline]
    pub fn with_model(mut self, model: MurfModel) -> Self {
        self.model = model;
        self
    }

    #[inline]
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    #[inline]
    pub fn with_channel_type(mut self, channel_type: MurfChannelType) -> Self {
        self.channel_type = channel_type;
        self
    }

    #[inline]
    pub fn with_format(mut self, format: MurfAudioFormat) -> Self {
        self.format = format;
        self
    }

    #[inline]
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.multi_native_locale = Some(locale.into());
        self
    }

    /// Adds a pronunciation hint for a word.
    pub fn with_pronunciation(mut self, word: impl Into<String>, hint: Pronunciation) -> Self {
        self.pronunciation_dictionary.insert(word.into(), hint);
        self
    }

    #[inline]
    pub fn with_reconnection(mut self, reconnection: ReconnectionConfig) -> Self {
        self.reconnection = reconnection;
        self
    }

    #[inline]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[inline]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    #[inline]
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TTSError::InvalidConfiguration`] if:
    /// - `api_key` or `voice_id` is empty or whitespace
    /// - `rate` or `pitch` is outside [-50, 50]
    /// - `variation` is outside [0, 5]
    /// - `sample_rate` is not 8000, 16000, 24000, 44100 or 48000
    /// - `url` is not a valid WebSocket URL
    pub fn validate(&self) -> TTSResult<()> {
        if self.api_key.trim().is_empty() {
            return Err(TTSError::InvalidConfiguration(
                "Murf API key is required and cannot be empty".to_string(),
            ));
        }

        if self.voice_id.trim().is_empty() {
            return Err(TTSError::InvalidConfiguration(
                "voice_id cannot be empty or whitespace".to_string(),
            ));
        }

        if !(MIN_RATE..=MAX_RATE).contains(&self.rate) {
            return Err(TTSError::InvalidConfiguration(format!(
                "rate must be between {MIN_RATE} and {MAX_RATE}, got {}",
                self.rate
            )));
        }

        if !(MIN_PITCH..=MAX_PITCH).contains(&self.pitch) {
            return Err(TTSError::InvalidConfiguration(format!(
                "pitch must be between {MIN_PITCH} and {MAX_PITCH}, got {}",
                self.pitch
            )));
        }

        if !(MIN_VARIATION..=MAX_VARIATION).contains(&self.variation) {
            return Err(TTSError::InvalidConfiguration(format!(
                "variation must be between {MIN_VARIATION} and {MAX_VARIATION}, got {}",
                self.variation
            )));
        }

        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(TTSError::InvalidConfiguration(format!(
                "sample_rate must be one of {SUPPORTED_SAMPLE_RATES:?}, got {}",
                self.sample_rate
            )));
        }

        if let Some(locale) = &self.multi_native_locale
            && locale.trim().is_empty()
        {
            return Err(TTSError::InvalidConfiguration(
                "multi_native_locale cannot be empty when set".to_string(),
            ));
        }

        validate_websocket_url(&self.url)
            .map_err(|e| TTSError::InvalidConfiguration(format!("url: {e}")))?;

        Ok(())
    }

    /// Builds the WebSocket URL with the session-level query parameters.
    pub fn build_websocket_url(&self) -> TTSResult<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| TTSError::InvalidConfiguration(format!("url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("sample_rate", &self.sample_rate.to_string())
            .append_pair("format", self.format.as_str())
            .append_pair("channel_type", self.channel_type.as_str())
            .append_pair("model", self.model.as_str());
        Ok(url)
    }

    /// Returns whether `other` can reuse a socket opened with this config.
    ///
    /// Only voice-level fields may differ; anything carried in the URL or the
    /// upgrade headers requires a new connection.
    pub fn same_session_params(&self, other: &Self) -> bool {
        self.url == other.url
            && self.api_key == other.api_key
            && self.sample_rate == other.sample_rate
            && self.format == other.format
            && self.channel_type == other.channel_type
            && self.model == other.model
    }

    /// Builds the per-message voice configuration block.
    pub fn voice_config(&self) -> VoiceConfig {
        VoiceConfig {
            voice_id: self.voice_id.clone(),
            style: self.style.clone(),
            rate: self.rate,
            pitch: self.pitch,
            pronunciation_dictionary: self.pronunciation_dictionary.clone(),
            variation: self.variation,
            multi_native_locale: self.multi_native_locale.clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
