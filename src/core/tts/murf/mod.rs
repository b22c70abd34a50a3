//! Murf streaming TTS over WebSocket.
//!
//! This module drives Murf's `stream-input` WebSocket API: text is streamed in
//! per-context chunks and audio comes back as base64 chunks tagged with the
//! context they belong to.
//!
//! # Sessions and Contexts
//!
//! A [`MurfTts`] session owns one WebSocket at a time. Audio-level parameters
//! (sample rate, format, channel type, model) are fixed for the socket, while
//! voice-level parameters are sent with every text message. A context is one
//! turn: it opens on the first [`MurfTts::submit_text`], is closed by
//! [`MurfTts::flush_audio`] and ends with exactly one end-of-turn event.
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use waav_tts_murf::core::tts::murf::{MurfTts, MurfTtsConfig};
//! use waav_tts_murf::core::tts::TtsEvent;
//!
//! let mut tts = MurfTts::new(MurfTtsConfig::new("your-api-key"));
//! tts.connect().await?;
//! let mut events = tts.receive()?;
//!
//! let ctx = tts.begin_context();
//! tts.submit_text("Hello ", &ctx, false).await?;
//! tts.submit_text("world.", &ctx, true).await?;
//! tts.flush_audio(&ctx).await?;
//!
//! while let Some(event) = events.next().await {
//!     match event {
//!         TtsEvent::Audio(frame) => play(&frame.data),
//!         TtsEvent::EndOfTurn { .. } => break,
//!         _ => {}
//!     }
//! }
//! tts.close().await?;
//! ```

pub mod config;
pub mod context;
pub mod messages;
pub mod provider;

#[cfg(test)]
mod tests;

// =============================================================================
// Constants
// =============================================================================

/// Murf streaming TTS WebSocket endpoint.
pub const MURF_TTS_URL: &str = "wss://global.api.murf.ai/v1/speech/stream-input";

/// Upgrade header carrying the API key.
pub const API_KEY_HEADER: &str = "api-key";

pub const DEFAULT_VOICE_ID: &str = "en-UK-ruby";

pub const DEFAULT_STYLE: &str = "Conversational";

pub const DEFAULT_VARIATION: i32 = 1;

pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const MIN_RATE: i32 = -50;
pub const MAX_RATE: i32 = 50;

pub const MIN_PITCH: i32 = -50;
pub const MAX_PITCH: i32 = 50;

pub const MIN_VARIATION: i32 = 0;
pub const MAX_VARIATION: i32 = 5;

/// Output sample rates accepted by Murf.
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8000, 16000, 24000, 44100, 48000];

// =============================================================================
// Public Re-exports
// =============================================================================

pub use config::{
    MurfAudioFormat, MurfChannelType, MurfModel, MurfTtsConfig, Pronunciation, PronunciationType,
};
pub use context::ContextTracker;
pub use messages::{
    MessageParseError, MurfClientMessage, ServerEvent, VoiceConfig, parse_server_message,
};
pub use provider::{EventStream, MurfTts};
