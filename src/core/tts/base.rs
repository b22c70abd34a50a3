//! Base types shared by streaming TTS sessions.
//!
//! This module defines the error taxonomy, connection state machine, reconnection
//! policy and the event model that a streaming TTS session surfaces to its caller.
//!
//! # Event Model
//!
//! A session emits an ordered sequence of [`TtsEvent`]s. Every context (one logical
//! turn) produces zero or more audio frames followed by exactly one
//! [`TtsEvent::EndOfTurn`]. Errors are reported as [`TtsEvent::Error`] carrying a
//! fatal/non-fatal distinction.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during TTS session operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TTSError {
    /// Invalid voice/audio parameter combination, rejected before connecting
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket handshake or authentication failure
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Mid-stream socket drop or malformed message; recovered by reconnection
    #[error("Transient stream error: {0}")]
    TransientStream(String),

    /// Retry budget exhausted or unrecoverable protocol violation
    #[error("Fatal stream error: {0}")]
    FatalStream(String),

    /// The context was interrupted by the caller
    #[error("Context cancelled: {0}")]
    ContextCancelled(String),

    /// The context no longer accepts text
    #[error("Context closed: {0}")]
    ContextClosed(String),

    /// Invalid caller input (e.g. empty text)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Error reported by the TTS provider for a context
    #[error("Provider error: {0}")]
    ProviderError(String),

    /// Operation not valid in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,
}

impl TTSError {
    /// Returns whether this error ends the session.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalStream(_))
    }
}

/// Result type for TTS operations.
pub type TTSResult<T> = Result<T, TTSError>;

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of a streaming session.
///
/// ```text
/// Disconnected -> Connecting -> Connected -> (Error -> Connected)* -> Closing -> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket is open
    #[default]
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Socket open and ready
    Connected,
    /// Socket lost; reconnection in progress
    Error,
    /// Caller-initiated shutdown in progress
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Error => write!(f, "Error"),
            ConnectionState::Closing => write!(f, "Closing"),
        }
    }
}

// =============================================================================
// Reconnection Policy
// =============================================================================

/// Configuration for automatic reconnection behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Enable automatic reconnection on connection loss.
    /// Default: true
    pub enabled: bool,

    /// Maximum number of reconnection attempts before giving up.
    /// Default: 5
    pub max_attempts: u32,

    /// Initial delay between reconnection attempts (milliseconds).
    /// Default: 250ms
    pub initial_delay_ms: u64,

    /// Maximum delay between reconnection attempts (milliseconds).
    /// Default: 10000ms
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    /// Default: 2.0
    pub backoff_multiplier: f32,

    /// Whether to add jitter to the delay.
    /// Default: true
    pub jitter: bool,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 250,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectionConfig {
    /// Create a config with reconnection disabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (1-based) using exponential backoff.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier as f64;

        // base_delay * multiplier^(attempt-1), capped
        let delay = base_delay * multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = delay.min(self.max_delay_ms as f64);

        let millis = if self.jitter {
            // Up to 25% jitter in either direction
            let jitter = rand_jitter(delay * 0.25);
            (delay + jitter).max(0.0) as u64
        } else {
            delay as u64
        };
        Duration::from_millis(millis)
    }

    /// Check if another reconnection attempt is allowed after `attempt` failures.
    ///
    /// The retry budget is always bounded; `max_attempts == 0` means no retries.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && attempt < self.max_attempts
    }
}

/// Pseudo-random jitter in `[-range, +range]` from the clock and a simple LCG.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = ((seed.wrapping_mul(1103515245).wrapping_add(12345)) % (1 << 31)) as f64;
    let normalized = random / (1u64 << 31) as f64;
    (normalized - 0.5) * 2.0 * range
}

// =============================================================================
// Context Identity
// =============================================================================

/// Opaque identifier of one synthesis context (one logical turn).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    /// Generates a fresh random context id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ContextId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ContextId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Hint describing how a unit of text/audio was grouped upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationHint {
    /// Grouped at sentence boundaries
    #[default]
    Sentence,
    /// Grouped per word
    Word,
    /// Forwarded as received
    None,
}

impl AggregationHint {
    /// Returns the hint as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sentence => "sentence",
            Self::Word => "word",
            Self::None => "none",
        }
    }
}

/// Why a context ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOfTurnReason {
    /// All text was flushed and all audio received
    Completed,
    /// The caller interrupted the context (barge-in) or the session was closed
    Interrupted,
    /// The socket dropped while the context was in flight; audio may be partial
    Disconnected,
    /// The provider reported an error for the context
    Error,
}

/// One chunk of synthesized audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Owning context
    pub context_id: ContextId,
    /// Raw audio bytes in the session's output format
    pub data: Bytes,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub num_channels: u16,
    /// Grouping hint carried through from the text side
    pub aggregated_by: AggregationHint,
}

/// Per-context usage and latency, reported once when the context ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnMetrics {
    pub context_id: ContextId,
    /// Time from the context opening to its first audio; `None` if no audio arrived
    pub ttfb: Option<Duration>,
    /// Characters submitted for synthesis
    pub characters: usize,
    pub audio_bytes: usize,
    /// Time from the context opening to its end-of-turn
    pub duration: Duration,
}

/// Events produced by a streaming TTS session.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsEvent {
    /// A new context was opened
    Started { context_id: ContextId },
    /// Text was accepted for synthesis under a context
    Text {
        context_id: ContextId,
        text: String,
        aggregated_by: AggregationHint,
    },
    /// Synthesized audio
    Audio(AudioFrame),
    /// Usage and latency of a context; always directly precedes its `EndOfTurn`
    Metrics(TurnMetrics),
    /// No further audio will arrive for the context
    EndOfTurn {
        context_id: ContextId,
        reason: EndOfTurnReason,
    },
    /// An error occurred; `fatal` errors leave the session disconnected
    Error {
        context_id: Option<ContextId>,
        error: TTSError,
        fatal: bool,
    },
}

impl TtsEvent {
    /// Returns the context this event belongs to, if any.
    pub fn context_id(&self) -> Option<&ContextId> {
        match self {
            TtsEvent::Started { context_id }
            | TtsEvent::Text { context_id, .. }
            | TtsEvent::EndOfTurn { context_id, .. } => Some(context_id),
            TtsEvent::Audio(frame) => Some(&frame.context_id),
            TtsEvent::Metrics(metrics) => Some(&metrics.context_id),
            TtsEvent::Error { context_id, .. } => context_id.as_ref(),
        }
    }

    /// Returns whether this is an end-of-turn marker.
    #[inline]
    pub fn is_end_of_turn(&self) -> bool {
        matches!(self, TtsEvent::EndOfTurn { .. })
    }
}
