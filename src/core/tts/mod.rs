//! Text-to-speech providers.
//!
//! - [`base`]: error taxonomy, connection state, reconnection policy and the
//!   session event model
//! - [`murf`]: Murf streaming WebSocket session
//! - [`pipeline`]: driver connecting a session to a host voice pipeline

pub mod base;
pub mod murf;
pub mod pipeline;

pub use base::{
    AggregationHint, AudioFrame, ConnectionState, ContextId, EndOfTurnReason, ReconnectionConfig,
    TTSError, TTSResult, TtsEvent, TurnMetrics,
};
pub use murf::{EventStream, MurfTts, MurfTtsConfig};
pub use pipeline::{
    AudioContextManager, FrameSink, NoopContextManager, PipelineInput, SentenceAggregator,
    TtsPipeline,
};
