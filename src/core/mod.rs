pub mod tts;

pub use tts::{
    AudioFrame, ConnectionState, ContextId, EndOfTurnReason, MurfTts, MurfTtsConfig, TTSError,
    TTSResult, TtsEvent, TurnMetrics,
};
