//! Tests for the Murf TTS session that need no Murf endpoint.
//!
//! These tests cover:
//! - Configuration errors surfaced before any traffic
//! - Session lifecycle without a socket
//! - Voice and configuration updates
//! - No-op operations on unknown contexts
//!
//! Socket-level behavior is exercised against a mock server in
//! `tests/murf_session_tests.rs`.

use std::time::Duration;

use super::*;
use crate::core::tts::base::{ConnectionState, ContextId, TTSError};

fn session(config: MurfTtsConfig) -> MurfTts {
    MurfTts::new(config)
}

/// Loopback address nothing listens on.
fn unreachable_config() -> MurfTtsConfig {
    MurfTtsConfig::new("test-key")
        .with_url("ws://127.0.0.1:1/v1/speech/stream-input")
        .with_connect_timeout(Duration::from_secs(2))
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test]
async fn test_connect_rejects_out_of_range_rate() {
    let mut tts = session(MurfTtsConfig::new("test-key").with_rate(60));
    let err = tts.connect().await.unwrap_err();
    assert!(matches!(err, TTSError::InvalidConfiguration(_)));
    assert_eq!(tts.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_rejects_unsupported_sample_rate() {
    let mut tts = session(MurfTtsConfig::new("test-key").with_sample_rate(11025));
    let err = tts.connect().await.unwrap_err();
    assert!(matches!(err, TTSError::InvalidConfiguration(_)));
}

#[tokio::test]
async fn test_connect_rejects_missing_api_key() {
    let mut tts = session(MurfTtsConfig::default());
    assert!(matches!(
        tts.connect().await,
        Err(TTSError::InvalidConfiguration(_))
    ));
}

#[tokio::test]
async fn test_submit_text_surfaces_config_error_on_lazy_connect() {
    let mut tts = session(MurfTtsConfig::new("test-key").with_pitch(-80));
    let ctx = tts.begin_context();
    let err = tts.submit_text("Hello", &ctx, false).await.unwrap_err();
    assert!(matches!(err, TTSError::InvalidConfiguration(_)));
    assert!(tts.active_context().is_none());
}

#[tokio::test]
async fn test_connect_to_unreachable_endpoint_fails() {
    let mut tts = session(unreachable_config());
    let err = tts.connect().await.unwrap_err();
    assert!(matches!(err, TTSError::ConnectionFailed(_)));
    assert_eq!(tts.connection_state(), ConnectionState::Disconnected);
    assert!(!tts.verify_connection().await);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_new_session_is_disconnected() {
    let tts = session(MurfTtsConfig::new("test-key"));
    assert_eq!(tts.connection_state(), ConnectionState::Disconnected);
    assert!(!tts.is_connected());
    assert!(tts.active_context().is_none());
}

#[test]
fn test_receive_before_connect_is_invalid_state() {
    let mut tts = session(MurfTtsConfig::new("test-key"));
    assert!(matches!(tts.receive(), Err(TTSError::InvalidState(_))));
}

#[test]
fn test_begin_context_generates_unique_ids() {
    let tts = session(MurfTtsConfig::new("test-key"));
    assert_ne!(tts.begin_context(), tts.begin_context());
}

#[tokio::test]
async fn test_close_without_connect_is_noop() {
    let mut tts = session(MurfTtsConfig::new("test-key"));
    tts.close().await.unwrap();
    tts.close().await.unwrap();
    assert_eq!(tts.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_empty_text_rejected_before_connecting() {
    let mut tts = session(unreachable_config());
    let ctx = tts.begin_context();
    let err = tts.submit_text("", &ctx, true).await.unwrap_err();
    assert!(matches!(err, TTSError::InvalidInput(_)));
    assert_eq!(tts.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_flush_and_interrupt_unknown_context_are_noops() {
    let mut tts = session(MurfTtsConfig::new("test-key"));
    let ctx = ContextId::from("never-opened");
    tts.flush_audio(&ctx).await.unwrap();
    tts.interrupt(&ctx).await.unwrap();
    assert_eq!(tts.connection_state(), ConnectionState::Disconnected);
}

// =============================================================================
// Voice and configuration updates
// =============================================================================

#[test]
fn test_set_voice_updates_config() {
    let mut tts = session(MurfTtsConfig::new("test-key"));
    tts.set_voice("en-US-natalie").unwrap();
    assert_eq!(tts.config().voice_id, "en-US-natalie");
    assert_eq!(tts.config().voice_config().voice_id, "en-US-natalie");
}

#[test]
fn test_set_voice_rejects_blank() {
    let mut tts = session(MurfTtsConfig::new("test-key"));
    assert!(matches!(
        tts.set_voice("  "),
        Err(TTSError::InvalidConfiguration(_))
    ));
    assert_eq!(tts.config().voice_id, DEFAULT_VOICE_ID);
}

#[tokio::test]
async fn test_update_config_validates() {
    let mut tts = session(MurfTtsConfig::new("test-key"));
    let err = tts
        .update_config(MurfTtsConfig::new("test-key").with_variation(9))
        .await
        .unwrap_err();
    assert!(matches!(err, TTSError::InvalidConfiguration(_)));
    assert_eq!(tts.config().variation, DEFAULT_VARIATION);
}

#[tokio::test]
async fn test_update_config_while_disconnected_does_not_connect() {
    let mut tts = session(MurfTtsConfig::new("test-key"));
    tts.update_config(
        MurfTtsConfig::new("test-key")
            .with_sample_rate(16000)
            .with_model(MurfModel::Gen2),
    )
    .await
    .unwrap();
    assert_eq!(tts.config().sample_rate, 16000);
    assert_eq!(tts.config().model, MurfModel::Gen2);
    assert_eq!(tts.connection_state(), ConnectionState::Disconnected);
}
