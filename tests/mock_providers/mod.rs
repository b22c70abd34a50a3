//! Mock provider servers for integration tests
//!
//! - WebSocket: Murf streaming TTS (`stream-input` endpoint)

// Not every test binary uses every helper
#![allow(dead_code)]

pub mod websocket_mock;

pub use websocket_mock::{MurfMock, MurfMockConfig};
