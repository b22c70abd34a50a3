//! WebSocket Mock Server for Murf streaming TTS
//!
//! Speaks enough of Murf's `stream-input` protocol to drive a session:
//! - checks the `api-key` upgrade header and rejects bad keys with HTTP 401
//! - answers each text message with base64 audio chunks tagged with its context
//! - sends `{"final": true, "context_id": ...}` once a context is ended
//! - stops answering for contexts that were cleared
//! - can drop the first connection after a number of text messages, or send it
//!   a frame that is not JSON
//! - can hold back `final` markers, answer marked text with a Murf error, and
//!   refuse every handshake after the first connection with HTTP 503

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

/// Bytes of PCM in every audio chunk the mock sends.
pub const AUDIO_CHUNK_BYTES: usize = 320;

#[derive(Clone, Debug)]
pub struct MurfMockConfig {
    /// Key the `api-key` header must carry
    pub api_key: String,
    /// Audio chunks sent per text message
    pub chunks_per_message: usize,
    /// Drop the first connection right after answering this many text messages
    pub drop_after_messages: Option<u64>,
    /// Send a non-JSON frame on the first connection after this many text messages
    pub malformed_after_messages: Option<u64>,
    /// Delay before each `final` marker; a clear in the meantime cancels it
    pub final_delay: Option<Duration>,
    /// Text containing this marker is answered with a Murf error instead of audio
    pub error_on_text: Option<String>,
    /// Answer every handshake after the first accepted connection with HTTP 503
    pub reject_reconnects: bool,
}

impl Default for MurfMockConfig {
    fn default() -> Self {
        Self {
            api_key: "test-key".to_string(),
            chunks_per_message: 2,
            drop_after_messages: None,
            malformed_after_messages: None,
            final_delay: None,
            error_on_text: None,
            reject_reconnects: false,
        }
    }
}

/// Message received by the mock, tagged with the connection it arrived on.
#[derive(Clone, Debug)]
pub struct Received {
    pub connection: u64,
    pub message: Value,
}

#[derive(Default)]
struct MockState {
    connections: AtomicU64,
    rejected: AtomicU64,
    received: Mutex<Vec<Received>>,
    queries: Mutex<Vec<String>>,
}

pub struct MurfMock {
    addr: SocketAddr,
    state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MurfMock {
    pub async fn start(config: MurfMockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state, config).await {
                        eprintln!("Murf mock connection error: {}", e);
                    }
                });
            }
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub async fn start_default() -> Self {
        Self::start(MurfMockConfig::default()).await
    }

    pub fn url(&self) -> String {
        format!("ws://{}/v1/speech/stream-input", self.addr)
    }

    /// Accepted WebSocket connections so far.
    pub fn connection_count(&self) -> u64 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Handshakes rejected, for a bad API key or while refusing reconnects.
    pub fn rejected_count(&self) -> u64 {
        self.state.rejected.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().unwrap().clone()
    }

    /// Query strings of accepted handshakes, in order.
    pub fn queries(&self) -> Vec<String> {
        self.state.queries.lock().unwrap().clone()
    }
}

impl Drop for MurfMock {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<MockState>,
    config: MurfMockConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let expected_key = config.api_key.clone();
    let reject_reconnects = config.reject_reconnects;
    let handshake_state = state.clone();
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if reject_reconnects && handshake_state.connections.load(Ordering::SeqCst) > 0 {
            handshake_state.rejected.fetch_add(1, Ordering::SeqCst);
            let mut rejection = ErrorResponse::new(Some("service unavailable".to_string()));
            *rejection.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            return Err(rejection);
        }
        let authorized = request
            .headers()
            .get("api-key")
            .and_then(|v| v.to_str().ok())
            == Some(expected_key.as_str());
        if !authorized {
            handshake_state.rejected.fetch_add(1, Ordering::SeqCst);
            let mut rejection = ErrorResponse::new(Some("invalid api key".to_string()));
            *rejection.status_mut() = StatusCode::UNAUTHORIZED;
            return Err(rejection);
        }
        handshake_state
            .queries
            .lock()
            .unwrap()
            .push(request.uri().query().unwrap_or_default().to_string());
        Ok(response)
    };

    let ws_stream = accept_hdr_async(stream, callback).await?;
    let (mut write, mut read) = ws_stream.split();

    let conn_id = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let mut text_messages = 0u64;
    let mut cleared: HashSet<String> = HashSet::new();
    let mut held_finals: Vec<(String, Instant)> = Vec::new();

    loop {
        let due = held_finals.iter().map(|(_, at)| *at).min();
        let msg = tokio::select! {
            msg = read.next() => msg,
            _ = tokio::time::sleep_until(due.unwrap_or_else(Instant::now)), if due.is_some() => {
                let now = Instant::now();
                let (ready, waiting): (Vec<_>, Vec<_>) =
                    held_finals.drain(..).partition(|(_, at)| *at <= now);
                held_finals = waiting;
                for (context_id, _) in ready {
                    let done = json!({ "final": true, "context_id": context_id });
                    write.send(Message::Text(done.to_string().into())).await?;
                }
                continue;
            }
        };
        let Some(msg) = msg else {
            break;
        };

        match msg {
            Ok(Message::Text(text)) => {
                let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                state.received.lock().unwrap().push(Received {
                    connection: conn_id,
                    message: request.clone(),
                });

                let context_id = request
                    .get("context_id")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string();

                if request.get("clear").and_then(|c| c.as_bool()) == Some(true) {
                    held_finals.retain(|(held, _)| *held != context_id);
                    cleared.insert(context_id);
                    continue;
                }
                if cleared.contains(&context_id) {
                    continue;
                }

                let end = request.get("end").and_then(|e| e.as_bool()) == Some(true);

                if let Some(text) = request.get("text").and_then(|t| t.as_str()) {
                    text_messages += 1;

                    if let Some(marker) = &config.error_on_text
                        && text.contains(marker.as_str())
                    {
                        let error = json!({
                            "error": format!("cannot synthesize {marker}"),
                            "context_id": context_id,
                        });
                        write.send(Message::Text(error.to_string().into())).await?;
                        continue;
                    }

                    for _ in 0..config.chunks_per_message {
                        let audio = json!({
                            "audio": BASE64.encode(vec![0u8; AUDIO_CHUNK_BYTES]),
                            "context_id": context_id,
                        });
                        write.send(Message::Text(audio.to_string().into())).await?;
                    }

                    if conn_id == 1 && config.drop_after_messages == Some(text_messages) {
                        // Drop the socket without a close frame
                        return Ok(());
                    }
                    if conn_id == 1 && config.malformed_after_messages == Some(text_messages) {
                        write.send(Message::Text("{not json".into())).await?;
                    }
                }

                if end {
                    match config.final_delay {
                        Some(delay) => held_finals.push((context_id, Instant::now() + delay)),
                        None => {
                            let done = json!({ "final": true, "context_id": context_id });
                            write.send(Message::Text(done.to_string().into())).await?;
                        }
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                eprintln!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
