//! Murf streaming TTS session.
//!
//! [`MurfTts`] owns the caller-facing half of a session. Once connected it runs
//! one supervisor task per session which, for every socket it opens, spawns
//! exactly one read task and one write task:
//!
//! ```text
//!   caller ──submit/flush/interrupt──▶ outbound queue ──▶ write task ──▶ socket
//!     ▲                                                                   │
//!     └──────── EventStream ◀── ContextTracker ◀──── read task ◀──────────┘
//! ```
//!
//! The outbound queue outlives individual sockets. When a socket drops, the
//! supervisor reclaims the queue from the write task, ends the in-flight
//! contexts with [`EndOfTurnReason::Disconnected`] (Murf cannot resume a
//! context on a new socket) and reconnects with exponential backoff. Messages
//! queued for contexts opened while reconnecting are delivered on the new
//! socket.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::{HeaderValue, StatusCode};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::API_KEY_HEADER;
use super::config::MurfTtsConfig;
use super::context::ContextTracker;
use super::messages::{MurfClientMessage, ServerEvent, parse_server_message};
use crate::core::tts::base::{
    AggregationHint, ConnectionState, ContextId, EndOfTurnReason, TTSError, TTSResult, TtsEvent,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How long `close()` waits for the socket to shut down cleanly.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the write task waits for a close frame to flush.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// How long `verify_connection()` waits for a pong.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Shared State
// =============================================================================

/// Items consumed by the write task.
#[derive(Debug)]
enum Outbound {
    Message(MurfClientMessage),
    /// Send a ping; the sender fires when the matching pong arrives
    Ping(oneshot::Sender<()>),
    /// Send a close frame and stop
    Close,
}

/// `verify_connection()` waiters keyed by the payload of the ping they sent.
type PongWaiters = VecDeque<(Bytes, oneshot::Sender<()>)>;

/// State shared between the session handle and its tasks.
#[derive(Clone)]
struct Shared {
    tracker: Arc<Mutex<ContextTracker>>,
    state: Arc<RwLock<ConnectionState>>,
    intentional_disconnect: Arc<AtomicBool>,
    pending_pongs: Arc<Mutex<PongWaiters>>,
    ping_seq: Arc<AtomicU64>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("Murf connection state: {} -> {}", *current, state);
            *current = state;
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }
}

// =============================================================================
// Event Stream
// =============================================================================

/// Ordered sequence of session events.
///
/// Ends when the session is closed, goes idle, hits a fatal error or is dropped.
/// Survives transparent reconnection.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<TtsEvent>,
}

impl EventStream {
    /// Waits for the next event.
    pub async fn recv(&mut self) -> Option<TtsEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = TtsEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// =============================================================================
// MurfTts
// =============================================================================

/// Streaming Murf TTS session.
pub struct MurfTts {
    config: MurfTtsConfig,
    shared: Shared,
    aggregation: AggregationHint,

    /// Caller side of the outbound queue
    outbound: Option<mpsc::UnboundedSender<Outbound>>,

    /// Event receiver, handed out once per connection by `receive()`
    events: Option<mpsc::UnboundedReceiver<TtsEvent>>,

    cancel: Option<CancellationToken>,
    supervisor: Option<JoinHandle<()>>,
}

impl MurfTts {
    /// Creates a disconnected session. The config is validated on connect.
    pub fn new(config: MurfTtsConfig) -> Self {
        let tracker = ContextTracker::new(config.sample_rate, config.channel_type.num_channels());
        Self {
            config,
            shared: Shared {
                tracker: Arc::new(Mutex::new(tracker)),
                state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
                intentional_disconnect: Arc::new(AtomicBool::new(false)),
                pending_pongs: Arc::new(Mutex::new(VecDeque::new())),
                ping_seq: Arc::new(AtomicU64::new(0)),
            },
            aggregation: AggregationHint::default(),
            outbound: None,
            events: None,
            cancel: None,
            supervisor: None,
        }
    }

    /// Sets the aggregation hint attached to text and audio of new contexts.
    pub fn with_aggregation(mut self, aggregation: AggregationHint) -> Self {
        self.aggregation = aggregation;
        self
    }

    #[inline]
    pub fn config(&self) -> &MurfTtsConfig {
        &self.config
    }

    #[inline]
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Returns the context currently accepting text, if any.
    pub fn active_context(&self) -> Option<ContextId> {
        self.shared.tracker.lock().active().cloned()
    }

    /// Generates an id for a new context.
    ///
    /// The context opens when text is first submitted under it.
    pub fn begin_context(&self) -> ContextId {
        ContextId::generate()
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Opens the WebSocket.
    ///
    /// Configuration errors are reported before any network traffic. A no-op
    /// if the session is already connected or reconnecting.
    pub async fn connect(&mut self) -> TTSResult<()> {
        match self.connection_state() {
            ConnectionState::Connected | ConnectionState::Error => return Ok(()),
            ConnectionState::Closing => {
                return Err(TTSError::InvalidState("session is closing".to_string()));
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }

        self.config.validate()?;
        self.release_session();

        self.shared.set_state(ConnectionState::Connecting);
        let ws = match open_socket(&self.config).await {
            Ok(ws) => ws,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };

        self.shared
            .intentional_disconnect
            .store(false, Ordering::SeqCst);
        let events = {
            let mut tracker = self.shared.tracker.lock();
            tracker.set_audio_format(
                self.config.sample_rate,
                self.config.channel_type.num_channels(),
            );
            tracker.attach()
        };
        self.events = Some(events);

        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);

        let cancel = CancellationToken::new();
        let supervisor = Supervisor {
            shared: self.shared.clone(),
            config: self.config.clone(),
            cancel: cancel.clone(),
        };

        self.shared.set_state(ConnectionState::Connected);
        self.supervisor = Some(tokio::spawn(supervisor.run(ws, rx)));
        self.cancel = Some(cancel);

        Ok(())
    }

    /// Returns the event stream for the current connection.
    ///
    /// Can be taken once per connection; a new stream is available after the
    /// session reconnects from `Disconnected`.
    pub fn receive(&mut self) -> TTSResult<EventStream> {
        self.events
            .take()
            .map(|rx| EventStream { rx })
            .ok_or_else(|| {
                TTSError::InvalidState(
                    "event stream already taken or session never connected".to_string(),
                )
            })
    }

    /// Closes the session, interrupting every pending context. Idempotent.
    pub async fn close(&mut self) -> TTSResult<()> {
        let state = self.connection_state();
        if state == ConnectionState::Disconnected && self.supervisor.is_none() {
            return Ok(());
        }

        info!("Closing Murf TTS session");
        self.shared.set_state(ConnectionState::Closing);
        self.shared
            .intentional_disconnect
            .store(true, Ordering::SeqCst);

        let interrupted = self
            .shared
            .tracker
            .lock()
            .finish_all(EndOfTurnReason::Interrupted);

        if let Some(outbound) = &self.outbound {
            for context_id in interrupted {
                let _ = outbound.send(Outbound::Message(MurfClientMessage::clear(context_id)));
            }
            let _ = outbound.send(Outbound::Close);
        }

        // Nothing to flush while reconnecting
        if state == ConnectionState::Error
            && let Some(cancel) = &self.cancel
        {
            cancel.cancel();
        }

        if let Some(mut handle) = self.supervisor.take()
            && timeout(CLOSE_TIMEOUT, &mut handle).await.is_err()
        {
            warn!("Murf session did not close within {CLOSE_TIMEOUT:?}; cancelling");
            if let Some(cancel) = &self.cancel {
                cancel.cancel();
            }
            if let Err(e) = handle.await {
                error!("Murf session task failed during close: {e}");
            }
        }

        self.release_session();
        self.shared.tracker.lock().detach();
        self.shared.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Drops handles left over from a finished session.
    fn release_session(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.supervisor.take()
            && !handle.is_finished()
        {
            handle.abort();
        }
        self.outbound = None;
        self.shared.pending_pongs.lock().clear();
    }

    // -------------------------------------------------------------------------
    // Text and contexts
    // -------------------------------------------------------------------------

    /// Queues `text` for synthesis under `context_id`.
    ///
    /// Connects first if the session is disconnected. Submitting under a new
    /// context while another is active implicitly flushes the active one.
    ///
    /// # Errors
    ///
    /// - [`TTSError::InvalidInput`] for empty text
    /// - [`TTSError::ContextClosed`] if the context already received its final
    ///   chunk, was flushed or has ended
    /// - [`TTSError::ContextCancelled`] if the context was interrupted
    pub async fn submit_text(
        &mut self,
        text: &str,
        context_id: &ContextId,
        is_final_chunk: bool,
    ) -> TTSResult<()> {
        if text.is_empty() {
            return Err(TTSError::InvalidInput("text cannot be empty".to_string()));
        }

        match self.connection_state() {
            ConnectionState::Disconnected => self.connect().await?,
            ConnectionState::Closing => {
                return Err(TTSError::InvalidState("session is closing".to_string()));
            }
            _ => {}
        }

        let voice = self.config.voice_config();
        let messages = self.shared.tracker.lock().submit(
            context_id,
            text,
            is_final_chunk,
            &voice,
            self.aggregation,
        )?;

        trace!(
            "Queued {} chars for context {context_id} (final: {is_final_chunk})",
            text.len()
        );
        for message in messages {
            self.enqueue(message)?;
        }
        Ok(())
    }

    /// Signals that no further text will be submitted for `context_id`.
    ///
    /// The context's end-of-turn event is emitted once Murf has delivered all of
    /// its audio. A no-op for unknown or already flushed contexts.
    pub async fn flush_audio(&mut self, context_id: &ContextId) -> TTSResult<()> {
        let end = self.shared.tracker.lock().flush(context_id);
        if let Some(end) = end {
            self.enqueue(end)?;
        }
        Ok(())
    }

    /// Abandons `context_id`, emitting its end-of-turn event immediately.
    ///
    /// Text still queued for the context is discarded and Murf is told to clear
    /// it. A no-op for unknown or finished contexts.
    pub async fn interrupt(&mut self, context_id: &ContextId) -> TTSResult<()> {
        if !self.shared.tracker.lock().interrupt(context_id) {
            return Ok(());
        }
        if let Err(e) = self.enqueue(MurfClientMessage::clear(context_id.clone())) {
            debug!("Could not send clear for interrupted context {context_id}: {e}");
        }
        Ok(())
    }

    fn enqueue(&self, message: MurfClientMessage) -> TTSResult<()> {
        let sent = self
            .outbound
            .as_ref()
            .is_some_and(|tx| tx.send(Outbound::Message(message)).is_ok());
        if sent {
            return Ok(());
        }

        // The session went away underneath the caller
        let ended = self
            .shared
            .tracker
            .lock()
            .finish_all(EndOfTurnReason::Disconnected);
        if !ended.is_empty() {
            warn!("Ended {} contexts queued on a closed session", ended.len());
        }
        Err(TTSError::NotConnected)
    }

    // -------------------------------------------------------------------------
    // Voice and configuration
    // -------------------------------------------------------------------------

    /// Changes the voice used by contexts opened from now on.
    ///
    /// Murf carries the voice in every text message, so no reconnection is
    /// needed; the active context keeps the voice it was opened with.
    pub fn set_voice(&mut self, voice_id: impl Into<String>) -> TTSResult<()> {
        let voice_id = voice_id.into();
        if voice_id.trim().is_empty() {
            return Err(TTSError::InvalidConfiguration(
                "voice_id cannot be empty or whitespace".to_string(),
            ));
        }
        info!("Switching Murf voice to {voice_id}");
        self.config.voice_id = voice_id;
        Ok(())
    }

    /// Replaces the configuration.
    ///
    /// Voice-level changes apply to the next context. If a socket-level
    /// parameter changed (url, api key, sample rate, format, channel type or
    /// model) an open session is closed and reopened, which ends the current
    /// event stream; call [`receive`](Self::receive) again afterwards.
    pub async fn update_config(&mut self, config: MurfTtsConfig) -> TTSResult<()> {
        config.validate()?;

        let reopen = !self.config.same_session_params(&config)
            && self.connection_state() != ConnectionState::Disconnected;
        self.config = config;

        if reopen {
            info!("Murf session parameters changed; reconnecting");
            self.close().await?;
            self.connect().await?;
        }
        Ok(())
    }

    /// Pings the socket and reports whether it answered.
    pub async fn verify_connection(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(outbound) = &self.outbound else {
            return false;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if outbound.send(Outbound::Ping(ack_tx)).is_err() {
            return false;
        }
        match timeout(PING_TIMEOUT, ack_rx).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!("Murf connection verification timed out");
                false
            }
        }
    }
}

impl Drop for MurfTts {
    fn drop(&mut self) {
        self.shared
            .intentional_disconnect
            .store(true, Ordering::SeqCst);
        {
            let mut tracker = self.shared.tracker.lock();
            let interrupted = tracker.finish_all(EndOfTurnReason::Interrupted);
            if !interrupted.is_empty() {
                debug!("Interrupted {} contexts on drop", interrupted.len());
            }
            tracker.detach();
        }
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

// =============================================================================
// Handshake
// =============================================================================

#[derive(Debug)]
enum HandshakeError {
    Config(TTSError),
    Rejected(StatusCode),
    Failed(String),
    TimedOut(Duration),
}

impl HandshakeError {
    fn is_auth_rejection(&self) -> bool {
        matches!(
            self,
            Self::Rejected(status)
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
        )
    }
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{e}"),
            Self::Rejected(status) if self.is_auth_rejection() => {
                write!(f, "authentication rejected (HTTP {})", status.as_u16())
            }
            Self::Rejected(status) => write!(f, "handshake rejected (HTTP {})", status.as_u16()),
            Self::Failed(e) => write!(f, "WebSocket connection failed: {e}"),
            Self::TimedOut(after) => write!(f, "connection timed out after {after:?}"),
        }
    }
}

impl From<HandshakeError> for TTSError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Config(e) => e,
            other => TTSError::ConnectionFailed(other.to_string()),
        }
    }
}

/// Returns the URL without its query string, for logging.
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

async fn open_socket(config: &MurfTtsConfig) -> Result<WsStream, HandshakeError> {
    let url = config.build_websocket_url().map_err(HandshakeError::Config)?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| HandshakeError::Config(TTSError::InvalidConfiguration(e.to_string())))?;
    let mut api_key = HeaderValue::from_str(&config.api_key).map_err(|_| {
        HandshakeError::Config(TTSError::InvalidConfiguration(
            "api_key contains characters not allowed in a header".to_string(),
        ))
    })?;
    api_key.set_sensitive(true);
    request.headers_mut().insert(API_KEY_HEADER, api_key);

    debug!("Connecting to Murf TTS: {}", redacted(&url));

    match timeout(config.connect_timeout, connect_async(request)).await {
        Ok(Ok((ws, response))) => {
            info!("Connected to Murf TTS (status: {})", response.status());
            Ok(ws)
        }
        Ok(Err(tungstenite::Error::Http(response))) => {
            Err(HandshakeError::Rejected(response.status()))
        }
        Ok(Err(e)) => Err(HandshakeError::Failed(e.to_string())),
        Err(_) => Err(HandshakeError::TimedOut(config.connect_timeout)),
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Why a socket stopped being usable.
#[derive(Debug)]
enum ConnectionEnd {
    /// The session was cancelled or closed by the caller
    Cancelled,
    /// No traffic and no live contexts for the idle timeout
    Idle,
    /// The socket dropped, failed or sent something unparseable
    Lost { reason: String, received: bool },
}

/// Why the read task stopped.
#[derive(Debug)]
enum ReadEnd {
    Cancelled,
    Closed(Option<String>),
    Failed(String),
    Malformed(String),
}

struct Supervisor {
    shared: Shared,
    config: MurfTtsConfig,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self, mut ws: WsStream, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        let mut attempt: u32 = 0;

        loop {
            let (end, reclaimed) = self.drive(ws, outbound).await;
            let Some(reclaimed) = reclaimed else {
                self.fail("write task terminated unexpectedly".to_string());
                return;
            };
            outbound = reclaimed;

            if self.cancel.is_cancelled()
                || self.shared.intentional_disconnect.load(Ordering::SeqCst)
            {
                debug!("Murf session closed by caller");
                self.shutdown();
                return;
            }

            match end {
                ConnectionEnd::Cancelled => {
                    self.shutdown();
                    return;
                }
                ConnectionEnd::Idle => {
                    info!(
                        "Murf session idle for {:?}; closing",
                        self.config.idle_timeout.unwrap_or_default()
                    );
                    self.shutdown();
                    return;
                }
                ConnectionEnd::Lost { reason, received } => {
                    if received {
                        attempt = 0;
                    }
                    warn!("Murf connection lost: {reason}");
                    self.shared.set_state(ConnectionState::Error);

                    let ended = self
                        .shared
                        .tracker
                        .lock()
                        .finish_all(EndOfTurnReason::Disconnected);
                    if !ended.is_empty() {
                        info!(
                            "Ended {} in-flight contexts after connection loss",
                            ended.len()
                        );
                    }

                    match self.reconnect(&mut attempt).await {
                        Some(new_ws) => ws = new_ws,
                        None => return,
                    }
                }
            }
        }
    }

    /// Runs one socket until it ends; returns the outbound queue for reuse.
    async fn drive(
        &self,
        ws: WsStream,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    ) -> (ConnectionEnd, Option<mpsc::UnboundedReceiver<Outbound>>) {
        let (sink, source) = ws.split();
        let conn = self.cancel.child_token();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(
            sink,
            outbound,
            control_rx,
            self.shared.clone(),
            self.config.keepalive_interval,
            conn.clone(),
        ));
        let mut reader = tokio::spawn(read_loop(
            source,
            control_tx,
            self.shared.clone(),
            conn.clone(),
        ));

        let mut reader_finished = false;
        let end = tokio::select! {
            result = &mut reader => {
                reader_finished = true;
                match result {
                    Ok((end, received)) => read_end_to_connection_end(end, received),
                    Err(e) => ConnectionEnd::Lost {
                        reason: format!("read task failed: {e}"),
                        received: false,
                    },
                }
            }
            _ = conn.cancelled() => {
                if self.cancel.is_cancelled() {
                    ConnectionEnd::Cancelled
                } else {
                    ConnectionEnd::Lost {
                        reason: "write failed".to_string(),
                        received: false,
                    }
                }
            }
            _ = idle_expired(&self.shared.tracker, self.config.idle_timeout) => ConnectionEnd::Idle,
        };

        conn.cancel();
        if !reader_finished && let Err(e) = reader.await {
            debug!("Read task ended with error: {e}");
        }

        match writer.await {
            Ok(outbound) => (end, Some(outbound)),
            Err(e) => {
                error!("Write task failed: {e}");
                (end, None)
            }
        }
    }

    async fn reconnect(&self, attempt: &mut u32) -> Option<WsStream> {
        let policy = &self.config.reconnection;
        loop {
            if !policy.should_retry(*attempt) {
                self.fail(format!(
                    "connection lost after {} reconnection attempts",
                    *attempt
                ));
                return None;
            }

            *attempt += 1;
            let delay = policy.calculate_delay(*attempt);
            info!(
                "Attempting Murf reconnection {}/{} in {:?}",
                *attempt, policy.max_attempts, delay
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    self.shutdown();
                    return None;
                }
            }
            if self.shared.intentional_disconnect.load(Ordering::SeqCst) {
                debug!("Disconnect requested during reconnection delay");
                self.shutdown();
                return None;
            }

            let result = tokio::select! {
                result = open_socket(&self.config) => result,
                _ = self.cancel.cancelled() => {
                    self.shutdown();
                    return None;
                }
            };

            match result {
                Ok(ws) => {
                    info!("Reconnected to Murf TTS after {} attempt(s)", *attempt);
                    self.shared.set_state(ConnectionState::Connected);
                    return Some(ws);
                }
                Err(e) if e.is_auth_rejection() => {
                    self.fail(e.to_string());
                    return None;
                }
                Err(e) => {
                    warn!("Reconnection attempt {} failed: {e}", *attempt);
                }
            }
        }
    }

    /// Ends the session after an unrecoverable failure.
    fn fail(&self, reason: String) {
        error!("Murf session failed: {reason}");
        {
            let mut tracker = self.shared.tracker.lock();
            tracker.finish_all(EndOfTurnReason::Disconnected);
            tracker.emit_error(None, TTSError::FatalStream(reason));
            tracker.detach();
        }
        self.shared.pending_pongs.lock().clear();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Ends the session cleanly.
    fn shutdown(&self) {
        {
            let mut tracker = self.shared.tracker.lock();
            tracker.finish_all(EndOfTurnReason::Interrupted);
            tracker.detach();
        }
        self.shared.pending_pongs.lock().clear();
        self.shared.set_state(ConnectionState::Disconnected);
        debug!("Murf session supervisor stopped");
    }
}

fn read_end_to_connection_end(end: ReadEnd, received: bool) -> ConnectionEnd {
    let reason = match end {
        ReadEnd::Cancelled => return ConnectionEnd::Cancelled,
        ReadEnd::Closed(Some(reason)) => format!("closed by server: {reason}"),
        ReadEnd::Closed(None) => "closed by server".to_string(),
        ReadEnd::Failed(e) => format!("socket error: {e}"),
        ReadEnd::Malformed(e) => format!("malformed message: {e}"),
    };
    ConnectionEnd::Lost { reason, received }
}

/// Resolves once the session has had no traffic and no live contexts for `idle`.
async fn idle_expired(tracker: &Arc<Mutex<ContextTracker>>, idle: Option<Duration>) {
    let Some(idle) = idle else {
        return std::future::pending::<()>().await;
    };
    loop {
        let wait = {
            let tracker = tracker.lock();
            if tracker.has_live_contexts() {
                idle
            } else {
                let elapsed = tracker.idle_for();
                if elapsed >= idle {
                    return;
                }
                idle - elapsed
            }
        };
        tokio::time::sleep(wait).await;
    }
}

// =============================================================================
// Read / Write Tasks
// =============================================================================

async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut control: mpsc::UnboundedReceiver<Message>,
    shared: Shared,
    keepalive: Option<Duration>,
    conn: CancellationToken,
) -> mpsc::UnboundedReceiver<Outbound> {
    let mut keepalive = keepalive.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            biased;

            _ = conn.cancelled() => {
                let _ = timeout(CLOSE_GRACE, sink.close()).await;
                break;
            }

            Some(frame) = control.recv() => {
                if let Err(e) = sink.send(frame).await {
                    warn!("Failed to send control frame: {e}");
                    conn.cancel();
                    break;
                }
            }

            item = outbound.recv() => match item {
                Some(Outbound::Message(message)) => {
                    if !shared.tracker.lock().should_send(&message) {
                        trace!("Discarding queued message for ended context {}", message.context_id());
                        continue;
                    }
                    let json = match message.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            error!("Failed to serialize Murf message: {e}");
                            continue;
                        }
                    };
                    trace!("Sending Murf message: {}", json.chars().take(100).collect::<String>());
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        warn!("Failed to send WebSocket message: {e}");
                        conn.cancel();
                        break;
                    }
                }
                Some(Outbound::Ping(ack)) => {
                    let seq = shared.ping_seq.fetch_add(1, Ordering::Relaxed) + 1;
                    let payload = Bytes::copy_from_slice(&seq.to_be_bytes());
                    // Registered first so a fast pong cannot miss its waiter
                    shared.pending_pongs.lock().push_back((payload.clone(), ack));
                    if let Err(e) = sink.send(Message::Ping(payload)).await {
                        warn!("Failed to send ping: {e}");
                        conn.cancel();
                        break;
                    }
                }
                Some(Outbound::Close) => {
                    debug!("Sending close frame to Murf");
                    let _ = timeout(CLOSE_GRACE, sink.close()).await;
                    break;
                }
                None => {
                    let _ = timeout(CLOSE_GRACE, sink.close()).await;
                    break;
                }
            },

            // Empty payload, so the pong never answers a verify waiter
            _ = tick(&mut keepalive) => {
                trace!("Sending keepalive ping");
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    warn!("Failed to send keepalive ping: {e}");
                    conn.cancel();
                    break;
                }
            }
        }
    }

    outbound
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn read_loop(
    mut source: WsSource,
    control: mpsc::UnboundedSender<Message>,
    shared: Shared,
    conn: CancellationToken,
) -> (ReadEnd, bool) {
    let mut received = false;

    loop {
        let next = tokio::select! {
            _ = conn.cancelled() => return (ReadEnd::Cancelled, received),
            next = source.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                trace!("Received Murf message: {}", text.chars().take(100).collect::<String>());
                let event = match parse_server_message(&text) {
                    Ok(event) => event,
                    Err(e) => return (ReadEnd::Malformed(e.to_string()), received),
                };
                received = true;
                dispatch(&shared, event);
            }
            Some(Ok(Message::Binary(data))) => {
                trace!("Received {} bytes of binary audio", data.len());
                received = true;
                shared.tracker.lock().on_audio(None, data, false);
            }
            Some(Ok(Message::Ping(payload))) => {
                let _ = control.send(Message::Pong(payload));
            }
            // Pongs do not count as activity for the idle timeout
            Some(Ok(Message::Pong(payload))) => {
                if !ack_pong(&mut shared.pending_pongs.lock(), &payload) {
                    trace!("Keepalive pong");
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .filter(|f| !f.reason.is_empty())
                    .map(|f| f.reason.as_str().to_string());
                if shared.intentional_disconnect.load(Ordering::SeqCst) {
                    debug!("Murf acknowledged close");
                } else {
                    info!("WebSocket closed by Murf: {reason:?}");
                }
                return (ReadEnd::Closed(reason), received);
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => return (ReadEnd::Failed(e.to_string()), received),
            None => return (ReadEnd::Closed(None), received),
        }
    }
}

/// Fires the waiter whose ping carried `payload`; returns whether one matched.
fn ack_pong(pending: &mut PongWaiters, payload: &[u8]) -> bool {
    let Some(pos) = pending.iter().position(|(sent, _)| sent.as_ref() == payload) else {
        return false;
    };
    if let Some((_, ack)) = pending.remove(pos) {
        let _ = ack.send(());
    }
    true
}

fn dispatch(shared: &Shared, event: ServerEvent) {
    let mut tracker = shared.tracker.lock();
    match event {
        ServerEvent::Audio {
            context_id,
            data,
            is_final,
        } => tracker.on_audio(context_id, data, is_final),
        ServerEvent::Final { context_id } => tracker.on_final(context_id),
        ServerEvent::Error {
            context_id,
            message,
        } => tracker.on_provider_error(context_id, message),
        ServerEvent::Unknown => debug!("Ignoring unrecognised Murf message"),
    }
}
