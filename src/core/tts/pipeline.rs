//! Host pipeline integration.
//!
//! A host voice pipeline hands the adapter an upstream stream of text fragments
//! (typically LLM tokens), a sink for the frames it produces and a hook for
//! dropping audio contexts on its side. [`TtsPipeline`] drives a [`MurfTts`]
//! session between them:
//!
//! - fragments are grouped into sentences by [`SentenceAggregator`] (optional)
//! - each run of fragments up to a `Flush` becomes one context
//! - `Interrupt` abandons the current context (barge-in)
//! - every session event is forwarded to the [`FrameSink`] in order
//! - [`AudioContextManager::remove_audio_context`] is called once per context,
//!   on interruption or when its end-of-turn event is forwarded

use std::collections::HashSet;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::base::{AggregationHint, ContextId, TTSError, TTSResult, TtsEvent};
use super::murf::{EventStream, MurfTts};

// =============================================================================
// Collaborator Traits
// =============================================================================

/// Downstream consumer of session events.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn push(&self, event: TtsEvent) -> TTSResult<()>;
}

/// Host-side audio context bookkeeping.
#[async_trait]
pub trait AudioContextManager: Send + Sync {
    /// Drops any audio the host still holds for `context_id`.
    async fn remove_audio_context(&self, context_id: &ContextId);
}

#[async_trait]
impl FrameSink for mpsc::Sender<TtsEvent> {
    async fn push(&self, event: TtsEvent) -> TTSResult<()> {
        self.send(event)
            .await
            .map_err(|_| TTSError::InvalidState("frame sink closed".to_string()))
    }
}

#[async_trait]
impl FrameSink for mpsc::UnboundedSender<TtsEvent> {
    async fn push(&self, event: TtsEvent) -> TTSResult<()> {
        self.send(event)
            .map_err(|_| TTSError::InvalidState("frame sink closed".to_string()))
    }
}

/// Context manager for hosts that keep no per-context audio state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopContextManager;

#[async_trait]
impl AudioContextManager for NoopContextManager {
    async fn remove_audio_context(&self, _context_id: &ContextId) {}
}

/// Items arriving from the upstream text producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineInput {
    /// A text fragment for the current turn
    Text(String),
    /// The current turn is complete
    Flush,
    /// Abandon the current turn
    Interrupt,
}

// =============================================================================
// Sentence Aggregation
// =============================================================================

/// Buffers text fragments and releases them at sentence boundaries.
///
/// A boundary is one of `.`, `!`, `?`, `;` or `…` followed by whitespace. The
/// whitespace stays with the released sentence so the released pieces
/// concatenate back to the input.
#[derive(Debug, Default)]
pub struct SentenceAggregator {
    buffer: String,
}

impl SentenceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment and returns every sentence it completed.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);

        let mut sentences = Vec::new();
        while let Some(end) = next_boundary(&self.buffer) {
            let rest = self.buffer.split_off(end);
            sentences.push(std::mem::replace(&mut self.buffer, rest));
        }
        sentences
    }

    /// Returns buffered text that never reached a boundary.
    ///
    /// Whitespace-only leftovers are discarded.
    pub fn take_remaining(&mut self) -> Option<String> {
        let remaining = std::mem::take(&mut self.buffer);
        (!remaining.trim().is_empty()).then_some(remaining)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[inline]
fn is_sentence_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | ';' | '…')
}

/// Byte offset just past the first terminator-plus-whitespace in `text`.
fn next_boundary(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if is_sentence_terminator(c)
            && let Some(&(idx, next)) = chars.peek()
            && next.is_whitespace()
        {
            return Some(idx + next.len_utf8());
        }
    }
    None
}

// =============================================================================
// Pipeline Driver
// =============================================================================

#[derive(Debug, Default)]
struct Turns {
    /// Context receiving upstream text
    current: Option<ContextId>,
    /// Contexts with text submitted and no end-of-turn forwarded yet
    open: HashSet<ContextId>,
    /// Contexts already removed from the host on interruption
    removed: HashSet<ContextId>,
}

/// Drives a Murf session from an upstream text stream.
pub struct TtsPipeline {
    tts: MurfTts,
    aggregator: Option<SentenceAggregator>,
}

impl TtsPipeline {
    /// Creates a pipeline with sentence aggregation enabled.
    pub fn new(tts: MurfTts) -> Self {
        Self {
            tts: tts.with_aggregation(AggregationHint::Sentence),
            aggregator: Some(SentenceAggregator::new()),
        }
    }

    /// Forwards fragments to Murf as they arrive.
    pub fn without_aggregation(self) -> Self {
        Self {
            tts: self.tts.with_aggregation(AggregationHint::None),
            aggregator: None,
        }
    }

    pub fn session(&self) -> &MurfTts {
        &self.tts
    }

    pub fn session_mut(&mut self) -> &mut MurfTts {
        &mut self.tts
    }

    /// Runs until `upstream` ends and every open turn has ended.
    ///
    /// A trailing turn without a `Flush` is flushed when `upstream` ends. The
    /// session is closed before returning.
    pub async fn run<S, K, C>(&mut self, mut upstream: S, sink: &K, contexts: &C) -> TTSResult<()>
    where
        S: Stream<Item = PipelineInput> + Unpin + Send,
        K: FrameSink + ?Sized,
        C: AudioContextManager + ?Sized,
    {
        self.tts.connect().await?;
        let mut events = Some(self.tts.receive()?);
        let mut turns = Turns::default();
        let mut upstream_done = false;

        info!("TTS pipeline started");
        let result = loop {
            if upstream_done && (turns.open.is_empty() || events.is_none()) {
                break Ok(());
            }

            tokio::select! {
                input = upstream.next(), if !upstream_done => {
                    let step = match input {
                        Some(PipelineInput::Text(text)) => {
                            self.on_text(&text, &mut turns, &mut events).await
                        }
                        Some(PipelineInput::Flush) => self.finish_turn(&mut turns, &mut events).await,
                        Some(PipelineInput::Interrupt) => self.on_interrupt(&mut turns, contexts).await,
                        None => {
                            upstream_done = true;
                            self.finish_turn(&mut turns, &mut events).await
                        }
                    };
                    if let Err(e) = step {
                        break Err(e);
                    }
                }

                event = next_event(&mut events), if events.is_some() => match event {
                    Some(event) => {
                        if let Err(e) = self.forward(event, &mut turns, sink, contexts).await {
                            break Err(e);
                        }
                    }
                    None => {
                        debug!("Session event stream ended");
                        events = self.tts.receive().ok();
                    }
                },

                else => break Ok(()),
            }
        };

        if let Err(e) = &result {
            warn!("TTS pipeline stopped with error: {e}");
        }
        self.tts.close().await?;
        info!("TTS pipeline finished");
        result
    }

    async fn on_text(
        &mut self,
        text: &str,
        turns: &mut Turns,
        events: &mut Option<EventStream>,
    ) -> TTSResult<()> {
        if text.is_empty() {
            return Ok(());
        }

        let ready = match &mut self.aggregator {
            Some(aggregator) => aggregator.push(text),
            None => vec![text.to_string()],
        };

        let context_id = turns
            .current
            .get_or_insert_with(ContextId::generate)
            .clone();
        for sentence in ready {
            self.submit(&sentence, &context_id, false, turns, events)
                .await?;
        }
        Ok(())
    }

    async fn finish_turn(
        &mut self,
        turns: &mut Turns,
        events: &mut Option<EventStream>,
    ) -> TTSResult<()> {
        let Some(context_id) = turns.current.clone() else {
            return Ok(());
        };

        let remaining = self
            .aggregator
            .as_mut()
            .and_then(SentenceAggregator::take_remaining);
        if let Some(remaining) = remaining {
            self.submit(&remaining, &context_id, true, turns, events)
                .await?;
        }

        turns.current = None;
        self.tts.flush_audio(&context_id).await
    }

    async fn on_interrupt<C>(&mut self, turns: &mut Turns, contexts: &C) -> TTSResult<()>
    where
        C: AudioContextManager + ?Sized,
    {
        if let Some(aggregator) = &mut self.aggregator {
            aggregator.clear();
        }
        // Flushed turns may still be streaming audio, so they are cut too
        let mut targets: Vec<ContextId> = turns
            .open
            .iter()
            .filter(|id| !turns.removed.contains(*id))
            .cloned()
            .collect();
        if let Some(current) = turns.current.take()
            && !targets.contains(&current)
        {
            targets.push(current);
        }

        for context_id in targets {
            debug!("Interrupting turn {context_id}");
            self.tts.interrupt(&context_id).await?;
            if turns.open.contains(&context_id) {
                contexts.remove_audio_context(&context_id).await;
                turns.removed.insert(context_id);
            }
        }
        Ok(())
    }

    async fn submit(
        &mut self,
        text: &str,
        context_id: &ContextId,
        is_final_chunk: bool,
        turns: &mut Turns,
        events: &mut Option<EventStream>,
    ) -> TTSResult<()> {
        match self
            .tts
            .submit_text(text, context_id, is_final_chunk)
            .await
        {
            Ok(()) => {
                turns.open.insert(context_id.clone());
                // A lazy reconnect opens a new event stream
                if events.is_none() {
                    *events = self.tts.receive().ok();
                }
                Ok(())
            }
            Err(e @ (TTSError::ContextClosed(_) | TTSError::ContextCancelled(_))) => {
                debug!("Dropping text for ended turn {context_id}: {e}");
                if turns.current.as_ref() == Some(context_id) {
                    turns.current = None;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn forward<K, C>(
        &mut self,
        event: TtsEvent,
        turns: &mut Turns,
        sink: &K,
        contexts: &C,
    ) -> TTSResult<()>
    where
        K: FrameSink + ?Sized,
        C: AudioContextManager + ?Sized,
    {
        let ended = match &event {
            TtsEvent::EndOfTurn { context_id, .. } => Some(context_id.clone()),
            _ => None,
        };

        sink.push(event).await?;

        if let Some(context_id) = ended {
            turns.open.remove(&context_id);
            if !turns.removed.remove(&context_id) {
                contexts.remove_audio_context(&context_id).await;
            }
            // Ended underneath us (disconnect or provider error)
            if turns.current.as_ref() == Some(&context_id) {
                turns.current = None;
                if let Some(aggregator) = &mut self.aggregator {
                    aggregator.clear();
                }
            }
        }
        Ok(())
    }
}

async fn next_event(events: &mut Option<EventStream>) -> Option<TtsEvent> {
    match events {
        Some(events) => events.next().await,
        None => std::future::pending().await,
    }
}
