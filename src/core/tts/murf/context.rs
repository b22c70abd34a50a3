//! Context bookkeeping for a Murf session.
//!
//! [`ContextTracker`] is the only mutable state shared between the caller-facing
//! session, the read task and the write task. It owns the event sender, so every
//! event is emitted while the tracker is locked; that makes "mark context
//! finished" and "emit its end-of-turn" a single step, and guarantees that no
//! audio frame for a context can follow its end-of-turn marker.
//!
//! A context emits its end-of-turn marker exactly once:
//! - `Completed` when the caller flushed it *and* Murf reported `final` for it
//! - `Interrupted` when the caller interrupted it or the session closed
//! - `Disconnected` when the socket dropped while it was in flight
//! - `Error` when Murf reported an error for it
//!
//! Every end-of-turn marker is directly preceded by a [`TtsEvent::Metrics`]
//! report for the same context.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::messages::{MurfClientMessage, VoiceConfig};
use crate::core::tts::base::{
    AggregationHint, AudioFrame, ContextId, EndOfTurnReason, TTSError, TTSResult, TtsEvent,
    TurnMetrics,
};

/// Number of finished context ids remembered to reject reuse.
const FINISHED_HISTORY: usize = 128;

#[derive(Debug)]
struct ContextEntry {
    /// Voice snapshot taken when the context opened
    voice: VoiceConfig,
    aggregated_by: AggregationHint,
    /// An `end: true` has been queued for this context
    end_sent: bool,
    /// The caller will submit no more text
    flushed: bool,
    /// Murf reported `final` for this context
    vendor_done: bool,
    audio_bytes: usize,
    characters: usize,
    opened_at: Instant,
    first_audio: Option<Duration>,
}

impl ContextEntry {
    fn metrics(&self, context_id: &ContextId) -> TurnMetrics {
        TurnMetrics {
            context_id: context_id.clone(),
            ttfb: self.first_audio,
            characters: self.characters,
            audio_bytes: self.audio_bytes,
            duration: self.opened_at.elapsed(),
        }
    }
}

/// Shared per-session context state.
#[derive(Debug)]
pub struct ContextTracker {
    live: HashMap<ContextId, ContextEntry>,
    /// Live contexts in the order they were opened
    order: VecDeque<ContextId>,
    /// The single context currently accepting text
    active: Option<ContextId>,
    finished: VecDeque<(ContextId, EndOfTurnReason)>,
    events: Option<mpsc::UnboundedSender<TtsEvent>>,
    sample_rate: u32,
    num_channels: u16,
    last_activity: Instant,
}

impl ContextTracker {
    pub fn new(sample_rate: u32, num_channels: u16) -> Self {
        Self {
            live: HashMap::new(),
            order: VecDeque::new(),
            active: None,
            finished: VecDeque::new(),
            events: None,
            sample_rate,
            num_channels,
            last_activity: Instant::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Event channel
    // -------------------------------------------------------------------------

    /// Installs a new event channel and returns its receiving half.
    pub fn attach(&mut self) -> mpsc::UnboundedReceiver<TtsEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        self.last_activity = Instant::now();
        rx
    }

    /// Drops the event sender, ending the caller's event sequence.
    pub fn detach(&mut self) {
        self.events = None;
    }

    pub fn set_audio_format(&mut self, sample_rate: u32, num_channels: u16) {
        self.sample_rate = sample_rate;
        self.num_channels = num_channels;
    }

    fn emit(&self, event: TtsEvent) {
        if let Some(tx) = &self.events
            && tx.send(event).is_err()
        {
            trace!("Event receiver dropped; discarding event");
        }
    }

    /// Emits an error event not tied to a specific context transition.
    pub fn emit_error(&self, context_id: Option<ContextId>, error: TTSError) {
        let fatal = error.is_fatal();
        self.emit(TtsEvent::Error {
            context_id,
            error,
            fatal,
        });
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    #[inline]
    pub fn is_live(&self, context_id: &ContextId) -> bool {
        self.live.contains_key(context_id)
    }

    #[inline]
    pub fn active(&self) -> Option<&ContextId> {
        self.active.as_ref()
    }

    #[inline]
    pub fn has_live_contexts(&self) -> bool {
        !self.live.is_empty()
    }

    /// Returns whether a queued outbound message should still go on the wire.
    ///
    /// Clear messages always go out; text and end messages only while their
    /// context is live, so text buffered for an interrupted context is discarded.
    pub fn should_send(&self, message: &MurfClientMessage) -> bool {
        message.is_clear() || self.is_live(message.context_id())
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    fn finished_reason(&self, context_id: &ContextId) -> Option<EndOfTurnReason> {
        self.finished
            .iter()
            .find(|(id, _)| id == context_id)
            .map(|(_, reason)| *reason)
    }

    /// Resolves the context an inbound message belongs to.
    ///
    /// Messages without a context id belong to the oldest live context.
    fn resolve(&self, context_id: Option<ContextId>) -> Option<ContextId> {
        match context_id {
            Some(id) => self.is_live(&id).then_some(id),
            None => self.order.front().cloned(),
        }
    }

    // -------------------------------------------------------------------------
    // Caller operations
    // -------------------------------------------------------------------------

    /// Accepts a text chunk and returns the messages to queue for the socket.
    ///
    /// Submitting to a new context while another is active implicitly flushes
    /// the active one.
    pub fn submit(
        &mut self,
        context_id: &ContextId,
        text: &str,
        is_final_chunk: bool,
        voice: &VoiceConfig,
        aggregated_by: AggregationHint,
    ) -> TTSResult<Vec<MurfClientMessage>> {
        if text.is_empty() {
            return Err(TTSError::InvalidInput("text cannot be empty".to_string()));
        }

        if let Some(reason) = self.finished_reason(context_id) {
            return Err(match reason {
                EndOfTurnReason::Interrupted => TTSError::ContextCancelled(context_id.to_string()),
                _ => TTSError::ContextClosed(format!("{context_id} has already ended")),
            });
        }

        let mut outbound = Vec::with_capacity(2);

        if let Some(entry) = self.live.get(context_id) {
            if entry.end_sent || entry.flushed {
                return Err(TTSError::ContextClosed(format!(
                    "{context_id} no longer accepts text"
                )));
            }
        } else {
            if let Some(previous) = self.active.clone() {
                debug!("Implicitly flushing context {previous} before opening {context_id}");
                if let Some(end) = self.flush(&previous) {
                    outbound.push(end);
                }
            }

            self.live.insert(
                context_id.clone(),
                ContextEntry {
                    voice: voice.clone(),
                    aggregated_by,
                    end_sent: false,
                    flushed: false,
                    vendor_done: false,
                    audio_bytes: 0,
                    characters: 0,
                    opened_at: Instant::now(),
                    first_audio: None,
                },
            );
            self.order.push_back(context_id.clone());
            self.active = Some(context_id.clone());
            debug!("Opened context {context_id}");
            self.emit(TtsEvent::Started {
                context_id: context_id.clone(),
            });
        }

        let Some(entry) = self.live.get_mut(context_id) else {
            return Err(TTSError::InvalidState(format!(
                "context {context_id} vanished during submit"
            )));
        };
        entry.vendor_done = false;
        entry.characters += text.chars().count();
        if is_final_chunk {
            entry.end_sent = true;
        }
        let voice = entry.voice.clone();
        let aggregated_by = entry.aggregated_by;

        self.emit(TtsEvent::Text {
            context_id: context_id.clone(),
            text: text.to_string(),
            aggregated_by,
        });
        outbound.push(MurfClientMessage::text(
            voice,
            context_id.clone(),
            text,
            is_final_chunk,
        ));
        self.touch();

        Ok(outbound)
    }

    /// Marks the context flushed. Returns an end message if one still needs sending.
    ///
    /// No-op for unknown, finished or already flushed contexts.
    pub fn flush(&mut self, context_id: &ContextId) -> Option<MurfClientMessage> {
        let entry = self.live.get_mut(context_id)?;
        if entry.flushed {
            return None;
        }
        entry.flushed = true;

        let end = if entry.end_sent {
            None
        } else {
            entry.end_sent = true;
            Some(MurfClientMessage::end(context_id.clone()))
        };

        if self.active.as_ref() == Some(context_id) {
            self.active = None;
        }
        debug!("Flushed context {context_id}");
        self.maybe_complete(context_id);
        end
    }

    /// Abandons a live context, emitting its end-of-turn immediately.
    ///
    /// Returns `true` if the context was live (a clear message should be sent).
    pub fn interrupt(&mut self, context_id: &ContextId) -> bool {
        if !self.is_live(context_id) {
            return false;
        }
        debug!("Interrupting context {context_id}");
        self.finish(context_id, EndOfTurnReason::Interrupted);
        true
    }

    /// Ends every live context with `reason`; returns the ids that were live.
    pub fn finish_all(&mut self, reason: EndOfTurnReason) -> Vec<ContextId> {
        let ids: Vec<ContextId> = self.order.iter().cloned().collect();
        for id in &ids {
            self.finish(id, reason);
        }
        ids
    }

    // -------------------------------------------------------------------------
    // Inbound handling
    // -------------------------------------------------------------------------

    /// Routes decoded audio to its context.
    pub fn on_audio(&mut self, context_id: Option<ContextId>, data: Bytes, is_final: bool) {
        self.touch();
        let Some(id) = self.resolve(context_id) else {
            trace!("Dropping {} audio bytes for an unavailable context", data.len());
            return;
        };

        if !data.is_empty() {
            let (aggregated_by, sample_rate, num_channels) = {
                let Some(entry) = self.live.get_mut(&id) else {
                    return;
                };
                if entry.first_audio.is_none() {
                    let ttfb = entry.opened_at.elapsed();
                    debug!("First audio for context {id} after {ttfb:?}");
                    entry.first_audio = Some(ttfb);
                }
                entry.audio_bytes += data.len();
                (entry.aggregated_by, self.sample_rate, self.num_channels)
            };
            self.emit(TtsEvent::Audio(AudioFrame {
                context_id: id.clone(),
                data,
                sample_rate,
                num_channels,
                aggregated_by,
            }));
        }

        if is_final {
            self.on_final(Some(id));
        }
    }

    /// Records Murf's final marker for a context.
    pub fn on_final(&mut self, context_id: Option<ContextId>) {
        self.touch();
        let Some(id) = self.resolve(context_id) else {
            trace!("Ignoring final marker for an unavailable context");
            return;
        };
        if let Some(entry) = self.live.get_mut(&id) {
            entry.vendor_done = true;
            debug!(
                "Received final output for context {id} ({} audio bytes)",
                entry.audio_bytes
            );
        }
        self.maybe_complete(&id);
    }

    /// Handles a provider error; a context-scoped error ends that context.
    pub fn on_provider_error(&mut self, context_id: Option<ContextId>, message: String) {
        self.touch();
        let error = TTSError::ProviderError(message);
        match self.resolve(context_id) {
            Some(id) => {
                warn!("Murf error for context {id}: {error}");
                self.emit_error(Some(id.clone()), error);
                self.finish(&id, EndOfTurnReason::Error);
            }
            None => {
                warn!("Murf error outside any context: {error}");
                self.emit_error(None, error);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn maybe_complete(&mut self, context_id: &ContextId) {
        let complete = self
            .live
            .get(context_id)
            .is_some_and(|e| e.flushed && e.end_sent && e.vendor_done);
        if complete {
            self.finish(context_id, EndOfTurnReason::Completed);
        }
    }

    fn finish(&mut self, context_id: &ContextId, reason: EndOfTurnReason) {
        let Some(entry) = self.live.remove(context_id) else {
            return;
        };
        self.order.retain(|id| id != context_id);
        if self.active.as_ref() == Some(context_id) {
            self.active = None;
        }
        self.finished.push_back((context_id.clone(), reason));
        while self.finished.len() > FINISHED_HISTORY {
            self.finished.pop_front();
        }

        let metrics = entry.metrics(context_id);
        info!(
            context_id = %context_id,
            ?reason,
            ttfb_ms = metrics.ttfb.map(|t| t.as_millis() as u64),
            characters = metrics.characters,
            audio_bytes = metrics.audio_bytes,
            "Murf context ended"
        );
        self.emit(TtsEvent::Metrics(metrics));
        self.emit(TtsEvent::EndOfTurn {
            context_id: context_id.clone(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tts::murf::config::MurfTtsConfig;

    fn setup() -> (ContextTracker, mpsc::UnboundedReceiver<TtsEvent>, VoiceConfig) {
        let mut tracker = ContextTracker::new(44100, 1);
        let rx = tracker.attach();
        (tracker, rx, MurfTtsConfig::new("k").voice_config())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TtsEvent>) -> Vec<TtsEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn end_of_turns(events: &[TtsEvent]) -> Vec<(ContextId, EndOfTurnReason)> {
        events
            .iter()
            .filter_map(|e| match e {
                TtsEvent::EndOfTurn { context_id, reason } => Some((context_id.clone(), *reason)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_submit_opens_context_and_emits_started() {
        let (mut tracker, mut rx, voice) = setup();
        let ctx = ContextId::from("1");
        let out = tracker
            .submit(&ctx, "Hello ", false, &voice, AggregationHint::Sentence)
            .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(tracker.active(), Some(&ctx));
        let events = drain(&mut rx);
        assert!(matches!(events[0], TtsEvent::Started { .. }));
        assert!(matches!(&events[1], TtsEvent::Text { text, .. } if text == "Hello "));
    }

    #[test]
    fn test_empty_text_rejected() {
        let (mut tracker, _rx, voice) = setup();
        let err = tracker
            .submit(&ContextId::from("1"), "", false, &voice, AggregationHint::None)
            .unwrap_err();
        assert!(matches!(err, TTSError::InvalidInput(_)));
        assert!(tracker.active().is_none());
    }

    #[test]
    fn test_single_end_of_turn_after_flush_and_final() {
        let (mut tracker, mut rx, voice) = setup();
        let ctx = ContextId::from("1");
        tracker
            .submit(&ctx, "Hello ", false, &voice, AggregationHint::Sentence)
            .unwrap();
        tracker
            .submit(&ctx, "world.", true, &voice, AggregationHint::Sentence)
            .unwrap();

        // Final chunk already carried end=true, so flush queues nothing
        assert!(tracker.flush(&ctx).is_none());

        tracker.on_audio(Some(ctx.clone()), Bytes::from_static(&[1, 2]), false);
        tracker.on_audio(None, Bytes::from_static(&[3, 4]), false);
        assert!(end_of_turns(&drain(&mut rx)).is_empty());

        tracker.on_final(Some(ctx.clone()));
        let events = drain(&mut rx);
        assert_eq!(
            end_of_turns(&events),
            vec![(ctx.clone(), EndOfTurnReason::Completed)]
        );
        assert!(!tracker.is_live(&ctx));

        // A duplicate final is ignored
        tracker.on_final(Some(ctx));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_vendor_final_before_flush_waits_for_flush() {
        let (mut tracker, mut rx, voice) = setup();
        let ctx = ContextId::from("1");
        tracker
            .submit(&ctx, "Hi.", true, &voice, AggregationHint::Sentence)
            .unwrap();
        tracker.on_audio(Some(ctx.clone()), Bytes::from_static(&[1]), true);
        assert!(end_of_turns(&drain(&mut rx)).is_empty());

        assert!(tracker.flush(&ctx).is_none());
        assert_eq!(
            end_of_turns(&drain(&mut rx)),
            vec![(ctx, EndOfTurnReason::Completed)]
        );
    }

    #[test]
    fn test_flush_sends_end_when_no_final_chunk() {
        let (mut tracker, _rx, voice) = setup();
        let ctx = ContextId::from("1");
        tracker
            .submit(&ctx, "Hello", false, &voice, AggregationHint::Sentence)
            .unwrap();
        let end = tracker.flush(&ctx).unwrap();
        assert_eq!(end, MurfClientMessage::end(ctx.clone()));
        assert!(tracker.active().is_none());

        // Flushing again or flushing unknown contexts is a no-op
        assert!(tracker.flush(&ctx).is_none());
        assert!(tracker.flush(&ContextId::from("nope")).is_none());
    }

    #[test]
    fn test_text_after_final_chunk_rejected() {
        let (mut tracker, _rx, voice) = setup();
        let ctx = ContextId::from("1");
        tracker
            .submit(&ctx, "Done.", true, &voice, AggregationHint::Sentence)
            .unwrap();
        let err = tracker
            .submit(&ctx, "More", false, &voice, AggregationHint::Sentence)
            .unwrap_err();
        assert!(matches!(err, TTSError::ContextClosed(_)));
    }

    #[test]
    fn test_new_context_implicitly_flushes_active() {
        let (mut tracker, mut rx, voice) = setup();
        let first = ContextId::from("1");
        let second = ContextId::from("2");
        tracker
            .submit(&first, "One", false, &voice, AggregationHint::Sentence)
            .unwrap();
        let out = tracker
            .submit(&second, "Two", false, &voice, AggregationHint::Sentence)
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0], MurfClientMessage::end(first.clone()));
        assert_eq!(tracker.active(), Some(&second));
        assert!(tracker.is_live(&first));

        tracker.on_final(Some(first.clone()));
        assert_eq!(
            end_of_turns(&drain(&mut rx)),
            vec![(first, EndOfTurnReason::Completed)]
        );
    }

    #[test]
    fn test_interrupt_emits_end_of_turn_and_drops_late_audio() {
        let (mut tracker, mut rx, voice) = setup();
        let ctx = ContextId::from("1");
        let out = tracker
            .submit(&ctx, "Buffered", false, &voice, AggregationHint::Sentence)
            .unwrap();

        assert!(tracker.interrupt(&ctx));
        assert!(!tracker.should_send(&out[0]));
        assert!(tracker.should_send(&MurfClientMessage::clear(ctx.clone())));

        tracker.on_audio(Some(ctx.clone()), Bytes::from_static(&[1, 2, 3]), false);
        tracker.on_final(Some(ctx.clone()));

        let events = drain(&mut rx);
        assert_eq!(
            end_of_turns(&events),
            vec![(ctx.clone(), EndOfTurnReason::Interrupted)]
        );
        assert!(!events.iter().any(|e| matches!(e, TtsEvent::Audio(_))));

        // Interrupting twice is a no-op; resubmitting is rejected
        assert!(!tracker.interrupt(&ctx));
        let err = tracker
            .submit(&ctx, "again", false, &voice, AggregationHint::Sentence)
            .unwrap_err();
        assert!(matches!(err, TTSError::ContextCancelled(_)));
    }

    #[test]
    fn test_audio_without_context_goes_to_oldest_live() {
        let (mut tracker, mut rx, voice) = setup();
        let first = ContextId::from("1");
        let second = ContextId::from("2");
        tracker
            .submit(&first, "One", false, &voice, AggregationHint::Sentence)
            .unwrap();
        tracker
            .submit(&second, "Two", false, &voice, AggregationHint::Sentence)
            .unwrap();
        drain(&mut rx);

        tracker.on_audio(None, Bytes::from_static(&[7]), false);
        match &drain(&mut rx)[0] {
            TtsEvent::Audio(frame) => {
                assert_eq!(frame.context_id, first);
                assert_eq!(frame.sample_rate, 44100);
                assert_eq!(frame.num_channels, 1);
                assert_eq!(frame.aggregated_by, AggregationHint::Sentence);
            }
            other => panic!("expected audio, got {other:?}"),
        }
    }

    #[test]
    fn test_provider_error_ends_context() {
        let (mut tracker, mut rx, voice) = setup();
        let ctx = ContextId::from("1");
        tracker
            .submit(&ctx, "Hi", false, &voice, AggregationHint::Sentence)
            .unwrap();
        drain(&mut rx);

        tracker.on_provider_error(Some(ctx.clone()), "bad voice".to_string());
        let events = drain(&mut rx);
        assert!(matches!(
            &events[0],
            TtsEvent::Error { fatal: false, error: TTSError::ProviderError(_), .. }
        ));
        assert_eq!(end_of_turns(&events), vec![(ctx, EndOfTurnReason::Error)]);
    }

    #[test]
    fn test_finish_all_on_disconnect() {
        let (mut tracker, mut rx, voice) = setup();
        for id in ["1", "2"] {
            tracker
                .submit(&ContextId::from(id), "x", false, &voice, AggregationHint::Sentence)
                .unwrap();
        }
        drain(&mut rx);

        let ended = tracker.finish_all(EndOfTurnReason::Disconnected);
        assert_eq!(ended.len(), 2);
        assert!(!tracker.has_live_contexts());
        let eots = end_of_turns(&drain(&mut rx));
        assert_eq!(eots.len(), 2);
        assert!(eots.iter().all(|(_, r)| *r == EndOfTurnReason::Disconnected));
    }

    #[test]
    fn test_metrics_precede_end_of_turn() {
        let (mut tracker, mut rx, voice) = setup();
        let ctx = ContextId::from("1");
        tracker
            .submit(&ctx, "Héllo ", false, &voice, AggregationHint::Sentence)
            .unwrap();
        tracker
            .submit(&ctx, "world.", true, &voice, AggregationHint::Sentence)
            .unwrap();
        tracker.flush(&ctx);
        tracker.on_audio(Some(ctx.clone()), Bytes::from_static(&[0; 8]), false);
        tracker.on_audio(Some(ctx.clone()), Bytes::from_static(&[0; 4]), true);

        let events = drain(&mut rx);
        let n = events.len();
        match &events[n - 2] {
            TtsEvent::Metrics(metrics) => {
                assert_eq!(metrics.context_id, ctx);
                assert_eq!(metrics.characters, 12);
                assert_eq!(metrics.audio_bytes, 12);
                let ttfb = metrics.ttfb.unwrap();
                assert!(ttfb <= metrics.duration);
            }
            other => panic!("expected metrics, got {other:?}"),
        }
        assert!(events[n - 1].is_end_of_turn());
        let reports = events
            .iter()
            .filter(|e| matches!(e, TtsEvent::Metrics(_)))
            .count();
        assert_eq!(reports, 1);
    }

    #[test]
    fn test_metrics_without_audio_have_no_ttfb() {
        let (mut tracker, mut rx, voice) = setup();
        let ctx = ContextId::from("1");
        tracker
            .submit(&ctx, "Cut", false, &voice, AggregationHint::Sentence)
            .unwrap();
        tracker.interrupt(&ctx);

        let metrics = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                TtsEvent::Metrics(m) => Some(m),
                _ => None,
            })
            .unwrap();
        assert_eq!(metrics.ttfb, None);
        assert_eq!(metrics.characters, 3);
        assert_eq!(metrics.audio_bytes, 0);
    }

    #[test]
    fn test_detach_ends_stream() {
        let (mut tracker, mut rx, _voice) = setup();
        tracker.detach();
        assert!(rx.try_recv().is_err());
        assert!(rx.is_closed());
    }
}
