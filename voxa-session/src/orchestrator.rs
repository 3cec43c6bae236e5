//! The session orchestrator.
//!
//! One orchestrator owns one conversation: the audio track, the transport
//! session, the transcript, and the per-session retrieval state. All
//! session flags live in a single record and every transition is a pure
//! function of (state, signal), so there is exactly one place where the
//! lifecycle can change.
//!
//! Event handling is sequential: inbound control events are processed in
//! arrival order on the session's one logical task. Concurrency exists only
//! as outstanding requests (device acquisition raced with negotiation,
//! spawned persistence writes, cancellable prewarms).

use crate::audio::{AcquiredTrack, AudioFrame, AudioSource, AudioTrack};
use crate::error::{SessionError, SessionResult};
use crate::events::{
    dispatch, ClientEvent, ConversationItem, EventHandler, ReplyBuffer, ServerEvent, SessionPatch,
};
use crate::retry::{retry_with_policy, RetryPolicy};
use crate::transcript::{Exchange, PersistenceClient, TranscriptAccumulator};
use crate::transport::{SessionOffer, Transport, TransportSession};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use voxa_common::config::{Config, RealtimeConfig};
use voxa_retrieval::{gate_context, ContextService};

/// User-turn trigger that makes the backend open the conversation.
const GREETING_PROMPT: &str = "Hello! Please greet me and tell me how you can help.";

// ============================================================================
// State Machine
// ============================================================================

/// Lifecycle states of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Recording,
    Responding,
    Reconnecting,
    Closed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Recording => "recording",
            Self::Responding => "responding",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Session-visible happenings that drive transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionSignal {
    ConnectRequested,
    TransportReady,
    SpeechStarted,
    SpeechStopped,
    ResponseStarted,
    ResponseDone,
    LinkLost,
    Recovered,
    CloseRequested,
}

/// Pure transition function. Signals that do not apply to the current state
/// leave it unchanged, so stale events cannot corrupt the lifecycle.
pub(crate) fn transition(state: SessionState, signal: SessionSignal) -> SessionState {
    use SessionSignal as S;
    use SessionState as St;

    match (state, signal) {
        (St::Idle | St::Closed, S::ConnectRequested) => St::Connecting,
        (St::Connecting, S::TransportReady) => St::Connected,
        (St::Connected | St::Responding, S::SpeechStarted) => St::Recording,
        (St::Recording, S::SpeechStopped) => St::Connected,
        (St::Connected | St::Recording, S::ResponseStarted) => St::Responding,
        (St::Responding, S::ResponseDone) => St::Connected,
        (St::Connected | St::Recording | St::Responding, S::LinkLost) => St::Reconnecting,
        (St::Reconnecting, S::Recovered) => St::Connected,
        (_, S::CloseRequested) => St::Closed,
        (state, _) => state,
    }
}

/// The one mutable record for a session. No scattered flags.
#[derive(Debug)]
struct SessionRecord {
    state: SessionState,
    greeting_sent: bool,
    capture_enabled: bool,
    retry_count: u32,
    last_utterance: String,
    pending_utterance: String,
    reply: ReplyBuffer,
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            greeting_sent: false,
            capture_enabled: true,
            retry_count: 0,
            last_utterance: String::new(),
            pending_utterance: String::new(),
            reply: ReplyBuffer::default(),
        }
    }
}

// ============================================================================
// Notices
// ============================================================================

/// Events surfaced to the surrounding application.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    Connected,
    Reconnecting { attempt: u32 },
    ContextInjected { chunks: usize },
    Ended { exchanges: Vec<Exchange> },
    Failed { reason: String },
}

// ============================================================================
// Orchestrator
// ============================================================================

enum LoopExit {
    LinkLost,
    Closed,
}

/// Orchestrates one live voice session.
pub struct SessionOrchestrator {
    id: String,
    realtime: RealtimeConfig,
    retry_policy: RetryPolicy,
    transport: Arc<dyn Transport>,
    audio: Arc<dyn AudioSource>,
    context: ContextService,
    category: Option<String>,
    record: Mutex<SessionRecord>,
    transcript: Mutex<TranscriptAccumulator>,
    track: Mutex<Option<Box<dyn AudioTrack>>>,
    observer: Mutex<Option<Box<dyn EventHandler + Send>>>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    closed: watch::Sender<bool>,
    // Handle to self for spawning the supervision task.
    weak: Weak<Self>,
}

impl SessionOrchestrator {
    /// Create an orchestrator with a fresh client-generated session id.
    ///
    /// The id stays stable for the session's whole lifetime, including
    /// across reconnects.
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        audio: Arc<dyn AudioSource>,
        context: ContextService,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionNotice>) {
        Self::with_category(config, transport, audio, context, None)
    }

    /// Like [`Self::new`], optionally restricting retrieval to one
    /// knowledge category.
    pub fn with_category(
        config: &Config,
        transport: Arc<dyn Transport>,
        audio: Arc<dyn AudioSource>,
        context: ContextService,
        category: Option<&str>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionNotice>) {
        let id = uuid::Uuid::new_v4().to_string();
        let persistence = config
            .persistence
            .endpoint
            .as_deref()
            .map(|endpoint| Arc::new(PersistenceClient::new(endpoint, &config.persistence.source_tag)));
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let orchestrator = Arc::new_cyclic(|weak| Self {
            transcript: Mutex::new(TranscriptAccumulator::new(&id, persistence)),
            id,
            realtime: config.realtime.clone(),
            retry_policy: RetryPolicy::from_config(&config.retry),
            transport,
            audio,
            context,
            category: category.map(|s| s.to_string()),
            record: Mutex::new(SessionRecord::default()),
            track: Mutex::new(None),
            observer: Mutex::new(None),
            notices: notices_tx,
            closed: closed_tx,
            weak: weak.clone(),
        });
        (orchestrator, notices_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn state(&self) -> SessionState {
        self.record.lock().await.state
    }

    pub async fn capture_enabled(&self) -> bool {
        self.record.lock().await.capture_enabled
    }

    /// Snapshot of the transcript so far.
    pub async fn exchanges(&self) -> Vec<Exchange> {
        self.transcript.lock().await.exchanges().to_vec()
    }

    /// Register the typed event observer. Every inbound control event is
    /// classified through [`crate::events::dispatch`] to its hooks, in
    /// arrival order, before the orchestrator's own processing.
    pub async fn set_event_handler(&self, handler: Box<dyn EventHandler + Send>) {
        *self.observer.lock().await = Some(handler);
    }

    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    // ------------------------------------------------------------------
    // Connect / Disconnect
    // ------------------------------------------------------------------

    /// Establish the session: acquire the local audio source and negotiate
    /// the transport in parallel, then arm supervision.
    ///
    /// Failures are retried under the configured policy; device and
    /// precondition errors are surfaced immediately.
    pub async fn connect(&self) -> SessionResult<()> {
        {
            let mut record = self.record.lock().await;
            if !matches!(record.state, SessionState::Idle | SessionState::Closed) {
                return Err(SessionError::InvalidState {
                    state: record.state.name(),
                    operation: "connect",
                });
            }
            record.state = transition(record.state, SessionSignal::ConnectRequested);
        }

        let closed_rx = self.closed.subscribe();
        let outcome = retry_with_policy(
            &self.retry_policy,
            || !*closed_rx.borrow(),
            |attempt| async move {
                self.record.lock().await.retry_count = attempt;
                if attempt > 1 {
                    self.notify(SessionNotice::Reconnecting { attempt });
                }
                self.establish().await
            },
        )
        .await;

        match outcome {
            Ok(Some((session, acquired))) => {
                self.arm(session, acquired).await;
                Ok(())
            }
            Ok(None) => Err(SessionError::InvalidState {
                state: "closed",
                operation: "connect",
            }),
            Err(e) => {
                self.record.lock().await.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    /// Flush the transcript, tear down audio and transport, clear the
    /// per-session caches, and surface the conversation to the application.
    pub async fn disconnect(&self) {
        {
            let mut record = self.record.lock().await;
            if record.state == SessionState::Closed {
                return;
            }
            record.state = transition(record.state, SessionSignal::CloseRequested);
        }
        let _ = self.closed.send(true);

        // Final flush carries every exchange; incremental writes were
        // best-effort only.
        self.transcript.lock().await.flush().await;
        *self.track.lock().await = None;
        self.context.clear_session(&self.id);

        let exchanges = self.exchanges().await;
        if !exchanges.is_empty() {
            self.notify(SessionNotice::Ended { exchanges });
        }
        tracing::info!(session_id = %self.id, "Session closed");
    }

    /// Enable or disable audio capture without tearing the session down.
    /// The track is muted, not removed, so a background session stays warm.
    pub async fn set_capture_enabled(&self, enabled: bool) {
        self.record.lock().await.capture_enabled = enabled;
        if let Some(track) = self.track.lock().await.as_ref() {
            track.set_enabled(enabled);
        }
        tracing::debug!(session_id = %self.id, enabled, "Capture gating changed");
    }

    // ------------------------------------------------------------------
    // Establishment
    // ------------------------------------------------------------------

    async fn build_offer(&self) -> SessionOffer {
        let mut instructions = self.realtime.instructions.clone();
        if let Some(tail) = self
            .transcript
            .lock()
            .await
            .tail_text(self.realtime.history_window)
        {
            instructions.push_str("\n\nPrior conversation:\n");
            instructions.push_str(&tail);
        }
        SessionOffer {
            session_id: self.id.clone(),
            offer: format!("voxa-offer/1;session={}", self.id),
            instructions,
            voice: self.realtime.voice.clone(),
        }
    }

    /// Acquire the device and negotiate the transport, raced together:
    /// the two are independent, so overall latency is the slower of the
    /// two calls rather than their sum.
    async fn establish(&self) -> SessionResult<(TransportSession, AcquiredTrack)> {
        let device_timeout = Duration::from_millis(self.realtime.device_timeout_ms);

        let audio_fut = async {
            match tokio::time::timeout(device_timeout, self.audio.acquire()).await {
                Ok(result) => result,
                Err(_) => Err(SessionError::Device("device acquisition timed out".into())),
            }
        };

        let (acquired, session) = tokio::try_join!(audio_fut, self.establish_transport())?;
        Ok((session, acquired))
    }

    /// Negotiate and open the transport, bounded by the connect timeout so
    /// local failure is detected before the backend's own timeout.
    async fn establish_transport(&self) -> SessionResult<TransportSession> {
        let connect_timeout = Duration::from_millis(self.realtime.connect_timeout_ms);
        let offer = self.build_offer().await;

        let session = match tokio::time::timeout(connect_timeout, self.transport.connect(offer))
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(SessionError::Timeout),
        };

        let patch = ClientEvent::SessionUpdate {
            session: SessionPatch {
                instructions: self.build_offer().await.instructions,
                voice: self.realtime.voice.clone(),
            },
        };
        if session.outbound.send(patch).await.is_err() {
            return Err(SessionError::ChannelClosed);
        }
        Ok(session)
    }

    async fn arm(&self, session: TransportSession, acquired: AcquiredTrack) {
        let AcquiredTrack { track, frames } = acquired;
        {
            let record = self.record.lock().await;
            track.set_enabled(record.capture_enabled);
        }
        *self.track.lock().await = Some(track);

        {
            let mut record = self.record.lock().await;
            record.state = transition(record.state, SessionSignal::TransportReady);
        }
        self.notify(SessionNotice::Connected);
        tracing::info!(session_id = %self.id, "Session connected");

        if let Some(this) = self.weak.upgrade() {
            tokio::spawn(this.supervise(session, frames));
        }
    }

    // ------------------------------------------------------------------
    // Supervision
    // ------------------------------------------------------------------

    async fn supervise(
        self: Arc<Self>,
        mut session: TransportSession,
        mut frames: mpsc::Receiver<AudioFrame>,
    ) {
        let mut closed_rx = self.closed.subscribe();

        loop {
            match self.run_session(&mut session, &mut frames, &mut closed_rx).await {
                LoopExit::Closed => break,
                LoopExit::LinkLost => {
                    if !self.realtime.auto_reconnect {
                        tracing::warn!(session_id = %self.id, "Link lost, auto-reconnect disabled");
                        self.notify(SessionNotice::Failed {
                            reason: "connection lost".into(),
                        });
                        self.disconnect().await;
                        break;
                    }

                    {
                        let mut record = self.record.lock().await;
                        record.state = transition(record.state, SessionSignal::LinkLost);
                    }
                    tracing::warn!(session_id = %self.id, "Link lost, reconnecting");

                    match self.reconnect().await {
                        Ok(Some(new_session)) => {
                            let mut record = self.record.lock().await;
                            record.state = transition(record.state, SessionSignal::Recovered);
                            drop(record);
                            self.notify(SessionNotice::Connected);
                            session = new_session;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // Terminal: a single user-visible failure after
                            // silent transient retries
                            self.notify(SessionNotice::Failed {
                                reason: e.to_string(),
                            });
                            self.disconnect().await;
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Reconnect with backoff, reusing the session id. Each attempt first
    /// checks liveness so a retry scheduled around a close becomes a no-op.
    async fn reconnect(&self) -> SessionResult<Option<TransportSession>> {
        let closed_rx = self.closed.subscribe();
        retry_with_policy(
            &self.retry_policy,
            || !*closed_rx.borrow(),
            |attempt| async move {
                self.record.lock().await.retry_count = attempt;
                self.notify(SessionNotice::Reconnecting { attempt });
                self.establish_transport().await
            },
        )
        .await
    }

    async fn run_session(
        &self,
        session: &mut TransportSession,
        frames: &mut mpsc::Receiver<AudioFrame>,
        closed_rx: &mut watch::Receiver<bool>,
    ) -> LoopExit {
        let mut frames_open = true;

        loop {
            tokio::select! {
                maybe_event = session.events.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_event(event, &session.outbound).await,
                        None => return LoopExit::LinkLost,
                    }
                }
                result = session.health.changed() => {
                    if result.is_err() {
                        return LoopExit::LinkLost;
                    }
                    let health = *session.health.borrow_and_update();
                    if health.fully_connected() {
                        // The attempt reached the fully-connected state;
                        // only now does backoff reset.
                        self.record.lock().await.retry_count = 0;
                    }
                    if !health.transport_connected {
                        return LoopExit::LinkLost;
                    }
                }
                maybe_frame = frames.recv(), if frames_open => {
                    match maybe_frame {
                        Some(frame) => self.forward_frame(frame, &session.outbound).await,
                        // Capture thread ended; the session itself stays up.
                        None => frames_open = false,
                    }
                }
                _ = closed_rx.changed() => {
                    if *closed_rx.borrow() {
                        return LoopExit::Closed;
                    }
                }
            }
        }
    }

    async fn forward_frame(&self, frame: AudioFrame, outbound: &mpsc::Sender<ClientEvent>) {
        if !self.record.lock().await.capture_enabled {
            return;
        }
        let mut bytes = Vec::with_capacity(frame.len() * 2);
        for sample in frame {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        let _ = outbound
            .send(ClientEvent::InputAudioAppend {
                audio: B64.encode(&bytes),
            })
            .await;
    }

    // ------------------------------------------------------------------
    // Event Handling
    // ------------------------------------------------------------------

    async fn handle_event(&self, event: ServerEvent, outbound: &mpsc::Sender<ClientEvent>) {
        if let Some(observer) = self.observer.lock().await.as_mut() {
            dispatch(&event, observer.as_mut());
        }

        match event {
            ServerEvent::SessionCreated | ServerEvent::SessionUpdated => {
                let send_greeting = {
                    let mut record = self.record.lock().await;
                    if record.greeting_sent {
                        false
                    } else {
                        record.greeting_sent = true;
                        true
                    }
                };
                if send_greeting {
                    tracing::info!(session_id = %self.id, "Control channel open, sending greeting");
                    let item = ConversationItem::greeting_trigger(GREETING_PROMPT);
                    let _ = outbound
                        .send(ClientEvent::ConversationItemCreate { item })
                        .await;
                    let _ = outbound.send(ClientEvent::ResponseCreate).await;
                }
            }
            ServerEvent::SpeechStarted => {
                let last_known = {
                    let mut record = self.record.lock().await;
                    record.state = transition(record.state, SessionSignal::SpeechStarted);
                    record.pending_utterance.clear();
                    record.last_utterance.clone()
                };
                // Speculative retrieval with the last known utterance text
                if !last_known.is_empty() {
                    self.context
                        .prewarm(&self.id, &last_known, self.category.as_deref());
                }
            }
            ServerEvent::TranscriptionDelta { delta } => {
                let partial = {
                    let mut record = self.record.lock().await;
                    record.pending_utterance.push_str(&delta);
                    record.pending_utterance.clone()
                };
                self.context
                    .prewarm(&self.id, &partial, self.category.as_deref());
            }
            ServerEvent::SpeechStopped => {
                let mut record = self.record.lock().await;
                record.state = transition(record.state, SessionSignal::SpeechStopped);
            }
            ServerEvent::TranscriptionCompleted { transcript } => {
                if transcript.trim().is_empty() {
                    return;
                }
                {
                    let mut record = self.record.lock().await;
                    record.last_utterance = transcript.clone();
                    record.pending_utterance.clear();
                }
                self.transcript.lock().await.push_user(&transcript);
                self.inject_context(&transcript, outbound).await;
            }
            ServerEvent::ResponseCreated => {
                let mut record = self.record.lock().await;
                record.state = transition(record.state, SessionSignal::ResponseStarted);
            }
            ServerEvent::ResponseTranscriptDelta { delta } => {
                self.record.lock().await.reply.push_delta(&delta);
            }
            ServerEvent::ResponseTranscriptDone { transcript } => {
                self.record.lock().await.reply.apply_partial(&transcript);
            }
            ServerEvent::ResponseDone => {
                let text = {
                    let mut record = self.record.lock().await;
                    record.state = transition(record.state, SessionSignal::ResponseDone);
                    record.reply.take()
                };
                if !text.is_empty() {
                    self.transcript.lock().await.push_assistant(&text);
                }
            }
            ServerEvent::ErrorEvent { error } => {
                tracing::error!(
                    session_id = %self.id,
                    code = error.code.as_deref().unwrap_or("-"),
                    message = %error.message,
                    "Backend reported an error"
                );
            }
            ServerEvent::Unknown => {
                tracing::debug!(session_id = %self.id, "Ignoring unknown control event");
            }
        }
    }

    /// Retrieve context for a finished utterance and inject it, strictly
    /// gated: low-confidence context is suppressed and the backend's own
    /// redirection handles out-of-scope questions.
    async fn inject_context(&self, utterance: &str, outbound: &mpsc::Sender<ClientEvent>) {
        let chunks = match self
            .context
            .retrieve_for_session(&self.id, utterance, self.category.as_deref())
            .await
        {
            Ok(chunks) => chunks,
            Err(e) => {
                // Retrieval failure degrades to "no context"; the
                // conversation continues either way.
                tracing::warn!(
                    session_id = %self.id,
                    error = %e,
                    "Context retrieval failed, continuing without context"
                );
                return;
            }
        };

        let Some(context) = gate_context(&chunks, self.context.relevance_threshold()) else {
            tracing::debug!(
                session_id = %self.id,
                top_score = ?chunks.first().map(|c| c.score),
                "No confident context for utterance"
            );
            return;
        };

        tracing::debug!(
            session_id = %self.id,
            chunks = chunks.len(),
            "Injecting retrieved context"
        );
        let item = ConversationItem::context(format!("Relevant knowledge:\n{context}"));
        if outbound
            .send(ClientEvent::ConversationItemCreate { item })
            .await
            .is_err()
        {
            tracing::warn!(session_id = %self.id, "Context injection failed, channel closed");
            return;
        }
        self.notify(SessionNotice::ContextInjected {
            chunks: chunks.len(),
        });
    }
}
