//! Control channel wire protocol and event dispatch.
//!
//! Inbound and outbound messages are discriminated by a string `type` tag.
//! Inbound events are a tagged union with an explicit catch-all arm, so new
//! event kinds are a compile-time-visible extension point and unknown tags
//! fall through to exactly one place.

use serde::{Deserialize, Serialize};

// ============================================================================
// Inbound Events
// ============================================================================

/// Error payload reported by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Inbound control messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Session established.
    #[serde(rename = "session.created")]
    SessionCreated,

    /// Session configuration acknowledged.
    #[serde(rename = "session.updated")]
    SessionUpdated,

    /// The user started speaking.
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    /// The user stopped speaking.
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    /// Interim transcription of the in-progress utterance.
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        #[serde(default)]
        delta: String,
    },

    /// Final transcription of a completed utterance.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },

    /// The assistant reply began.
    #[serde(rename = "response.created")]
    ResponseCreated,

    /// Partial assistant reply text.
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseTranscriptDelta {
        #[serde(default)]
        delta: String,
    },

    /// Complete assistant reply text.
    #[serde(rename = "response.audio_transcript.done")]
    ResponseTranscriptDone {
        #[serde(default)]
        transcript: String,
    },

    /// The assistant reply fully finished.
    #[serde(rename = "response.done")]
    ResponseDone,

    /// Backend-reported error.
    #[serde(rename = "error")]
    ErrorEvent { error: ErrorDetail },

    /// Forward compatibility: unknown tags are ignored.
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Parse one control channel frame. Malformed frames and unknown tags
    /// both land on `Unknown`.
    pub fn parse(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or(Self::Unknown)
    }
}

// ============================================================================
// Outbound Events
// ============================================================================

/// Session configuration patch.
#[derive(Debug, Clone, Serialize)]
pub struct SessionPatch {
    pub instructions: String,
    pub voice: String,
}

/// One piece of conversation item content.
#[derive(Debug, Clone, Serialize)]
pub struct ItemContent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

/// A synthetic conversation item injected by the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub role: &'static str,
    pub content: Vec<ItemContent>,
}

impl ConversationItem {
    /// Retrieved context, injected as a synthetic prior message.
    pub fn context(text: impl Into<String>) -> Self {
        Self {
            kind: "message",
            role: "system",
            content: vec![ItemContent {
                kind: "input_text",
                text: text.into(),
            }],
        }
    }

    /// The mandatory greeting, injected as a user-turn trigger.
    pub fn greeting_trigger(text: impl Into<String>) -> Self {
        Self {
            kind: "message",
            role: "user",
            content: vec![ItemContent {
                kind: "input_text",
                text: text.into(),
            }],
        }
    }
}

/// Outbound control messages used by the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionPatch },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
}

// ============================================================================
// Dispatch
// ============================================================================

/// Typed hooks for inbound control events. Every hook defaults to a no-op.
pub trait EventHandler {
    fn on_session_update(&mut self) {}
    fn on_speech_started(&mut self) {}
    fn on_speech_stopped(&mut self) {}
    fn on_transcription_partial(&mut self, _delta: &str) {}
    fn on_transcription_completed(&mut self, _transcript: &str) {}
    fn on_response_started(&mut self) {}
    fn on_response_transcript(&mut self, _partial: &str) {}
    fn on_response_done(&mut self) {}
    fn on_error(&mut self, _code: Option<&str>, _message: &str) {}
}

/// Map one inbound event to exactly one hook.
///
/// Pure classification: no side effects beyond invoking the handler.
pub fn dispatch<H: EventHandler + ?Sized>(event: &ServerEvent, handler: &mut H) {
    match event {
        ServerEvent::SessionCreated | ServerEvent::SessionUpdated => handler.on_session_update(),
        ServerEvent::SpeechStarted => handler.on_speech_started(),
        ServerEvent::SpeechStopped => handler.on_speech_stopped(),
        ServerEvent::TranscriptionDelta { delta } => handler.on_transcription_partial(delta),
        ServerEvent::TranscriptionCompleted { transcript } => {
            handler.on_transcription_completed(transcript);
        }
        ServerEvent::ResponseCreated => handler.on_response_started(),
        ServerEvent::ResponseTranscriptDelta { delta } => handler.on_response_transcript(delta),
        ServerEvent::ResponseTranscriptDone { transcript } => {
            handler.on_response_transcript(transcript);
        }
        ServerEvent::ResponseDone => handler.on_response_done(),
        ServerEvent::ErrorEvent { error } => {
            handler.on_error(error.code.as_deref(), &error.message);
        }
        ServerEvent::Unknown => {
            tracing::debug!("Ignoring unknown control event");
        }
    }
}

// ============================================================================
// Reply Accumulation
// ============================================================================

/// Accumulates one assistant reply from partial transcripts.
///
/// Partials apply idempotently: a cumulative partial is taken only when it
/// is strictly longer than the accumulated text, so duplicate or
/// out-of-order partials cannot corrupt the visible transcript.
#[derive(Debug, Clone, Default)]
pub struct ReplyBuffer {
    text: String,
}

impl ReplyBuffer {
    /// Fold a delta into the accumulated text.
    pub fn push_delta(&mut self, delta: &str) {
        if !delta.is_empty() {
            self.text.push_str(delta);
        }
    }

    /// Apply a cumulative partial. Returns whether it was taken.
    pub fn apply_partial(&mut self, partial: &str) -> bool {
        if partial.len() > self.text.len() {
            self.text = partial.to_string();
            true
        } else {
            false
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Take the accumulated reply, leaving the buffer empty for the next one.
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_events() {
        let event = ServerEvent::parse(r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":120}"#);
        assert!(matches!(event, ServerEvent::SpeechStarted));

        let event = ServerEvent::parse(
            r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"hello there"}"#,
        );
        match event {
            ServerEvent::TranscriptionCompleted { transcript } => {
                assert_eq!(transcript, "hello there");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let event = ServerEvent::parse(
            r#"{"type":"error","error":{"code":"rate_limited","message":"slow down"}}"#,
        );
        match event {
            ServerEvent::ErrorEvent { error } => {
                assert_eq!(error.code.as_deref(), Some("rate_limited"));
                assert_eq!(error.message, "slow down");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_tags_are_tolerated() {
        let event = ServerEvent::parse(r#"{"type":"rate_limits.updated","rate_limits":[]}"#);
        assert!(matches!(event, ServerEvent::Unknown));
    }

    #[test]
    fn malformed_frames_are_tolerated() {
        assert!(matches!(ServerEvent::parse("{not json"), ServerEvent::Unknown));
        assert!(matches!(ServerEvent::parse(r#"{"no_type":1}"#), ServerEvent::Unknown));
    }

    #[test]
    fn outbound_events_carry_the_type_tag() {
        let json = serde_json::to_value(ClientEvent::ResponseCreate).expect("serialize");
        assert_eq!(json["type"], "response.create");

        let json = serde_json::to_value(ClientEvent::ConversationItemCreate {
            item: ConversationItem::context("tuition is 120000"),
        })
        .expect("serialize");
        assert_eq!(json["type"], "conversation.item.create");
        assert_eq!(json["item"]["role"], "system");
        assert_eq!(json["item"]["content"][0]["type"], "input_text");
        assert_eq!(json["item"]["content"][0]["text"], "tuition is 120000");

        let json = serde_json::to_value(ClientEvent::ConversationItemCreate {
            item: ConversationItem::greeting_trigger("Please greet the caller."),
        })
        .expect("serialize");
        assert_eq!(json["item"]["role"], "user");
    }

    #[derive(Default)]
    struct RecordingHandler {
        calls: Vec<String>,
    }

    impl EventHandler for RecordingHandler {
        fn on_session_update(&mut self) {
            self.calls.push("session".into());
        }
        fn on_speech_started(&mut self) {
            self.calls.push("speech_start".into());
        }
        fn on_speech_stopped(&mut self) {
            self.calls.push("speech_stop".into());
        }
        fn on_transcription_partial(&mut self, delta: &str) {
            self.calls.push(format!("partial:{delta}"));
        }
        fn on_transcription_completed(&mut self, transcript: &str) {
            self.calls.push(format!("final:{transcript}"));
        }
        fn on_response_started(&mut self) {
            self.calls.push("response_start".into());
        }
        fn on_response_transcript(&mut self, partial: &str) {
            self.calls.push(format!("reply:{partial}"));
        }
        fn on_response_done(&mut self) {
            self.calls.push("response_done".into());
        }
        fn on_error(&mut self, code: Option<&str>, message: &str) {
            self.calls.push(format!("error:{}:{message}", code.unwrap_or("-")));
        }
    }

    #[test]
    fn each_event_maps_to_one_hook() {
        let mut handler = RecordingHandler::default();
        let events = [
            ServerEvent::SessionCreated,
            ServerEvent::SpeechStarted,
            ServerEvent::TranscriptionDelta { delta: "what".into() },
            ServerEvent::SpeechStopped,
            ServerEvent::TranscriptionCompleted { transcript: "what are the fees".into() },
            ServerEvent::ResponseCreated,
            ServerEvent::ResponseTranscriptDelta { delta: "The".into() },
            ServerEvent::ResponseDone,
            ServerEvent::Unknown,
        ];
        for event in &events {
            dispatch(event, &mut handler);
        }
        assert_eq!(
            handler.calls,
            vec![
                "session",
                "speech_start",
                "partial:what",
                "speech_stop",
                "final:what are the fees",
                "response_start",
                "reply:The",
                "response_done",
            ]
        );
    }

    #[test]
    fn reply_buffer_ignores_shorter_partials() {
        let mut buffer = ReplyBuffer::default();
        assert!(buffer.apply_partial("The fee"));
        assert!(buffer.apply_partial("The fee is 120000"));
        // Duplicate of an earlier partial arrives late
        assert!(!buffer.apply_partial("The fee"));
        assert_eq!(buffer.text(), "The fee is 120000");
    }

    #[test]
    fn reply_buffer_length_is_non_decreasing() {
        // For any interleaving of partials and the final, accumulated length
        // never shrinks and ends equal to the final text.
        let full = "The fee for the B.Tech program is 120000 per year.";
        let partials = [
            &full[..7],
            &full[..3],
            &full[..20],
            &full[..20],
            &full[..11],
            full,
            &full[..30],
        ];

        let mut buffer = ReplyBuffer::default();
        let mut previous_len = 0;
        for partial in partials {
            buffer.apply_partial(partial);
            assert!(buffer.text().len() >= previous_len);
            previous_len = buffer.text().len();
        }
        assert_eq!(buffer.text(), full);
    }

    #[test]
    fn reply_buffer_folds_deltas() {
        let mut buffer = ReplyBuffer::default();
        buffer.push_delta("The fee ");
        buffer.push_delta("is 120000.");
        assert_eq!(buffer.text(), "The fee is 120000.");

        let taken = buffer.take();
        assert_eq!(taken, "The fee is 120000.");
        assert!(buffer.is_empty());
    }
}
