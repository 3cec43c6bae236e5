//! Realtime session orchestration for the Voxa voice agent.
//!
//! Supervises one live media+control session against the remote speech
//! backend: event dispatch, context injection, transcript accumulation,
//! and automatic reconnection with backoff. Conversational state survives
//! transient transport failures; the session id is stable across retries.

pub mod audio;
pub mod error;
pub mod events;
pub mod negotiation;
pub mod orchestrator;
pub mod retry;
pub mod transcript;
pub mod transport;

pub use audio::{AudioSource, AudioTrack, NoopAudioSource};
pub use error::{NegotiationErrorKind, SessionError, SessionResult};
pub use events::{dispatch, ClientEvent, EventHandler, ReplyBuffer, ServerEvent};
pub use orchestrator::{SessionNotice, SessionOrchestrator, SessionState};
pub use retry::{retry_with_policy, RetryPolicy};
pub use transcript::{Exchange, PersistenceClient, Role, TranscriptAccumulator};
pub use transport::{LinkHealth, RealtimeTransport, SessionOffer, Transport, TransportSession};

#[cfg(feature = "mic")]
pub use audio::MicSource;
