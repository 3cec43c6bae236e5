//! Error types for the session orchestrator.

use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Classified negotiation failure causes.
///
/// Classification hints, not structured retry signals: each cause maps to a
/// distinct user-facing explanation and remediation hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationErrorKind {
    /// The remote backend rejected the offer.
    Rejected,
    /// Traffic appears blocked by a firewall or proxy.
    NetworkBlocked,
    /// TLS certificate validation failed.
    Certificate,
    /// Name resolution failed.
    Dns,
    /// The endpoint could not be reached at all.
    Unreachable,
}

impl NegotiationErrorKind {
    /// Map a machine-readable error code from the negotiation endpoint.
    pub fn from_code(code: &str) -> Self {
        match code {
            "rejected" | "offer_rejected" => Self::Rejected,
            "network_blocked" | "blocked" => Self::NetworkBlocked,
            "certificate" | "tls" => Self::Certificate,
            "dns" => Self::Dns,
            _ => Self::Unreachable,
        }
    }

    /// Remediation hint shown when the endpoint supplied none.
    pub fn explanation(&self) -> &'static str {
        match self {
            Self::Rejected => "The voice backend rejected the session request. Try again shortly.",
            Self::NetworkBlocked => {
                "A firewall or proxy appears to be blocking the connection. \
                 Check your network settings or switch networks."
            }
            Self::Certificate => {
                "Secure connection could not be verified. Check your system \
                 clock and certificate store."
            }
            Self::Dns => "The voice backend hostname could not be resolved. Check your DNS settings.",
            Self::Unreachable => "The voice backend could not be reached. Check your connection.",
        }
    }
}

impl std::fmt::Display for NegotiationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Rejected => "rejected",
            Self::NetworkBlocked => "network-blocked",
            Self::Certificate => "certificate",
            Self::Dns => "dns",
            Self::Unreachable => "unreachable",
        };
        write!(f, "{name}")
    }
}

/// Session error type.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No microphone, or permission denied. Fatal for the current connect
    /// attempt; not retried without caller intervention.
    #[error("Audio device unavailable: {0}")]
    Device(String),

    /// Transport negotiation failed; retried by the reconnect controller.
    #[error("Negotiation failed ({kind}): {suggestion}")]
    Negotiation {
        kind: NegotiationErrorKind,
        suggestion: String,
    },

    /// The control channel closed underneath us.
    #[error("Control channel closed")]
    ChannelClosed,

    /// A bounded wait elapsed.
    #[error("Connection attempt timed out")]
    Timeout,

    /// The retry ceiling was reached. Surfaced to the caller exactly once.
    #[error("Connection failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Precondition violation on the session state machine.
    #[error("Session is {state}, cannot {operation}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Whether the reconnect controller may schedule another attempt.
    ///
    /// Device and precondition errors have no sensible retry; exhaustion is
    /// already terminal.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Device(_) | Self::InvalidState { .. } | Self::RetriesExhausted { .. }
        )
    }
}
