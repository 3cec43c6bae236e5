//! Offer/answer negotiation and relay server discovery.
//!
//! The negotiation endpoint proxies our offer descriptor to the remote
//! backend and returns the answer descriptor as opaque text. Failure
//! responses carry a machine-readable code and a human-readable suggestion;
//! both are classification hints for the user-facing explanation, not
//! structured retry signals.

use crate::error::{NegotiationErrorKind, SessionError, SessionResult};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters for one negotiation round.
#[derive(Debug, Clone, Serialize)]
pub struct NegotiationRequest {
    pub session_id: String,
    /// Locally-generated offer descriptor, opaque to this client.
    pub offer: String,
    pub instructions: String,
    pub voice: String,
}

#[derive(Debug, Deserialize)]
struct NegotiationFailure {
    #[serde(default)]
    code: String,
    #[serde(default)]
    suggestion: Option<String>,
}

/// Client for the transport negotiation endpoint.
pub struct NegotiationClient {
    client: Client,
    url: String,
}

impl NegotiationClient {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.to_string(),
        }
    }

    /// Send the offer and wait for the answer descriptor.
    pub async fn negotiate(&self, request: &NegotiationRequest) -> SessionResult<String> {
        let resp = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let failure: NegotiationFailure =
                serde_json::from_str(&body).unwrap_or(NegotiationFailure {
                    code: String::new(),
                    suggestion: None,
                });
            let kind = NegotiationErrorKind::from_code(&failure.code);
            let suggestion = failure
                .suggestion
                .unwrap_or_else(|| kind.explanation().to_string());
            tracing::warn!(
                status = %status,
                kind = %kind,
                "Negotiation rejected"
            );
            return Err(SessionError::Negotiation { kind, suggestion });
        }

        let answer = resp.text().await.map_err(|e| {
            SessionError::Internal(format!("failed to read answer descriptor: {e}"))
        })?;
        if answer.trim().is_empty() {
            return Err(SessionError::Negotiation {
                kind: NegotiationErrorKind::Rejected,
                suggestion: NegotiationErrorKind::Rejected.explanation().to_string(),
            });
        }
        Ok(answer)
    }
}

/// Classify a request-level failure into the negotiation taxonomy.
fn classify_transport_error(e: reqwest::Error) -> SessionError {
    if e.is_timeout() {
        return SessionError::Timeout;
    }

    let message = e.to_string().to_lowercase();
    let kind = if message.contains("dns") || message.contains("resolve") {
        NegotiationErrorKind::Dns
    } else if message.contains("certificate") || message.contains("tls") {
        NegotiationErrorKind::Certificate
    } else {
        NegotiationErrorKind::Unreachable
    };

    SessionError::Negotiation {
        kind,
        suggestion: kind.explanation().to_string(),
    }
}

// ============================================================================
// Relay Server Discovery
// ============================================================================

/// One relay/reflection server descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Fixed public fallback used when the upstream list is empty or unreachable.
pub fn default_ice_servers() -> Vec<IceServer> {
    ["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"]
        .into_iter()
        .map(|url| IceServer {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        })
        .collect()
}

/// Client for the relay server list endpoint.
pub struct IceClient {
    client: Client,
    url: String,
}

impl IceClient {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.to_string(),
        }
    }

    /// Fetch the relay list, falling back to the public defaults on an
    /// empty or failed response.
    pub async fn servers(&self) -> Vec<IceServer> {
        let fetched: Option<Vec<IceServer>> = match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "Relay list request failed");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Relay list unreachable");
                None
            }
        };

        match fetched {
            Some(servers) if !servers.is_empty() => servers,
            _ => {
                tracing::debug!("Using default relay servers");
                default_ice_servers()
            }
        }
    }
}
