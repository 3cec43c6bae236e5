//! Realtime transport: negotiation plus the control channel.
//!
//! The control channel is a message-oriented duplex stream carrying the
//! JSON events of [`crate::events`]. A live session surfaces link health
//! through a watch channel: transport-level connectivity flips on socket
//! state, media-level connectivity flips once the backend acknowledges the
//! session on the open channel.

use crate::error::{NegotiationErrorKind, SessionError, SessionResult};
use crate::events::{ClientEvent, ServerEvent};
use crate::negotiation::{IceClient, NegotiationClient, NegotiationRequest};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

/// Link-level health of a live transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkHealth {
    /// The underlying socket is up.
    pub transport_connected: bool,
    /// The backend acknowledged the session on the open channel.
    pub media_connected: bool,
}

impl LinkHealth {
    /// Both signals true: the state in which the retry counter may reset.
    pub fn fully_connected(&self) -> bool {
        self.transport_connected && self.media_connected
    }
}

/// Session parameters for one connection attempt.
#[derive(Debug, Clone)]
pub struct SessionOffer {
    pub session_id: String,
    /// Locally-generated offer descriptor, opaque beyond this client.
    pub offer: String,
    pub instructions: String,
    pub voice: String,
}

/// A live media+control session handed to the orchestrator.
pub struct TransportSession {
    /// Inbound control events, in arrival order.
    pub events: mpsc::Receiver<ServerEvent>,
    /// Outbound control messages. Dropping every sender closes the channel.
    pub outbound: mpsc::Sender<ClientEvent>,
    /// Link health signals.
    pub health: watch::Receiver<LinkHealth>,
}

/// Transport seam: negotiate a session and open its control channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, offer: SessionOffer) -> SessionResult<TransportSession>;
}

/// Production transport: HTTP offer/answer negotiation, relay discovery,
/// then a WebSocket control channel.
pub struct RealtimeTransport {
    negotiation: NegotiationClient,
    ice: IceClient,
    control_url: String,
    ice_timeout: Duration,
}

impl RealtimeTransport {
    pub fn new(config: &voxa_common::config::RealtimeConfig) -> Self {
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        Self {
            negotiation: NegotiationClient::new(&config.negotiation_url, connect_timeout),
            ice: IceClient::new(&config.ice_url, Duration::from_millis(config.ice_timeout_ms)),
            control_url: config.control_url.clone(),
            ice_timeout: Duration::from_millis(config.ice_timeout_ms),
        }
    }
}

#[async_trait]
impl Transport for RealtimeTransport {
    async fn connect(&self, offer: SessionOffer) -> SessionResult<TransportSession> {
        // Candidate gathering is time-boxed separately from the negotiation;
        // the fixed default list covers a slow or empty upstream.
        let servers = match tokio::time::timeout(self.ice_timeout, self.ice.servers()).await {
            Ok(servers) => servers,
            Err(_) => crate::negotiation::default_ice_servers(),
        };
        tracing::debug!(relay_servers = servers.len(), "Gathered relay servers");

        let request = NegotiationRequest {
            session_id: offer.session_id.clone(),
            offer: offer.offer.clone(),
            instructions: offer.instructions.clone(),
            voice: offer.voice.clone(),
        };
        let answer = self.negotiation.negotiate(&request).await?;
        tracing::debug!(
            session_id = %offer.session_id,
            answer_bytes = answer.len(),
            "Session negotiated"
        );

        let url = format!("{}?session={}", self.control_url, offer.session_id);
        let (ws, _resp) = tokio_tungstenite::connect_async(&url).await.map_err(|e| {
            SessionError::Negotiation {
                kind: NegotiationErrorKind::Unreachable,
                suggestion: format!("control channel connect failed: {e}"),
            }
        })?;

        let (mut write, mut read) = ws.split();
        let (event_tx, events) = mpsc::channel::<ServerEvent>(64);
        let (outbound, mut out_rx) = mpsc::channel::<ClientEvent>(64);
        let (health_tx, health) = watch::channel(LinkHealth {
            transport_connected: true,
            media_connected: false,
        });

        let session_id = offer.session_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_out = out_rx.recv() => {
                        let Some(event) = maybe_out else {
                            // Session torn down locally
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        };
                        let frame = match serde_json::to_string(&event) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::error!(error = %e, "Unserializable control event");
                                continue;
                            }
                        };
                        if write.send(Message::Text(frame)).await.is_err() {
                            tracing::warn!(session_id = %session_id, "Control channel send failed");
                            health_tx.send_modify(|h| h.transport_connected = false);
                            break;
                        }
                    }
                    maybe_msg = read.next() => {
                        match maybe_msg {
                            Some(Ok(Message::Text(text))) => {
                                let event = ServerEvent::parse(&text);
                                if matches!(
                                    event,
                                    ServerEvent::SessionCreated | ServerEvent::SessionUpdated
                                ) {
                                    health_tx.send_modify(|h| h.media_connected = true);
                                }
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::info!(session_id = %session_id, "Control channel closed");
                                health_tx.send_modify(|h| h.transport_connected = false);
                                break;
                            }
                            Some(Err(e)) => {
                                tracing::warn!(session_id = %session_id, error = %e, "Control channel failed");
                                health_tx.send_modify(|h| h.transport_connected = false);
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        Ok(TransportSession {
            events,
            outbound,
            health,
        })
    }
}
