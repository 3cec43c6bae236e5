//! Voxa Agent - Main entry point.
//!
//! Serves the retrieval HTTP surface and opens a voice session against the
//! remote speech backend, logging session notices until shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use voxa_common::config::Config;
use voxa_common::logging::init_logging;
use voxa_retrieval::{
    retrieval_router, ContextService, HttpEmbedding, QdrantContextStore, RetrievalState,
};
use voxa_session::orchestrator::{SessionNotice, SessionOrchestrator};
use voxa_session::transport::RealtimeTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load_with_env()?;

    // Initialize logging
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Voxa Agent v{}", env!("CARGO_PKG_VERSION"));

    // Wire the retrieval service: local embeddings plus the vector store
    let embedder = Arc::new(HttpEmbedding::new(
        &config.retrieval.embedding_url,
        config.retrieval.embedding_model.clone(),
        config.retrieval.embedding_dimension,
        Duration::from_millis(config.retrieval.timeout_ms),
    ));
    let store = Arc::new(
        QdrantContextStore::connect(
            &config.retrieval.vector_store_url,
            &config.retrieval.collection,
            config.retrieval.vector_dimension,
        )
        .map_err(|e| anyhow::anyhow!("vector store: {e}"))?,
    );
    let context = ContextService::new(embedder, store, config.retrieval.clone());

    // Retrieval HTTP surface
    let router = retrieval_router(Arc::new(RetrievalState {
        service: context.clone(),
    }));
    let addr = format!("{}:{}", config.network.bind, config.network.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "Retrieval surface listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Retrieval server exited");
        }
    });

    // Voice session
    let transport = Arc::new(RealtimeTransport::new(&config.realtime));
    let (orchestrator, mut notices) =
        SessionOrchestrator::new(&config, transport, audio_source(), context);

    let session = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        if let Err(e) = session.connect().await {
            tracing::error!(error = %e, "Session failed");
        }
    });

    loop {
        tokio::select! {
            maybe_notice = notices.recv() => {
                match maybe_notice {
                    Some(SessionNotice::Connected) => tracing::info!("Voice session connected"),
                    Some(SessionNotice::Reconnecting { attempt }) => {
                        tracing::info!(attempt, "Voice session reconnecting");
                    }
                    Some(SessionNotice::ContextInjected { chunks }) => {
                        tracing::info!(chunks, "Context injected");
                    }
                    Some(SessionNotice::Ended { exchanges }) => {
                        tracing::info!(exchanges = exchanges.len(), "Conversation ended");
                    }
                    Some(SessionNotice::Failed { reason }) => {
                        tracing::error!(reason = %reason, "Voice session failed");
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                orchestrator.disconnect().await;
                break;
            }
        }
    }

    Ok(())
}

#[cfg(feature = "mic")]
fn audio_source() -> Arc<dyn voxa_session::audio::AudioSource> {
    Arc::new(voxa_session::audio::MicSource::default())
}

#[cfg(not(feature = "mic"))]
fn audio_source() -> Arc<dyn voxa_session::audio::AudioSource> {
    Arc::new(voxa_session::audio::NoopAudioSource)
}
