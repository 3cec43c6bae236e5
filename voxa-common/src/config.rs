//! Configuration management for Voxa services.
//!
//! All Voxa services share a unified configuration file at `~/.voxa/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Explicit config file values
//! 2. Environment variables (VOXA_* prefix)
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `VOXA_NEGOTIATION_URL` → realtime.negotiation_url
//! - `VOXA_CONTROL_URL` → realtime.control_url
//! - `VOXA_ICE_URL` → realtime.ice_url
//! - `VOXA_VOICE` → realtime.voice
//! - `VOXA_VECTOR_STORE_URL` → retrieval.vector_store_url
//! - `VOXA_EMBEDDING_URL` → retrieval.embedding_url
//! - `VOXA_PERSISTENCE_URL` → persistence.endpoint
//! - `VOXA_LOG_LEVEL` → observability.log_level
//! - `VOXA_BIND_ADDRESS` → network.bind

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".voxa"),
        |dirs| dirs.home_dir().join(".voxa"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Network Configuration
// ============================================================================

/// Bind address for the retrieval HTTP surface.
///
/// Default is `127.0.0.1` (local only). Set to `0.0.0.0` for remote access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the retrieval HTTP surface.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    7340
}

// ============================================================================
// Realtime Session Configuration
// ============================================================================

/// Settings for establishing and supervising the realtime session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Offer/answer negotiation endpoint (HTTP POST).
    #[serde(default = "default_negotiation_url")]
    pub negotiation_url: String,

    /// Control channel endpoint (WebSocket).
    #[serde(default = "default_control_url")]
    pub control_url: String,

    /// ICE/relay server list endpoint (HTTP GET).
    #[serde(default = "default_ice_url")]
    pub ice_url: String,

    /// Voice identifier sent with the negotiation request.
    #[serde(default = "default_voice")]
    pub voice: String,

    /// Static system prompt for the conversation.
    #[serde(default = "default_instructions")]
    pub instructions: String,

    /// How many prior exchanges to fold into the instructions on reconnect.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Bound on ICE candidate gathering, milliseconds.
    #[serde(default = "default_ice_timeout_ms")]
    pub ice_timeout_ms: u64,

    /// Bound on the full connection handshake, milliseconds. Kept shorter
    /// than the backend's own internal timeout so local failure is detected
    /// first.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bound on local audio device acquisition, milliseconds.
    #[serde(default = "default_device_timeout_ms")]
    pub device_timeout_ms: u64,

    /// Whether the orchestrator schedules reconnects on link failure.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            negotiation_url: default_negotiation_url(),
            control_url: default_control_url(),
            ice_url: default_ice_url(),
            voice: default_voice(),
            instructions: default_instructions(),
            history_window: default_history_window(),
            ice_timeout_ms: default_ice_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            device_timeout_ms: default_device_timeout_ms(),
            auto_reconnect: true,
        }
    }
}

fn default_negotiation_url() -> String {
    "http://127.0.0.1:7341/api/v1/realtime/negotiate".into()
}

fn default_control_url() -> String {
    "ws://127.0.0.1:7341/api/v1/realtime/channel".into()
}

fn default_ice_url() -> String {
    "http://127.0.0.1:7341/api/v1/realtime/ice".into()
}

fn default_voice() -> String {
    "verse".into()
}

fn default_instructions() -> String {
    "You are a helpful voice assistant. Answer only from the provided \
     context; if no context is available, politely redirect the caller \
     to topics you can help with."
        .into()
}

fn default_history_window() -> usize {
    6
}

fn default_ice_timeout_ms() -> u64 {
    2_000
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_device_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Retrieval Configuration
// ============================================================================

/// Settings for the context retrieval service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Qdrant endpoint URL.
    #[serde(default = "default_vector_store_url")]
    pub vector_store_url: String,

    /// Collection holding the knowledge chunks.
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Vector width of the collection.
    #[serde(default = "default_vector_dimension")]
    pub vector_dimension: usize,

    /// Base URL of the OpenAI-compatible embeddings endpoint.
    #[serde(default = "default_embedding_url")]
    pub embedding_url: String,

    /// Embedding model name.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Native output width of the embedding model. Padded up to
    /// `vector_dimension` when smaller.
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,

    /// Number of nearest chunks requested per query.
    #[serde(default = "default_match_count")]
    pub match_count: u64,

    /// Number of nearest chunks requested on the prewarm path.
    #[serde(default = "default_prewarm_match_count")]
    pub prewarm_match_count: u64,

    /// Minimum top similarity for context to be injected at all.
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,

    /// Client-side bound on every retrieval network call, milliseconds.
    #[serde(default = "default_retrieval_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_store_url: default_vector_store_url(),
            collection: default_collection(),
            vector_dimension: default_vector_dimension(),
            embedding_url: default_embedding_url(),
            embedding_model: default_embedding_model(),
            embedding_dimension: default_embedding_dimension(),
            match_count: default_match_count(),
            prewarm_match_count: default_prewarm_match_count(),
            relevance_threshold: default_relevance_threshold(),
            timeout_ms: default_retrieval_timeout_ms(),
        }
    }
}

fn default_vector_store_url() -> String {
    "http://localhost:6334".into()
}

fn default_collection() -> String {
    "voxa_knowledge".into()
}

fn default_vector_dimension() -> usize {
    768
}

fn default_embedding_url() -> String {
    "http://localhost:11434".into()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".into()
}

fn default_embedding_dimension() -> usize {
    768
}

fn default_match_count() -> u64 {
    3
}

fn default_prewarm_match_count() -> u64 {
    2
}

fn default_relevance_threshold() -> f32 {
    0.25
}

fn default_retrieval_timeout_ms() -> u64 {
    2_000
}

// ============================================================================
// Persistence Configuration
// ============================================================================

/// Settings for the external conversation persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Endpoint accepting conversation submissions (HTTP POST).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Source tag attached to every submission.
    #[serde(default = "default_source_tag")]
    pub source_tag: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            source_tag: default_source_tag(),
        }
    }
}

fn default_source_tag() -> String {
    "voxa-voice".into()
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Reconnect policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Hard ceiling on connection attempts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds (doubles with each attempt).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Base log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Output format: "json" or "pretty".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Unified configuration for all Voxa services.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub realtime: RealtimeConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable fallbacks.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("VOXA_NEGOTIATION_URL") {
            self.realtime.negotiation_url = url;
        }
        if let Ok(url) = std::env::var("VOXA_CONTROL_URL") {
            self.realtime.control_url = url;
        }
        if let Ok(url) = std::env::var("VOXA_ICE_URL") {
            self.realtime.ice_url = url;
        }
        if let Ok(voice) = std::env::var("VOXA_VOICE") {
            self.realtime.voice = voice;
        }
        if let Ok(url) = std::env::var("VOXA_VECTOR_STORE_URL") {
            self.retrieval.vector_store_url = url;
        }
        if let Ok(url) = std::env::var("VOXA_EMBEDDING_URL") {
            self.retrieval.embedding_url = url;
        }
        if let Ok(url) = std::env::var("VOXA_PERSISTENCE_URL") {
            self.persistence.endpoint = Some(url);
        }
        if let Ok(level) = std::env::var("VOXA_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(bind) = std::env::var("VOXA_BIND_ADDRESS") {
            self.network.bind = bind;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.network.bind, "127.0.0.1");
        assert_eq!(config.retrieval.match_count, 3);
        assert!((config.retrieval.relevance_threshold - 0.25).abs() < f32::EPSILON);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 2_000);
        assert!(config.realtime.auto_reconnect);
    }

    #[test]
    fn connect_timeout_shorter_than_backend_default() {
        // Local failure must be detected before the backend's own timeout.
        let config = Config::default();
        assert!(config.realtime.connect_timeout_ms < 30_000);
        assert!(config.realtime.ice_timeout_ms < config.realtime.connect_timeout_ms);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"retrieval": {"relevance_threshold": 0.4, "collection": "campus"}}"#,
        )
        .expect("write config");

        let config = Config::load_from(&path).expect("load");
        assert!((config.retrieval.relevance_threshold - 0.4).abs() < f32::EPSILON);
        assert_eq!(config.retrieval.collection, "campus");
        // Untouched sections fall back to defaults
        assert_eq!(config.retrieval.match_count, 3);
        assert_eq!(config.realtime.voice, "verse");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").expect("write config");
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        std::env::set_var("VOXA_VOICE", "cedar");
        std::env::set_var("VOXA_LOG_LEVEL", "debug");
        config.apply_env_overrides();
        std::env::remove_var("VOXA_VOICE");
        std::env::remove_var("VOXA_LOG_LEVEL");

        assert_eq!(config.realtime.voice, "cedar");
        assert_eq!(config.observability.log_level, "debug");
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).expect("serialize");
        let back: Config = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.retrieval.collection, config.retrieval.collection);
        assert_eq!(back.retry.max_attempts, config.retry.max_attempts);
    }
}
