//! Server backend for the Coedit real-time collaborative code editor.
//!
//! Clients connect over WebSockets, join a document, and exchange edit
//! operations, cursors, and chat. Concurrent edits are serialized into one
//! authoritative history by per-document single-writer sessions running an
//! operational-transform engine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

pub mod auth;
mod chat;
mod hub;
pub mod ot;
pub mod protocol;
mod session;
pub mod store;

use crate::auth::{AuthedUser, Role};
use crate::hub::SessionHub;
use crate::protocol::close;
use crate::session::close_with;
use crate::store::{Access, DocumentStore, FileStore};

/// Unique identifier for a document (and its chat room).
#[repr(align(64))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier([u8; Self::MAX_LEN]);

impl Identifier {
    /// Maximum length of a document ID, in bytes.
    pub const MAX_LEN: usize = 64;

    fn valid_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' ')
    }
}

impl FromStr for Identifier {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            anyhow::bail!("Document ID is empty");
        }
        if s.len() > Self::MAX_LEN {
            anyhow::bail!("Document ID is too long");
        }
        if !s.chars().all(Self::valid_char) {
            anyhow::bail!("Document ID contains invalid characters");
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self(bytes))
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(Self::MAX_LEN);
        std::str::from_utf8(&self.0[..len]).expect("Document ID contains invalid UTF-8")
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl Serialize for Identifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_ref())
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Server configuration, read from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HS256 secret used to verify connection tokens.
    pub jwt_secret: String,
    /// Whether tokenless connections may join public documents.
    pub allow_guests: bool,
    /// Cadence of periodic snapshot saves.
    pub snapshot_interval: Duration,
    /// Dirty-op count that triggers an early snapshot.
    pub snapshot_op_threshold: usize,
    /// Nominal size of the in-memory operation window per document.
    pub op_buffer_size: usize,
    /// Bound of each member's outbound queue before eviction.
    pub outbound_queue_max: usize,
    /// How long a socket write may stall before the member counts as a slow
    /// consumer.
    pub write_timeout: Duration,
    /// A socket with no inbound frame for this long is closed.
    pub read_idle_timeout: Duration,
    /// Members silent for this long are marked away; twice this forces a
    /// leave.
    pub presence_timeout: Duration,
    /// How long an empty session stays loaded for reconnects.
    pub grace_period: Duration,
    /// Capacity of each room's chat history ring.
    pub chat_history_size: usize,
    /// Continuous snapshot failure past this marks the session degraded.
    pub persist_fatal_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            allow_guests: true,
            snapshot_interval: Duration::from_secs(5),
            snapshot_op_threshold: 50,
            op_buffer_size: 1024,
            outbound_queue_max: 256,
            write_timeout: Duration::from_secs(10),
            read_idle_timeout: Duration::from_secs(90),
            presence_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(300),
            chat_history_size: 1000,
            persist_fatal_timeout: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above. `JWT_SECRET` is required.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            jwt_secret: std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            allow_guests: env_flag("ALLOW_GUESTS", defaults.allow_guests)?,
            snapshot_interval: env_ms("SNAPSHOT_INTERVAL_MS", defaults.snapshot_interval)?,
            snapshot_op_threshold: defaults.snapshot_op_threshold,
            op_buffer_size: env_usize("OP_BUFFER_SIZE", defaults.op_buffer_size)?,
            outbound_queue_max: env_usize("OUTBOUND_QUEUE_MAX", defaults.outbound_queue_max)?,
            write_timeout: defaults.write_timeout,
            read_idle_timeout: env_ms("READ_IDLE_TIMEOUT_MS", defaults.read_idle_timeout)?,
            presence_timeout: env_ms("PRESENCE_TIMEOUT_MS", defaults.presence_timeout)?,
            grace_period: env_ms("GRACE_PERIOD_MS", defaults.grace_period)?,
            chat_history_size: env_usize("CHAT_HISTORY_SIZE", defaults.chat_history_size)?,
            persist_fatal_timeout: defaults.persist_fatal_timeout,
        })
    }
}

fn env_ms(name: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => {
            let ms: u64 = raw.parse().with_context(|| format!("Unable to parse {name}"))?;
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(default),
    }
}

fn env_usize(name: &str, default: usize) -> anyhow::Result<usize> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().with_context(|| format!("Unable to parse {name}")),
        Err(_) => Ok(default),
    }
}

fn env_flag(name: &str, default: bool) -> anyhow::Result<bool> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().with_context(|| format!("Unable to parse {name}")),
        Err(_) => Ok(default),
    }
}

/// The shared state of the server, accessible from request handlers.
pub struct ServerState {
    config: Arc<ServerConfig>,
    store: Arc<dyn DocumentStore>,
    hub: Arc<SessionHub>,
    start_time: u64,
}

impl ServerState {
    /// Construct server state backed by a [`FileStore`] at `storage`.
    pub async fn new(config: ServerConfig, storage: PathBuf) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(FileStore::new(storage).await?);
        Ok(Self::with_store(config, store))
    }

    /// Construct server state over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Arc<Self> {
        let config = Arc::new(config);
        let hub = SessionHub::new(Arc::clone(&store), Arc::clone(&config));
        let start_time = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Arc::new(Self {
            config,
            store,
            hub,
            start_time,
        })
    }

    /// State with a throwaway storage directory and a fixed test secret.
    pub async fn temporary() -> anyhow::Result<Arc<Self>> {
        Self::temporary_with(ServerConfig {
            jwt_secret: "test-secret".to_string(),
            ..ServerConfig::default()
        })
        .await
    }

    /// Like [`ServerState::temporary`] with explicit configuration.
    pub async fn temporary_with(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(FileStore::temporary().await?);
        Ok(Self::with_store(config, store))
    }

    /// The persistence adapter backing this server.
    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }

    /// Drain all sessions, persisting final snapshots. Called on shutdown.
    pub async fn persist(&self) {
        self.hub.shutdown().await;
    }
}

/// Statistics about the server, returned from an API endpoint.
#[derive(Serialize)]
struct Stats {
    /// System time when the server started, in seconds since Unix epoch.
    start_time: u64,
    /// Number of live in-memory sessions.
    num_sessions: usize,
    /// Number of documents persisted in the store.
    num_documents: usize,
}

/// Build the server router: the WebSocket gateway plus the read-only
/// document and stats endpoints.
pub fn server(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/socket/{id}", get(socket_handler))
        .route("/api/text/{id}", get(text_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SocketQuery {
    token: Option<String>,
}

/// Handler for the `/api/socket/{id}` endpoint.
async fn socket_handler(
    Path(id): Path<Identifier>,
    Query(query): Query<SocketQuery>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    info!("socket connection for id = {}", id);
    let token = bearer
        .map(|TypedHeader(Authorization(b))| b.token().to_string())
        .or(query.token);
    ws.on_upgrade(move |socket| admit(socket, id, token, state))
}

/// The gateway proper. Authentication and authorization failures are final:
/// the socket is closed with a policy code and never reaches a session.
async fn admit(
    socket: axum::extract::ws::WebSocket,
    id: Identifier,
    token: Option<String>,
    state: Arc<ServerState>,
) {
    let user = match token {
        Some(token) => match auth::verify(&token, &state.config.jwt_secret) {
            Ok(user) => user,
            Err(e) => {
                info!("rejecting connection to {}: {:#}", id, e);
                return close_with(socket, close::POLICY, "auth").await;
            }
        },
        None => {
            if !state.config.allow_guests {
                info!("rejecting tokenless connection to {}", id);
                return close_with(socket, close::POLICY, "auth").await;
            }
            AuthedUser::guest()
        }
    };

    let access = if user.role == Role::Admin {
        Access::Edit
    } else {
        let subject = (!user.is_guest()).then_some(user.user_id.as_str());
        match state.store.resolve_access(subject, &id).await {
            Ok(access) => access,
            Err(e) => {
                error!("access resolution for {} failed: {}", id, e);
                return close_with(socket, close::INTERNAL, "internal").await;
            }
        }
    };
    if access == Access::None {
        info!("user {} is forbidden on {}", user.user_id, id);
        return close_with(socket, close::POLICY, "forbidden").await;
    }

    state.hub.attach(&id, socket, user, access).await;
}

/// Handler for the `/api/text/{id}` endpoint.
async fn text_handler(Path(id): Path<Identifier>, State(state): State<Arc<ServerState>>) -> String {
    match state.hub.text(&id).await {
        Some(text) => text,
        None => state
            .store
            .load_snapshot(&id)
            .await
            .map(|snapshot| snapshot.content)
            .unwrap_or_default(),
    }
}

/// Handler for the `/api/stats` endpoint.
async fn stats_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let num_documents = state.store.document_count().await.unwrap_or(0);
    Json(Stats {
        start_time: state.start_time,
        num_sessions: state.hub.session_count(),
        num_documents,
    })
}
