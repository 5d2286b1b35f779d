//! Registry of live document sessions.
//!
//! The hub owns the only cross-session shared map. It finds or creates the
//! session for a document, hands connections over, and reaps sessions whose
//! member set has been empty past the grace period. It never touches session
//! internals after creation; everything goes through the session inbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocket;
use dashmap::DashMap;
use tokio::sync::{Mutex, oneshot};
use tokio::time::{self, Duration};
use tracing::{info, warn};

use crate::auth::AuthedUser;
use crate::chat::ChatRoom;
use crate::session::{DocumentSession, Event, SessionHandle, close_with, now_ms};
use crate::store::{Access, DocumentStore, Snapshot, StoreError};
use crate::{Identifier, ServerConfig};
use crate::protocol::close;

/// The permanent chat room: its history is parked here when the session
/// unloads and rehydrated on the next join.
const GENERAL_ROOM: &str = "general";

/// Process-wide registry of live [`DocumentSession`]s.
pub(crate) struct SessionHub {
    sessions: Arc<DashMap<Identifier, SessionHandle>>,
    store: Arc<dyn DocumentStore>,
    config: Arc<ServerConfig>,
    parked_chat: Mutex<HashMap<Identifier, ChatRoom>>,
}

impl SessionHub {
    /// Create the hub and start its janitor task.
    pub(crate) fn new(store: Arc<dyn DocumentStore>, config: Arc<ServerConfig>) -> Arc<Self> {
        let hub = Arc::new(Self {
            sessions: Arc::new(DashMap::new()),
            store,
            config,
            parked_chat: Mutex::new(HashMap::new()),
        });
        tokio::spawn(janitor(Arc::clone(&hub)));
        hub
    }

    /// Deliver an authorized connection to its document session, creating
    /// the session on first join. Closes the socket itself on failure.
    pub(crate) async fn attach(
        &self,
        id: &Identifier,
        socket: WebSocket,
        user: AuthedUser,
        access: Access,
    ) {
        let mut event = Event::Join { socket, user, access };
        // a handle can go stale if its dispatcher just unloaded; retire it
        // and recreate once
        for _ in 0..2 {
            let handle = match self.get_or_create(id).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("failed to open session for {}: {:#}", id, e);
                    if let Event::Join { socket, .. } = event {
                        close_with(socket, close::INTERNAL, "internal").await;
                    }
                    return;
                }
            };
            match handle.inbox.send(event) {
                Ok(()) => return,
                Err(stale) => {
                    self.sessions.remove(id);
                    event = stale.0;
                }
            }
        }
        if let Event::Join { socket, .. } = event {
            close_with(socket, close::INTERNAL, "internal").await;
        }
    }

    async fn get_or_create(&self, id: &Identifier) -> Result<SessionHandle> {
        if let Some(handle) = self.sessions.get(id) {
            return Ok(handle.value().clone());
        }
        // load outside the map entry so a slow store cannot stall other
        // documents; a racing creator wins below
        let snapshot = match self.store.load_snapshot(id).await {
            Ok(snapshot) => snapshot,
            Err(StoreError::NotFound) => Snapshot::empty(),
            Err(e) => return Err(e).context("loading document snapshot"),
        };
        let chat = self
            .parked_chat
            .lock()
            .await
            .remove(id)
            .unwrap_or_else(|| ChatRoom::new(self.config.chat_history_size));

        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(entry) => {
                // lost the creation race; hand the chat state back, after
                // releasing the map shard (never await while holding it)
                let handle = entry.get().clone();
                drop(entry);
                if id.as_ref() == GENERAL_ROOM {
                    self.parked_chat.lock().await.insert(id.clone(), chat);
                }
                Ok(handle)
            }
            Entry::Vacant(entry) => {
                info!("creating session for id = {}", id);
                let (handle, task) = DocumentSession::spawn(
                    id.clone(),
                    snapshot,
                    chat,
                    Arc::clone(&self.config),
                    Arc::clone(&self.store),
                );
                entry.insert(handle.clone());
                // watchdog: a panicking dispatcher must not take down the
                // process; drop the broken session so the next join reloads
                // from the last snapshot
                let sessions = Arc::clone(&self.sessions);
                let id = id.clone();
                tokio::spawn(async move {
                    if let Err(e) = task.await
                        && e.is_panic()
                    {
                        warn!("session dispatcher for {} panicked; unloading", id);
                        sessions.remove(&id);
                    }
                });
                Ok(handle)
            }
        }
    }

    /// Current document content, from the live session if there is one.
    pub(crate) async fn text(&self, id: &Identifier) -> Option<String> {
        let handle = self.sessions.get(id).map(|h| h.value().clone())?;
        let (tx, rx) = oneshot::channel();
        handle.inbox.send(Event::Text { reply: tx }).ok()?;
        rx.await.ok()
    }

    /// Number of live sessions.
    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drain every session, persisting final snapshots.
    pub(crate) async fn shutdown(&self) {
        let ids: Vec<Identifier> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.drain(&id, true).await;
        }
    }

    /// Ask a session to unload. Returns whether it is gone.
    async fn drain(&self, id: &Identifier, force: bool) -> bool {
        let Some(handle) = self.sessions.get(id).map(|h| h.value().clone()) else {
            return true;
        };
        let (tx, rx) = oneshot::channel();
        if handle.inbox.send(Event::Drain { force, reply: tx }).is_err() {
            self.sessions.remove(id);
            return true;
        }
        match time::timeout(Duration::from_secs(30), rx).await {
            Ok(Ok(outcome)) if outcome.unloaded => {
                self.sessions.remove(id);
                if id.as_ref() == GENERAL_ROOM
                    && let Some(chat) = outcome.chat
                    && chat.message_count() > 0
                {
                    self.parked_chat.lock().await.insert(id.clone(), chat);
                }
                true
            }
            Ok(Ok(_)) => false, // refused: members present or final save failed
            Ok(Err(_)) | Err(_) => {
                self.sessions.remove(id);
                true
            }
        }
    }
}

/// Periodically unloads sessions that have sat empty past the grace period.
async fn janitor(hub: Arc<SessionHub>) {
    let sweep = (hub.config.grace_period / 4)
        .max(Duration::from_millis(50))
        .min(Duration::from_secs(30));
    let mut interval = time::interval(sweep);
    loop {
        interval.tick().await;
        let grace = hub.config.grace_period.as_millis() as u64;
        let mut expired = Vec::new();
        for entry in hub.sessions.iter() {
            let since = entry.value().empty_since.load(Ordering::Relaxed);
            if since != 0 && now_ms().saturating_sub(since) >= grace {
                expired.push(entry.key().clone());
            }
        }
        for id in expired {
            info!("grace period expired for empty session {}", id);
            if !hub.drain(&id, false).await {
                // final save failed or a member came back; restart the clock
                // unless the session is occupied again
                if let Some(handle) = hub.sessions.get(&id) {
                    let since = handle.empty_since.load(Ordering::Relaxed);
                    if since != 0 {
                        let _ = handle.empty_since.compare_exchange(
                            since,
                            now_ms(),
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        );
                    }
                }
            }
        }
    }
}
