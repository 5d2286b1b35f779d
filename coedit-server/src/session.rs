//! Per-document collaboration sessions.
//!
//! A [`DocumentSession`] is a single-writer actor: one dispatcher task owns
//! all mutable state and drains a FIFO inbox fed by per-connection reader
//! tasks. Outbound traffic goes through bounded per-member queues drained by
//! per-connection writer tasks, so the dispatcher never blocks on a socket.
//! Persistence runs in spawned workers that report back through the inbox.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::AuthedUser;
use crate::chat::{ChatRefusal, ChatRoom};
use crate::ot::{self, Edit, EditKind, OpSeq};
use crate::protocol::{
    ChatSendReq, ClientMsg, CursorPos, ErrorCode, SelectionRange, ServerMsg, WireOp, WireUser, close,
};
use crate::store::{Access, DocumentStore, OpRow, Snapshot, StoreError};
use crate::{Identifier, ServerConfig};

/// Cursor and selection updates are coalesced to at most one broadcast per
/// member and channel within this interval.
const CURSOR_EMIT_INTERVAL: Duration = Duration::from_millis(50);
/// Housekeeping cadence: presence flushes, away marking, typing expiry.
const SWEEP_INTERVAL: Duration = Duration::from_millis(25);
/// Malformed frames tolerated per window before the connection is dropped.
const MALFORMED_LIMIT: u32 = 10;
const MALFORMED_WINDOW: Duration = Duration::from_secs(60);
/// Snapshot retry backoff bounds.
const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 30;

const COLOR_PALETTE: [&str; 12] = [
    "#f94144", "#f3722c", "#f8961e", "#f9c74f", "#90be6d", "#43aa8b", "#4d908e", "#577590",
    "#277da1", "#9b5de5", "#f15bb5", "#00bbf9",
];

/// Milliseconds since the Unix epoch; the hub compares these against the
/// grace period.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Events drained by the session dispatcher. Everything that mutates session
/// state arrives here, in arrival order.
pub(crate) enum Event {
    /// A connection cleared the gateway and joins the session.
    Join {
        socket: WebSocket,
        user: AuthedUser,
        access: Access,
    },
    /// A connection went away.
    Leave { conn_id: Uuid },
    /// A parsed frame from a member's reader task.
    Frame { conn_id: Uuid, msg: ClientMsg },
    /// Adapter history requested for a stale-base operation arrived.
    HistoryLoaded {
        conn_id: Uuid,
        result: Result<Vec<OpRow>, StoreError>,
    },
    /// A snapshot save worker finished.
    SnapshotSaved {
        version: u64,
        result: Result<(), StoreError>,
    },
    /// An op-log flush worker finished.
    OpsFlushed {
        upto: u64,
        result: Result<(), StoreError>,
    },
    /// Read-only query for the current content.
    Text { reply: oneshot::Sender<String> },
    /// Hub request to unload: grace-period expiry, or forced on shutdown.
    Drain {
        force: bool,
        reply: oneshot::Sender<DrainOutcome>,
    },
}

/// Result of a [`Event::Drain`] request.
pub(crate) struct DrainOutcome {
    /// Whether the session unloaded (final save succeeded or was forced).
    pub unloaded: bool,
    /// Chat state handed back to the hub on unload.
    pub chat: Option<ChatRoom>,
}

/// Shared handle to a running session.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub inbox: mpsc::UnboundedSender<Event>,
    /// Epoch milliseconds at which the member set became empty; 0 while
    /// occupied. Polled by the hub janitor.
    pub empty_since: Arc<AtomicU64>,
}

/// `Loading → Active → Draining → Unloaded`. Loading is the snapshot fetch
/// the hub performs before spawning the dispatcher, so the enum starts at
/// `Active`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Active,
    Draining,
    Unloaded,
}

/// An accepted operation retained in the in-memory window.
struct HistoryOp {
    version: u64,
    edit: Edit,
    user_id: String,
    /// Connection id of the emitter, for insertion-point tie-breaks.
    client_id: String,
    timestamp: DateTime<Utc>,
}

/// Ops queued for a member while adapter history is being loaded.
struct PendingHistory {
    loaded_from: u64,
    queued: VecDeque<WireOp>,
}

struct Member {
    conn_id: Uuid,
    user: AuthedUser,
    access: Access,
    color: String,
    cursor: Option<CursorPos>,
    selection: Option<SelectionRange>,
    last_client_version: u64,
    last_activity: Instant,
    away: bool,
    tx: mpsc::Sender<ServerMsg>,
    close_tx: Option<oneshot::Sender<CloseFrame>>,
    pending_cursor: Option<CursorPos>,
    pending_selection: Option<SelectionRange>,
    last_cursor_emit: Option<Instant>,
    last_selection_emit: Option<Instant>,
    pending_ops: Option<PendingHistory>,
}

impl Member {
    fn wire(&self) -> WireUser {
        WireUser {
            conn_id: self.conn_id,
            user_id: self.user.user_id.clone(),
            display_name: self.user.display_name.clone(),
            color: self.color.clone(),
            away: self.away,
            cursor: self.cursor,
            selection: self.selection,
        }
    }
}

/// The session actor. Constructed and spawned by the hub; lives on its own
/// dispatcher task until unloaded.
pub(crate) struct DocumentSession {
    id: Identifier,
    config: Arc<ServerConfig>,
    store: Arc<dyn DocumentStore>,
    inbox_tx: mpsc::UnboundedSender<Event>,
    state: SessionState,

    content: String,
    len16: u32,
    version: u64,
    language: String,
    owner_id: Option<String>,
    is_public: bool,

    history: VecDeque<HistoryOp>,
    flushed_version: u64,
    flush_inflight: bool,

    last_saved_version: u64,
    meta_dirty: bool,
    save_inflight: bool,
    save_failures: u32,
    next_save_earliest: Instant,
    first_save_failure: Option<Instant>,
    degraded: bool,

    members: HashMap<Uuid, Member>,
    color_cursor: usize,
    chat: ChatRoom,
    empty_since: Arc<AtomicU64>,
}

impl DocumentSession {
    /// Spawn the dispatcher for a freshly loaded document.
    pub(crate) fn spawn(
        id: Identifier,
        snapshot: Snapshot,
        chat: ChatRoom,
        config: Arc<ServerConfig>,
        store: Arc<dyn DocumentStore>,
    ) -> (SessionHandle, tokio::task::JoinHandle<()>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let empty_since = Arc::new(AtomicU64::new(now_ms()));
        let handle = SessionHandle {
            inbox: inbox_tx.clone(),
            empty_since: Arc::clone(&empty_since),
        };
        let session = DocumentSession {
            len16: ot::utf16_len(&snapshot.content),
            content: snapshot.content,
            version: snapshot.version,
            language: snapshot.language,
            owner_id: snapshot.owner_id,
            is_public: snapshot.is_public,
            history: VecDeque::new(),
            flushed_version: snapshot.version,
            flush_inflight: false,
            last_saved_version: snapshot.version,
            meta_dirty: false,
            save_inflight: false,
            save_failures: 0,
            next_save_earliest: Instant::now(),
            first_save_failure: None,
            degraded: false,
            members: HashMap::new(),
            color_cursor: 0,
            chat,
            state: SessionState::Active,
            empty_since,
            id,
            config,
            store,
            inbox_tx,
        };
        let task = tokio::spawn(session.run(inbox_rx));
        (handle, task)
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Event>) {
        let mut persist = time::interval(self.config.snapshot_interval);
        persist.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("session started for id = {}", self.id);
        while self.state != SessionState::Unloaded {
            tokio::select! {
                event = inbox.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = persist.tick() => self.persist_tick(),
                _ = sweep.tick() => self.sweep(),
            }
        }
        info!("session unloaded for id = {}", self.id);
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Join { socket, user, access } => self.handle_join(socket, user, access),
            Event::Leave { conn_id } => self.handle_leave(conn_id),
            Event::Frame { conn_id, msg } => self.handle_frame(conn_id, msg),
            Event::HistoryLoaded { conn_id, result } => self.handle_history_loaded(conn_id, result),
            Event::SnapshotSaved { version, result } => self.handle_snapshot_saved(version, result),
            Event::OpsFlushed { upto, result } => self.handle_ops_flushed(upto, result),
            Event::Text { reply } => {
                let _ = reply.send(self.content.clone());
            }
            Event::Drain { force, reply } => self.handle_drain(force, reply).await,
        }
    }

    // ---- membership ----

    fn handle_join(&mut self, socket: WebSocket, user: AuthedUser, access: Access) {
        if self.state != SessionState::Active {
            tokio::spawn(refuse_draining(socket));
            return;
        }
        let conn_id = Uuid::new_v4();
        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_queue_max);
        let (close_tx, close_rx) = oneshot::channel();
        let (sink, stream) = socket.split();
        tokio::spawn(writer_loop(sink, out_rx, close_rx, self.config.write_timeout));
        tokio::spawn(reader_loop(
            stream,
            conn_id,
            self.inbox_tx.clone(),
            out_tx.clone(),
            self.config.read_idle_timeout,
        ));

        if self.owner_id.is_none() && !user.is_guest() && access == Access::Edit {
            self.owner_id = Some(user.user_id.clone());
            self.meta_dirty = true;
        }

        let color = self.assign_color();
        let member = Member {
            conn_id,
            user,
            access,
            color: color.clone(),
            cursor: None,
            selection: None,
            last_client_version: self.version,
            last_activity: Instant::now(),
            away: false,
            tx: out_tx,
            close_tx: Some(close_tx),
            pending_cursor: None,
            pending_selection: None,
            last_cursor_emit: None,
            last_selection_emit: None,
            pending_ops: None,
        };

        let mut users: Vec<WireUser> = self.members.values().map(Member::wire).collect();
        users.push(member.wire());
        let handshake = ServerMsg::DocumentState {
            content: self.content.clone(),
            version: self.version,
            language: self.language.clone(),
            users,
            your_color: color,
            your_conn_id: conn_id,
        };
        // a freshly created queue cannot be full
        let _ = member.tx.try_send(handshake);
        for message in self.chat.recent() {
            let _ = member.tx.try_send(ServerMsg::ChatMessage {
                message: message.to_wire(),
            });
        }

        let wire = member.wire();
        let user_id = member.user.user_id.clone();
        info!(
            "member {} ({}) joined document {} with {:?} access",
            conn_id, user_id, self.id, member.access
        );
        self.members.insert(conn_id, member);
        self.chat.join(&user_id);
        self.touch_occupancy();
        self.broadcast_except(conn_id, ServerMsg::UserJoined { user: wire });
    }

    fn handle_leave(&mut self, conn_id: Uuid) {
        let Some(member) = self.members.remove(&conn_id) else {
            return;
        };
        debug!("member {} left document {}", conn_id, self.id);
        let user_id = member.user.user_id.clone();
        // dropping `member.tx` lets the writer task wind the socket down
        self.chat.leave(&user_id);
        self.touch_occupancy();
        self.broadcast_except(conn_id, ServerMsg::UserLeft { user_id });
    }

    fn touch_occupancy(&self) {
        let value = if self.members.is_empty() { now_ms() } else { 0 };
        self.empty_since.store(value, Ordering::Relaxed);
    }

    fn assign_color(&mut self) -> String {
        let used: HashSet<&str> = self.members.values().map(|m| m.color.as_str()).collect();
        if let Some(color) = COLOR_PALETTE.iter().find(|c| !used.contains(**c)) {
            return color.to_string();
        }
        let color = COLOR_PALETTE[self.color_cursor % COLOR_PALETTE.len()];
        self.color_cursor += 1;
        color.to_string()
    }

    // ---- frame dispatch ----

    fn handle_frame(&mut self, conn_id: Uuid, msg: ClientMsg) {
        let Some(member) = self.members.get_mut(&conn_id) else {
            return;
        };
        member.last_activity = Instant::now();
        let was_away = std::mem::replace(&mut member.away, false);
        let user_id = member.user.user_id.clone();
        if was_away {
            self.broadcast_except(
                conn_id,
                ServerMsg::UserAway {
                    user_id: user_id.clone(),
                    away: false,
                },
            );
        }
        match msg {
            ClientMsg::Ping => {} // answered by the reader task
            ClientMsg::Op(op) => self.handle_op(conn_id, op),
            ClientMsg::Cursor { position } => self.handle_cursor(conn_id, position),
            ClientMsg::Selection { range } => self.handle_selection(conn_id, range),
            ClientMsg::Language { language } => self.handle_language(conn_id, language),
            ClientMsg::ChatSend(req) => self.handle_chat_send(conn_id, req),
            ClientMsg::ChatReact { message_id, emoji } => {
                self.handle_chat_react(conn_id, message_id, emoji)
            }
            ClientMsg::ChatTyping { is_typing } => self.handle_chat_typing(conn_id, is_typing),
        }
    }

    // ---- the OT path ----

    fn handle_op(&mut self, conn_id: Uuid, op: WireOp) {
        let access = match self.members.get_mut(&conn_id) {
            Some(member) => {
                if let Some(pending) = member.pending_ops.as_mut() {
                    // keep per-connection order while history loads
                    pending.queued.push_back(op);
                    return;
                }
                member.last_client_version = member.last_client_version.max(op.base_version);
                member.access
            }
            None => return,
        };
        if op.base_version > self.version {
            let message = format!(
                "base version {} is ahead of server version {}",
                op.base_version, self.version
            );
            self.send_error(conn_id, ErrorCode::FutureOp, message, None);
            return;
        }
        if access < Access::Edit {
            self.send_error(
                conn_id,
                ErrorCode::ReadOnly,
                "connection has view-only access".to_string(),
                None,
            );
            return;
        }
        if op.base_version < self.window_start() {
            self.begin_history_load(conn_id, op);
            return;
        }
        self.accept_op(conn_id, op, &[]);
    }

    /// Version of the oldest transform base the in-memory window can serve.
    fn window_start(&self) -> u64 {
        self.version - self.history.len() as u64
    }

    fn begin_history_load(&mut self, conn_id: Uuid, op: WireOp) {
        let from = op.base_version;
        let Some(member) = self.members.get_mut(&conn_id) else {
            return;
        };
        debug!(
            "loading ops since {} for stale client {} on {}",
            from, conn_id, self.id
        );
        member.pending_ops = Some(PendingHistory {
            loaded_from: from,
            queued: VecDeque::from([op]),
        });
        let store = Arc::clone(&self.store);
        let id = self.id.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = store.load_ops_since(&id, from).await;
            let _ = inbox.send(Event::HistoryLoaded { conn_id, result });
        });
    }

    fn handle_history_loaded(&mut self, conn_id: Uuid, result: Result<Vec<OpRow>, StoreError>) {
        let Some(member) = self.members.get_mut(&conn_id) else {
            return;
        };
        let Some(pending) = member.pending_ops.take() else {
            return;
        };
        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                warn!("history load for {} failed: {}", self.id, e);
                self.evict(conn_id, close::INTERNAL, "internal");
                return;
            }
        };
        for op in pending.queued {
            if !self.members.contains_key(&conn_id) {
                break; // evicted while draining the queue
            }
            if op.base_version < pending.loaded_from {
                self.send_error(
                    conn_id,
                    ErrorCode::InvalidOp,
                    "base version regressed within one connection".to_string(),
                    None,
                );
                continue;
            }
            self.accept_op(conn_id, op, &rows);
        }
    }

    fn accept_op(&mut self, conn_id: Uuid, op: WireOp, loaded: &[OpRow]) {
        let client_op_id = op.client_op_id.clone();
        match self.transform_and_apply(conn_id, op, loaded) {
            Ok(server_version) => {
                if let Some(member) = self.members.get_mut(&conn_id) {
                    member.last_client_version = server_version;
                }
                self.deliver(
                    conn_id,
                    ServerMsg::Ack {
                        client_op_id,
                        server_version,
                    },
                );
                self.maybe_flush_ops(false);
                self.maybe_snapshot(false);
            }
            Err(message) => self.send_error(conn_id, ErrorCode::InvalidOp, message, None),
        }
    }

    /// Steps 3–7 of the acceptance algorithm: validate, transform against the
    /// concurrent series, apply, log, and broadcast. Returns the version to
    /// acknowledge.
    fn transform_and_apply(
        &mut self,
        conn_id: Uuid,
        op: WireOp,
        loaded: &[OpRow],
    ) -> Result<u64, String> {
        let user_id = match self.members.get(&conn_id) {
            Some(member) => member.user.user_id.clone(),
            None => return Err("connection is gone".to_string()),
        };
        let client_id = conn_id.to_string();
        let base = op.base_version;

        let edit = match op.kind {
            EditKind::Insert => Edit::Insert {
                position: op.position,
                text: op.text.ok_or("insert requires text")?,
            },
            EditKind::Delete => Edit::Delete {
                position: op.position,
                length: op.length.ok_or("delete requires a length")?,
            },
        };

        let mut len = self.len_at(base, loaded)?;
        let mut seq = OpSeq::from_edit(&edit, len).map_err(|e| e.to_string())?;

        // fold across everything accepted since the client's base
        let window_start = self.window_start();
        for row in loaded
            .iter()
            .filter(|r| r.version > base && r.version <= window_start)
        {
            let other = OpSeq::from_row_shape(row.kind, row.position, row.length, len)
                .map_err(|e| e.to_string())?;
            // persisted rows carry no client id; fall back to the user id
            let first = client_id.as_str() < row.user_id.as_str();
            seq = seq.transform(&other, first).map_err(|e| e.to_string())?;
            len = other.target_len();
        }
        for past in self.history.iter().filter(|h| h.version > base) {
            let other = OpSeq::from_edit(&past.edit, len).map_err(|e| e.to_string())?;
            let first = client_id.as_str() < past.client_id.as_str();
            seq = seq.transform(&other, first).map_err(|e| e.to_string())?;
            len = other.target_len();
        }

        if seq.target_len() > ot::MAX_DOC_LEN {
            return Err("document would exceed the maximum size".to_string());
        }

        let primitives = seq.primitives();
        if primitives.is_empty() {
            // fully swallowed by concurrent deletes; acknowledge as a no-op
            return Ok(self.version);
        }

        let new_content = seq.apply(&self.content).map_err(|e| e.to_string())?;
        self.content = new_content;
        self.len16 = seq.target_len();

        let timestamp = Utc::now();
        for edit in primitives {
            self.version += 1;
            let (text, length) = match &edit {
                Edit::Insert { text, .. } => (Some(text.clone()), None),
                Edit::Delete { length, .. } => (None, Some(*length)),
            };
            self.broadcast_except(
                conn_id,
                ServerMsg::RemoteOp {
                    kind: edit.kind(),
                    position: edit.position(),
                    text,
                    length,
                    version: self.version,
                    user_id: user_id.clone(),
                },
            );
            self.history.push_back(HistoryOp {
                version: self.version,
                edit,
                user_id: user_id.clone(),
                client_id: client_id.clone(),
                timestamp,
            });
        }
        self.trim_history();
        Ok(self.version)
    }

    /// UTF-16 length of the document at `base`, reconstructed by unwinding
    /// the deltas of everything applied since.
    fn len_at(&self, base: u64, loaded: &[OpRow]) -> Result<u32, String> {
        let mut len = self.len16 as i64;
        for past in self.history.iter().rev().filter(|h| h.version > base) {
            match &past.edit {
                Edit::Insert { text, .. } => len -= ot::utf16_len(text) as i64,
                Edit::Delete { length, .. } => len += *length as i64,
            }
        }
        let window_start = self.window_start();
        for row in loaded
            .iter()
            .rev()
            .filter(|r| r.version > base && r.version <= window_start)
        {
            match row.kind {
                EditKind::Insert => len -= row.length as i64,
                EditKind::Delete => len += row.length as i64,
            }
        }
        u32::try_from(len).map_err(|_| "history does not reach the requested base".to_string())
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.config.op_buffer_size {
            match self.history.front() {
                Some(front) if front.version <= self.flushed_version => {
                    self.history.pop_front();
                }
                // unflushed ops are never evicted; the window grows until the
                // store catches up
                _ => break,
            }
        }
    }

    // ---- presence ----

    fn handle_cursor(&mut self, conn_id: Uuid, position: CursorPos) {
        let Some(member) = self.members.get_mut(&conn_id) else {
            return;
        };
        member.cursor = Some(position);
        let due = member
            .last_cursor_emit
            .is_none_or(|at| at.elapsed() >= CURSOR_EMIT_INTERVAL);
        if due {
            member.last_cursor_emit = Some(Instant::now());
            member.pending_cursor = None;
            let user_id = member.user.user_id.clone();
            self.broadcast_except(conn_id, ServerMsg::CursorMove { user_id, position });
        } else {
            member.pending_cursor = Some(position);
        }
    }

    fn handle_selection(&mut self, conn_id: Uuid, range: SelectionRange) {
        let Some(member) = self.members.get_mut(&conn_id) else {
            return;
        };
        member.selection = Some(range);
        let due = member
            .last_selection_emit
            .is_none_or(|at| at.elapsed() >= CURSOR_EMIT_INTERVAL);
        if due {
            member.last_selection_emit = Some(Instant::now());
            member.pending_selection = None;
            let user_id = member.user.user_id.clone();
            self.broadcast_except(conn_id, ServerMsg::SelectionChange { user_id, range });
        } else {
            member.pending_selection = Some(range);
        }
    }

    fn handle_language(&mut self, conn_id: Uuid, language: String) {
        let Some(member) = self.members.get(&conn_id) else {
            return;
        };
        if member.access < Access::Edit {
            self.send_error(
                conn_id,
                ErrorCode::ReadOnly,
                "connection has view-only access".to_string(),
                None,
            );
            return;
        }
        let user_id = member.user.user_id.clone();
        self.language = language.clone();
        self.meta_dirty = true;
        self.broadcast_all(ServerMsg::LanguageChange { language, user_id });
    }

    /// Flush coalesced presence, mark idle members away, expire typing.
    fn sweep(&mut self) {
        if self.state != SessionState::Active {
            return;
        }
        let now = Instant::now();

        let mut emits: Vec<(Uuid, ServerMsg)> = Vec::new();
        for member in self.members.values_mut() {
            if let Some(position) = member.pending_cursor
                && member
                    .last_cursor_emit
                    .is_none_or(|at| now.duration_since(at) >= CURSOR_EMIT_INTERVAL)
            {
                member.pending_cursor = None;
                member.last_cursor_emit = Some(now);
                emits.push((
                    member.conn_id,
                    ServerMsg::CursorMove {
                        user_id: member.user.user_id.clone(),
                        position,
                    },
                ));
            }
            if let Some(range) = member.pending_selection
                && member
                    .last_selection_emit
                    .is_none_or(|at| now.duration_since(at) >= CURSOR_EMIT_INTERVAL)
            {
                member.pending_selection = None;
                member.last_selection_emit = Some(now);
                emits.push((
                    member.conn_id,
                    ServerMsg::SelectionChange {
                        user_id: member.user.user_id.clone(),
                        range,
                    },
                ));
            }
        }
        for (source, msg) in emits {
            self.broadcast_except(source, msg);
        }

        let timeout = self.config.presence_timeout;
        let mut gone_away: Vec<(Uuid, String)> = Vec::new();
        let mut idle: Vec<Uuid> = Vec::new();
        for member in self.members.values_mut() {
            let silent = now.duration_since(member.last_activity);
            if silent >= timeout * 2 {
                idle.push(member.conn_id);
            } else if silent >= timeout && !member.away {
                member.away = true;
                gone_away.push((member.conn_id, member.user.user_id.clone()));
            }
        }
        for (conn_id, user_id) in gone_away {
            self.broadcast_except(conn_id, ServerMsg::UserAway { user_id, away: true });
        }
        for conn_id in idle {
            info!("forcing leave of idle member {} on {}", conn_id, self.id);
            self.evict(conn_id, close::NORMAL, "idle");
        }

        for user_id in self.chat.expire_typing(std::time::Instant::now()) {
            self.broadcast_all(ServerMsg::ChatTyping {
                user_id,
                is_typing: false,
            });
        }
    }

    // ---- chat ----

    fn handle_chat_send(&mut self, conn_id: Uuid, req: ChatSendReq) {
        let Some(member) = self.members.get(&conn_id) else {
            return;
        };
        let user_id = member.user.user_id.clone();
        let display_name = member.user.display_name.clone();
        let outcome = self
            .chat
            .send(&user_id, &display_name, req, std::time::Instant::now())
            .map(|m| m.to_wire());
        match outcome {
            Ok(message) => self.broadcast_all(ServerMsg::ChatMessage { message }),
            Err(refusal) => self.send_chat_refusal(conn_id, refusal),
        }
    }

    fn handle_chat_react(&mut self, conn_id: Uuid, message_id: Uuid, emoji: String) {
        let Some(member) = self.members.get(&conn_id) else {
            return;
        };
        let user_id = member.user.user_id.clone();
        match self
            .chat
            .react(&user_id, message_id, &emoji, std::time::Instant::now())
        {
            Ok(added) => self.broadcast_all(ServerMsg::ChatReaction {
                message_id,
                emoji,
                user_id,
                added,
            }),
            Err(refusal) => self.send_chat_refusal(conn_id, refusal),
        }
    }

    fn handle_chat_typing(&mut self, conn_id: Uuid, is_typing: bool) {
        let Some(member) = self.members.get(&conn_id) else {
            return;
        };
        let user_id = member.user.user_id.clone();
        if self
            .chat
            .set_typing(&user_id, is_typing, std::time::Instant::now())
        {
            self.broadcast_except(conn_id, ServerMsg::ChatTyping { user_id, is_typing });
        }
    }

    fn send_chat_refusal(&mut self, conn_id: Uuid, refusal: ChatRefusal) {
        let (code, message, retry_after) = match refusal {
            ChatRefusal::TooLong => (
                ErrorCode::TooLong,
                "message exceeds the maximum length".to_string(),
                None,
            ),
            ChatRefusal::NotMember => (
                ErrorCode::NotMember,
                "not a member of this room".to_string(),
                None,
            ),
            ChatRefusal::RateLimited(retry) => (
                ErrorCode::RateLimited,
                "rate limit exceeded".to_string(),
                Some(retry),
            ),
            ChatRefusal::UnknownMessage => {
                (ErrorCode::InvalidOp, "unknown message id".to_string(), None)
            }
            ChatRefusal::TooManyReactions => (
                ErrorCode::InvalidOp,
                "too many distinct reactions".to_string(),
                None,
            ),
        };
        self.send_error(conn_id, code, message, retry_after);
    }

    // ---- persistence ----

    fn persist_tick(&mut self) {
        if self.state != SessionState::Active {
            return;
        }
        self.maybe_flush_ops(true);
        self.maybe_snapshot(true);
    }

    fn maybe_flush_ops(&mut self, tick: bool) {
        if self.flush_inflight || self.version == self.flushed_version {
            return;
        }
        let unflushed = (self.version - self.flushed_version) as usize;
        if !tick && unflushed < self.config.op_buffer_size / 2 {
            return;
        }
        let rows: Vec<OpRow> = self
            .history
            .iter()
            .filter(|h| h.version > self.flushed_version)
            .map(op_row)
            .collect();
        let Some(last) = rows.last() else {
            return;
        };
        let upto = last.version;
        self.flush_inflight = true;
        let store = Arc::clone(&self.store);
        let id = self.id.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = store.append_ops(&id, &rows).await;
            let _ = inbox.send(Event::OpsFlushed { upto, result });
        });
    }

    fn handle_ops_flushed(&mut self, upto: u64, result: Result<(), StoreError>) {
        self.flush_inflight = false;
        match result {
            Ok(()) => {
                self.flushed_version = self.flushed_version.max(upto);
                self.trim_history();
            }
            Err(e) => warn!("op flush for {} failed: {}", self.id, e),
        }
    }

    fn maybe_snapshot(&mut self, tick: bool) {
        if self.save_inflight {
            return;
        }
        let dirty_ops = (self.version - self.last_saved_version) as usize;
        if dirty_ops == 0 && !self.meta_dirty {
            return;
        }
        if !tick && dirty_ops < self.config.snapshot_op_threshold {
            return;
        }
        if Instant::now() < self.next_save_earliest {
            return;
        }
        let snapshot = self.snapshot();
        let version = snapshot.version;
        self.save_inflight = true;
        self.meta_dirty = false;
        let store = Arc::clone(&self.store);
        let id = self.id.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = store.save_snapshot(&id, &snapshot).await;
            let _ = inbox.send(Event::SnapshotSaved { version, result });
        });
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            content: self.content.clone(),
            version: self.version,
            language: self.language.clone(),
            owner_id: self.owner_id.clone(),
            is_public: self.is_public,
        }
    }

    fn handle_snapshot_saved(&mut self, version: u64, result: Result<(), StoreError>) {
        self.save_inflight = false;
        match result {
            Ok(()) => {
                debug!("persisted version {} for id = {}", version, self.id);
                self.last_saved_version = self.last_saved_version.max(version);
                self.save_failures = 0;
                self.first_save_failure = None;
                self.next_save_earliest = Instant::now();
                if self.degraded {
                    info!("persistence recovered for {}", self.id);
                    self.degraded = false;
                }
            }
            Err(e) => {
                warn!("snapshot save for {} failed: {}", self.id, e);
                self.meta_dirty = true;
                self.save_failures += 1;
                let exp = self.save_failures.saturating_sub(1).min(5);
                let secs = (BACKOFF_BASE_SECS << exp).min(BACKOFF_CAP_SECS) as f64;
                let jitter: f64 = rand::random_range(0.8..=1.2);
                self.next_save_earliest = Instant::now() + Duration::from_secs_f64(secs * jitter);
                let first = *self.first_save_failure.get_or_insert_with(Instant::now);
                if !self.degraded && first.elapsed() >= self.config.persist_fatal_timeout {
                    self.degraded = true;
                    error!(
                        "persistence for {} failing past the fatal timeout; session degraded",
                        self.id
                    );
                }
            }
        }
    }

    // ---- drain ----

    async fn handle_drain(&mut self, force: bool, reply: oneshot::Sender<DrainOutcome>) {
        if !force && !self.members.is_empty() {
            // a member returned before the janitor got here
            let _ = reply.send(DrainOutcome {
                unloaded: false,
                chat: None,
            });
            return;
        }
        self.state = SessionState::Draining;

        // best-effort op tail flush, then the final snapshot attempt; no
        // members are left so awaiting the store here is harmless
        let rows: Vec<OpRow> = self
            .history
            .iter()
            .filter(|h| h.version > self.flushed_version)
            .map(op_row)
            .collect();
        if let Some(last) = rows.last() {
            let upto = last.version;
            match self.store.append_ops(&self.id, &rows).await {
                Ok(()) => self.flushed_version = self.flushed_version.max(upto),
                Err(e) => warn!("final op flush for {} failed: {}", self.id, e),
            }
        }

        let mut saved = self.version == self.last_saved_version && !self.meta_dirty;
        if !saved {
            match self.store.save_snapshot(&self.id, &self.snapshot()).await {
                Ok(()) => {
                    self.last_saved_version = self.version;
                    self.meta_dirty = false;
                    saved = true;
                }
                Err(e) => warn!("final snapshot for {} failed: {}", self.id, e),
            }
        }

        if !saved && !force {
            // stay loaded; the hub resets the grace timer and retries
            self.state = SessionState::Active;
            let _ = reply.send(DrainOutcome {
                unloaded: false,
                chat: None,
            });
            return;
        }

        for (_, mut member) in self.members.drain() {
            if let Some(close_tx) = member.close_tx.take() {
                let _ = close_tx.send(CloseFrame {
                    code: close::GOING_AWAY,
                    reason: "going_away".into(),
                });
            }
        }
        self.state = SessionState::Unloaded;
        let chat = std::mem::replace(&mut self.chat, ChatRoom::new(0));
        let _ = reply.send(DrainOutcome {
            unloaded: true,
            chat: Some(chat),
        });
    }

    // ---- delivery ----

    fn deliver(&mut self, conn_id: Uuid, msg: ServerMsg) {
        let Some(member) = self.members.get(&conn_id) else {
            return;
        };
        match member.tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "outbound queue full for member {} on {}; dropping slow consumer",
                    conn_id, self.id
                );
                self.evict(conn_id, close::INTERNAL, "slow_consumer");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => self.handle_leave(conn_id),
        }
    }

    fn broadcast_except(&mut self, exclude: Uuid, msg: ServerMsg) {
        let targets: Vec<Uuid> = self
            .members
            .keys()
            .filter(|id| **id != exclude)
            .copied()
            .collect();
        for conn_id in targets {
            self.deliver(conn_id, msg.clone());
        }
    }

    fn broadcast_all(&mut self, msg: ServerMsg) {
        let targets: Vec<Uuid> = self.members.keys().copied().collect();
        for conn_id in targets {
            self.deliver(conn_id, msg.clone());
        }
    }

    fn send_error(&mut self, conn_id: Uuid, code: ErrorCode, message: String, retry_after: Option<u64>) {
        self.deliver(
            conn_id,
            ServerMsg::Error {
                code,
                message,
                retry_after,
            },
        );
    }

    fn evict(&mut self, conn_id: Uuid, code: u16, reason: &'static str) {
        let Some(member) = self.members.get_mut(&conn_id) else {
            return;
        };
        if let Some(close_tx) = member.close_tx.take() {
            let _ = close_tx.send(CloseFrame {
                code,
                reason: reason.into(),
            });
        }
        self.handle_leave(conn_id);
    }
}

fn op_row(op: &HistoryOp) -> OpRow {
    let mut hasher = DefaultHasher::new();
    op.version.hash(&mut hasher);
    op.user_id.hash(&mut hasher);
    match &op.edit {
        Edit::Insert { position, text } => {
            0u8.hash(&mut hasher);
            position.hash(&mut hasher);
            text.hash(&mut hasher);
        }
        Edit::Delete { position, length } => {
            1u8.hash(&mut hasher);
            position.hash(&mut hasher);
            length.hash(&mut hasher);
        }
    }
    OpRow {
        version: op.version,
        kind: op.edit.kind(),
        position: op.edit.position(),
        length: op.edit.len_utf16(),
        user_id: op.user_id.clone(),
        timestamp: op.timestamp,
        op_hash: hasher.finish(),
    }
}

/// Sent to sockets that arrive while the session is draining.
async fn refuse_draining(mut socket: WebSocket) {
    let _ = socket
        .send(ServerMsg::error(ErrorCode::Unavailable, "session is unloading").into())
        .await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close::UNAVAILABLE,
            reason: "unavailable".into(),
        })))
        .await;
}

/// Close a socket with a code and reason, dropping it afterwards.
pub(crate) async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Drains a member's outbound queue onto the socket. The only task allowed
/// to block on the peer; a stalled send past `write_timeout` counts as a
/// slow consumer.
async fn writer_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<ServerMsg>,
    mut close_rx: oneshot::Receiver<CloseFrame>,
    write_timeout: Duration,
) {
    let frame = loop {
        tokio::select! {
            biased;
            signal = &mut close_rx => {
                break signal.unwrap_or(CloseFrame {
                    code: close::NORMAL,
                    reason: "".into(),
                });
            }
            msg = out_rx.recv() => match msg {
                Some(msg) => match time::timeout(write_timeout, sink.send(msg.into())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return, // transport is gone
                    Err(_) => break CloseFrame {
                        code: close::INTERNAL,
                        reason: "slow_consumer".into(),
                    },
                },
                None => break CloseFrame {
                    code: close::NORMAL,
                    reason: "".into(),
                },
            },
        }
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

/// Parses frames off the socket into inbox events. Never touches session
/// state; enforces the idle timeout and the malformed-frame budget.
async fn reader_loop(
    mut stream: SplitStream<WebSocket>,
    conn_id: Uuid,
    inbox: mpsc::UnboundedSender<Event>,
    out_tx: mpsc::Sender<ServerMsg>,
    idle_timeout: Duration,
) {
    let mut strikes = 0u32;
    let mut window_start = Instant::now();
    loop {
        let frame = match time::timeout(idle_timeout, stream.next()).await {
            Err(_) => {
                debug!("read idle timeout for {}", conn_id);
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientMsg>(&text) {
                Ok(ClientMsg::Ping) => {
                    // answer straight from the reader, but let the session
                    // count the frame as activity
                    let _ = out_tx.try_send(ServerMsg::Pong);
                    if inbox.send(Event::Frame { conn_id, msg: ClientMsg::Ping }).is_err() {
                        break;
                    }
                }
                Ok(msg) => {
                    if inbox.send(Event::Frame { conn_id, msg }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("malformed frame from {}: {}", conn_id, e);
                    let _ = out_tx.try_send(ServerMsg::error(ErrorCode::BadMessage, "malformed frame"));
                    if strike(&mut strikes, &mut window_start) {
                        break;
                    }
                }
            },
            Message::Binary(_) => {
                let _ = out_tx.try_send(ServerMsg::error(
                    ErrorCode::BadMessage,
                    "binary frames are not part of the protocol",
                ));
                if strike(&mut strikes, &mut window_start) {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    let _ = inbox.send(Event::Leave { conn_id });
}

fn strike(strikes: &mut u32, window_start: &mut Instant) -> bool {
    if window_start.elapsed() >= MALFORMED_WINDOW {
        *window_start = Instant::now();
        *strikes = 0;
    }
    *strikes += 1;
    *strikes > MALFORMED_LIMIT
}
