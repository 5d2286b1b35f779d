//! Wire protocol: the JSON frames exchanged over a session WebSocket.
//!
//! Every frame is a single JSON object with a `type` discriminator. The two
//! enums below are the complete, closed contract; this module is the only
//! place frames are encoded or decoded.

use std::collections::BTreeMap;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ot::EditKind;

/// WebSocket close codes used by the server.
pub mod close {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Server is going away (shutdown, drain).
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation: `auth` or `forbidden`.
    pub const POLICY: u16 = 1008;
    /// Frame exceeded the maximum payload size.
    pub const TOO_LARGE: u16 = 1009;
    /// Internal error or slow consumer eviction.
    pub const INTERNAL: u16 = 1011;
    /// Session is draining and refuses new joins.
    pub const UNAVAILABLE: u16 = 4001;
}

/// Machine-readable error codes carried by [`ServerMsg::Error`] frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame was not valid JSON or had an unknown `type`.
    BadMessage,
    /// Operation failed validation or transformation.
    InvalidOp,
    /// Operation's base version is ahead of the server.
    FutureOp,
    /// Connection has view-only access.
    ReadOnly,
    /// Chat message exceeds the length limit.
    TooLong,
    /// Per-user rate limit exceeded; retry after `retryAfter` seconds.
    RateLimited,
    /// Sender is not a member of the room.
    NotMember,
    /// Session is draining and cannot accept the request.
    Unavailable,
}

/// A cursor position as reported by the editor widget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPos {
    /// Zero-based line.
    pub line: u32,
    /// Zero-based column.
    pub column: u32,
}

/// An inclusive selection range between two cursor positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    /// Anchor of the selection.
    pub start: CursorPos,
    /// Head of the selection.
    pub end: CursorPos,
}

/// An edit operation as sent by a client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOp {
    /// Insert or delete.
    pub kind: EditKind,
    /// Offset in UTF-16 code units at the client's base version.
    pub position: u32,
    /// Inserted text; required for inserts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Deleted span length; required for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    /// Document version the client produced this op against.
    pub base_version: u64,
    /// Client-chosen correlation id, echoed in the `ack`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_op_id: Option<String>,
}

/// Payload of a `chat.send` frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendReq {
    /// Message body.
    pub content: String,
    /// Mentioned user ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    /// Whether the body should render as a code block.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_code_snippet: bool,
    /// Language tag for code snippets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_language: Option<String>,
    /// Client correlation id for optimistic updates, echoed back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// A message received from a client over the WebSocket.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMsg {
    /// Liveness probe; answered with [`ServerMsg::Pong`].
    Ping,
    /// An edit operation (see [`WireOp`]).
    Op(WireOp),
    /// Cursor moved.
    Cursor {
        /// New cursor position.
        position: CursorPos,
    },
    /// Selection changed.
    Selection {
        /// New selection range.
        range: SelectionRange,
    },
    /// Change the document language; requires edit access.
    Language {
        /// New language tag.
        language: String,
    },
    /// Send a chat message to the room.
    #[serde(rename = "chat.send")]
    ChatSend(ChatSendReq),
    /// Toggle a reaction on a message.
    #[serde(rename = "chat.react", rename_all = "camelCase")]
    ChatReact {
        /// Target message.
        message_id: Uuid,
        /// Reaction emoji.
        emoji: String,
    },
    /// Signal that the user is (or stopped) typing.
    #[serde(rename = "chat.typing", rename_all = "camelCase")]
    ChatTyping {
        /// Whether the user is currently typing.
        is_typing: bool,
    },
}

/// A session member as described to clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUser {
    /// Connection id, unique per socket.
    pub conn_id: Uuid,
    /// Authenticated (or guest) subject.
    pub user_id: String,
    /// Display name.
    pub display_name: String,
    /// Palette color assigned on join.
    pub color: String,
    /// Whether the member is idle.
    #[serde(default)]
    pub away: bool,
    /// Last known cursor position, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPos>,
    /// Last known selection, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
}

/// A chat message as described to clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageWire {
    /// Server-assigned message id.
    pub id: Uuid,
    /// Sender subject.
    pub user_id: String,
    /// Sender display name at send time.
    pub display_name: String,
    /// Message body.
    pub content: String,
    /// Server-stamped send time.
    pub timestamp: DateTime<Utc>,
    /// Whether the body renders as a code block.
    #[serde(default)]
    pub is_code_snippet: bool,
    /// Language tag for code snippets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_language: Option<String>,
    /// Mentioned user ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    /// Reactions: emoji to the user ids holding it, sorted for determinism.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, Vec<String>>,
    /// Echo of the client correlation id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// A message sent to clients over the WebSocket.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMsg {
    /// Join handshake: the full document snapshot and member list.
    #[serde(rename_all = "camelCase")]
    DocumentState {
        /// Current document content.
        content: String,
        /// Current document version.
        version: u64,
        /// Current language tag.
        language: String,
        /// All members, including the recipient.
        users: Vec<WireUser>,
        /// Color assigned to the recipient.
        your_color: String,
        /// Connection id assigned to the recipient.
        your_conn_id: Uuid,
    },
    /// Acknowledges an accepted operation to its sender.
    #[serde(rename_all = "camelCase")]
    Ack {
        /// Echo of the client's correlation id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_op_id: Option<String>,
        /// Version after applying the operation.
        server_version: u64,
    },
    /// A transformed operation accepted from another member.
    #[serde(rename_all = "camelCase")]
    RemoteOp {
        /// Insert or delete.
        kind: EditKind,
        /// Offset in UTF-16 code units.
        position: u32,
        /// Inserted text, for inserts.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        /// Deleted span length, for deletes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        length: Option<u32>,
        /// Version after applying this operation.
        version: u64,
        /// Subject that produced the operation.
        user_id: String,
    },
    /// Another member's cursor moved.
    #[serde(rename_all = "camelCase")]
    CursorMove {
        /// Subject whose cursor moved.
        user_id: String,
        /// New position.
        position: CursorPos,
    },
    /// Another member's selection changed.
    #[serde(rename_all = "camelCase")]
    SelectionChange {
        /// Subject whose selection changed.
        user_id: String,
        /// New range.
        range: SelectionRange,
    },
    /// A member joined the session.
    UserJoined {
        /// The joining member.
        user: WireUser,
    },
    /// A member left the session.
    #[serde(rename_all = "camelCase")]
    UserLeft {
        /// Subject that left.
        user_id: String,
    },
    /// A member went idle or came back.
    #[serde(rename_all = "camelCase")]
    UserAway {
        /// Subject whose idle state changed.
        user_id: String,
        /// Whether the member is now away.
        away: bool,
    },
    /// The document language changed.
    #[serde(rename_all = "camelCase")]
    LanguageChange {
        /// New language tag.
        language: String,
        /// Subject that changed it.
        user_id: String,
    },
    /// A chat message was posted to the room.
    #[serde(rename = "chat.message")]
    ChatMessage {
        /// The posted message.
        message: ChatMessageWire,
    },
    /// A reaction was toggled on a message.
    #[serde(rename = "chat.reaction", rename_all = "camelCase")]
    ChatReaction {
        /// Target message.
        message_id: Uuid,
        /// Reaction emoji.
        emoji: String,
        /// Subject that toggled it.
        user_id: String,
        /// True if the reaction was added, false if removed.
        added: bool,
    },
    /// A member's typing state changed.
    #[serde(rename = "chat.typing", rename_all = "camelCase")]
    ChatTyping {
        /// Subject whose typing state changed.
        user_id: String,
        /// Whether the member is typing.
        is_typing: bool,
    },
    /// A request was refused; the connection stays open.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
        /// Seconds to wait before retrying, for rate limits.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
    /// Reply to [`ClientMsg::Ping`].
    Pong,
}

impl ServerMsg {
    /// Shorthand for an error frame without a retry hint.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMsg::Error {
            code,
            message: message.into(),
            retry_after: None,
        }
    }
}

impl From<ServerMsg> for Message {
    fn from(msg: ServerMsg) -> Self {
        let serialized = serde_json::to_string(&msg).expect("failed serialize");
        Message::text(serialized)
    }
}
