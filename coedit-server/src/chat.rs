//! Per-room chat: bounded history, reactions, typing, rate limits.
//!
//! A [`ChatRoom`] is plain state owned and driven by its document session's
//! dispatcher; it validates requests and reports what to broadcast, but never
//! touches connections itself.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::protocol::{ChatMessageWire, ChatSendReq};

/// Maximum chat message length, in characters.
pub const MAX_MESSAGE_LEN: usize = 5000;
/// Maximum distinct reaction emojis per message.
pub const MAX_REACTION_EMOJIS: usize = 20;
/// Typing indicators expire after this much silence.
pub const TYPING_EXPIRY: Duration = Duration::from_secs(5);
/// How many recent messages are replayed to a joining member.
pub const JOIN_REPLAY: usize = 50;

const SEND_LIMIT: u32 = 10;
const REACT_LIMIT: u32 = 30;
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Why a chat request was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatRefusal {
    /// Message body exceeds [`MAX_MESSAGE_LEN`].
    TooLong,
    /// Sender is not in the room.
    NotMember,
    /// Per-user rate limit hit; retry after the given number of seconds.
    RateLimited(u64),
    /// Reaction target does not exist (or has been evicted).
    UnknownMessage,
    /// Message already carries [`MAX_REACTION_EMOJIS`] distinct emojis.
    TooManyReactions,
}

#[derive(Clone, Debug)]
struct RateWindow {
    start: Instant,
    count: u32,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self { start: now, count: 0 }
    }

    fn admit(&mut self, now: Instant, limit: u32) -> Result<(), u64> {
        if now.duration_since(self.start) >= RATE_WINDOW {
            self.start = now;
            self.count = 0;
        }
        if self.count >= limit {
            let left = RATE_WINDOW.saturating_sub(now.duration_since(self.start));
            return Err(left.as_secs().max(1));
        }
        self.count += 1;
        Ok(())
    }
}

/// A message held in the room's ring buffer.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    /// Server-assigned id.
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
    pub is_code_snippet: bool,
    /// Language tag for code snippets.
    pub code_language: Option<String>,
    /// Mentioned user ids.
    pub mentions: Vec<String>,
    /// Reactions: emoji to the set of users holding it.
    pub reactions: HashMap<String, HashSet<String>>,
    /// Echo of the client correlation id.
    pub client_id: Option<String>,
}

impl StoredMessage {
    /// Wire representation of this message.
    pub fn to_wire(&self) -> ChatMessageWire {
        let reactions = self
            .reactions
            .iter()
            .map(|(emoji, users)| {
                let mut users: Vec<String> = users.iter().cloned().collect();
                users.sort();
                (emoji.clone(), users)
            })
            .collect();
        ChatMessageWire {
            id: self.id,
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            content: self.content.clone(),
            timestamp: self.timestamp,
            is_code_snippet: self.is_code_snippet,
            code_language: self.code_language.clone(),
            mentions: self.mentions.clone(),
            reactions,
            client_id: self.client_id.clone(),
        }
    }
}

/// Chat state for one room.
pub struct ChatRoom {
    participants: HashSet<String>,
    messages: VecDeque<StoredMessage>,
    unread: HashMap<String, u32>,
    typing: HashMap<String, Instant>,
    sends: HashMap<String, RateWindow>,
    reacts: HashMap<String, RateWindow>,
    capacity: usize,
}

impl ChatRoom {
    /// An empty room holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            participants: HashSet::new(),
            messages: VecDeque::new(),
            unread: HashMap::new(),
            typing: HashMap::new(),
            sends: HashMap::new(),
            reacts: HashMap::new(),
            capacity,
        }
    }

    /// Register a participant; resets their unread counter.
    pub fn join(&mut self, user_id: &str) {
        self.participants.insert(user_id.to_string());
        self.unread.insert(user_id.to_string(), 0);
    }

    /// Remove a participant. Their unread counter keeps counting.
    pub fn leave(&mut self, user_id: &str) {
        self.participants.remove(user_id);
        self.typing.remove(user_id);
    }

    /// Number of messages currently held in the ring.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// The most recent messages, oldest first, capped at [`JOIN_REPLAY`].
    pub fn recent(&self) -> impl Iterator<Item = &StoredMessage> {
        let skip = self.messages.len().saturating_sub(JOIN_REPLAY);
        self.messages.iter().skip(skip)
    }

    /// Unread count for a user.
    pub fn unread_of(&self, user_id: &str) -> u32 {
        self.unread.get(user_id).copied().unwrap_or(0)
    }

    /// Accept a message from `user_id`, returning the stored copy.
    pub fn send(
        &mut self,
        user_id: &str,
        display_name: &str,
        req: ChatSendReq,
        now: Instant,
    ) -> Result<&StoredMessage, ChatRefusal> {
        if !self.participants.contains(user_id) {
            return Err(ChatRefusal::NotMember);
        }
        if req.content.chars().count() > MAX_MESSAGE_LEN {
            return Err(ChatRefusal::TooLong);
        }
        self.sends
            .entry(user_id.to_string())
            .or_insert_with(|| RateWindow::new(now))
            .admit(now, SEND_LIMIT)
            .map_err(ChatRefusal::RateLimited)?;

        self.typing.remove(user_id);
        for (other, count) in self.unread.iter_mut() {
            if other != user_id {
                *count += 1;
            }
        }
        self.unread.insert(user_id.to_string(), 0);

        self.messages.push_back(StoredMessage {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            content: req.content,
            timestamp: Utc::now(),
            is_code_snippet: req.is_code_snippet,
            code_language: req.code_language,
            mentions: req.mentions,
            reactions: HashMap::new(),
            client_id: req.client_id,
        });
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
        Ok(self.messages.back().expect("just pushed"))
    }

    /// Toggle `emoji` on a message for `user_id`. Returns whether the
    /// reaction is now present.
    pub fn react(
        &mut self,
        user_id: &str,
        message_id: Uuid,
        emoji: &str,
        now: Instant,
    ) -> Result<bool, ChatRefusal> {
        if !self.participants.contains(user_id) {
            return Err(ChatRefusal::NotMember);
        }
        self.reacts
            .entry(user_id.to_string())
            .or_insert_with(|| RateWindow::new(now))
            .admit(now, REACT_LIMIT)
            .map_err(ChatRefusal::RateLimited)?;

        let message = self
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.id == message_id)
            .ok_or(ChatRefusal::UnknownMessage)?;
        if let Some(holders) = message.reactions.get_mut(emoji) {
            if holders.remove(user_id) {
                if holders.is_empty() {
                    message.reactions.remove(emoji);
                }
                return Ok(false);
            }
            holders.insert(user_id.to_string());
            return Ok(true);
        }
        if message.reactions.len() >= MAX_REACTION_EMOJIS {
            return Err(ChatRefusal::TooManyReactions);
        }
        message
            .reactions
            .entry(emoji.to_string())
            .or_default()
            .insert(user_id.to_string());
        Ok(true)
    }

    /// Record a typing signal. Returns whether the change should be
    /// broadcast (repeated "still typing" refreshes stay silent).
    pub fn set_typing(&mut self, user_id: &str, is_typing: bool, now: Instant) -> bool {
        if !self.participants.contains(user_id) {
            return false;
        }
        if is_typing {
            self.typing.insert(user_id.to_string(), now).is_none()
        } else {
            self.typing.remove(user_id).is_some()
        }
    }

    /// Expire typing indicators that have gone silent; returns the users
    /// whose indicators just lapsed.
    pub fn expire_typing(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .typing
            .iter()
            .filter(|(_, since)| now.duration_since(**since) >= TYPING_EXPIRY)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &expired {
            self.typing.remove(user);
        }
        expired
    }
}
