//! In-memory message log for the open session.
//!
//! The live room and the REST backend both deliver copies of the same
//! messages. Everything funnels through [`MessageLog::merge`], which keeps
//! the log sorted by `(created_at, id)`, drops copies whose ID is already
//! present, and swaps optimistic echoes for their confirmed counterparts.

use crate::types::{LocalEcho, Message, MessageId, Role, SessionId};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First sighting of this ID.
    Inserted,
    /// First sighting of this ID; it confirmed the echo with this client ref.
    ReplacedEcho(String),
    /// ID already present.
    Duplicate,
    /// Message belongs to a different session.
    Foreign,
}

impl MergeOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, MergeOutcome::Inserted | MergeOutcome::ReplacedEcho(_))
    }
}

#[derive(Debug, Clone)]
pub struct MessageLog {
    session_id: SessionId,
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
    echoes: Vec<LocalEcho>,
}

impl MessageLog {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            messages: Vec::new(),
            seen: HashSet::new(),
            echoes: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    pub fn merge(&mut self, message: Message) -> MergeOutcome {
        if message.session_id != self.session_id {
            return MergeOutcome::Foreign;
        }

        if self.seen.contains(&message.id) {
            // Read flags only move forward.
            if message.read {
                if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
                    existing.read = true;
                }
            }
            return MergeOutcome::Duplicate;
        }

        let confirmed_echo = self
            .echoes
            .iter()
            .position(|echo| echo.matches(&message))
            .map(|idx| self.echoes.remove(idx).client_ref);

        let pos = self
            .messages
            .partition_point(|m| m.sort_key() <= message.sort_key());
        self.seen.insert(message.id.clone());
        self.messages.insert(pos, message);

        match confirmed_echo {
            Some(client_ref) => MergeOutcome::ReplacedEcho(client_ref),
            None => MergeOutcome::Inserted,
        }
    }

    /// Merges a batch and returns the messages that were new, in log order.
    pub fn merge_all(&mut self, batch: impl IntoIterator<Item = Message>) -> Vec<Message> {
        let mut fresh = Vec::new();
        for message in batch {
            if self.merge(message.clone()).is_new() {
                fresh.push(message);
            }
        }
        fresh.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        fresh
    }

    pub fn add_echo(&mut self, echo: LocalEcho) {
        self.echoes.push(echo);
    }

    pub fn remove_echo(&mut self, client_ref: &str) -> Option<LocalEcho> {
        let idx = self.echoes.iter().position(|e| e.client_ref == client_ref)?;
        Some(self.echoes.remove(idx))
    }

    pub fn echoes(&self) -> &[LocalEcho] {
        &self.echoes
    }

    /// Echoes still unconfirmed after `max_wait`.
    pub fn expired_echoes(&self, now: DateTime<Utc>, max_wait: Duration) -> Vec<LocalEcho> {
        self.echoes
            .iter()
            .filter(|e| now - e.created_at >= max_wait)
            .cloned()
            .collect()
    }

    /// Flags every message from `sender` as read; returns how many changed.
    pub fn mark_read_from(&mut self, sender: Role) -> usize {
        let mut changed = 0;
        for message in self.messages.iter_mut().filter(|m| m.sender == sender) {
            if !message.read {
                message.read = true;
                changed += 1;
            }
        }
        changed
    }

    /// Unread messages as seen by `viewer`, i.e. unread ones sent by the other side.
    pub fn unread_count(&self, viewer: Role) -> u32 {
        let sender = viewer.counterpart();
        self.messages
            .iter()
            .filter(|m| m.sender == sender && !m.read)
            .count() as u32
    }
}
