use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agency,
}

impl Role {
    pub fn counterpart(self) -> Role {
        match self {
            Role::User => Role::Agency,
            Role::Agency => Role::User,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agency => "agency",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    FormRequest,
    FormResponse,
    PaymentRequest,
    PaymentStatus,
    ProofUpload,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCounts {
    pub user: u32,
    pub agency: u32,
}

impl UnreadCounts {
    pub fn for_role(&self, role: Role) -> u32 {
        match role {
            Role::User => self.user,
            Role::Agency => self.agency,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: SessionId,
    pub user_id: String,
    pub agency_id: String,
    #[serde(default)]
    pub unread: UnreadCounts,
    pub created_at: DateTime<Utc>,
}

/// A server-confirmed chat message. The payload is never interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sender: Role,
    pub kind: MessageKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl Message {
    pub fn sort_key(&self) -> (DateTime<Utc>, &MessageId) {
        (self.created_at, &self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub sender: Role,
    pub kind: MessageKind,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl OutgoingMessage {
    pub fn new(sender: Role, kind: MessageKind, payload: Value) -> Self {
        Self {
            sender,
            kind,
            payload,
            client_ref: None,
        }
    }

    pub fn text(sender: Role, text: impl Into<String>) -> Self {
        Self::new(sender, MessageKind::Text, Value::String(text.into()))
    }

    pub fn form_request(sender: Role, form: Value) -> Self {
        Self::new(sender, MessageKind::FormRequest, form)
    }

    pub fn form_response(sender: Role, response: Value) -> Self {
        Self::new(sender, MessageKind::FormResponse, response)
    }

    pub fn with_client_ref(mut self, client_ref: impl Into<String>) -> Self {
        self.client_ref = Some(client_ref.into());
        self
    }
}

/// Optimistic local copy of an outgoing message awaiting confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEcho {
    pub client_ref: String,
    pub session_id: SessionId,
    pub sender: Role,
    pub kind: MessageKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl LocalEcho {
    pub fn matches(&self, confirmed: &Message) -> bool {
        if let Some(client_ref) = confirmed.client_ref.as_deref() {
            return client_ref == self.client_ref;
        }
        self.sender == confirmed.sender
            && self.kind == confirmed.kind
            && self.payload == confirmed.payload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Audio,
    Video,
}

/// Call-signaling events relayed through the session room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum CallSignal {
    CallUser {
        from: Role,
        kind: CallKind,
        #[serde(default)]
        offer: Value,
    },
    CallAccepted {
        from: Role,
        #[serde(default)]
        answer: Value,
    },
    CallEnded {
        from: Role,
    },
    UserLeft {
        from: Role,
    },
}

impl CallSignal {
    pub fn event_name(&self) -> &'static str {
        match self {
            CallSignal::CallUser { .. } => "call_user",
            CallSignal::CallAccepted { .. } => "call_accepted",
            CallSignal::CallEnded { .. } => "call_ended",
            CallSignal::UserLeft { .. } => "user_left",
        }
    }
}
