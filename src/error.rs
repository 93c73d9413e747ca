use crate::payment::PaymentError;
use crate::types::SessionId;

/// Failures of the two collaborators (REST backend and realtime socket).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("realtime connection is down")]
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("could not resolve session for user {user_id} and agency {agency_id}")]
    SessionResolution {
        user_id: String,
        agency_id: String,
        #[source]
        source: TransportError,
    },
    #[error("could not join room {room_id}")]
    ChannelJoin {
        room_id: SessionId,
        #[source]
        source: TransportError,
    },
    #[error("could not send message in session {session_id}")]
    Send {
        session_id: SessionId,
        #[source]
        source: TransportError,
    },
    #[error("could not fetch messages for session {session_id}")]
    Fetch {
        session_id: SessionId,
        #[source]
        source: TransportError,
    },
    #[error("could not mark session {session_id} read")]
    MarkRead {
        session_id: SessionId,
        #[source]
        source: TransportError,
    },
    #[error("channel is not open")]
    NotOpen,
    #[error(transparent)]
    Payment(#[from] PaymentError),
}
