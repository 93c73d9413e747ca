//! Persistence collaborator: the platform's REST API.

use crate::config::BackendConfig;
use crate::error::TransportError;
use crate::payment::{Payment, PaymentRequest, PaymentVerification, ProofUpload};
use crate::types::{ConversationSession, Message, OutgoingMessage, Role, SessionId};
use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Idempotent lookup-or-create of the session binding `user_id` and `agency_id`.
    async fn resolve_session(
        &self,
        user_id: &str,
        agency_id: &str,
    ) -> Result<ConversationSession, TransportError>;

    async fn list_sessions(
        &self,
        viewer: Role,
        id: &str,
    ) -> Result<Vec<ConversationSession>, TransportError>;

    /// Server-ordered message log of a session.
    async fn fetch_messages(&self, session_id: &SessionId) -> Result<Vec<Message>, TransportError>;

    async fn post_message(
        &self,
        session_id: &SessionId,
        message: &OutgoingMessage,
    ) -> Result<Message, TransportError>;

    async fn mark_read(&self, session_id: &SessionId, reader: Role) -> Result<(), TransportError>;
}

#[async_trait]
pub trait PaymentBackend: Send + Sync {
    async fn create_payment(
        &self,
        session_id: &SessionId,
        request: &PaymentRequest,
    ) -> Result<Payment, TransportError>;

    async fn update_payment(
        &self,
        verification: &PaymentVerification,
    ) -> Result<Payment, TransportError>;

    async fn latest_payment(&self, session_id: &SessionId)
        -> Result<Option<Payment>, TransportError>;

    async fn upload_proof(
        &self,
        payment_id: &str,
        proof: &ProofUpload,
        file: Bytes,
    ) -> Result<Payment, TransportError>;
}

/// Responses arrive either bare or wrapped in `{"data": ...}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(value) => value,
        }
    }
}

#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpBackend {
    pub fn new(cfg: &BackendConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds.max(1)))
            .build()?;
        Ok(Self::with_client(client, cfg))
    }

    pub fn with_client(client: Client, cfg: &BackendConfig) -> Self {
        Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_token: cfg.api_token.clone(),
        }
    }

    fn url(&self, segments: &[&str]) -> String {
        let mut url = self.base_url.clone();
        for segment in segments {
            url.push('/');
            url.extend(utf8_percent_encode(segment, NON_ALPHANUMERIC));
        }
        url
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match self.api_token.as_ref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

async fn check_status(resp: Response) -> Result<Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T, TransportError> {
    let resp = check_status(resp).await?;
    let bytes = resp.bytes().await?;
    let envelope: Envelope<T> = serde_json::from_slice(&bytes)?;
    Ok(envelope.into_inner())
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn resolve_session(
        &self,
        user_id: &str,
        agency_id: &str,
    ) -> Result<ConversationSession, TransportError> {
        let req = self
            .client
            .post(self.url(&["chat", "sessions", "resolve"]))
            .json(&json!({"user_id": user_id, "agency_id": agency_id}));
        let resp = self.authed(req).send().await?;
        read_json(resp).await
    }

    async fn list_sessions(
        &self,
        viewer: Role,
        id: &str,
    ) -> Result<Vec<ConversationSession>, TransportError> {
        let req = self
            .client
            .get(self.url(&["chat", "sessions"]))
            .query(&[("role", viewer.as_str()), ("id", id)]);
        let resp = self.authed(req).send().await?;
        read_json(resp).await
    }

    async fn fetch_messages(&self, session_id: &SessionId) -> Result<Vec<Message>, TransportError> {
        let req = self
            .client
            .get(self.url(&["chat", "sessions", session_id.as_str(), "messages"]));
        let resp = self.authed(req).send().await?;
        read_json(resp).await
    }

    async fn post_message(
        &self,
        session_id: &SessionId,
        message: &OutgoingMessage,
    ) -> Result<Message, TransportError> {
        let req = self
            .client
            .post(self.url(&["chat", "sessions", session_id.as_str(), "messages"]))
            .json(message);
        let resp = self.authed(req).send().await?;
        read_json(resp).await
    }

    async fn mark_read(&self, session_id: &SessionId, reader: Role) -> Result<(), TransportError> {
        let req = self
            .client
            .post(self.url(&["chat", "sessions", session_id.as_str(), "read"]))
            .json(&json!({"reader": reader}));
        let resp = self.authed(req).send().await?;
        check_status(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl PaymentBackend for HttpBackend {
    async fn create_payment(
        &self,
        session_id: &SessionId,
        request: &PaymentRequest,
    ) -> Result<Payment, TransportError> {
        let req = self.client.post(self.url(&["payments"])).json(&json!({
            "session_id": session_id,
            "amount": request.amount,
            "description": request.description,
        }));
        let resp = self.authed(req).send().await?;
        read_json(resp).await
    }

    async fn update_payment(
        &self,
        verification: &PaymentVerification,
    ) -> Result<Payment, TransportError> {
        let req = self
            .client
            .put(self.url(&["payments", verification.payment_id.as_str()]))
            .json(verification);
        let resp = self.authed(req).send().await?;
        read_json(resp).await
    }

    async fn latest_payment(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Payment>, TransportError> {
        let req = self
            .client
            .get(self.url(&["payments", "latest"]))
            .query(&[("session_id", session_id.as_str())]);
        let resp = self.authed(req).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        read_json(resp).await.map(Some)
    }

    async fn upload_proof(
        &self,
        payment_id: &str,
        proof: &ProofUpload,
        file: Bytes,
    ) -> Result<Payment, TransportError> {
        let part = reqwest::multipart::Part::bytes(file.to_vec())
            .file_name(proof.filename.clone())
            .mime_str(&proof.mime_type)?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("size", proof.size.to_string());
        let req = self
            .client
            .post(self.url(&["payments", payment_id, "proof"]))
            .multipart(form);
        let resp = self.authed(req).send().await?;
        read_json(resp).await
    }
}
