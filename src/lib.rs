pub mod backend;
pub mod channel;
pub mod config;
pub mod error;
pub mod log;
pub mod payment;
pub mod realtime;
pub mod session;
pub mod types;

pub use channel::{ChannelMode, MessageChannel, MessageSubscription};
pub use config::Config;
pub use error::{ChatError, TransportError};
pub use session::SessionResolver;
pub use types::{Message, MessageKind, OutgoingMessage, Role, SessionId};

use self::backend::{HttpBackend, PaymentBackend};
use self::payment::{Payment, PaymentRequest, PaymentVerification, ProofUpload};
use self::realtime::WsTransport;
use bytes::Bytes;
use std::sync::Arc;
use tracing::info;

/// Resolver, channel and payment endpoints wired to one backend and socket.
pub struct ChatClient {
    pub resolver: SessionResolver,
    pub channel: MessageChannel,
    payments: Arc<dyn PaymentBackend>,
}

impl ChatClient {
    /// Builds the HTTP backend and starts the socket connection loop.
    /// Must be called inside a tokio runtime.
    pub fn connect(config: &Config) -> Result<Self, TransportError> {
        let backend = Arc::new(HttpBackend::new(&config.backend)?);
        let transport = Arc::new(WsTransport::connect(&config.realtime));
        info!(
            "chat client using {} and {}",
            config.backend.base_url, config.realtime.socket_url
        );
        Ok(Self {
            resolver: SessionResolver::new(backend.clone()),
            channel: MessageChannel::new(backend.clone(), transport, config.channel.clone()),
            payments: backend,
        })
    }

    pub fn from_parts(
        resolver: SessionResolver,
        channel: MessageChannel,
        payments: Arc<dyn PaymentBackend>,
    ) -> Self {
        Self {
            resolver,
            channel,
            payments,
        }
    }

    /// Resolves the session between the viewer and the counterpart and opens it.
    pub async fn start_conversation(
        &self,
        viewer: Role,
        self_id: &str,
        counterpart_id: &str,
    ) -> Result<SessionId, ChatError> {
        let session_id = self
            .resolver
            .resolve_for(viewer, self_id, counterpart_id)
            .await?;
        self.channel.open(session_id.clone()).await?;
        Ok(session_id)
    }

    fn open_session(&self) -> Result<SessionId, ChatError> {
        self.channel.session_id().ok_or(ChatError::NotOpen)
    }

    /// Records the payment request with the backend, then posts it in the chat.
    ///
    /// The two steps are not atomic. If the chat message fails to send, the
    /// payment already exists on the backend. `latest_payment` returns it, and
    /// the request message can be posted again through the channel with
    /// `OutgoingMessage::payment_request` instead of creating a second payment.
    pub async fn request_payment(
        &self,
        sender: Role,
        request: PaymentRequest,
    ) -> Result<(Payment, Message), ChatError> {
        request.validate()?;
        let session_id = self.open_session()?;
        let payment = self
            .payments
            .create_payment(&session_id, &request)
            .await
            .map_err(|source| ChatError::Send {
                session_id: session_id.clone(),
                source,
            })?;
        let message = self
            .channel
            .send_with_echo(OutgoingMessage::payment_request(sender, &request)?)
            .await?;
        Ok((payment, message))
    }

    pub async fn verify_payment(
        &self,
        sender: Role,
        verification: PaymentVerification,
    ) -> Result<(Payment, Message), ChatError> {
        let session_id = self.open_session()?;
        let payment = self
            .payments
            .update_payment(&verification)
            .await
            .map_err(|source| ChatError::Send {
                session_id: session_id.clone(),
                source,
            })?;
        let message = self
            .channel
            .send_with_echo(OutgoingMessage::payment_status(sender, &verification))
            .await?;
        Ok((payment, message))
    }

    pub async fn upload_proof(
        &self,
        sender: Role,
        payment_id: &str,
        mut proof: ProofUpload,
        file: Bytes,
    ) -> Result<(Payment, Message), ChatError> {
        // The declared size is replaced by what is actually being uploaded.
        proof.size = file.len() as u64;
        proof.validate()?;
        let session_id = self.open_session()?;
        let payment = self
            .payments
            .upload_proof(payment_id, &proof, file)
            .await
            .map_err(|source| ChatError::Send {
                session_id: session_id.clone(),
                source,
            })?;
        proof.payment_id = Some(payment.id.clone());
        let message = self
            .channel
            .send_with_echo(OutgoingMessage::proof_upload(sender, &proof)?)
            .await?;
        Ok((payment, message))
    }

    pub async fn latest_payment(&self) -> Result<Option<Payment>, ChatError> {
        let session_id = self.open_session()?;
        self.payments
            .latest_payment(&session_id)
            .await
            .map_err(|source| ChatError::Fetch { session_id, source })
    }
}
