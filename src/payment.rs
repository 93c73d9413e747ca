//! Payment-request workflow payloads carried inside chat messages.
//!
//! The agency asks for a payment, the user uploads a proof, the agency
//! verifies it. Each step travels as a structured message payload and,
//! for persistence, through the backend's payment endpoints.

use crate::types::{MessageKind, OutgoingMessage, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_PROOF_BYTES: u64 = 5 * 1024 * 1024;
pub const PROOF_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/jpg", "application/pdf"];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PaymentError {
    #[error("please enter a valid amount")]
    InvalidAmount,
    #[error("please provide a description")]
    MissingDescription,
    #[error("proof file is {0} bytes, limit is 5 MiB")]
    ProofTooLarge(u64),
    #[error("unsupported proof type: {0}")]
    UnsupportedProofType(String),
    #[error("payment id is required")]
    MissingPaymentId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub amount: f64,
    pub description: String,
}

impl PaymentRequest {
    pub fn new(amount: f64, description: impl Into<String>) -> Result<Self, PaymentError> {
        let req = Self {
            amount,
            description: description.into().trim().to_string(),
        };
        req.validate()?;
        Ok(req)
    }

    pub fn validate(&self) -> Result<(), PaymentError> {
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(PaymentError::InvalidAmount);
        }
        if self.description.trim().is_empty() {
            return Err(PaymentError::MissingDescription);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Verified,
    Rejected,
}

impl VerificationStatus {
    pub fn resulting_status(self) -> PaymentStatus {
        match self {
            VerificationStatus::Verified => PaymentStatus::Completed,
            VerificationStatus::Rejected => PaymentStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentVerification {
    pub payment_id: String,
    pub status: VerificationStatus,
    #[serde(default)]
    pub notes: String,
}

impl PaymentVerification {
    pub fn new(
        payment_id: impl Into<String>,
        status: VerificationStatus,
        notes: impl Into<String>,
    ) -> Result<Self, PaymentError> {
        let payment_id = payment_id.into();
        if payment_id.trim().is_empty() {
            return Err(PaymentError::MissingPaymentId);
        }
        Ok(Self {
            payment_id,
            status,
            notes: notes.into().trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub amount: f64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: PaymentStatus,
    #[serde(default)]
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofUpload {
    pub payment_id: Option<String>,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl ProofUpload {
    pub fn new(
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
    ) -> Result<Self, PaymentError> {
        let proof = Self {
            payment_id: None,
            filename: filename.into(),
            mime_type: mime_type.into().to_lowercase(),
            size,
            url: None,
        };
        proof.validate()?;
        Ok(proof)
    }

    pub fn validate(&self) -> Result<(), PaymentError> {
        if !PROOF_MIME_TYPES.contains(&self.mime_type.as_str()) {
            return Err(PaymentError::UnsupportedProofType(self.mime_type.clone()));
        }
        if self.size > MAX_PROOF_BYTES {
            return Err(PaymentError::ProofTooLarge(self.size));
        }
        Ok(())
    }
}

impl OutgoingMessage {
    pub fn payment_request(sender: Role, request: &PaymentRequest) -> Result<Self, PaymentError> {
        request.validate()?;
        Ok(Self::new(
            sender,
            MessageKind::PaymentRequest,
            serde_json::json!(request),
        ))
    }

    pub fn payment_status(sender: Role, verification: &PaymentVerification) -> Self {
        Self::new(
            sender,
            MessageKind::PaymentStatus,
            serde_json::json!({
                "payment_id": verification.payment_id,
                "verification": verification.status,
                "status": verification.status.resulting_status(),
                "notes": verification.notes,
            }),
        )
    }

    pub fn proof_upload(sender: Role, proof: &ProofUpload) -> Result<Self, PaymentError> {
        proof.validate()?;
        Ok(Self::new(
            sender,
            MessageKind::ProofUpload,
            serde_json::json!(proof),
        ))
    }
}
