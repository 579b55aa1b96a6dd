//! Platform webhook: subscription handshake, signature check, event dispatch.

pub mod payload;
pub mod service;
pub mod verification;

use thiserror::Error;

use crate::database::StoreError;
use crate::utils::ApiError;

pub use payload::{classify, parse_envelope, Entry, MessagingEvent};
pub use service::{EventSummary, WebhookService};
pub use verification::{SignatureCheck, SignatureVerifier};

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("subscription verification failed")]
    VerificationFailed,

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("malformed webhook payload: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::VerificationFailed | WebhookError::InvalidSignature => {
                ApiError::Forbidden(err.to_string())
            }
            WebhookError::Malformed(msg) => ApiError::BadRequest(msg),
            WebhookError::Store(e) => ApiError::from(e),
        }
    }
}
