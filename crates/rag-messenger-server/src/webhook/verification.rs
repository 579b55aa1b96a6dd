use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use tracing::{debug, warn};

use super::WebhookError;
use crate::database::ConversationStore;
use crate::vault::{matches_any, CredentialVault};

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_256_HEADER: &str = "x-hub-signature-256";
pub const SIGNATURE_SHA1_HEADER: &str = "x-hub-signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Verified,
    /// No app secret configured; the body was accepted unsigned.
    Skipped,
}

/// Verifies `X-Hub-Signature-256` (or the legacy SHA-1 header) over the raw body.
#[derive(Clone)]
pub struct SignatureVerifier {
    app_secret: Option<String>,
}

impl SignatureVerifier {
    pub fn new(app_secret: Option<String>) -> Self {
        Self {
            app_secret: app_secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn verify(
        &self,
        body: &[u8],
        sha256_header: Option<&str>,
        sha1_header: Option<&str>,
    ) -> Result<SignatureCheck, WebhookError> {
        let Some(secret) = &self.app_secret else {
            warn!("No app secret configured, accepting unsigned webhook");
            return Ok(SignatureCheck::Skipped);
        };

        let verified = match (sha256_header, sha1_header) {
            (Some(header), _) => {
                let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                    .map_err(|_| WebhookError::InvalidSignature)?;
                mac.update(body);
                check_tag(header, "sha256=", |tag| mac.verify_slice(tag).is_ok())
            }
            (None, Some(header)) => {
                let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
                    .map_err(|_| WebhookError::InvalidSignature)?;
                mac.update(body);
                check_tag(header, "sha1=", |tag| mac.verify_slice(tag).is_ok())
            }
            (None, None) => false,
        };

        if verified {
            debug!("Webhook signature verified");
            Ok(SignatureCheck::Verified)
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }
}

fn check_tag(header: &str, prefix: &str, verify: impl FnOnce(&[u8]) -> bool) -> bool {
    header
        .trim()
        .strip_prefix(prefix)
        .and_then(|hex_tag| hex::decode(hex_tag).ok())
        .is_some_and(|tag| verify(&tag))
}

/// Subscription handshake: `mode` must be `subscribe` and `token` must match a
/// channel's verify token or the operator-wide fallback.
pub async fn verify_subscription(
    store: &dyn ConversationStore,
    vault: &CredentialVault,
    fallback_token: Option<&str>,
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&str>,
) -> Result<String, WebhookError> {
    let (Some("subscribe"), Some(token), Some(challenge)) = (mode, token, challenge) else {
        return Err(WebhookError::VerificationFailed);
    };

    let mut candidates: Vec<String> = store
        .verify_tokens()
        .await?
        .into_iter()
        .filter_map(|stored| match vault.decrypt(&stored) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("Skipping undecryptable verify token: {}", e);
                None
            }
        })
        .collect();
    candidates.extend(fallback_token.filter(|t| !t.is_empty()).map(str::to_string));

    if matches_any(candidates.iter().map(String::as_str), token) {
        Ok(challenge.to_string())
    } else {
        Err(WebhookError::VerificationFailed)
    }
}
