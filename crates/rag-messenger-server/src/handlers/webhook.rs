use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;

use crate::state::AppState;
use crate::utils::error::ApiError;
use crate::webhook::verification::{SIGNATURE_256_HEADER, SIGNATURE_SHA1_HEADER};
use crate::webhook::EventSummary;

/// Handshake parameters; the plain names are accepted as aliases.
#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode", alias = "mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token", alias = "verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge", alias = "challenge")]
    pub challenge: Option<String>,
}

pub async fn verify_handler(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Result<String, ApiError> {
    let challenge = state
        .webhook
        .verify_subscription(
            query.mode.as_deref(),
            query.verify_token.as_deref(),
            query.challenge.as_deref(),
        )
        .await?;
    Ok(challenge)
}

/// Takes the raw body so the signature covers exactly what was sent.
pub async fn event_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<EventSummary>, ApiError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let summary = state
        .webhook
        .handle_event(
            &body,
            header(SIGNATURE_256_HEADER),
            header(SIGNATURE_SHA1_HEADER),
        )
        .await?;
    Ok(Json(summary))
}
