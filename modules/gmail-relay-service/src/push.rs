//! Pub/Sub push envelope decoding.

use crate::gmail_types::PubSubPushEnvelope;
use axum::body::{Body, Bytes};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use gmail_relay_types::PushPayload;

#[derive(Debug)]
pub enum DecodeError {
    TooLarge { limit: usize },
    Body(String),
    Envelope(String),
    Base64(String),
    Payload(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::TooLarge { limit } => write!(f, "push body exceeds {} bytes", limit),
            DecodeError::Body(e) => write!(f, "failed to read push body: {}", e),
            DecodeError::Envelope(e) => write!(f, "invalid push envelope: {}", e),
            DecodeError::Base64(e) => write!(f, "invalid base64 in message.data: {}", e),
            DecodeError::Payload(e) => write!(f, "invalid notification payload: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Read at most `limit` bytes of the request body. Anything larger is rejected
/// without being buffered further.
pub async fn read_body(body: Body, limit: usize) -> Result<Bytes, DecodeError> {
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        let text = e.to_string();
        if is_length_limit_error(&e) {
            DecodeError::TooLarge { limit }
        } else {
            DecodeError::Body(text)
        }
    })
}

fn is_length_limit_error(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.to_string().to_ascii_lowercase().contains("length limit") {
            return true;
        }
        source = e.source();
    }
    false
}

/// Decode `{"message": {"data": "<base64 of {emailAddress, historyId}>"}}`.
pub fn decode_push(bytes: &[u8]) -> Result<(PushPayload, Option<String>), DecodeError> {
    let envelope: PubSubPushEnvelope =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Envelope(e.to_string()))?;

    let data = envelope.message.data.trim();
    if data.is_empty() {
        return Err(DecodeError::Envelope("message.data is empty".to_string()));
    }

    let raw = decode_base64(data)?;
    let payload: PushPayload =
        serde_json::from_slice(&raw).map_err(|e| DecodeError::Payload(e.to_string()))?;

    if payload.email_address.trim().is_empty() {
        return Err(DecodeError::Payload("emailAddress is empty".to_string()));
    }

    Ok((payload, envelope.message.message_id))
}

/// Pub/Sub sends padded standard base64, but unpadded and URL-safe variants
/// show up from proxies and test tooling.
fn decode_base64(data: &str) -> Result<Vec<u8>, DecodeError> {
    let mut last_err = None;
    for engine in [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD] {
        match engine.decode(data) {
            Ok(bytes) => return Ok(bytes),
            Err(e) => last_err = Some(e),
        }
    }
    Err(DecodeError::Base64(
        last_err.map(|e| e.to_string()).unwrap_or_default(),
    ))
}
