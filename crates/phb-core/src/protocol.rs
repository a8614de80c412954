//! Wire messages for the gateway WebSocket protocol.
//!
//! One UTF-8 JSON object per text frame. Relay payloads stay opaque
//! (`serde_json::Value`); only the handshake messages have fixed shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames larger than this are rejected with close code 1009.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Close codes used by the handshake and the registry.
pub const CLOSE_MISSING_DEVICE_ID: u16 = 4400;
pub const CLOSE_AUTH_FAILED: u16 = 4401;
pub const CLOSE_ALREADY_CLAIMED: u16 = 4403;
pub const CLOSE_SUPERSEDED: u16 = 4409;

/// Authenticated principal kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Desktop,
    Device,
}

/// How a client proves itself in the auth response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    DesktopClaim,
    Desktop,
    Device,
}

/// First server frame on every accepted socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthChallenge {
    #[serde(rename = "type")]
    pub typ: String,
    pub nonce: String,
    pub gateway_public_key: String,
    pub claimed: bool,
}

impl AuthChallenge {
    pub fn new(nonce: impl Into<String>, gateway_public_key: impl Into<String>, claimed: bool) -> Self {
        Self {
            typ: "auth_challenge".to_string(),
            nonce: nonce.into(),
            gateway_public_key: gateway_public_key.into(),
            claimed,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The attestation as carried in an auth response: opaque blob string plus
/// the desktop's signature over those exact bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationEnvelope {
    pub blob: String,
    pub desktop_signature: String,
}

/// Client reply to the challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub auth_mode: AuthMode,
    pub nonce_signature: String,
    /// Present for `desktop_claim` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_public_key: Option<String>,
    /// Present for `device` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<AttestationEnvelope>,
}

/// Server confirmation after a successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOk {
    #[serde(rename = "type")]
    pub typ: String,
    pub role: Role,
    pub device_id: String,
}

impl AuthOk {
    pub fn new(role: Role, device_id: impl Into<String>) -> Self {
        Self {
            typ: "auth_ok".to_string(),
            role,
            device_id: device_id.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A handshake refusal: WebSocket close code plus a short reason token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthReject {
    pub code: u16,
    pub reason: &'static str,
}

impl AuthReject {
    pub const fn new(code: u16, reason: &'static str) -> Self {
        Self { code, reason }
    }

    pub const fn auth_failed() -> Self {
        Self::new(CLOSE_AUTH_FAILED, "auth_failed")
    }

    pub const fn already_claimed() -> Self {
        Self::new(CLOSE_ALREADY_CLAIMED, "already_claimed")
    }
}

/// What an unauthenticated socket may send after the challenge.
#[derive(Debug, Clone)]
pub enum HandshakeFrame {
    AuthResponse(AuthResponse),
    /// Forwarded to the desktop unchanged; the gateway never inspects it.
    PairingRequest(Value),
}

/// Classify the first client frame of the handshake by its `type` field.
/// Returns `None` for malformed JSON or an unexpected type.
pub fn classify_handshake_frame(text: &str) -> Option<HandshakeFrame> {
    let value: Value = serde_json::from_str(text).ok()?;
    let typ = value.get("type").and_then(Value::as_str).map(str::to_string);
    match typ.as_deref() {
        Some("auth_response") => serde_json::from_value(value)
            .ok()
            .map(HandshakeFrame::AuthResponse),
        Some("pairing_request") => Some(HandshakeFrame::PairingRequest(value)),
        _ => None,
    }
}

/// Whether a post-auth frame is a (forbidden) second auth attempt.
pub fn is_auth_response(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(Value::as_str).map(|t| t == "auth_response"))
        .unwrap_or(false)
}

/// Build the rejection sent to a pairing socket when no desktop is connected.
pub fn pairing_rejected(reason: &str) -> String {
    serde_json::json!({
        "type": "pairing_response",
        "status": "rejected",
        "reason": reason,
    })
    .to_string()
}
