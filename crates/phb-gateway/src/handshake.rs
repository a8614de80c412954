//! Authentication handshake flow.
//!
//! Implements the gateway auth protocol:
//! 1. Server sends `auth_challenge` with a fresh nonce
//! 2. Client answers `auth_response` (desktop_claim / desktop / device)
//! 3. Server sends `auth_ok` or closes with a 44xx code
//!
//! Everything here is pure with respect to the socket; `server.rs` owns the
//! I/O and the handshake timeout.

use chrono::Utc;
use phb_core::attestation::{self, AttestationError};
use phb_core::crypto;
use phb_core::protocol::{AuthChallenge, AuthMode, AuthReject, AuthResponse, Role, CLOSE_AUTH_FAILED};
use tracing::{debug, warn};

use crate::state::StateStore;

/// Build the challenge for a freshly accepted socket. Returns the nonce the
/// response must sign and the serialized frame.
pub async fn issue_challenge(state: &StateStore) -> (String, String) {
    let nonce = crypto::random_nonce();
    let challenge =
        AuthChallenge::new(nonce.as_str(), state.gateway_public_key_b64(), state.is_claimed().await);
    (nonce, challenge.to_json())
}

/// Verify an auth_response against the nonce issued to this socket.
///
/// On success returns the authenticated role; on failure the close
/// code/reason pair for the socket. `desktop_claim` binds the desktop key as
/// a side effect.
pub async fn verify_auth_response(
    state: &StateStore,
    device_id: &str,
    nonce_hex: &str,
    response: &AuthResponse,
) -> Result<Role, AuthReject> {
    let nonce = crypto::decode_nonce(nonce_hex);
    match response.auth_mode {
        AuthMode::DesktopClaim => verify_desktop_claim(state, &nonce, response).await,
        AuthMode::Desktop => verify_desktop(state, &nonce, response).await,
        AuthMode::Device => verify_device(state, device_id, &nonce, response).await,
    }
}

async fn verify_desktop_claim(
    state: &StateStore,
    nonce: &[u8],
    response: &AuthResponse,
) -> Result<Role, AuthReject> {
    if state.is_claimed().await {
        return Err(AuthReject::already_claimed());
    }
    let Some(public_key) = response.device_public_key.as_deref() else {
        debug!("desktop claim without public key");
        return Err(AuthReject::auth_failed());
    };
    if !crypto::verify(public_key, nonce, &response.nonce_signature) {
        warn!("desktop claim nonce signature invalid");
        return Err(AuthReject::auth_failed());
    }
    match state.bind_desktop(public_key).await {
        Ok(()) => Ok(Role::Desktop),
        // Lost the race to a concurrent claim.
        Err(phb_core::GatewayError::AlreadyClaimed) => Err(AuthReject::already_claimed()),
        Err(e) => {
            warn!(error = %e, "failed to persist desktop binding");
            Err(AuthReject::auth_failed())
        }
    }
}

async fn verify_desktop(
    state: &StateStore,
    nonce: &[u8],
    response: &AuthResponse,
) -> Result<Role, AuthReject> {
    let Some(desktop_key) = state.desktop_public_key().await else {
        debug!("desktop auth attempted before claim");
        return Err(AuthReject::auth_failed());
    };
    if !crypto::verify(&desktop_key, nonce, &response.nonce_signature) {
        warn!("desktop nonce signature invalid");
        return Err(AuthReject::auth_failed());
    }
    Ok(Role::Desktop)
}

async fn verify_device(
    state: &StateStore,
    device_id: &str,
    nonce: &[u8],
    response: &AuthResponse,
) -> Result<Role, AuthReject> {
    let Some(desktop_key) = state.desktop_public_key().await else {
        debug!("device auth attempted before claim");
        return Err(AuthReject::auth_failed());
    };
    let Some(att) = response.attestation.as_ref() else {
        debug!("device auth without attestation");
        return Err(AuthReject::auth_failed());
    };

    let claims = attestation::verify_device_attestation(
        &desktop_key,
        &att.blob,
        &att.desktop_signature,
        device_id,
        Utc::now(),
    )
    .map_err(|e| match e {
        AttestationError::Expired => AuthReject::new(CLOSE_AUTH_FAILED, "attestation_expired"),
        other => {
            warn!(device_id = %device_id, reason = ?other, "attestation rejected");
            AuthReject::auth_failed()
        }
    })?;

    if !crypto::verify(&claims.device_public_key, nonce, &response.nonce_signature) {
        warn!(device_id = %device_id, "device nonce signature invalid");
        return Err(AuthReject::auth_failed());
    }
    Ok(Role::Device)
}
