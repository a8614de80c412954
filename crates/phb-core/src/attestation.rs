//! Device attestations issued by the desktop during pairing.
//!
//! An attestation is a JSON blob `{device_id, device_public_key, expires_at?}`
//! plus the desktop's Ed25519 signature over the blob bytes. The blob is
//! carried as an opaque string and never re-encoded: verification runs over
//! the exact bytes that arrived on the wire.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::crypto;

/// Claims embedded in an attestation blob.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AttestationClaims {
    pub device_id: String,
    pub device_public_key: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// Why an attestation was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationError {
    /// The desktop signature does not verify over the blob bytes.
    BadDesktopSignature,
    /// The blob is not the expected JSON shape.
    MalformedBlob,
    /// The embedded device_id does not match the connecting device.
    DeviceIdMismatch,
    /// `expires_at` has passed or is unparseable.
    Expired,
}

/// Verify the desktop-signed attestation chain for a connecting device.
///
/// Checks, in order: desktop signature over the exact blob bytes, blob shape,
/// device_id match, and expiry (server clock, UTC). The caller still has to
/// verify the nonce signature under the returned `device_public_key`.
pub fn verify_device_attestation(
    desktop_public_key_b64: &str,
    blob: &str,
    desktop_signature_b64: &str,
    expected_device_id: &str,
    now: DateTime<Utc>,
) -> Result<AttestationClaims, AttestationError> {
    if !crypto::verify(desktop_public_key_b64, blob.as_bytes(), desktop_signature_b64) {
        return Err(AttestationError::BadDesktopSignature);
    }

    let claims: AttestationClaims =
        serde_json::from_str(blob).map_err(|_| AttestationError::MalformedBlob)?;
    if claims.device_id.is_empty() || claims.device_public_key.is_empty() {
        return Err(AttestationError::MalformedBlob);
    }
    if claims.device_id != expected_device_id {
        return Err(AttestationError::DeviceIdMismatch);
    }

    if let Some(ref raw) = claims.expires_at {
        let expiry = DateTime::parse_from_rfc3339(raw).map_err(|_| AttestationError::Expired)?;
        if expiry.with_timezone(&Utc) <= now {
            return Err(AttestationError::Expired);
        }
    }

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn signed_blob(desktop: &Keypair, device_id: &str, device_key: &str, expires_at: Option<&str>) -> (String, String) {
        let mut obj = serde_json::json!({
            "device_id": device_id,
            "device_public_key": device_key,
        });
        if let Some(exp) = expires_at {
            obj["expires_at"] = exp.into();
        }
        let blob = obj.to_string();
        let sig = desktop.sign(blob.as_bytes());
        (blob, sig)
    }

    #[test]
    fn valid_attestation_passes() {
        let desktop = Keypair::generate();
        let device = Keypair::generate();
        let (blob, sig) = signed_blob(&desktop, "phone-1", &device.public_key_b64(), Some("2099-01-01T00:00:00Z"));

        let claims = verify_device_attestation(&desktop.public_key_b64(), &blob, &sig, "phone-1", Utc::now()).unwrap();
        assert_eq!(claims.device_id, "phone-1");
        assert_eq!(claims.device_public_key, device.public_key_b64());
    }

    #[test]
    fn attestation_without_expiry_passes() {
        let desktop = Keypair::generate();
        let device = Keypair::generate();
        let (blob, sig) = signed_blob(&desktop, "phone-1", &device.public_key_b64(), None);
        assert!(verify_device_attestation(&desktop.public_key_b64(), &blob, &sig, "phone-1", Utc::now()).is_ok());
    }

    #[test]
    fn wrong_desktop_key_rejected() {
        let desktop = Keypair::generate();
        let impostor = Keypair::generate();
        let device = Keypair::generate();
        let (blob, sig) = signed_blob(&impostor, "phone-1", &device.public_key_b64(), None);
        assert_eq!(
            verify_device_attestation(&desktop.public_key_b64(), &blob, &sig, "phone-1", Utc::now()),
            Err(AttestationError::BadDesktopSignature)
        );
    }

    #[test]
    fn device_id_mismatch_rejected() {
        let desktop = Keypair::generate();
        let device = Keypair::generate();
        let (blob, sig) = signed_blob(&desktop, "phone-1", &device.public_key_b64(), None);
        assert_eq!(
            verify_device_attestation(&desktop.public_key_b64(), &blob, &sig, "phone-2", Utc::now()),
            Err(AttestationError::DeviceIdMismatch)
        );
    }

    #[test]
    fn expired_attestation_rejected() {
        let desktop = Keypair::generate();
        let device = Keypair::generate();
        let (blob, sig) = signed_blob(&desktop, "phone-1", &device.public_key_b64(), Some("2020-01-01T00:00:00Z"));
        assert_eq!(
            verify_device_attestation(&desktop.public_key_b64(), &blob, &sig, "phone-1", Utc::now()),
            Err(AttestationError::Expired)
        );
    }

    #[test]
    fn unparseable_expiry_rejected() {
        let desktop = Keypair::generate();
        let device = Keypair::generate();
        let (blob, sig) = signed_blob(&desktop, "phone-1", &device.public_key_b64(), Some("next tuesday"));
        assert_eq!(
            verify_device_attestation(&desktop.public_key_b64(), &blob, &sig, "phone-1", Utc::now()),
            Err(AttestationError::Expired)
        );
    }

    #[test]
    fn signature_binds_exact_bytes() {
        let desktop = Keypair::generate();
        let device = Keypair::generate();
        let (blob, sig) = signed_blob(&desktop, "phone-1", &device.public_key_b64(), None);
        // Semantically identical JSON with different whitespace must fail:
        // the signature covers the bytes, not the value.
        let reformatted = blob.replace(':', ": ");
        assert_eq!(
            verify_device_attestation(&desktop.public_key_b64(), &reformatted, &sig, "phone-1", Utc::now()),
            Err(AttestationError::BadDesktopSignature)
        );
    }

    #[test]
    fn signed_non_json_rejected_as_malformed() {
        let desktop = Keypair::generate();
        let blob = "not json at all";
        let sig = desktop.sign(blob.as_bytes());
        assert_eq!(
            verify_device_attestation(&desktop.public_key_b64(), blob, &sig, "phone-1", Utc::now()),
            Err(AttestationError::MalformedBlob)
        );
    }
}
