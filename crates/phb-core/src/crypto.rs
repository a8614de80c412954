//! Ed25519 primitives for gateway, desktop, and device identities.
//!
//! Keys and signatures travel as standard-alphabet base64; challenge nonces
//! as lowercase hex. Verification failure of any kind, a bad signature or a
//! malformed input alike, reports `false` rather than surfacing an error to
//! the caller.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{GatewayError, GwResult};

/// Length of a challenge nonce in raw bytes (64 hex chars on the wire).
pub const NONCE_LEN: usize = 32;

/// An Ed25519 keypair held in memory via its 32-byte seed.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Restore a keypair from a base64 seed (the `gateway.key` format).
    pub fn from_seed_b64(seed_b64: &str) -> GwResult<Self> {
        let raw = BASE64
            .decode(seed_b64.trim())
            .map_err(|e| GatewayError::Crypto(format!("invalid key encoding: {e}")))?;
        let seed: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| GatewayError::Crypto("Ed25519 seed must be exactly 32 bytes".into()))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    /// The seed as base64, for persistence.
    pub fn seed_b64(&self) -> String {
        BASE64.encode(self.signing.as_bytes())
    }

    /// The public half as base64 raw bytes.
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.signing.verifying_key().as_bytes())
    }

    /// Sign arbitrary bytes, returning a base64 signature.
    pub fn sign(&self, message: &[u8]) -> String {
        BASE64.encode(self.signing.sign(message).to_bytes())
    }
}

/// Verify a base64 Ed25519 signature over `message` under a base64 public key.
///
/// Constant-time via `verify_strict`; any decoding problem yields `false`.
pub fn verify(public_key_b64: &str, message: &[u8], signature_b64: &str) -> bool {
    let Some(key) = decode_verifying_key(public_key_b64) else {
        return false;
    };
    let Ok(sig_raw) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_raw.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    key.verify_strict(message, &signature).is_ok()
}

/// Whether a base64 string decodes to a valid Ed25519 public key.
pub fn is_valid_public_key_b64(public_key_b64: &str) -> bool {
    decode_verifying_key(public_key_b64).is_some()
}

fn decode_verifying_key(public_key_b64: &str) -> Option<VerifyingKey> {
    let raw = BASE64.decode(public_key_b64).ok()?;
    let bytes: [u8; 32] = raw.as_slice().try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

/// Create a fresh challenge nonce: 32 random bytes, lowercase hex.
pub fn random_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Decode a hex nonce back to raw bytes for signing/verification.
pub fn decode_nonce(nonce_hex: &str) -> Vec<u8> {
    hex::decode(nonce_hex).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"challenge bytes");
        assert!(verify(&kp.public_key_b64(), b"challenge bytes", &sig));
    }

    #[test]
    fn tampered_message_fails() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"original");
        assert!(!verify(&kp.public_key_b64(), b"tampered", &sig));
    }

    #[test]
    fn wrong_key_fails() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let sig = kp.sign(b"message");
        assert!(!verify(&other.public_key_b64(), b"message", &sig));
    }

    #[test]
    fn malformed_inputs_return_false_not_panic() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"message");
        assert!(!verify("not-base64!!!", b"message", &sig));
        assert!(!verify(&kp.public_key_b64(), b"message", "@@@"));
        // Valid base64 but wrong length.
        assert!(!verify("AAAA", b"message", &sig));
        assert!(!verify(&kp.public_key_b64(), b"message", "AAAA"));
    }

    #[test]
    fn seed_round_trip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_seed_b64(&kp.seed_b64()).unwrap();
        assert_eq!(kp.public_key_b64(), restored.public_key_b64());
    }

    #[test]
    fn from_seed_rejects_garbage() {
        assert!(Keypair::from_seed_b64("!!!").is_err());
        assert!(Keypair::from_seed_b64("AAAA").is_err()); // too short
    }

    #[test]
    fn nonce_is_64_lowercase_hex() {
        let nonce = random_nonce();
        assert_eq!(nonce.len(), 64);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(nonce, random_nonce());
        assert_eq!(decode_nonce(&nonce).len(), NONCE_LEN);
    }
}
