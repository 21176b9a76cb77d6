//! Crypto primitives: content hashing, chain-bound signable bytes and
//! Ed25519 signing.
//!
//! Secret keys never leave this module. Callers hold a [`SignerHandle`] and
//! pass it where a signature is needed; verification goes through a
//! [`KeyDirectory`] of public keys.

use std::collections::HashMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::{Value, json};

use crate::canonical::canonical_bytes;

/// Signature algorithm version. Version 1 = Ed25519.
pub const SIG_ALG_VERSION: u8 = 1;
pub const SIG_ALG_NAME: &str = "Ed25519";

/// Hash algorithm behind `content_hash`.
pub const HASH_ALG_NAME: &str = "SHA-256";

/// `prev_hash` of the event at sequence 1.
pub const GENESIS_ANCHOR: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// SHA-256 over the canonical encoding of a document, lowercase hex.
pub fn content_hash(content: &Value) -> String {
    sha256::digest(canonical_bytes(content))
}

/// Bytes to be signed for an event.
///
/// Includes `prev_hash` so a valid signature cannot be relocated to a
/// different chain position. An absent agent encodes as JSON null.
pub fn signable_bytes(
    content_hash: &str,
    prev_hash: &str,
    agent_id: Option<&str>,
) -> Vec<u8> {
    let doc = json!({
        "agent_id": agent_id,
        "content_hash": content_hash,
        "prev_hash": prev_hash,
    });
    canonical_bytes(&doc)
}

/// Raw signature bytes to base64 for transport. Ed25519 signatures are 64
/// bytes, which produces ~88 base64 characters.
pub fn signature_to_base64(signature: &[u8]) -> String {
    BASE64.encode(signature)
}

/// Base64 transport form back to raw bytes.
pub fn signature_from_base64(signature_b64: &str) -> anyhow::Result<Vec<u8>> {
    Ok(BASE64.decode(signature_b64)?)
}

/// Why a signature failed verification. The store maps this onto the
/// integrity error family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureFailure {
    UnknownSigner(String),
    UnknownSigVersion(u8),
    MalformedSignature,
    Invalid,
}

impl fmt::Display for SignatureFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSigner(id) => write!(f, "no public key registered for '{id}'"),
            Self::UnknownSigVersion(v) => write!(f, "unknown sig_alg_version {v}"),
            Self::MalformedSignature => write!(f, "signature is not 64 bytes"),
            Self::Invalid => write!(f, "signature does not verify"),
        }
    }
}

/// Handle to an Ed25519 signing key. The key material is private to this
/// struct and is redacted from Debug output.
#[derive(Clone)]
pub struct SignerHandle {
    signer_id: String,
    key: SigningKey,
}

impl SignerHandle {
    /// Generate a fresh keypair for `signer_id`.
    pub fn generate(signer_id: impl Into<String>) -> Self {
        Self {
            signer_id: signer_id.into(),
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a handle from a 32-byte seed (operator key storage).
    pub fn from_seed(signer_id: impl Into<String>, seed: &[u8; 32]) -> Self {
        Self {
            signer_id: signer_id.into(),
            key: SigningKey::from_bytes(seed),
        }
    }

    pub fn signer_id(&self) -> &str {
        &self.signer_id
    }

    /// Sign a message, returning the raw 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl fmt::Debug for SignerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerHandle")
            .field("signer_id", &self.signer_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Registry of public keys for verification, keyed by signer id
/// (agent ids, `SYSTEM:` actors and witness ids alike).
#[derive(Debug, Default, Clone)]
pub struct KeyDirectory {
    keys: HashMap<String, VerifyingKey>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, signer_id: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(signer_id.into(), key);
    }

    /// Register the public half of a local signer handle.
    pub fn register_handle(&mut self, handle: &SignerHandle) {
        self.register(handle.signer_id().to_string(), handle.verifying_key());
    }

    pub fn contains(&self, signer_id: &str) -> bool {
        self.keys.contains_key(signer_id)
    }

    /// Verify `signature` over `message` under the key registered for
    /// `signer_id`. Unknown signature-algorithm versions are rejected.
    pub fn verify(
        &self,
        signer_id: &str,
        message: &[u8],
        signature: &[u8],
        sig_alg_version: u8,
    ) -> Result<(), SignatureFailure> {
        if sig_alg_version != SIG_ALG_VERSION {
            return Err(SignatureFailure::UnknownSigVersion(sig_alg_version));
        }
        let key = self
            .keys
            .get(signer_id)
            .ok_or_else(|| SignatureFailure::UnknownSigner(signer_id.to_string()))?;
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| SignatureFailure::MalformedSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);
        key.verify(message, &signature)
            .map_err(|_| SignatureFailure::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signable_bytes_are_canonical_and_bind_prev_hash() {
        let a = signable_bytes("abc", &"0".repeat(64), Some("agent-001"));
        assert_eq!(
            String::from_utf8(a.clone()).unwrap(),
            format!(
                r#"{{"agent_id":"agent-001","content_hash":"abc","prev_hash":"{}"}}"#,
                "0".repeat(64)
            )
        );
        // A different prev_hash yields different signable bytes.
        let b = signable_bytes("abc", &"1".repeat(64), Some("agent-001"));
        assert_ne!(a, b);
    }

    #[test]
    fn absent_agent_encodes_as_null() {
        let bytes = signable_bytes("h", "p", None);
        assert!(String::from_utf8(bytes).unwrap().contains("\"agent_id\":null"));
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let handle = SignerHandle::generate("agent-test");
        let mut dir = KeyDirectory::new();
        dir.register_handle(&handle);

        let msg = signable_bytes("h", GENESIS_ANCHOR, Some("agent-test"));
        let sig = handle.sign(&msg);
        assert!(dir.verify("agent-test", &msg, &sig, SIG_ALG_VERSION).is_ok());

        // Tampered message fails.
        let other = signable_bytes("h2", GENESIS_ANCHOR, Some("agent-test"));
        assert_eq!(
            dir.verify("agent-test", &other, &sig, SIG_ALG_VERSION),
            Err(SignatureFailure::Invalid)
        );
    }

    #[test]
    fn unknown_sig_version_is_rejected() {
        let handle = SignerHandle::generate("agent-v");
        let mut dir = KeyDirectory::new();
        dir.register_handle(&handle);
        let sig = handle.sign(b"m");
        assert_eq!(
            dir.verify("agent-v", b"m", &sig, 2),
            Err(SignatureFailure::UnknownSigVersion(2))
        );
    }

    #[test]
    fn base64_round_trip() {
        let raw = vec![7u8; 64];
        let b64 = signature_to_base64(&raw);
        assert_eq!(signature_from_base64(&b64).unwrap(), raw);
    }

    #[test]
    fn debug_redacts_key_material() {
        let handle = SignerHandle::generate("agent-dbg");
        let rendered = format!("{handle:?}");
        assert!(rendered.contains("<redacted>"));
    }
}
