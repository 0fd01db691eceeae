//! Ed25519 keys, key rings and detached signatures
//!
//! Keys are stored as base64 text: a signing key file holds the 32-byte secret,
//! a key ring file holds one 32-byte public key per line (`#` starts a comment).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyRingError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid key on line {line}: {reason}")]
    InvalidKey { line: usize, reason: String },

    #[error("key ring contains no keys")]
    Empty,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature is not valid base64 Ed25519: {0}")]
    Encoding(String),

    #[error("no trusted key matches the signature")]
    NoMatchingKey,
}

/// Short key identifier: the first 8 bytes of SHA-256 over the public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId([u8; 8]);

impl KeyId {
    pub fn of(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[..8]);
        Self(id)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Generate a new signing key
pub fn generate() -> SigningKey {
    SigningKey::generate(&mut rand::rngs::OsRng)
}

/// Sign `data`, returning the base64 signature text
pub fn sign(key: &SigningKey, data: &[u8]) -> String {
    STANDARD.encode(key.sign(data).to_bytes())
}

pub fn encode_signing_key(key: &SigningKey) -> String {
    STANDARD.encode(key.to_bytes())
}

pub fn encode_public_key(key: &VerifyingKey) -> String {
    STANDARD.encode(key.to_bytes())
}

fn decode_key_bytes(text: &str) -> Result<[u8; 32], String> {
    let bytes = STANDARD.decode(text.trim()).map_err(|e| e.to_string())?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| format!("expected 32 bytes, got {}", bytes.len()))
}

pub fn parse_signing_key(text: &str) -> Result<SigningKey, KeyRingError> {
    let bytes = decode_key_bytes(text).map_err(|reason| KeyRingError::InvalidKey { line: 1, reason })?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Read a signing key file
pub fn load_signing_key(path: &Path) -> Result<SigningKey, KeyRingError> {
    let text = read(path)?;
    parse_signing_key(&text)
}

fn read(path: &Path) -> Result<String, KeyRingError> {
    std::fs::read_to_string(path).map_err(|source| KeyRingError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// The set of public keys trusted to sign configurations
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: Vec<VerifyingKey>,
}

impl KeyRing {
    pub fn new(keys: Vec<VerifyingKey>) -> Self {
        Self { keys }
    }

    pub fn parse(text: &str) -> Result<Self, KeyRingError> {
        let mut keys = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let invalid = |reason| KeyRingError::InvalidKey {
                line: index + 1,
                reason,
            };
            let bytes = decode_key_bytes(line).map_err(invalid)?;
            let key = VerifyingKey::from_bytes(&bytes).map_err(|e| invalid(e.to_string()))?;
            keys.push(key);
        }
        if keys.is_empty() {
            return Err(KeyRingError::Empty);
        }
        Ok(Self { keys })
    }

    pub fn load(path: &Path) -> Result<Self, KeyRingError> {
        Self::parse(&read(path)?)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn ids(&self) -> Vec<KeyId> {
        self.keys.iter().map(KeyId::of).collect()
    }

    /// Check a base64 detached signature over `data`, returning the id of the key that made it
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<KeyId, SignatureError> {
        let text = std::str::from_utf8(signature)
            .map_err(|e| SignatureError::Encoding(e.to_string()))?;
        let raw = STANDARD
            .decode(text.trim())
            .map_err(|e| SignatureError::Encoding(e.to_string()))?;
        let signature =
            Signature::from_slice(&raw).map_err(|e| SignatureError::Encoding(e.to_string()))?;

        self.keys
            .iter()
            .find(|key| key.verify_strict(data, &signature).is_ok())
            .map(KeyId::of)
            .ok_or(SignatureError::NoMatchingKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = generate();
        let ring = KeyRing::new(vec![key.verifying_key()]);

        let signature = sign(&key, b"ports: []\n");
        let signer = ring.verify(b"ports: []\n", signature.as_bytes()).unwrap();
        assert_eq!(signer, KeyId::of(&key.verifying_key()));
    }

    #[test]
    fn test_tampered_document_rejected() {
        let key = generate();
        let ring = KeyRing::new(vec![key.verifying_key()]);

        let signature = sign(&key, b"ports: []\n");
        assert_eq!(
            ring.verify(b"ports: [] \n", signature.as_bytes()),
            Err(SignatureError::NoMatchingKey)
        );
    }

    #[test]
    fn test_untrusted_key_rejected() {
        let ring = KeyRing::new(vec![generate().verifying_key()]);
        let signature = sign(&generate(), b"data");
        assert_eq!(
            ring.verify(b"data", signature.as_bytes()),
            Err(SignatureError::NoMatchingKey)
        );
    }

    #[test]
    fn test_garbage_signature() {
        let ring = KeyRing::new(vec![generate().verifying_key()]);
        assert!(matches!(
            ring.verify(b"data", b"not base64!"),
            Err(SignatureError::Encoding(_))
        ));
        assert!(matches!(
            ring.verify(b"data", STANDARD.encode([0u8; 10]).as_bytes()),
            Err(SignatureError::Encoding(_))
        ));
    }

    #[test]
    fn test_parse_key_ring_file() {
        let first = generate().verifying_key();
        let second = generate().verifying_key();
        let text = format!(
            "# deploy keys\n{}\n\n  {}  # ops\n",
            encode_public_key(&first),
            encode_public_key(&second)
        );

        let ring = KeyRing::parse(&text).unwrap();
        assert_eq!(ring.ids(), vec![KeyId::of(&first), KeyId::of(&second)]);
    }

    #[test]
    fn test_parse_key_ring_errors() {
        assert!(matches!(KeyRing::parse("# nothing\n"), Err(KeyRingError::Empty)));
        assert!(matches!(
            KeyRing::parse("# header\nAAAA\n"),
            Err(KeyRingError::InvalidKey { line: 2, .. })
        ));
    }

    #[test]
    fn test_signing_key_text_round_trip() {
        let key = generate();
        let parsed = parse_signing_key(&format!("{}\n", encode_signing_key(&key))).unwrap();
        assert_eq!(parsed.to_bytes(), key.to_bytes());
        assert_eq!(KeyId::of(&key.verifying_key()).to_string().len(), 16);
    }
}
