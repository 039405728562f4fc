//! SSH key helpers.
//!
//! Private keys travel as PEM (PKCS#8 when generated here, PKCS#1 or OpenSSH
//! accepted on read). Public keys travel as `authorized_keys` lines. Host-key
//! pinning compares the SSH wire encoding, never a textual form.

use crate::error::{CommsError, Result};
use russh_keys::key::{KeyPair, PublicKey, SignatureHash};
use russh_keys::PublicKeyBase64;

/// Key size for the adaptor and per-pod keypairs.
pub const DEFAULT_RSA_BITS: usize = 4096;

/// Key size for the ephemeral attestation host key.
pub const ATTESTATION_RSA_BITS: usize = 3072;

/// A private/public keypair as stored in a secret.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct KeyPairBlobs {
    /// PEM encoded private key
    pub private_key: Vec<u8>,
    /// `authorized_keys` formatted public key, may be empty
    pub public_key: Vec<u8>,
}

impl std::fmt::Debug for KeyPairBlobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairBlobs")
            .field("private_key", &format_args!("<{} bytes>", self.private_key.len()))
            .field("public_key", &String::from_utf8_lossy(&self.public_key))
            .finish()
    }
}

/// Generate an RSA key pair usable as an SSH host or client key.
pub fn generate_rsa(bits: usize) -> Result<KeyPair> {
    KeyPair::generate_rsa(bits, SignatureHash::SHA2_256)
        .ok_or_else(|| CommsError::KeyError(format!("failed to generate {}-bit RSA key", bits)))
}

/// Generate an RSA keypair and encode both halves for storage.
pub fn generate_keypair_blobs(bits: usize) -> Result<KeyPairBlobs> {
    let key = generate_rsa(bits)?;

    let mut private_key = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut private_key)?;

    let public = key.clone_public_key()?;
    let public_key = authorized_key_line(&public).into_bytes();

    tracing::debug!(bits, "Generated RSA keypair");
    Ok(KeyPairBlobs {
        private_key,
        public_key,
    })
}

/// Format a public key as an `authorized_keys` line.
pub fn authorized_key_line(key: &PublicKey) -> String {
    let algo = match key {
        PublicKey::RSA { .. } => "ssh-rsa",
        other => other.name(),
    };
    format!("{} {}\n", algo, key.public_key_base64())
}

/// Parse a PEM private key.
pub fn parse_private_key(pem: &[u8]) -> Result<KeyPair> {
    if pem.is_empty() {
        return Err(CommsError::KeyError("private key is empty".to_string()));
    }
    let pem = std::str::from_utf8(pem)
        .map_err(|e| CommsError::KeyError(format!("private key is not PEM text: {}", e)))?;
    russh_keys::decode_secret_key(pem, None)
        .map_err(|e| CommsError::KeyError(format!("failed to parse private key: {}", e)))
}

/// Parse an `authorized_keys` line (`<algo> <base64> [comment]`) or a bare
/// base64 blob.
pub fn parse_authorized_key(line: &[u8]) -> Result<PublicKey> {
    let line = std::str::from_utf8(line)
        .map_err(|e| CommsError::KeyError(format!("public key is not text: {}", e)))?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    let b64 = match fields.as_slice() {
        [] => return Err(CommsError::KeyError("public key is empty".to_string())),
        [b64] => *b64,
        [_, b64, ..] => *b64,
    };
    russh_keys::parse_public_key_base64(b64)
        .map_err(|e| CommsError::KeyError(format!("failed to parse public key: {}", e)))
}

/// SSH wire encoding of a public key, the form used for pinning.
pub fn marshal_public_key(key: &PublicKey) -> Vec<u8> {
    key.public_key_bytes()
}

/// SHA-256 fingerprint of a public key, for logs.
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_parse_blobs() {
        let blobs = generate_keypair_blobs(2048).unwrap();
        assert!(String::from_utf8_lossy(&blobs.private_key).contains("PRIVATE KEY"));
        assert!(blobs.public_key.starts_with(b"ssh-rsa "));
        assert!(blobs.public_key.ends_with(b"\n"));

        let private = parse_private_key(&blobs.private_key).unwrap();
        let public = parse_authorized_key(&blobs.public_key).unwrap();
        assert_eq!(
            marshal_public_key(&private.clone_public_key().unwrap()),
            marshal_public_key(&public)
        );
    }

    #[test]
    fn test_parse_bare_base64() {
        let key = generate_rsa(2048).unwrap().clone_public_key().unwrap();
        let bare = key.public_key_base64();
        let parsed = parse_authorized_key(bare.as_bytes()).unwrap();
        assert_eq!(marshal_public_key(&parsed), marshal_public_key(&key));
    }

    #[test]
    fn test_parse_failures() {
        assert!(parse_private_key(b"").is_err());
        assert!(parse_private_key(b"-----BEGIN NOTHING-----").is_err());
        assert!(parse_authorized_key(b"   ").is_err());
        assert!(parse_authorized_key(b"ssh-rsa !!!notbase64").is_err());
    }

    #[test]
    fn test_distinct_keys_marshal_differently() {
        let a = generate_rsa(2048).unwrap().clone_public_key().unwrap();
        let b = generate_rsa(2048).unwrap().clone_public_key().unwrap();
        assert_ne!(marshal_public_key(&a), marshal_public_key(&b));
        assert!(!fingerprint(&a).is_empty());
    }
}
