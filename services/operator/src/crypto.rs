//! Password encryption for stored BMC credentials.
//!
//! Passwords are stored as base64 RSA-OAEP (SHA-512) ciphertext. The public
//! key encrypts; the private key is only loaded by the operator process.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::rand_core::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha512;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to read key {path}: {source}")]
    ReadKey {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {0} key")]
    InvalidKey(&'static str),

    #[error("no private key loaded")]
    NoPrivateKey,

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Encrypts and decrypts stored passwords.
#[derive(Clone)]
pub struct PasswordCipher {
    public: RsaPublicKey,
    private: Option<RsaPrivateKey>,
}

impl std::fmt::Debug for PasswordCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordCipher")
            .field("can_decrypt", &self.private.is_some())
            .finish()
    }
}

impl PasswordCipher {
    /// Cipher with both keys; the public key is derived from the private one.
    pub fn from_private_key(private: RsaPrivateKey) -> Self {
        Self {
            public: private.to_public_key(),
            private: Some(private),
        }
    }

    /// Encrypt-only cipher.
    pub fn from_public_key(public: RsaPublicKey) -> Self {
        Self {
            public,
            private: None,
        }
    }

    /// Parse a PKCS#8 or PKCS#1 private key PEM.
    pub fn from_private_pem(pem: &str) -> Result<Self, CryptoError> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|_| CryptoError::InvalidKey("private"))?;
        Ok(Self::from_private_key(key))
    }

    /// Parse an SPKI or PKCS#1 public key PEM.
    pub fn from_public_pem(pem: &str) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|_| CryptoError::InvalidKey("public"))?;
        Ok(Self::from_public_key(key))
    }

    /// Load the private key from disk.
    pub fn load_private(path: &Path) -> Result<Self, CryptoError> {
        Self::from_private_pem(&read_key(path)?)
    }

    /// Load the public key from disk.
    pub fn load_public(path: &Path) -> Result<Self, CryptoError> {
        Self::from_public_pem(&read_key(path)?)
    }

    pub fn can_decrypt(&self) -> bool {
        self.private.is_some()
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let ciphertext = self
            .public
            .encrypt(&mut OsRng, Oaep::new::<Sha512>(), plaintext.as_bytes())
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        Ok(STANDARD.encode(ciphertext))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let private = self.private.as_ref().ok_or(CryptoError::NoPrivateKey)?;
        let ciphertext = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        let plaintext = private
            .decrypt(Oaep::new::<Sha512>(), &ciphertext)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| CryptoError::Decrypt(e.to_string()))
    }
}

fn read_key(path: &Path) -> Result<String, CryptoError> {
    std::fs::read_to_string(path).map_err(|source| CryptoError::ReadKey {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::OnceLock;

    use super::*;

    /// One key per test binary; generation is slow in debug builds.
    pub fn test_cipher() -> PasswordCipher {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        let key = KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 1536).unwrap());
        PasswordCipher::from_private_key(key.clone())
    }
}
