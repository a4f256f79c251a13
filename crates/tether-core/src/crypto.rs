//! Payload encryption for sync records.
//!
//! Every non-tombstone record exchanged with the sync server carries its
//! payload encrypted with the per-account secret key. The wire layout is
//! `nonce || ciphertext || tag`, so a valid ciphertext is always at least
//! [`ENCRYPTION_OVERHEAD`] bytes long.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use thiserror::Error;

/// Byte length of an account secret key.
pub const SECRET_KEY_SIZE: usize = 32;
/// Byte length of the random nonce prepended to each encrypted payload.
pub const NONCE_SIZE: usize = 24;
/// Byte length of the authentication tag appended by the cipher.
pub const TAG_SIZE: usize = 16;
/// Fixed per-payload overhead: nonce plus authentication tag.
pub const ENCRYPTION_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Errors raised by the crypto layer
#[derive(Debug, Error)]
pub enum CryptoError {
    /// No secret key is available for this account
    #[error("No secret key available")]
    MissingSecretKey,

    /// Provided key material has the wrong length
    #[error("Secret key must be {SECRET_KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Encryption failed
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Ciphertext is too short to contain a nonce and tag
    #[error("Invalid ciphertext length: {0} bytes")]
    InvalidCiphertextLength(usize),

    /// Authentication failed while decrypting
    #[error("Decryption failed")]
    DecryptionFailed,
}

pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// Per-account secret key used to encrypt and decrypt record payloads.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; SECRET_KEY_SIZE]);

impl SecretKey {
    /// Wrap raw key material
    #[must_use]
    pub const fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Wrap key material of unchecked length
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; SECRET_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(bytes))
    }

    const fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Capability for encrypting and decrypting record payloads.
pub trait Crypter {
    /// Fetch the account secret key, failing if none is provisioned
    fn fetch_secret_key(&self) -> CryptoResult<SecretKey>;

    /// Encrypt `plaintext`, producing `nonce || ciphertext || tag`
    fn encrypt(&self, plaintext: &[u8], key: &SecretKey) -> CryptoResult<Vec<u8>>;

    /// Decrypt data produced by [`Crypter::encrypt`].
    ///
    /// Fails with [`CryptoError::InvalidCiphertextLength`] when the input is
    /// too short to even contain a nonce and tag, and with
    /// [`CryptoError::DecryptionFailed`] when authentication fails.
    fn decrypt(&self, ciphertext: &[u8], key: &SecretKey) -> CryptoResult<Vec<u8>>;
}

/// XChaCha20-Poly1305 implementation of [`Crypter`].
pub struct XChaChaCrypter {
    key: Option<SecretKey>,
}

impl XChaChaCrypter {
    /// Create a crypter holding the account secret key
    #[must_use]
    pub const fn new(key: SecretKey) -> Self {
        Self { key: Some(key) }
    }

    /// Create a crypter with no provisioned key; `fetch_secret_key` fails
    /// until the account is set up
    #[must_use]
    pub const fn locked() -> Self {
        Self { key: None }
    }
}

impl Crypter for XChaChaCrypter {
    fn fetch_secret_key(&self) -> CryptoResult<SecretKey> {
        self.key.clone().ok_or(CryptoError::MissingSecretKey)
    }

    fn encrypt(&self, plaintext: &[u8], key: &SecretKey) -> CryptoResult<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut output = Vec::with_capacity(NONCE_SIZE + sealed.len());
        output.extend_from_slice(nonce.as_slice());
        output.extend_from_slice(&sealed);
        Ok(output)
    }

    fn decrypt(&self, ciphertext: &[u8], key: &SecretKey) -> CryptoResult<Vec<u8>> {
        if ciphertext.len() < ENCRYPTION_OVERHEAD {
            return Err(CryptoError::InvalidCiphertextLength(ciphertext.len()));
        }

        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
        cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SecretKey {
        SecretKey::from_bytes([7u8; SECRET_KEY_SIZE])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let crypter = XChaChaCrypter::new(test_key());
        let key = crypter.fetch_secret_key().unwrap();

        let sealed = crypter.encrypt(b"hello devices", &key).unwrap();
        assert_eq!(sealed.len(), b"hello devices".len() + ENCRYPTION_OVERHEAD);

        let plain = crypter.decrypt(&sealed, &key).unwrap();
        assert_eq!(plain, b"hello devices");
    }

    #[test]
    fn test_short_ciphertext_is_invalid_length() {
        let crypter = XChaChaCrypter::new(test_key());
        let key = crypter.fetch_secret_key().unwrap();

        let result = crypter.decrypt(&[0u8; ENCRYPTION_OVERHEAD - 1], &key);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidCiphertextLength(len)) if len == ENCRYPTION_OVERHEAD - 1
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let crypter = XChaChaCrypter::new(test_key());
        let key = crypter.fetch_secret_key().unwrap();

        let mut sealed = crypter.encrypt(b"payload", &key).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;

        assert!(matches!(
            crypter.decrypt(&sealed, &key),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let crypter = XChaChaCrypter::new(test_key());
        let key = crypter.fetch_secret_key().unwrap();
        let sealed = crypter.encrypt(b"payload", &key).unwrap();

        let other = SecretKey::from_bytes([9u8; SECRET_KEY_SIZE]);
        assert!(matches!(
            crypter.decrypt(&sealed, &other),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_locked_crypter_has_no_key() {
        assert!(matches!(
            XChaChaCrypter::locked().fetch_secret_key(),
            Err(CryptoError::MissingSecretKey)
        ));
    }

    #[test]
    fn test_secret_key_debug_redacts_material() {
        let debug = format!("{:?}", test_key());
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains('7'));
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(matches!(
            SecretKey::from_slice(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
    }
}
