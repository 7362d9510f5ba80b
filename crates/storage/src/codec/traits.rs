//! Part cipher trait definitions.

/// Cipher applied to the metadata and geometry parts before they reach the
/// secondary store.
///
/// The origin id part is never passed through the cipher.
///
/// # Thread Safety
///
/// Ciphers must be `Send + Sync`: spill workers encrypt and fetch workers
/// decrypt concurrently with one shared instance.
///
/// # Cipher Identity
///
/// Each cipher has an identifier used in log lines and errors.
pub trait PartCipher: Send + Sync {
    /// Encrypt one serialized part.
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decrypt one stored part.
    ///
    /// Returns an error if the bytes cannot be decrypted (wrong key,
    /// truncated data).
    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Unique cipher identifier.
    fn cipher_id(&self) -> &str;
}

/// Produces the session cipher.
///
/// Called once per cache session. A factory may fail (missing key material,
/// unavailable provider); the session then runs unencrypted.
pub trait CipherFactory: Send + Sync {
    /// Build the cipher for this session.
    fn create(&self) -> Result<Box<dyn PartCipher>, CodecError>;
}

/// Cipher errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Encryption failed.
    #[error("Encrypt error: {0}")]
    EncryptError(String),

    /// Decryption failed (wrong key, invalid format).
    #[error("Decrypt error: {0}")]
    DecryptError(String),

    /// The cipher could not be created.
    #[error("Cipher unavailable: {0}")]
    Unavailable(String),
}

impl From<CodecError> for geocache_core::Error {
    fn from(e: CodecError) -> Self {
        geocache_core::Error::CodecError(e.to_string())
    }
}
