//! Identity cipher (no transformation).
//!
//! Used when encryption is enabled without a real provider, and as the
//! reference implementation in tests. Bytes pass through unchanged.

use super::traits::{CipherFactory, CodecError, PartCipher};

/// Identity cipher - no transformation.
///
/// # Example
///
/// ```
/// use geocache_storage::codec::{IdentityCipher, PartCipher};
///
/// let cipher = IdentityCipher;
/// let sealed = cipher.encrypt(b"roads").unwrap();
/// assert_eq!(cipher.decrypt(&sealed).unwrap(), b"roads");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCipher;

impl PartCipher for IdentityCipher {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(plain.to_vec())
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(sealed.to_vec())
    }

    fn cipher_id(&self) -> &str {
        "identity"
    }
}

impl CipherFactory for IdentityCipher {
    fn create(&self) -> Result<Box<dyn PartCipher>, CodecError> {
        Ok(Box::new(IdentityCipher))
    }
}
