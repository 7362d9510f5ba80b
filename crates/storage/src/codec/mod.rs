//! Part cipher abstraction.
//!
//! Metadata and geometry bytes pass through the session cipher on their way
//! to and from the secondary store. The origin id part never does: it stays
//! readable so records can be matched to their source without the key.
//!
//! A session either has one cipher for its whole lifetime or none. If the
//! factory fails at startup the failure is logged and the session runs
//! unencrypted; nothing is retried.
//!
//! # Usage
//!
//! ```ignore
//! use geocache_storage::codec::{session_cipher, IdentityCipher};
//!
//! let cipher = session_cipher(Some(&IdentityCipher));
//! assert!(cipher.is_some());
//! ```

mod identity;
mod traits;

use std::sync::Arc;

pub use identity::IdentityCipher;
pub use traits::{CipherFactory, CodecError, PartCipher};

/// Shared handle to the session cipher
pub type SharedCipher = Arc<dyn PartCipher>;

/// Build the session cipher, falling back to no encryption on failure.
pub fn session_cipher(factory: Option<&dyn CipherFactory>) -> Option<SharedCipher> {
    let factory = factory?;
    match factory.create() {
        Ok(cipher) => {
            tracing::info!(target: "geocache::codec", cipher = cipher.cipher_id(), "Payload encryption enabled");
            Some(Arc::from(cipher))
        }
        Err(e) => {
            tracing::warn!(target: "geocache::codec", error = %e, "Cipher unavailable, payloads will be stored unencrypted");
            None
        }
    }
}
